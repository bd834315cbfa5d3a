//! Compiler driver: walks a traversal tree bottom-up and stitches the
//! fragments every node emits into one [`LogicalPlan`].

use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};
use xxhash_rust::xxh64::Xxh64;

use crate::compiler::context::{ContextManager, LabelBinding, VertexIdManager};
use crate::compiler::errors::{CompileError, Result};
use crate::compiler::logical::{EdgeKind, LogicalPlan, LogicalVertex, OperatorType};
use crate::compiler::schema::GraphSchema;
use crate::compiler::tree::{NodeType, Step, TreeNode};
use crate::compiler::value::ValueType;
use crate::types::VertexId;

/// Compiler tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Let a range at the root of the traversal stop early once it produced
    /// `high - low` results.
    pub enable_early_stop: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            enable_early_stop: true,
        }
    }
}

/// Output of a successful compilation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledPlan {
    plan: LogicalPlan,
    labels: Vec<LabelBinding>,
    output_type: ValueType,
}

impl CompiledPlan {
    /// The operator DAG.
    pub fn plan(&self) -> &LogicalPlan {
        &self.plan
    }

    /// Label bindings that survived compilation.
    pub fn labels(&self) -> &[LabelBinding] {
        &self.labels
    }

    /// Output type of the traversal root.
    pub fn output_type(&self) -> &ValueType {
        &self.output_type
    }

    /// The single vertex producing the plan's results.
    pub fn finish_vertex(&self) -> Option<&LogicalVertex> {
        let id = self.plan.finish().iter().next()?;
        self.plan.vertex(*id)
    }

    /// Walks back from the finish vertex over one-to-one operators and returns
    /// the first vertex that can change cardinality or ordering.
    fn shaping_vertex(&self) -> Option<&LogicalVertex> {
        let mut vertex = self.finish_vertex()?;
        while vertex.op.is_one_to_one() {
            let mut incoming = self
                .plan
                .incoming(vertex.id)
                .filter(|edge| edge.kind != EdgeKind::Broadcast);
            let edge = incoming.next()?;
            if incoming.next().is_some() {
                return None;
            }
            vertex = self.plan.vertex(edge.from)?;
        }
        Some(vertex)
    }

    /// Maximum number of results when the plan ends in an early-stop global
    /// range. A keyed range bounds each key, not the stream.
    pub fn result_bound(&self) -> Option<u64> {
        let range = self.shaping_vertex()?;
        if range.op != OperatorType::Range {
            return None;
        }
        let combiner = self
            .plan
            .incoming(range.id)
            .filter_map(|edge| self.plan.vertex(edge.from))
            .find(|v| v.op == OperatorType::CombinerRange)?;
        if !combiner.early_stop {
            return None;
        }
        match range.args.longs().as_slice() {
            [low, high] => u64::try_from(high - low).ok(),
            _ => None,
        }
    }

    /// Whether results must keep the order produced by each target.
    pub fn preserves_order(&self) -> bool {
        self.shaping_vertex()
            .map(|vertex| vertex.op.preserves_order())
            .unwrap_or(false)
    }

    /// Deterministic hash of the plan structure, independent of the concrete
    /// vertex ids. Plans that differ only by id renumbering share it.
    pub fn fingerprint(&self) -> u64 {
        let ordinal = |id: VertexId| {
            self.plan
                .vertices()
                .iter()
                .position(|v| v.id == id)
                .map(|idx| idx as u64)
                .unwrap_or(u64::MAX)
        };
        let mut hasher = Xxh64::new(0);
        hasher.write_u64(self.plan.vertices().len() as u64);
        for vertex in self.plan.vertices() {
            hasher.write(vertex.op.name().as_bytes());
            hasher.write_u8(vertex.early_stop as u8);
            hasher.write_u64(vertex.args.values().len() as u64);
            for arg in vertex.args.values() {
                hasher.write(arg.to_string().as_bytes());
                hasher.write_u8(0xff);
            }
        }
        let mut edges: Vec<(u64, u64, EdgeKind)> = self
            .plan
            .edges()
            .iter()
            .map(|edge| (ordinal(edge.from), ordinal(edge.to), edge.kind))
            .collect();
        edges.sort();
        hasher.write_u64(edges.len() as u64);
        for (from, to, kind) in edges {
            hasher.write_u64(from);
            hasher.write_u64(to);
            hasher.write(kind.to_string().as_bytes());
        }
        for id in self.plan.finish() {
            hasher.write_u64(ordinal(*id));
        }
        hasher.write(self.output_type.to_string().as_bytes());
        hasher.finish()
    }

    /// Explain tree rooted at the finish vertex.
    pub fn explain(&self) -> PlanExplain {
        let root = match self.plan.finish().iter().next() {
            Some(id) => self.explain_vertex(*id, None),
            None => ExplainNode::new("EMPTY"),
        };
        PlanExplain {
            root,
            fingerprint: self.fingerprint(),
        }
    }

    fn explain_vertex(&self, id: VertexId, via: Option<EdgeKind>) -> ExplainNode {
        let Some(vertex) = self.plan.vertex(id) else {
            return ExplainNode::new("MISSING");
        };
        let mut node = ExplainNode::new(vertex.op.name());
        node.props.push(ExplainProp::new("id", vertex.id.to_string()));
        if !vertex.args.is_empty() {
            let args: Vec<String> = vertex.args.values().iter().map(|a| a.to_string()).collect();
            node.props.push(ExplainProp::new("args", args.join(", ")));
        }
        if vertex.early_stop {
            node.props.push(ExplainProp::new("early_stop", "true"));
        }
        if let Some(kind) = via {
            node.props.push(ExplainProp::new("input", kind.to_string()));
        }
        for binding in &self.labels {
            if binding.producer == id {
                node.props.push(ExplainProp::new("as", binding.label.clone()));
            }
        }
        for edge in self.plan.incoming(id) {
            node.inputs.push(self.explain_vertex(edge.from, Some(edge.kind)));
        }
        node
    }
}

/// Human readable rendering of a compiled plan.
#[derive(Clone, Debug)]
pub struct PlanExplain {
    /// Root node of the explain tree.
    pub root: ExplainNode,
    /// Structural fingerprint of the plan.
    pub fingerprint: u64,
}

/// One operator in an explain tree.
#[derive(Clone, Debug)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Key/value annotations.
    pub props: Vec<ExplainProp>,
    /// Producers feeding this operator.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    fn render(&self, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.op, indent = depth * 2)?;
        if !self.props.is_empty() {
            let props: Vec<String> = self
                .props
                .iter()
                .map(|p| format!("{}={}", p.key, p.value))
                .collect();
            write!(f, " [{}]", props.join(" "))?;
        }
        writeln!(f)?;
        for input in &self.inputs {
            input.render(depth + 1, f)?;
        }
        Ok(())
    }
}

/// Annotation attached to an [`ExplainNode`].
#[derive(Clone, Debug)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value.
    pub value: String,
}

impl ExplainProp {
    fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for PlanExplain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plan {:016x}", self.fingerprint)?;
        self.root.render(0, f)
    }
}

/// Compiles traversal trees against one schema.
pub struct TraversalCompiler<'s> {
    schema: &'s dyn GraphSchema,
    config: CompilerConfig,
}

struct Build<'s> {
    ctx: ContextManager<'s>,
    plan: LogicalPlan,
}

impl<'s> TraversalCompiler<'s> {
    /// Creates a compiler.
    pub fn new(schema: &'s dyn GraphSchema, config: CompilerConfig) -> Self {
        Self { schema, config }
    }

    /// Compiles `tree` with vertex ids starting at 1.
    pub fn compile(&self, tree: &TreeNode) -> Result<CompiledPlan> {
        self.compile_with(tree, VertexIdManager::default())
    }

    /// Compiles `tree` drawing vertex ids from `ids`.
    pub fn compile_with(&self, tree: &TreeNode, ids: VertexIdManager) -> Result<CompiledPlan> {
        tree.validate()?;
        let output_type = tree.output_type(self.schema)?;

        let mut tree = tree.clone();
        if self.config.enable_early_stop {
            mark_early_stop(&mut tree);
        }

        let mut build = Build {
            ctx: ContextManager::with_id_manager(self.schema, ids),
            plan: LogicalPlan::new(),
        };
        let finish = self.compile_node(&tree, None, &mut build)?;
        build.plan.set_finish(finish)?;

        let compiled = CompiledPlan {
            labels: build.ctx.labels().bindings(),
            plan: build.plan,
            output_type,
        };
        info!(
            root = tree.step.name(),
            vertices = compiled.plan.vertices().len(),
            edges = compiled.plan.edges().len(),
            output_type = %compiled.output_type,
            fingerprint = compiled.fingerprint(),
            "compiled traversal"
        );
        Ok(compiled)
    }

    fn compile_node(
        &self,
        node: &TreeNode,
        start: Option<VertexId>,
        build: &mut Build<'s>,
    ) -> Result<VertexId> {
        if node.step == Step::Start {
            return start.ok_or_else(|| {
                CompileError::structural("start", "placeholder used outside of a branch")
            });
        }

        let mut frontier: SmallVec<[VertexId; 2]> = SmallVec::new();
        for input in &node.inputs {
            frontier.push(self.compile_node(input, start, build)?);
        }
        if let Step::Union { branches } = &node.step {
            let input = match frontier.as_slice() {
                [input] => *input,
                _ => return Err(CompileError::structural("union", "expected exactly one input")),
            };
            frontier.clear();
            let branch_input = node.input()?.infer(self.schema, build.ctx.branch_input())?;
            build.ctx.enter_branch(branch_input);
            let compiled: Result<SmallVec<[VertexId; 2]>> = branches
                .iter()
                .map(|branch| self.compile_node(branch, Some(input), build))
                .collect();
            build.ctx.leave_branch();
            frontier = compiled?;
        }

        let fragment = node.build_fragment(&mut build.ctx, &frontier)?;
        let emitted: SmallVec<[VertexId; 2]> = fragment.vertices().iter().map(|v| v.id).collect();
        debug!(
            step = node.step.name(),
            category = ?node.category(),
            vertices = emitted.len(),
            "emitted fragment"
        );
        let output = build.plan.merge(fragment)?;
        for vertex in emitted {
            self.wire_requirements(node, vertex, build)?;
        }
        Ok(output)
    }

    /// Every label a vertex reads must come from one of its ancestors. Labels
    /// bound before a closed scope reach the vertex through a broadcast side
    /// input.
    fn wire_requirements(&self, node: &TreeNode, vertex: VertexId, build: &mut Build<'s>) -> Result<()> {
        let labels = build.ctx.labels();
        let Some(required) = labels.required_labels(vertex) else {
            return Ok(());
        };
        let mut side_inputs = Vec::new();
        for label in required {
            let source = labels
                .source(label)
                .ok_or_else(|| CompileError::unresolved(label, node.step.name()))?;
            if !build.plan.is_ancestor(source.producer, vertex) {
                return Err(CompileError::unresolved(label, node.step.name()));
            }
            if source.scope < labels.scope() && !side_inputs.contains(&source.producer) {
                side_inputs.push(source.producer);
            }
        }
        for producer in side_inputs {
            debug!(%producer, consumer = %vertex, "wiring label side input");
            build.plan.add_edge(producer, vertex, EdgeKind::Broadcast)?;
        }
        Ok(())
    }
}

/// A range reached from the root through one-to-one steps only bounds the
/// total result count.
fn mark_early_stop(root: &mut TreeNode) {
    let mut current = root;
    while current.category() == NodeType::Map && current.inputs.len() == 1 {
        current = &mut current.inputs[0];
    }
    if matches!(current.step, Step::Range { .. }) && !current.use_key {
        current.early_stop = true;
    }
}

/// Compiles `tree` with the default configuration.
pub fn compile(tree: &TreeNode, schema: &dyn GraphSchema) -> Result<CompiledPlan> {
    TraversalCompiler::new(schema, CompilerConfig::default()).compile(tree)
}
