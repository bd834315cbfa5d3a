//! Traversal tree IR.
//!
//! A traversal arrives as a rooted tree of [`TreeNode`]s, each wrapping one
//! [`Step`]. Every node can infer its output type and compile itself into a
//! [`PlanFragment`] attached to the frontier of its already compiled inputs.
//! Steps are a closed sum type so adding a new kind is checked by `match`
//! exhaustiveness.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compiler::context::ContextManager;
use crate::compiler::errors::{CompileError, Result};
use crate::compiler::logical::{
    Argument, CompareOp, EdgeKind, LogicalVertex, OperatorType, PlanFragment,
};
use crate::compiler::schema::GraphSchema;
use crate::compiler::value::{Value, ValueType, VariantType};
use crate::types::VertexId;

/// Structural category of a step; decides how it is wired into the plan.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeType {
    /// Starts a traversal, has no input.
    Source,
    /// One output per input element.
    Map,
    /// Zero or one output per input element.
    Filter,
    /// Zero or more outputs per input element.
    FlatMap,
    /// Barrier reducing all inputs; closes the label scope.
    Aggregate,
    /// Merges several branches.
    Binary,
}

/// Traversal direction over adjacency.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follow outgoing edges.
    #[default]
    Out,
    /// Follow incoming edges.
    In,
    /// Follow edges in both directions.
    Both,
}

/// Endpoint selector when moving from an edge to its vertices.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeEnd {
    /// Source vertex.
    Out,
    /// Destination vertex.
    In,
    /// Both endpoints.
    Both,
    /// The endpoint the traverser did not arrive from.
    Other,
}

/// Property comparison used by `has`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Comparison operator.
    pub op: CompareOp,
    /// Right-hand side literal.
    pub value: Value,
}

impl Predicate {
    /// Builds a predicate.
    pub fn new(op: CompareOp, value: impl Into<Value>) -> Self {
        Self {
            op,
            value: value.into(),
        }
    }
}

/// Step kind plus its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Placeholder for the input of an enclosing branching step.
    Start,
    /// Scan vertices, optionally by id or label.
    V {
        /// Vertex ids; empty means all.
        #[serde(default)]
        ids: Vec<i64>,
        /// Vertex label names; empty means all.
        #[serde(default)]
        vertex_labels: Vec<String>,
    },
    /// Scan edges, optionally by id or label.
    E {
        /// Edge ids; empty means all.
        #[serde(default)]
        ids: Vec<i64>,
        /// Edge label names; empty means all.
        #[serde(default)]
        edge_labels: Vec<String>,
    },
    /// Vertex to adjacent vertices.
    Expand {
        /// Traversal direction.
        #[serde(default)]
        direction: Direction,
        /// Edge label filter.
        #[serde(default)]
        edge_labels: Vec<String>,
    },
    /// Vertex to incident edges.
    ExpandEdge {
        /// Traversal direction.
        #[serde(default)]
        direction: Direction,
        /// Edge label filter.
        #[serde(default)]
        edge_labels: Vec<String>,
    },
    /// Edge to its endpoint vertices.
    EdgeVertex {
        /// Endpoint selector.
        end: EdgeEnd,
    },
    /// Keep elements carrying one of the labels.
    HasLabel {
        /// Label names.
        labels: Vec<String>,
    },
    /// Keep elements whose property satisfies the predicate.
    Has {
        /// Property name.
        prop: String,
        /// Comparison.
        predicate: Predicate,
    },
    /// Property values of an element.
    Values {
        /// Property names.
        props: Vec<String>,
    },
    /// Element id.
    Id,
    /// Element label.
    Label,
    /// Size of each incoming collection.
    CountLocal,
    /// Number of incoming elements.
    Count,
    /// Global positional filter, `high` exclusive.
    Range {
        /// First kept offset.
        low: i64,
        /// First dropped offset.
        high: i64,
    },
    /// Positional filter over the items of each incoming collection.
    RangeLocal {
        /// First kept offset.
        low: i64,
        /// First dropped offset.
        high: i64,
    },
    /// Drop duplicates.
    Dedup,
    /// Keep a random subset.
    Sample {
        /// Number of elements kept.
        amount: i64,
    },
    /// Global ordering.
    Order {
        /// Property to order by; the element itself when absent.
        #[serde(default)]
        by: Option<String>,
        /// Descending instead of ascending.
        #[serde(default)]
        descending: bool,
    },
    /// Collect everything into one list.
    Fold,
    /// Expand each incoming collection into its items.
    Unfold,
    /// Read labelled values.
    Select {
        /// Label names.
        labels: Vec<String>,
    },
    /// Run every branch on the input and merge the outputs.
    Union {
        /// Branch traversals, each rooted at a [`Step::Start`] leaf.
        branches: Vec<TreeNode>,
    },
}

impl Step {
    /// Short name used in errors and explain output.
    pub fn name(&self) -> &'static str {
        match self {
            Step::Start => "start",
            Step::V { .. } => "V",
            Step::E { .. } => "E",
            Step::Expand { .. } => "expand",
            Step::ExpandEdge { .. } => "expandE",
            Step::EdgeVertex { .. } => "edgeVertex",
            Step::HasLabel { .. } => "hasLabel",
            Step::Has { .. } => "has",
            Step::Values { .. } => "values",
            Step::Id => "id",
            Step::Label => "label",
            Step::CountLocal => "count(local)",
            Step::Count => "count",
            Step::Range { .. } => "range",
            Step::RangeLocal { .. } => "range(local)",
            Step::Dedup => "dedup",
            Step::Sample { .. } => "sample",
            Step::Order { .. } => "order",
            Step::Fold => "fold",
            Step::Unfold => "unfold",
            Step::Select { .. } => "select",
            Step::Union { .. } => "union",
        }
    }

    /// Structural category.
    pub fn category(&self) -> NodeType {
        match self {
            Step::Start | Step::V { .. } | Step::E { .. } => NodeType::Source,
            Step::Expand { .. } | Step::ExpandEdge { .. } | Step::Values { .. } | Step::Unfold => {
                NodeType::FlatMap
            }
            Step::EdgeVertex { end } => match end {
                EdgeEnd::Both => NodeType::FlatMap,
                _ => NodeType::Map,
            },
            Step::Id
            | Step::Label
            | Step::CountLocal
            | Step::RangeLocal { .. }
            | Step::Select { .. } => NodeType::Map,
            Step::HasLabel { .. }
            | Step::Has { .. }
            | Step::Range { .. }
            | Step::Dedup
            | Step::Sample { .. }
            | Step::Order { .. } => NodeType::Filter,
            Step::Count | Step::Fold => NodeType::Aggregate,
            Step::Union { .. } => NodeType::Binary,
        }
    }
}

/// Output type plus the types bound to labels visible at a step.
#[derive(Clone, Debug)]
pub(crate) struct Inferred {
    pub ty: ValueType,
    pub labels: BTreeMap<String, ValueType>,
}

impl Inferred {
    fn new(ty: ValueType) -> Self {
        Self {
            ty,
            labels: BTreeMap::new(),
        }
    }
}

/// One traversal step with its inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Step kind and parameters.
    #[serde(flatten)]
    pub step: Step,
    /// Upstream steps; exactly one for non-source steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<TreeNode>,
    /// Labels bound to this step's output (`as(...)`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Results are addressed by element key.
    #[serde(default)]
    pub use_key: bool,
    /// Operator may stop once it produced enough output.
    #[serde(default)]
    pub early_stop: bool,
}

impl TreeNode {
    /// Node without inputs.
    pub fn new(step: Step) -> Self {
        Self {
            step,
            inputs: Vec::new(),
            labels: Vec::new(),
            use_key: false,
            early_stop: false,
        }
    }

    /// Node consuming `input`.
    pub fn with_input(step: Step, input: TreeNode) -> Self {
        let mut node = Self::new(step);
        node.inputs.push(input);
        node
    }

    /// Structural category of this node.
    pub fn category(&self) -> NodeType {
        self.step.category()
    }

    /// The single input of a non-source step.
    pub fn input(&self) -> Result<&TreeNode> {
        match self.inputs.as_slice() {
            [input] => Ok(input),
            _ => Err(CompileError::structural(
                self.step.name(),
                format!("expected exactly one input, found {}", self.inputs.len()),
            )),
        }
    }

    /// Output type of this node, computed from its kind and its inputs.
    pub fn output_type(&self, schema: &dyn GraphSchema) -> Result<ValueType> {
        Ok(self.infer(schema, None)?.ty)
    }

    pub(crate) fn infer(&self, schema: &dyn GraphSchema, start: Option<&Inferred>) -> Result<Inferred> {
        let mut env = match &self.step {
            Step::Start => start.cloned().ok_or_else(|| {
                CompileError::structural("start", "placeholder used outside of a branch")
            })?,
            Step::V { .. } => Inferred::new(ValueType::Vertex),
            Step::E { .. } => Inferred::new(ValueType::Edge),
            Step::Union { branches } => {
                let input = self.input()?.infer(schema, start)?;
                let mut labels = input.labels.clone();
                let mut types = Vec::with_capacity(branches.len());
                for branch in branches {
                    let out = branch.infer(schema, Some(&input))?;
                    labels.extend(out.labels);
                    types.push(out.ty);
                }
                let ty = ValueType::unify(types).ok_or_else(|| {
                    CompileError::structural("union", "requires at least one branch")
                })?;
                Inferred { ty, labels }
            }
            _ => {
                let input = self.input()?.infer(schema, start)?;
                let ty = self.step_type(schema, &input)?;
                Inferred {
                    ty,
                    labels: input.labels,
                }
            }
        };
        for label in &self.labels {
            env.labels.insert(label.clone(), env.ty.clone());
        }
        Ok(env)
    }

    fn step_type(&self, schema: &dyn GraphSchema, input: &Inferred) -> Result<ValueType> {
        let name = self.step.name();
        let expect_vertex = || {
            if input.ty == ValueType::Vertex {
                Ok(())
            } else {
                Err(CompileError::validation(
                    name,
                    format!("expects vertex input, got {}", input.ty),
                ))
            }
        };
        let expect_element = || {
            if input.ty.is_element() {
                Ok(())
            } else {
                Err(CompileError::validation(
                    name,
                    format!("expects vertex or edge input, got {}", input.ty),
                ))
            }
        };
        match &self.step {
            Step::Expand { .. } => {
                expect_vertex()?;
                Ok(ValueType::Vertex)
            }
            Step::ExpandEdge { .. } => {
                expect_vertex()?;
                Ok(ValueType::Edge)
            }
            Step::EdgeVertex { .. } => {
                if input.ty != ValueType::Edge {
                    return Err(CompileError::validation(
                        name,
                        format!("expects edge input, got {}", input.ty),
                    ));
                }
                Ok(ValueType::Vertex)
            }
            Step::HasLabel { .. } | Step::Has { .. } => {
                expect_element()?;
                Ok(input.ty.clone())
            }
            Step::Values { props } => {
                expect_element()?;
                let mut types = Vec::with_capacity(props.len());
                for prop in props {
                    types.push(ValueType::Property(schema.resolve_property(prop)?.ty));
                }
                ValueType::unify(types)
                    .ok_or_else(|| CompileError::validation(name, "requires at least one property"))
            }
            Step::Id => {
                expect_element()?;
                Ok(ValueType::long())
            }
            Step::Label => {
                expect_element()?;
                Ok(ValueType::Value(VariantType::String))
            }
            Step::CountLocal | Step::Count => Ok(ValueType::long()),
            Step::Range { .. }
            | Step::RangeLocal { .. }
            | Step::Dedup
            | Step::Sample { .. }
            | Step::Order { .. } => Ok(input.ty.clone()),
            Step::Fold => Ok(ValueType::list_of(input.ty.clone())),
            Step::Unfold => match &input.ty {
                ValueType::List(_) | ValueType::Map(..) => Ok(input.ty.element()),
                other => Err(CompileError::validation(
                    name,
                    format!("expects a collection input, got {other}"),
                )),
            },
            Step::Select { labels } => {
                let mut types = Vec::with_capacity(labels.len());
                for label in labels {
                    let ty = input
                        .labels
                        .get(label)
                        .ok_or_else(|| CompileError::unresolved(label, name))?;
                    types.push(ty.clone());
                }
                if types.len() == 1 {
                    return Ok(types.remove(0));
                }
                let value = ValueType::unify(types)
                    .ok_or_else(|| CompileError::validation(name, "requires at least one label"))?;
                Ok(ValueType::map_of(ValueType::Value(VariantType::String), value))
            }
            Step::Start | Step::V { .. } | Step::E { .. } | Step::Union { .. } => {
                Ok(input.ty.clone())
            }
        }
    }

    /// Checks arity and step parameters of the whole tree. Runs before any
    /// vertex is emitted.
    pub fn validate(&self) -> Result<()> {
        let name = self.step.name();
        match self.category() {
            NodeType::Source => {
                if !self.inputs.is_empty() {
                    return Err(CompileError::structural(name, "source steps take no input"));
                }
            }
            _ => {
                self.input()?;
            }
        }
        match &self.step {
            Step::Range { low, high } | Step::RangeLocal { low, high } => {
                check_bounds(name, *low, *high)?;
            }
            Step::Sample { amount } if *amount < 0 => {
                return Err(CompileError::validation(
                    name,
                    format!("amount must be non-negative, got {amount}"),
                ));
            }
            Step::HasLabel { labels } if labels.is_empty() => {
                return Err(CompileError::validation(name, "requires at least one label"));
            }
            Step::Values { props } if props.is_empty() => {
                return Err(CompileError::validation(name, "requires at least one property"));
            }
            Step::Select { labels } if labels.is_empty() => {
                return Err(CompileError::validation(name, "requires at least one label"));
            }
            Step::Has { predicate, .. } => {
                let is_list = matches!(predicate.value, Value::List(_));
                let wants_list = matches!(predicate.op, CompareOp::Within | CompareOp::Without);
                if is_list != wants_list {
                    return Err(CompileError::validation(
                        name,
                        format!("operator {} cannot compare against {}", predicate.op, predicate.value),
                    ));
                }
            }
            Step::Union { branches } => {
                if branches.is_empty() {
                    return Err(CompileError::validation(name, "requires at least one branch"));
                }
                for branch in branches {
                    branch.validate()?;
                }
            }
            _ => {}
        }
        for input in &self.inputs {
            input.validate()?;
        }
        Ok(())
    }

    /// Labels this step reads.
    pub fn required_labels(&self) -> &[String] {
        match &self.step {
            Step::Select { labels } => labels,
            _ => &[],
        }
    }

    /// Compiles this node into a fragment hanging off `inputs`.
    ///
    /// `inputs` holds the frontier of the single input, or the frontier of
    /// every branch for [`Step::Union`].
    pub fn build_fragment(
        &self,
        ctx: &mut ContextManager<'_>,
        inputs: &[VertexId],
    ) -> Result<PlanFragment> {
        let name = self.step.name();
        let key = self.use_key;
        match &self.step {
            Step::Start => Err(CompileError::structural(
                name,
                "placeholder resolves to its branch input and emits no vertex",
            )),
            Step::V { ids, vertex_labels } => {
                let mut args = Argument::new();
                for id in ids {
                    args = args.long(*id);
                }
                for label in vertex_labels {
                    args = args.int(label_arg(name, ctx.schema().resolve_vertex_label(label)?)?);
                }
                self.source(ctx, inputs, OperatorType::V, args)
            }
            Step::E { ids, edge_labels } => {
                let mut args = Argument::new();
                for id in ids {
                    args = args.long(*id);
                }
                for label in edge_labels {
                    args = args.int(label_arg(name, ctx.schema().resolve_edge_label(label)?)?);
                }
                self.source(ctx, inputs, OperatorType::E, args)
            }
            Step::Expand {
                direction,
                edge_labels,
            } => {
                let op = match direction {
                    Direction::Out => OperatorType::Out,
                    Direction::In => OperatorType::In,
                    Direction::Both => OperatorType::Both,
                };
                let args = edge_label_args(ctx, name, edge_labels)?;
                self.unary(ctx, inputs, op, args, self.fetch_edge())
            }
            Step::ExpandEdge {
                direction,
                edge_labels,
            } => {
                let op = match direction {
                    Direction::Out => OperatorType::OutE,
                    Direction::In => OperatorType::InE,
                    Direction::Both => OperatorType::BothE,
                };
                let args = edge_label_args(ctx, name, edge_labels)?;
                self.unary(ctx, inputs, op, args, self.fetch_edge())
            }
            Step::EdgeVertex { end } => {
                let op = match end {
                    EdgeEnd::Out => OperatorType::OutV,
                    EdgeEnd::In => OperatorType::InV,
                    EdgeEnd::Both => OperatorType::BothV,
                    EdgeEnd::Other => OperatorType::OtherV,
                };
                self.unary(ctx, inputs, op, Argument::new(), EdgeKind::Forward)
            }
            Step::HasLabel { labels } => {
                let input = self.input()?.infer(ctx.schema(), ctx.branch_input())?;
                let on_edges = input.ty == ValueType::Edge;
                let mut args = Argument::new();
                for label in labels {
                    let id = if on_edges {
                        ctx.schema().resolve_edge_label(label)?
                    } else {
                        ctx.schema().resolve_vertex_label(label)?
                    };
                    args = args.int(label_arg(name, id)?);
                }
                self.unary(ctx, inputs, OperatorType::HasLabel, args, self.fetch_edge())
            }
            Step::Has { prop, predicate } => {
                let def = ctx.schema().resolve_property(prop)?;
                let args = Argument::new()
                    .int(label_arg(name, def.id)?)
                    .compare(predicate.op)
                    .literal(predicate.value.clone());
                self.unary(ctx, inputs, OperatorType::Has, args, self.fetch_edge())
            }
            Step::Values { props } => {
                let mut args = Argument::new();
                for prop in props {
                    args = args.int(label_arg(name, ctx.schema().resolve_property(prop)?.id)?);
                }
                self.unary(ctx, inputs, OperatorType::PropValue, args, self.fetch_edge())
            }
            Step::Id => self.unary(ctx, inputs, OperatorType::Id, Argument::new(), EdgeKind::Forward),
            Step::Label => self.unary(
                ctx,
                inputs,
                OperatorType::LabelValue,
                Argument::new(),
                self.fetch_edge(),
            ),
            Step::CountLocal => self.unary(
                ctx,
                inputs,
                OperatorType::CountLocal,
                Argument::new(),
                EdgeKind::Forward,
            ),
            Step::Count => self.count_global(ctx, inputs),
            Step::Range { low, high } => self.range_global(ctx, inputs, *low, *high),
            Step::RangeLocal { low, high } => {
                check_bounds(name, *low, *high)?;
                self.unary(
                    ctx,
                    inputs,
                    OperatorType::RangeLocal,
                    Argument::new().long(*low).long(*high),
                    EdgeKind::Forward,
                )
            }
            Step::Dedup => self.unary(
                ctx,
                inputs,
                OperatorType::Dedup.select_key(key),
                Argument::new(),
                EdgeKind::ShuffleByKey,
            ),
            Step::Sample { amount } => self.unary(
                ctx,
                inputs,
                OperatorType::Sample.select_key(key),
                Argument::new().long(*amount),
                self.gather_edge(),
            ),
            Step::Order { by, descending } => {
                let mut args = Argument::new().flag(*descending);
                if let Some(prop) = by {
                    args = args.int(label_arg(name, ctx.schema().resolve_property(prop)?.id)?);
                }
                self.unary(
                    ctx,
                    inputs,
                    OperatorType::Order.select_key(key),
                    args,
                    self.gather_edge(),
                )
            }
            Step::Fold => {
                ctx.labels_mut().close_scope();
                self.unary(
                    ctx,
                    inputs,
                    OperatorType::Fold.select_key(key),
                    Argument::new(),
                    self.gather_edge(),
                )
            }
            Step::Unfold => self.unary(ctx, inputs, OperatorType::Unfold, Argument::new(), EdgeKind::Forward),
            Step::Select { labels } => {
                for label in labels {
                    if ctx.labels().source(label).is_none() {
                        return Err(CompileError::unresolved(label, name));
                    }
                }
                let mut args = Argument::new();
                for label in labels {
                    args = args.str(label);
                }
                self.unary(ctx, inputs, OperatorType::Select, args, EdgeKind::Forward)
            }
            Step::Union { branches } => {
                if inputs.len() != branches.len() || inputs.is_empty() {
                    return Err(CompileError::structural(
                        name,
                        format!(
                            "expected {} branch frontiers, found {}",
                            branches.len(),
                            inputs.len()
                        ),
                    ));
                }
                let args = Argument::new().int(branch_count(name, inputs.len())?);
                let mut fragment = PlanFragment::attach(inputs);
                let vertex =
                    LogicalVertex::with_args(ctx.next_vertex_id()?, OperatorType::Union, args);
                let id = fragment.add_vertex(vertex)?;
                for input in inputs {
                    fragment.add_edge(*input, id, EdgeKind::Forward)?;
                }
                self.bind_labels(ctx, &mut fragment, id)?;
                Ok(fragment)
            }
        }
    }

    /// Global range: a per-partition combiner keeps the first `high`
    /// elements, then the real range applies `(low, high)` after the shuffle.
    fn range_global(
        &self,
        ctx: &mut ContextManager<'_>,
        inputs: &[VertexId],
        low: i64,
        high: i64,
    ) -> Result<PlanFragment> {
        check_bounds(self.step.name(), low, high)?;
        let source = self.single_frontier(inputs)?;
        let mut fragment = PlanFragment::attach(inputs);

        let mut combiner = LogicalVertex::with_args(
            ctx.next_vertex_id()?,
            OperatorType::CombinerRange,
            Argument::new().long(0).long(high),
        );
        combiner.early_stop = self.early_stop;
        let combiner = fragment.add_unary(combiner, source, EdgeKind::Forward)?;

        let range = LogicalVertex::with_args(
            ctx.next_vertex_id()?,
            OperatorType::Range.select_key(self.use_key),
            Argument::new().long(low).long(high),
        );
        let range = fragment.add_unary(range, combiner, self.gather_edge())?;

        self.bind_labels(ctx, &mut fragment, range)?;
        Ok(fragment)
    }

    /// Global count: per-partition partial counts summed after the shuffle.
    fn count_global(&self, ctx: &mut ContextManager<'_>, inputs: &[VertexId]) -> Result<PlanFragment> {
        let source = self.single_frontier(inputs)?;
        ctx.labels_mut().close_scope();
        let mut fragment = PlanFragment::attach(inputs);

        let combiner = LogicalVertex::new(ctx.next_vertex_id()?, OperatorType::CombinerCount);
        let combiner = fragment.add_unary(combiner, source, EdgeKind::Forward)?;

        let sum = LogicalVertex::new(
            ctx.next_vertex_id()?,
            OperatorType::Sum.select_key(self.use_key),
        );
        let sum = fragment.add_unary(sum, combiner, self.gather_edge())?;

        self.bind_labels(ctx, &mut fragment, sum)?;
        Ok(fragment)
    }

    fn source(
        &self,
        ctx: &mut ContextManager<'_>,
        inputs: &[VertexId],
        op: OperatorType,
        args: Argument,
    ) -> Result<PlanFragment> {
        if !inputs.is_empty() {
            return Err(CompileError::structural(
                self.step.name(),
                "source steps take no input frontier",
            ));
        }
        let mut fragment = PlanFragment::attach(&[]);
        let id = fragment.add_vertex(LogicalVertex::with_args(ctx.next_vertex_id()?, op, args))?;
        self.bind_labels(ctx, &mut fragment, id)?;
        Ok(fragment)
    }

    fn unary(
        &self,
        ctx: &mut ContextManager<'_>,
        inputs: &[VertexId],
        op: OperatorType,
        args: Argument,
        edge: EdgeKind,
    ) -> Result<PlanFragment> {
        let input = self.single_frontier(inputs)?;
        let mut fragment = PlanFragment::attach(inputs);
        let vertex = LogicalVertex::with_args(ctx.next_vertex_id()?, op, args);
        let id = fragment.add_unary(vertex, input, edge)?;
        self.bind_labels(ctx, &mut fragment, id)?;
        Ok(fragment)
    }

    fn bind_labels(
        &self,
        ctx: &mut ContextManager<'_>,
        fragment: &mut PlanFragment,
        output: VertexId,
    ) -> Result<()> {
        let labels = ctx.labels_mut();
        for label in &self.labels {
            labels.record_label_usage(output, label);
        }
        for label in self.required_labels() {
            labels.record_label_requirement(output, label);
        }
        fragment.set_output(output)
    }

    fn single_frontier(&self, inputs: &[VertexId]) -> Result<VertexId> {
        match inputs {
            [input] => Ok(*input),
            _ => Err(CompileError::structural(
                self.step.name(),
                format!("expected one compiled input frontier, found {}", inputs.len()),
            )),
        }
    }

    /// Steps reading element data run where the element lives. Output of a
    /// scan is already there; anything else is routed by key.
    fn fetch_edge(&self) -> EdgeKind {
        match self.inputs.first() {
            Some(input) if input.category() == NodeType::Source && input.step != Step::Start => {
                EdgeKind::Forward
            }
            _ => EdgeKind::ShuffleByKey,
        }
    }

    /// Global steps gather onto one partition, or per key in key mode.
    fn gather_edge(&self) -> EdgeKind {
        if self.use_key {
            EdgeKind::ShuffleByKey
        } else {
            EdgeKind::ShuffleByConst
        }
    }
}

fn check_bounds(name: &str, low: i64, high: i64) -> Result<()> {
    if low < 0 || high < 0 {
        return Err(CompileError::validation(
            name,
            format!("bounds must be non-negative, got ({low}, {high})"),
        ));
    }
    if low > high {
        return Err(CompileError::validation(
            name,
            format!("low bound {low} exceeds high bound {high}"),
        ));
    }
    Ok(())
}

/// Schema ids travel as `int` operator arguments.
fn label_arg(name: &str, id: u32) -> Result<i32> {
    i32::try_from(id).map_err(|_| {
        CompileError::validation(name, format!("schema id {id} exceeds the int argument range"))
    })
}

fn branch_count(name: &str, count: usize) -> Result<i32> {
    i32::try_from(count).map_err(|_| {
        CompileError::validation(name, format!("{count} branches exceed the int argument range"))
    })
}

fn edge_label_args(ctx: &ContextManager<'_>, name: &str, labels: &[String]) -> Result<Argument> {
    let mut args = Argument::new();
    for label in labels {
        args = args.int(label_arg(name, ctx.schema().resolve_edge_label(label)?)?);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::schema::InMemorySchema;

    fn schema() -> InMemorySchema {
        InMemorySchema::new()
            .with_vertex_label("person", 1)
            .with_edge_label("knows", 2)
            .with_property("age", 3, VariantType::Int)
            .with_property("name", 4, VariantType::String)
    }

    fn v() -> TreeNode {
        TreeNode::new(Step::V {
            ids: vec![],
            vertex_labels: vec![],
        })
    }

    #[test]
    fn range_passes_input_type_through() {
        let schema = schema();
        let values = TreeNode::with_input(
            Step::Values {
                props: vec!["age".into()],
            },
            v(),
        );
        let range = TreeNode::with_input(Step::Range { low: 0, high: 3 }, values.clone());
        assert_eq!(
            range.output_type(&schema).unwrap(),
            values.output_type(&schema).unwrap()
        );
        assert_eq!(
            range.output_type(&schema).unwrap(),
            ValueType::Property(VariantType::Int)
        );
    }

    #[test]
    fn oversized_schema_id_is_rejected() {
        let schema = InMemorySchema::new().with_edge_label("huge", u32::MAX);
        let expand = TreeNode::with_input(
            Step::Expand {
                direction: Direction::Out,
                edge_labels: vec!["huge".into()],
            },
            v(),
        );
        let err = crate::compiler::compile(&expand, &schema).unwrap_err();
        assert!(
            matches!(&err, CompileError::Validation { node, .. } if node == "expand"),
            "{err:?}"
        );
    }

    #[test]
    fn count_local_is_always_long() {
        let schema = schema();
        for input in [
            v(),
            TreeNode::with_input(Step::Fold, v()),
            TreeNode::with_input(Step::Label, v()),
        ] {
            let count = TreeNode::with_input(Step::CountLocal, input);
            assert_eq!(count.output_type(&schema).unwrap(), ValueType::long());
        }
    }

    #[test]
    fn output_type_is_stable() {
        let schema = schema();
        let node = TreeNode::with_input(Step::Fold, v());
        let first = node.output_type(&schema).unwrap();
        let second = node.output_type(&schema).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, ValueType::list_of(ValueType::Vertex));
    }

    #[test]
    fn select_resolves_label_types() {
        let schema = schema();
        let mut tagged = v();
        tagged.labels.push("a".into());
        let values = TreeNode::with_input(
            Step::Values {
                props: vec!["name".into()],
            },
            tagged,
        );
        let mut named = values;
        named.labels.push("b".into());
        let single = TreeNode::with_input(
            Step::Select {
                labels: vec!["a".into()],
            },
            named.clone(),
        );
        assert_eq!(single.output_type(&schema).unwrap(), ValueType::Vertex);
        let both = TreeNode::with_input(
            Step::Select {
                labels: vec!["a".into(), "b".into()],
            },
            named,
        );
        match both.output_type(&schema).unwrap() {
            ValueType::Map(key, _) => assert_eq!(*key, ValueType::Value(VariantType::String)),
            other => panic!("expected map, got {other}"),
        }
    }

    #[test]
    fn select_on_missing_label_fails() {
        let schema = schema();
        let select = TreeNode::with_input(
            Step::Select {
                labels: vec!["missing".into()],
            },
            v(),
        );
        assert!(matches!(
            select.output_type(&schema),
            Err(CompileError::UnresolvedLabel { .. })
        ));
    }

    #[test]
    fn expand_rejects_edge_input() {
        let schema = schema();
        let edges = TreeNode::new(Step::E {
            ids: vec![],
            edge_labels: vec![],
        });
        let expand = TreeNode::with_input(
            Step::Expand {
                direction: Direction::Out,
                edge_labels: vec![],
            },
            edges,
        );
        assert!(matches!(
            expand.output_type(&schema),
            Err(CompileError::Validation { .. })
        ));
    }

    #[test]
    fn validate_rejects_bad_bounds_and_arity() {
        let inverted = TreeNode::with_input(Step::Range { low: 5, high: 2 }, v());
        assert!(matches!(
            inverted.validate(),
            Err(CompileError::Validation { .. })
        ));
        let negative = TreeNode::with_input(Step::Range { low: -1, high: 2 }, v());
        assert!(matches!(
            negative.validate(),
            Err(CompileError::Validation { .. })
        ));
        let orphan = TreeNode::new(Step::Count);
        assert!(matches!(
            orphan.validate(),
            Err(CompileError::Structural { .. })
        ));
    }

    #[test]
    fn has_within_requires_list() {
        let has = TreeNode::with_input(
            Step::Has {
                prop: "age".into(),
                predicate: Predicate::new(CompareOp::Within, 3_i64),
            },
            v(),
        );
        assert!(has.validate().is_err());
    }

    #[test]
    fn union_unifies_branch_types() {
        let schema = schema();
        let start = || TreeNode::new(Step::Start);
        let union = TreeNode::with_input(
            Step::Union {
                branches: vec![
                    TreeNode::with_input(
                        Step::Expand {
                            direction: Direction::Out,
                            edge_labels: vec![],
                        },
                        start(),
                    ),
                    TreeNode::with_input(
                        Step::ExpandEdge {
                            direction: Direction::Out,
                            edge_labels: vec![],
                        },
                        start(),
                    ),
                ],
            },
            v(),
        );
        match union.output_type(&schema).unwrap() {
            ValueType::Variety(set) => assert_eq!(set.len(), 2),
            other => panic!("expected variety, got {other}"),
        }
    }

    #[test]
    fn tree_deserializes_from_json() {
        let node: TreeNode = serde_json::from_str(
            r#"{"step":"range","low":2,"high":5,"early_stop":true,
                "inputs":[{"step":"v"}]}"#,
        )
        .expect("tree parses");
        assert_eq!(node.step, Step::Range { low: 2, high: 5 });
        assert!(node.early_stop);
        assert_eq!(node.inputs.len(), 1);
    }
}
