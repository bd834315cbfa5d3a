//! Logical plan graph: operator vertices connected by data-movement edges.
//!
//! The graph is an arena keyed by [`VertexId`]. Tree nodes emit
//! [`PlanFragment`]s hanging off the frontier of their inputs, and the driver
//! merges each fragment into the [`LogicalPlan`] under construction.

use std::collections::BTreeSet;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::compiler::errors::{CompileError, Result};
use crate::compiler::value::Value;
use crate::types::VertexId;

/// Operator kinds understood by the backend execution engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum OperatorType {
    V,
    E,
    Out,
    In,
    Both,
    OutE,
    InE,
    BothE,
    OutV,
    InV,
    BothV,
    OtherV,
    HasLabel,
    Has,
    PropValue,
    Id,
    LabelValue,
    CountLocal,
    CombinerCount,
    Sum,
    SumByKey,
    CombinerRange,
    Range,
    RangeByKey,
    RangeLocal,
    Dedup,
    DedupByKey,
    Sample,
    SampleByKey,
    Order,
    OrderByKey,
    Fold,
    FoldByKey,
    Unfold,
    Select,
    Union,
}

impl OperatorType {
    /// Key-aware variant of this operator, or the operator itself when it has
    /// none.
    pub fn use_key(self) -> Self {
        match self {
            OperatorType::Sum => OperatorType::SumByKey,
            OperatorType::Range => OperatorType::RangeByKey,
            OperatorType::Dedup => OperatorType::DedupByKey,
            OperatorType::Sample => OperatorType::SampleByKey,
            OperatorType::Order => OperatorType::OrderByKey,
            OperatorType::Fold => OperatorType::FoldByKey,
            other => other,
        }
    }

    /// Picks the key-aware variant when `use_key` is set.
    pub fn select_key(self, use_key: bool) -> Self {
        if use_key {
            self.use_key()
        } else {
            self
        }
    }

    /// Whether results leave this operator in a defined order.
    pub fn preserves_order(self) -> bool {
        matches!(self, OperatorType::Order | OperatorType::OrderByKey)
    }

    /// Emits exactly one output per input element.
    pub fn is_one_to_one(self) -> bool {
        matches!(
            self,
            OperatorType::Id
                | OperatorType::LabelValue
                | OperatorType::CountLocal
                | OperatorType::RangeLocal
                | OperatorType::Select
                | OperatorType::OutV
                | OperatorType::InV
                | OperatorType::OtherV
        )
    }

    /// Partial operators inserted ahead of a global one.
    pub fn is_combiner(self) -> bool {
        matches!(self, OperatorType::CombinerRange | OperatorType::CombinerCount)
    }

    /// Canonical operator name as printed in explain output.
    pub fn name(self) -> &'static str {
        match self {
            OperatorType::V => "V",
            OperatorType::E => "E",
            OperatorType::Out => "OUT",
            OperatorType::In => "IN",
            OperatorType::Both => "BOTH",
            OperatorType::OutE => "OUT_E",
            OperatorType::InE => "IN_E",
            OperatorType::BothE => "BOTH_E",
            OperatorType::OutV => "OUT_V",
            OperatorType::InV => "IN_V",
            OperatorType::BothV => "BOTH_V",
            OperatorType::OtherV => "OTHER_V",
            OperatorType::HasLabel => "HAS_LABEL",
            OperatorType::Has => "HAS",
            OperatorType::PropValue => "PROP_VALUE",
            OperatorType::Id => "ID",
            OperatorType::LabelValue => "LABEL_VALUE",
            OperatorType::CountLocal => "COUNT_LOCAL",
            OperatorType::CombinerCount => "COMBINER_COUNT",
            OperatorType::Sum => "SUM",
            OperatorType::SumByKey => "SUM_BY_KEY",
            OperatorType::CombinerRange => "COMBINER_RANGE",
            OperatorType::Range => "RANGE",
            OperatorType::RangeByKey => "RANGE_BY_KEY",
            OperatorType::RangeLocal => "RANGE_LOCAL",
            OperatorType::Dedup => "DEDUP",
            OperatorType::DedupByKey => "DEDUP_BY_KEY",
            OperatorType::Sample => "SAMPLE",
            OperatorType::SampleByKey => "SAMPLE_BY_KEY",
            OperatorType::Order => "ORDER",
            OperatorType::OrderByKey => "ORDER_BY_KEY",
            OperatorType::Fold => "FOLD",
            OperatorType::FoldByKey => "FOLD_BY_KEY",
            OperatorType::Unfold => "UNFOLD",
            OperatorType::Select => "SELECT",
            OperatorType::Union => "UNION",
        }
    }
}

impl fmt::Display for OperatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison applied by `has` filters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Within,
    Without,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompareOp::Eq => "eq",
            CompareOp::Neq => "neq",
            CompareOp::Lt => "lt",
            CompareOp::Lte => "lte",
            CompareOp::Gt => "gt",
            CompareOp::Gte => "gte",
            CompareOp::Within => "within",
            CompareOp::Without => "without",
        };
        f.write_str(name)
    }
}

/// One typed entry of an operator argument list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
#[allow(missing_docs)]
pub enum ArgValue {
    Long(i64),
    Int(i32),
    Bool(bool),
    Str(String),
    Compare(CompareOp),
    Literal(Value),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Long(v) => write!(f, "{v}"),
            ArgValue::Int(v) => write!(f, "{v}"),
            ArgValue::Bool(v) => write!(f, "{v}"),
            ArgValue::Str(v) => write!(f, "{v}"),
            ArgValue::Compare(op) => write!(f, "{op}"),
            ArgValue::Literal(v) => write!(f, "{v}"),
        }
    }
}

/// Opaque operator parameters, encoded as a typed value list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Argument {
    values: Vec<ArgValue>,
}

impl Argument {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a long value.
    pub fn long(mut self, value: i64) -> Self {
        self.values.push(ArgValue::Long(value));
        self
    }

    /// Appends an int value.
    pub fn int(mut self, value: i32) -> Self {
        self.values.push(ArgValue::Int(value));
        self
    }

    /// Appends a boolean.
    pub fn flag(mut self, value: bool) -> Self {
        self.values.push(ArgValue::Bool(value));
        self
    }

    /// Appends a string.
    pub fn str(mut self, value: impl Into<String>) -> Self {
        self.values.push(ArgValue::Str(value.into()));
        self
    }

    /// Appends a comparison operator.
    pub fn compare(mut self, op: CompareOp) -> Self {
        self.values.push(ArgValue::Compare(op));
        self
    }

    /// Appends a literal.
    pub fn literal(mut self, value: Value) -> Self {
        self.values.push(ArgValue::Literal(value));
        self
    }

    /// Entries in insertion order.
    pub fn values(&self) -> &[ArgValue] {
        &self.values
    }

    /// Long entries in insertion order, skipping other kinds.
    pub fn longs(&self) -> Vec<i64> {
        self.values
            .iter()
            .filter_map(|value| match value {
                ArgValue::Long(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// True when no entries were added.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One operator instance in the compiled plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalVertex {
    /// Unique id within the plan.
    pub id: VertexId,
    /// Operator kind.
    pub op: OperatorType,
    /// Operator parameters.
    pub args: Argument,
    /// Operator may short-circuit once it produced enough output.
    #[serde(default)]
    pub early_stop: bool,
}

impl LogicalVertex {
    /// Vertex without arguments.
    pub fn new(id: VertexId, op: OperatorType) -> Self {
        Self::with_args(id, op, Argument::new())
    }

    /// Vertex with the given arguments.
    pub fn with_args(id: VertexId, op: OperatorType, args: Argument) -> Self {
        Self {
            id,
            op,
            args,
            early_stop: false,
        }
    }
}

/// Data movement between two operators.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Output stays on the producing partition.
    Forward,
    /// Output is redistributed by element key.
    ShuffleByKey,
    /// Output is gathered onto a single partition.
    ShuffleByConst,
    /// Output is replicated to every partition.
    Broadcast,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeKind::Forward => "forward",
            EdgeKind::ShuffleByKey => "shuffle-by-key",
            EdgeKind::ShuffleByConst => "shuffle-by-const",
            EdgeKind::Broadcast => "broadcast",
        };
        f.write_str(name)
    }
}

/// Directed connection between two vertices.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LogicalEdge {
    /// Producing vertex.
    pub from: VertexId,
    /// Consuming vertex.
    pub to: VertexId,
    /// Movement semantics.
    pub kind: EdgeKind,
}

/// Plan delta emitted by one tree node.
///
/// A fragment hangs off the frontier vertices of its inputs; its edges may
/// only reference those frontier vertices or vertices added to the fragment.
#[derive(Debug)]
pub struct PlanFragment {
    attached: SmallVec<[VertexId; 2]>,
    vertices: Vec<LogicalVertex>,
    edges: Vec<LogicalEdge>,
    output: Option<VertexId>,
}

impl PlanFragment {
    /// Starts a fragment attached to the given input frontiers.
    pub fn attach(frontier: &[VertexId]) -> Self {
        Self {
            attached: frontier.iter().copied().collect(),
            vertices: Vec::new(),
            edges: Vec::new(),
            output: None,
        }
    }

    fn knows(&self, id: VertexId) -> bool {
        self.attached.contains(&id) || self.vertices.iter().any(|v| v.id == id)
    }

    /// Adds a vertex to the fragment.
    pub fn add_vertex(&mut self, vertex: LogicalVertex) -> Result<VertexId> {
        if self.knows(vertex.id) {
            return Err(CompileError::structural(
                vertex.op.name(),
                format!("vertex id {} allocated twice", vertex.id),
            ));
        }
        let id = vertex.id;
        self.vertices.push(vertex);
        Ok(id)
    }

    /// Connects two vertices known to the fragment.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId, kind: EdgeKind) -> Result<()> {
        for id in [from, to] {
            if !self.knows(id) {
                return Err(CompileError::DanglingVertex { vertex: id });
            }
        }
        self.edges.push(LogicalEdge { from, to, kind });
        Ok(())
    }

    /// Convenience: adds `vertex` and wires `input` into it.
    pub fn add_unary(
        &mut self,
        vertex: LogicalVertex,
        input: VertexId,
        kind: EdgeKind,
    ) -> Result<VertexId> {
        let id = self.add_vertex(vertex)?;
        self.add_edge(input, id, kind)?;
        Ok(id)
    }

    /// Marks the vertex that becomes the new frontier.
    pub fn set_output(&mut self, id: VertexId) -> Result<()> {
        if !self.knows(id) {
            return Err(CompileError::DanglingVertex { vertex: id });
        }
        self.output = Some(id);
        Ok(())
    }

    /// Frontier vertex produced by this fragment.
    pub fn output(&self) -> Option<VertexId> {
        self.output
    }

    /// Vertices emitted by this fragment.
    pub fn vertices(&self) -> &[LogicalVertex] {
        &self.vertices
    }
}

/// The compiled dataflow DAG.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "PlanParts", into = "PlanParts")]
pub struct LogicalPlan {
    vertices: Vec<LogicalVertex>,
    index: FxHashMap<VertexId, usize>,
    edges: Vec<LogicalEdge>,
    finish: BTreeSet<VertexId>,
}

impl LogicalPlan {
    /// Empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vertex. Ids must be unique.
    pub fn add_vertex(&mut self, vertex: LogicalVertex) -> Result<()> {
        if self.index.contains_key(&vertex.id) {
            return Err(CompileError::structural(
                vertex.op.name(),
                format!("vertex id {} already present", vertex.id),
            ));
        }
        self.index.insert(vertex.id, self.vertices.len());
        self.vertices.push(vertex);
        Ok(())
    }

    /// Adds an edge between two vertices already present in the plan.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId, kind: EdgeKind) -> Result<()> {
        for id in [from, to] {
            if !self.contains(id) {
                return Err(CompileError::DanglingVertex { vertex: id });
            }
        }
        if from == to || self.is_ancestor(to, from) {
            return Err(CompileError::structural(
                "plan",
                format!("edge {from} -> {to} would create a cycle"),
            ));
        }
        self.edges.push(LogicalEdge { from, to, kind });
        Ok(())
    }

    /// Marks a vertex as a plan output.
    pub fn set_finish(&mut self, id: VertexId) -> Result<()> {
        if !self.contains(id) {
            return Err(CompileError::DanglingVertex { vertex: id });
        }
        self.finish.insert(id);
        Ok(())
    }

    /// Merges a fragment whose attach points are already in the plan and
    /// returns the fragment's frontier vertex.
    pub fn merge(&mut self, fragment: PlanFragment) -> Result<VertexId> {
        for id in &fragment.attached {
            if !self.contains(*id) {
                return Err(CompileError::DanglingVertex { vertex: *id });
            }
        }
        let output = fragment.output.ok_or_else(|| {
            CompileError::structural("plan", "fragment did not declare an output vertex")
        })?;
        for vertex in fragment.vertices {
            self.add_vertex(vertex)?;
        }
        for edge in fragment.edges {
            self.add_edge(edge.from, edge.to, edge.kind)?;
        }
        Ok(output)
    }

    /// Whether `id` is in the plan.
    pub fn contains(&self, id: VertexId) -> bool {
        self.index.contains_key(&id)
    }

    /// Vertex lookup.
    pub fn vertex(&self, id: VertexId) -> Option<&LogicalVertex> {
        self.index.get(&id).map(|idx| &self.vertices[*idx])
    }

    /// All vertices in insertion order.
    pub fn vertices(&self) -> &[LogicalVertex] {
        &self.vertices
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> &[LogicalEdge] {
        &self.edges
    }

    /// Output vertices.
    pub fn finish(&self) -> &BTreeSet<VertexId> {
        &self.finish
    }

    /// Edges entering `id`.
    pub fn incoming(&self, id: VertexId) -> impl Iterator<Item = &LogicalEdge> {
        self.edges.iter().filter(move |edge| edge.to == id)
    }

    /// Edges leaving `id`.
    pub fn outgoing(&self, id: VertexId) -> impl Iterator<Item = &LogicalEdge> {
        self.edges.iter().filter(move |edge| edge.from == id)
    }

    /// True when `ancestor` reaches `id` through one or more edges, or the
    /// two are the same vertex.
    pub fn is_ancestor(&self, ancestor: VertexId, id: VertexId) -> bool {
        let mut stack = vec![id];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.extend(self.incoming(current).map(|edge| edge.from));
        }
        false
    }

    /// Count of vertices running `op`.
    pub fn count_op(&self, op: OperatorType) -> usize {
        self.vertices.iter().filter(|v| v.op == op).count()
    }
}

#[derive(Serialize, Deserialize)]
struct PlanParts {
    vertices: Vec<LogicalVertex>,
    edges: Vec<LogicalEdge>,
    finish: Vec<VertexId>,
}

impl From<LogicalPlan> for PlanParts {
    fn from(plan: LogicalPlan) -> Self {
        Self {
            vertices: plan.vertices,
            edges: plan.edges,
            finish: plan.finish.into_iter().collect(),
        }
    }
}

impl TryFrom<PlanParts> for LogicalPlan {
    type Error = CompileError;

    fn try_from(parts: PlanParts) -> Result<Self> {
        let mut plan = LogicalPlan::new();
        for vertex in parts.vertices {
            plan.add_vertex(vertex)?;
        }
        for edge in parts.edges {
            plan.add_edge(edge.from, edge.to, edge.kind)?;
        }
        for id in parts.finish {
            plan.set_finish(id)?;
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(id: u32, op: OperatorType) -> LogicalVertex {
        LogicalVertex::new(VertexId(id), op)
    }

    #[test]
    fn edges_require_known_endpoints() {
        let mut plan = LogicalPlan::new();
        plan.add_vertex(vertex(1, OperatorType::V)).unwrap();
        let err = plan
            .add_edge(VertexId(1), VertexId(2), EdgeKind::Forward)
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::DanglingVertex {
                vertex: VertexId(2)
            }
        );
        assert!(plan.set_finish(VertexId(9)).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut plan = LogicalPlan::new();
        plan.add_vertex(vertex(1, OperatorType::V)).unwrap();
        assert!(plan.add_vertex(vertex(1, OperatorType::E)).is_err());
    }

    #[test]
    fn cycles_are_rejected() {
        let mut plan = LogicalPlan::new();
        plan.add_vertex(vertex(1, OperatorType::V)).unwrap();
        plan.add_vertex(vertex(2, OperatorType::Out)).unwrap();
        plan.add_edge(VertexId(1), VertexId(2), EdgeKind::Forward)
            .unwrap();
        assert!(plan
            .add_edge(VertexId(2), VertexId(1), EdgeKind::Forward)
            .is_err());
        assert!(plan.is_ancestor(VertexId(1), VertexId(2)));
        assert!(!plan.is_ancestor(VertexId(2), VertexId(1)));
    }

    #[test]
    fn fragments_must_attach_to_existing_frontier() {
        let mut fragment = PlanFragment::attach(&[VertexId(5)]);
        let id = fragment
            .add_unary(vertex(6, OperatorType::Out), VertexId(5), EdgeKind::Forward)
            .unwrap();
        fragment.set_output(id).unwrap();
        let mut plan = LogicalPlan::new();
        assert_eq!(
            plan.merge(fragment).unwrap_err(),
            CompileError::DanglingVertex {
                vertex: VertexId(5)
            }
        );
    }

    #[test]
    fn fragment_edges_cannot_reach_outside() {
        let mut fragment = PlanFragment::attach(&[VertexId(1)]);
        fragment.add_vertex(vertex(2, OperatorType::Out)).unwrap();
        assert!(fragment
            .add_edge(VertexId(3), VertexId(2), EdgeKind::Forward)
            .is_err());
    }

    #[test]
    fn key_variants() {
        assert_eq!(OperatorType::Range.use_key(), OperatorType::RangeByKey);
        assert_eq!(OperatorType::Out.use_key(), OperatorType::Out);
        assert_eq!(OperatorType::Dedup.select_key(false), OperatorType::Dedup);
    }

    #[test]
    fn argument_builder_keeps_order() {
        let args = Argument::new().long(0).long(5).str("x");
        assert_eq!(args.longs(), vec![0, 5]);
        assert_eq!(args.values().len(), 3);
    }
}
