//! Fluent traversal builder.

use crate::compiler::errors::{CompileError, Result};
use crate::compiler::logical::CompareOp;
use crate::compiler::planner::{CompiledPlan, PlanExplain, TraversalCompiler};
use crate::compiler::tree::{Direction, EdgeEnd, Predicate, Step, TreeNode};
use crate::compiler::value::Value;

/// Builds a [`TreeNode`] one step at a time, `g.V().out("knows").range(0, 5)`
/// style.
#[derive(Debug)]
pub struct Traversal {
    root: Option<TreeNode>,
    error: Option<CompileError>,
}

impl Traversal {
    fn from_node(node: TreeNode) -> Self {
        Self {
            root: Some(node),
            error: None,
        }
    }

    /// Starts from every vertex.
    pub fn v() -> Self {
        Self::v_ids(Vec::new())
    }

    /// Starts from the given vertex ids.
    pub fn v_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::from_node(TreeNode::new(Step::V {
            ids: ids.into_iter().collect(),
            vertex_labels: Vec::new(),
        }))
    }

    /// Starts from every edge.
    pub fn e() -> Self {
        Self::from_node(TreeNode::new(Step::E {
            ids: Vec::new(),
            edge_labels: Vec::new(),
        }))
    }

    /// Anonymous traversal used as a branch; starts at the enclosing step's
    /// input.
    pub fn anonymous() -> Self {
        Self::from_node(TreeNode::new(Step::Start))
    }

    fn push(mut self, step: Step) -> Self {
        if self.error.is_some() {
            return self;
        }
        match self.root.take() {
            Some(input) => self.root = Some(TreeNode::with_input(step, input)),
            None => {
                self.error = Some(CompileError::structural(step.name(), "no input step"));
            }
        }
        self
    }

    fn expand(self, direction: Direction, labels: &[&str]) -> Self {
        self.push(Step::Expand {
            direction,
            edge_labels: owned(labels),
        })
    }

    fn expand_edge(self, direction: Direction, labels: &[&str]) -> Self {
        self.push(Step::ExpandEdge {
            direction,
            edge_labels: owned(labels),
        })
    }

    /// Adjacent vertices over outgoing edges.
    pub fn out(self, labels: &[&str]) -> Self {
        self.expand(Direction::Out, labels)
    }

    /// Adjacent vertices over incoming edges.
    pub fn in_(self, labels: &[&str]) -> Self {
        self.expand(Direction::In, labels)
    }

    /// Adjacent vertices in both directions.
    pub fn both(self, labels: &[&str]) -> Self {
        self.expand(Direction::Both, labels)
    }

    /// Outgoing edges.
    pub fn out_e(self, labels: &[&str]) -> Self {
        self.expand_edge(Direction::Out, labels)
    }

    /// Incoming edges.
    pub fn in_e(self, labels: &[&str]) -> Self {
        self.expand_edge(Direction::In, labels)
    }

    /// Edges in both directions.
    pub fn both_e(self, labels: &[&str]) -> Self {
        self.expand_edge(Direction::Both, labels)
    }

    /// Source vertex of each edge.
    pub fn out_v(self) -> Self {
        self.push(Step::EdgeVertex { end: EdgeEnd::Out })
    }

    /// Destination vertex of each edge.
    pub fn in_v(self) -> Self {
        self.push(Step::EdgeVertex { end: EdgeEnd::In })
    }

    /// Both endpoints of each edge.
    pub fn both_v(self) -> Self {
        self.push(Step::EdgeVertex { end: EdgeEnd::Both })
    }

    /// Endpoint the traverser did not come from.
    pub fn other_v(self) -> Self {
        self.push(Step::EdgeVertex {
            end: EdgeEnd::Other,
        })
    }

    /// Keeps elements with one of the labels.
    pub fn has_label(self, labels: &[&str]) -> Self {
        self.push(Step::HasLabel {
            labels: owned(labels),
        })
    }

    /// Keeps elements whose property equals `value`.
    pub fn has(self, prop: &str, value: impl Into<Value>) -> Self {
        self.has_where(prop, CompareOp::Eq, value)
    }

    /// Keeps elements whose property satisfies `op value`.
    pub fn has_where(self, prop: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        self.push(Step::Has {
            prop: prop.to_owned(),
            predicate: Predicate::new(op, value),
        })
    }

    /// Property values.
    pub fn values(self, props: &[&str]) -> Self {
        self.push(Step::Values {
            props: owned(props),
        })
    }

    /// Element ids.
    pub fn id(self) -> Self {
        self.push(Step::Id)
    }

    /// Element labels.
    pub fn label(self) -> Self {
        self.push(Step::Label)
    }

    /// Global count.
    pub fn count(self) -> Self {
        self.push(Step::Count)
    }

    /// Size of each incoming collection.
    pub fn count_local(self) -> Self {
        self.push(Step::CountLocal)
    }

    /// Global range, `high` exclusive.
    pub fn range(self, low: i64, high: i64) -> Self {
        self.push(Step::Range { low, high })
    }

    /// Shorthand for `range(0, n)`.
    pub fn limit(self, n: i64) -> Self {
        self.range(0, n)
    }

    /// Range over the items of each incoming collection.
    pub fn range_local(self, low: i64, high: i64) -> Self {
        self.push(Step::RangeLocal { low, high })
    }

    /// Drops duplicates.
    pub fn dedup(self) -> Self {
        self.push(Step::Dedup)
    }

    /// Keeps `amount` random elements.
    pub fn sample(self, amount: i64) -> Self {
        self.push(Step::Sample { amount })
    }

    /// Orders by the element itself, or by `by` when given.
    pub fn order(self, by: Option<&str>, descending: bool) -> Self {
        self.push(Step::Order {
            by: by.map(str::to_owned),
            descending,
        })
    }

    /// Collects everything into a list.
    pub fn fold(self) -> Self {
        self.push(Step::Fold)
    }

    /// Expands collections into their items.
    pub fn unfold(self) -> Self {
        self.push(Step::Unfold)
    }

    /// Reads labelled values.
    pub fn select(self, labels: &[&str]) -> Self {
        self.push(Step::Select {
            labels: owned(labels),
        })
    }

    /// Runs every branch on the current output and merges the results.
    pub fn union(mut self, branches: Vec<Traversal>) -> Self {
        let mut nodes = Vec::with_capacity(branches.len());
        for branch in branches {
            match branch.build() {
                Ok(node) => nodes.push(node),
                Err(err) => {
                    self.error.get_or_insert(err);
                    return self;
                }
            }
        }
        self.push(Step::Union { branches: nodes })
    }

    /// Binds the current step's output to `label`.
    pub fn as_(mut self, label: &str) -> Self {
        if let Some(root) = self.root.as_mut() {
            root.labels.push(label.to_owned());
        }
        self
    }

    /// Switches the current step to key-addressed mode.
    pub fn by_key(mut self) -> Self {
        if let Some(root) = self.root.as_mut() {
            root.use_key = true;
        }
        self
    }

    /// Allows the current step to stop early.
    pub fn early_stop(mut self) -> Self {
        if let Some(root) = self.root.as_mut() {
            root.early_stop = true;
        }
        self
    }

    /// Finalizes the tree.
    pub fn build(self) -> Result<TreeNode> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.root
            .ok_or_else(|| CompileError::structural("traversal", "empty traversal"))
    }

    /// Builds and compiles the traversal.
    pub fn compile(self, compiler: &TraversalCompiler<'_>) -> Result<CompiledPlan> {
        compiler.compile(&self.build()?)
    }

    /// Builds, compiles and explains the traversal.
    pub fn explain(self, compiler: &TraversalCompiler<'_>) -> Result<PlanExplain> {
        Ok(self.compile(compiler)?.explain())
    }
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| (*item).to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_tree() {
        let tree = Traversal::v().as_("a").out(&["knows"]).range(2, 5).build().unwrap();
        assert_eq!(tree.step, Step::Range { low: 2, high: 5 });
        let expand = tree.input().unwrap();
        assert!(matches!(expand.step, Step::Expand { .. }));
        assert_eq!(expand.input().unwrap().labels, vec!["a".to_owned()]);
    }

    #[test]
    fn union_branches_start_at_placeholder() {
        let tree = Traversal::v()
            .union(vec![
                Traversal::anonymous().out(&[]),
                Traversal::anonymous().in_(&[]),
            ])
            .build()
            .unwrap();
        let Step::Union { branches } = &tree.step else {
            panic!("expected union");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].input().unwrap().step, Step::Start);
    }
}
