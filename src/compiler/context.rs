//! Per-compilation state: vertex id allocation and label bookkeeping.
//!
//! A [`ContextManager`] is created for exactly one compilation and passed
//! down the tree walk explicitly. Nothing in here is shared between
//! compilations, so none of it is synchronized.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::compiler::errors::{CompileError, Result};
use crate::compiler::schema::GraphSchema;
use crate::compiler::tree::Inferred;
use crate::types::VertexId;

/// Strictly increasing vertex id allocator.
#[derive(Debug)]
pub struct VertexIdManager {
    next: u32,
}

impl VertexIdManager {
    /// Allocator whose first id is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    /// Returns a fresh id.
    pub fn next_id(&mut self) -> Result<VertexId> {
        let id = self.next;
        self.next = id.checked_add(1).ok_or(CompileError::VertexIdOverflow)?;
        Ok(VertexId(id))
    }
}

impl Default for VertexIdManager {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Where a label's value is produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LabelSource {
    /// Vertex whose output is bound to the label.
    pub producer: VertexId,
    /// Label scope open when the label was bound.
    pub scope: u32,
}

/// Label binding exposed on a compiled plan.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LabelBinding {
    /// Label name.
    pub label: String,
    /// Vertex whose output is bound to the label.
    pub producer: VertexId,
    /// Vertices that read the label's value.
    pub consumers: BTreeSet<VertexId>,
}

/// Tracks which vertices bind labels and which vertices require them.
#[derive(Debug, Default)]
pub struct LabelManager {
    sources: FxHashMap<String, LabelSource>,
    used: BTreeMap<VertexId, BTreeSet<String>>,
    required: BTreeMap<VertexId, BTreeSet<String>>,
    scope: u32,
}

impl LabelManager {
    /// Marks that `vertex`'s output must stay addressable under `label`.
    ///
    /// Rebinding a label points it at the most recent producer.
    pub fn record_label_usage(&mut self, vertex: VertexId, label: &str) {
        self.sources.insert(
            label.to_owned(),
            LabelSource {
                producer: vertex,
                scope: self.scope,
            },
        );
        self.used
            .entry(vertex)
            .or_default()
            .insert(label.to_owned());
    }

    /// Marks that `vertex` reads the value bound to `label`.
    pub fn record_label_requirement(&mut self, vertex: VertexId, label: &str) {
        self.required
            .entry(vertex)
            .or_default()
            .insert(label.to_owned());
    }

    /// Looks up the current binding of `label`.
    pub fn source(&self, label: &str) -> Option<&LabelSource> {
        self.sources.get(label)
    }

    /// Closes the current label scope. Labels bound before this point are no
    /// longer carried along the traverser path.
    pub fn close_scope(&mut self) {
        self.scope += 1;
    }

    /// Identifier of the open label scope.
    pub fn scope(&self) -> u32 {
        self.scope
    }

    /// Labels bound on `vertex`.
    pub fn used_labels(&self, vertex: VertexId) -> Option<&BTreeSet<String>> {
        self.used.get(&vertex)
    }

    /// Labels `vertex` reads.
    pub fn required_labels(&self, vertex: VertexId) -> Option<&BTreeSet<String>> {
        self.required.get(&vertex)
    }

    /// Every vertex with at least one label requirement.
    pub fn requirements(&self) -> impl Iterator<Item = (VertexId, &BTreeSet<String>)> {
        self.required.iter().map(|(vertex, labels)| (*vertex, labels))
    }

    /// Collapses the accumulated state into per-label bindings.
    pub fn bindings(&self) -> Vec<LabelBinding> {
        let mut out: BTreeMap<&str, LabelBinding> = BTreeMap::new();
        for (label, source) in &self.sources {
            out.insert(
                label,
                LabelBinding {
                    label: label.clone(),
                    producer: source.producer,
                    consumers: BTreeSet::new(),
                },
            );
        }
        for (vertex, labels) in &self.required {
            for label in labels {
                if let Some(binding) = out.get_mut(label.as_str()) {
                    binding.consumers.insert(*vertex);
                }
            }
        }
        out.into_values().collect()
    }
}

/// Compilation context handed to every tree node.
pub struct ContextManager<'a> {
    schema: &'a dyn GraphSchema,
    ids: VertexIdManager,
    labels: LabelManager,
    branch_inputs: Vec<Inferred>,
}

impl<'a> ContextManager<'a> {
    /// Fresh context whose ids start at 1.
    pub fn new(schema: &'a dyn GraphSchema) -> Self {
        Self::with_id_manager(schema, VertexIdManager::default())
    }

    /// Fresh context using a caller-supplied id allocator.
    pub fn with_id_manager(schema: &'a dyn GraphSchema, ids: VertexIdManager) -> Self {
        Self {
            schema,
            ids,
            labels: LabelManager::default(),
            branch_inputs: Vec::new(),
        }
    }

    /// Returns a fresh vertex id.
    pub fn next_vertex_id(&mut self) -> Result<VertexId> {
        self.ids.next_id()
    }

    /// Read-only schema lookup.
    pub fn schema(&self) -> &'a dyn GraphSchema {
        self.schema
    }

    /// Label bookkeeping.
    pub fn labels(&self) -> &LabelManager {
        &self.labels
    }

    /// Mutable label bookkeeping.
    pub fn labels_mut(&mut self) -> &mut LabelManager {
        &mut self.labels
    }

    /// Enters a branch whose `start` placeholder stands for `input`.
    pub(crate) fn enter_branch(&mut self, input: Inferred) {
        self.branch_inputs.push(input);
    }

    pub(crate) fn leave_branch(&mut self) {
        self.branch_inputs.pop();
    }

    /// Inferred input of the innermost enclosing branch.
    pub(crate) fn branch_input(&self) -> Option<&Inferred> {
        self.branch_inputs.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::schema::InMemorySchema;

    #[test]
    fn ids_are_strictly_increasing() {
        let schema = InMemorySchema::new();
        let mut ctx = ContextManager::new(&schema);
        let a = ctx.next_vertex_id().unwrap();
        let b = ctx.next_vertex_id().unwrap();
        assert!(b > a);
    }

    #[test]
    fn overflow_is_reported() {
        let mut ids = VertexIdManager::starting_at(u32::MAX);
        assert!(matches!(
            ids.next_id(),
            Err(CompileError::VertexIdOverflow)
        ));
    }

    #[test]
    fn bindings_collect_consumers() {
        let mut labels = LabelManager::default();
        labels.record_label_usage(VertexId(1), "a");
        labels.record_label_requirement(VertexId(4), "a");
        labels.record_label_requirement(VertexId(5), "a");
        assert!(labels.used_labels(VertexId(1)).is_some_and(|set| set.contains("a")));
        assert_eq!(labels.requirements().count(), 2);
        let bindings = labels.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].producer, VertexId(1));
        assert_eq!(
            bindings[0].consumers.iter().copied().collect::<Vec<_>>(),
            vec![VertexId(4), VertexId(5)]
        );
    }

    #[test]
    fn rebinding_points_at_latest_producer() {
        let mut labels = LabelManager::default();
        labels.record_label_usage(VertexId(1), "a");
        labels.close_scope();
        labels.record_label_usage(VertexId(3), "a");
        let source = labels.source("a").unwrap();
        assert_eq!(source.producer, VertexId(3));
        assert_eq!(source.scope, 1);
    }
}
