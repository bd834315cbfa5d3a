#![forbid(unsafe_code)]

//! Traversal compiler.
//!
//! Turns a traversal tree into a distributed dataflow plan: typed operator
//! vertices connected by edges that say how data moves between partitions.

/// Fluent traversal builder.
///
/// Assembles trees programmatically without spelling out every node.
pub mod builder;

/// Per-compilation id allocation and label bookkeeping.
pub mod context;

/// Structured compilation errors.
pub mod errors;

/// Logical plan graph: vertices, edges and fragments.
pub mod logical;

/// Compiler driver and compiled plan artifacts.
///
/// Walks the tree bottom-up, merges fragments, wires label side inputs and
/// fingerprints the result.
pub mod planner;

/// Read-only schema lookup.
pub mod schema;

/// Traversal tree IR.
pub mod tree;

/// Value-type system and literal values.
pub mod value;

pub use builder::Traversal;
pub use errors::CompileError;
pub use planner::{compile, CompiledPlan, CompilerConfig, PlanExplain, TraversalCompiler};
pub use tree::{Step, TreeNode};
