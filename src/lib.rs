//! Graph traversal frontend: compiles traversal trees into distributed
//! dataflow plans and dispatches them to backend execution servers.
//!
//! ```no_run
//! use graphflow::compiler::{schema::InMemorySchema, Traversal, TraversalCompiler, CompilerConfig};
//!
//! let schema = InMemorySchema::new();
//! let compiler = TraversalCompiler::new(&schema, CompilerConfig::default());
//! let plan = Traversal::v().range(2, 5).compile(&compiler)?;
//! println!("{}", plan.explain());
//! # Ok::<(), graphflow::compiler::CompileError>(())
//! ```

#![warn(missing_docs)]

pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod session;
pub mod types;

pub use error::{Error, Result};
