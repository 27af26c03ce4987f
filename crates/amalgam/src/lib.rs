//! The Amalgam execution runtime.
//!
//! Programs are trees of typed [`node`]s allocated from per-entity arenas
//! with cooperative mark-and-sweep garbage collection. The tree-walking
//! [`interpreter`] evaluates them against an [`entity`](crate::entity),
//! with scope / opcode / construction stacks, per-opcode opt-in
//! concurrency over a shared thread pool, permission-gated side effects,
//! and generalized-distance entity queries.
//!
//! ```no_run
//! use amalgam::entity::Entity;
//! use amalgam::permissions::Permissions;
//!
//! let entity = Entity::new("seed");
//! entity.set_permissions(Permissions::all_permissions());
//! let (result, _violation) = entity.execute_source("(+ 1 2)", None);
//! assert_eq!(result.to_number(), 3.0);
//! ```

pub mod asset;
pub mod code;
pub mod concurrency;
pub mod entity;
pub mod interpreter;
pub mod listeners;
pub mod node;
pub mod permissions;
pub mod rand_stream;
pub mod string_pool;

pub use entity::Entity;
pub use interpreter::{ConstraintViolation, ExecutionResult, Interpreter, InterpreterConstraints};
pub use node::{NodeHandle, NodeManager, NodeRef, NodeType};
pub use permissions::Permissions;
pub use rand_stream::RandomStream;
pub use string_pool::{string_pool, StringId};
