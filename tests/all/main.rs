//! Integration tests for the Amalgam runtime.

mod constraints;
mod entity;
mod gc;
mod interpreter;
mod parser;
mod queries;
mod threads;

use amalgam::{Entity, Permissions};
use std::sync::Arc;

/// A root entity with full permissions and a fixed seed, the common
/// starting point of most tests.
pub(crate) fn test_entity() -> Arc<Entity> {
    let _ = env_logger::try_init();
    let entity = Entity::new("test seed");
    entity.set_permissions(Permissions::all_permissions());
    entity
}

/// Evaluates source against a fresh entity and returns the numeric result.
pub(crate) fn eval_number(src: &str) -> f64 {
    let entity = test_entity();
    let (result, violation) = entity.execute_source(src, None);
    assert_eq!(violation, None, "unexpected constraint violation in {src}");
    result.to_number()
}

/// Evaluates source against a fresh entity and returns the unparsed
/// result.
pub(crate) fn eval_unparse(src: &str) -> String {
    let entity = test_entity();
    let (result, _) = entity.execute_source(src, None);
    result.unparse()
}
