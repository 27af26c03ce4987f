use crate::test_entity;
use amalgam::{ConstraintViolation, InterpreterConstraints};

#[test]
fn sandbox_execution_step_budget() {
    let entity = test_entity();
    // an infinite loop under a 1000-step sandbox budget
    let (result, violation) = entity.execute_source(
        "(call_sandboxed (lambda (while (true) (sequence))) (null) 1000)",
        None,
    );
    assert!(result.node().is_null_value());
    assert_eq!(violation, Some(ConstraintViolation::ExecutionStep));
}

#[test]
fn outer_step_budget_halts_evaluation() {
    let entity = test_entity();
    let constraints = InterpreterConstraints::with_max_execution_steps(50);
    let (result, violation) =
        entity.execute_source("(while (true) (sequence))", Some(constraints));
    assert!(result.node().is_null_value());
    assert_eq!(violation, Some(ConstraintViolation::ExecutionStep));
}

#[test]
fn allocation_budget_halts_evaluation() {
    let entity = test_entity();
    let constraints = InterpreterConstraints {
        max_num_allocated_nodes: 64,
        ..InterpreterConstraints::default()
    };
    // allocate without bound by accumulating onto a list
    let (_result, violation) = entity.execute_source(
        "(sequence (assign \"l\" (list)) (while (true) (accum \"l\" 1)))",
        Some(constraints),
    );
    assert_eq!(violation, Some(ConstraintViolation::NodeAllocation));
}

#[test]
fn depth_budget_halts_runaway_recursion() {
    let entity = test_entity();
    let constraints = InterpreterConstraints {
        max_opcode_execution_depth: 40,
        ..InterpreterConstraints::default()
    };
    // self-application recurses until the depth budget trips
    let (result, violation) = entity.execute_source(
        "(sequence
           (assign \"f\" (lambda (call (retrieve \"f\"))))
           (call (retrieve \"f\")))",
        Some(constraints),
    );
    assert!(result.node().is_null_value());
    assert_eq!(violation, Some(ConstraintViolation::ExecutionDepth));
}

#[test]
fn budgets_do_not_trip_under_the_limit() {
    let entity = test_entity();
    let constraints = InterpreterConstraints::with_max_execution_steps(10_000);
    let (result, violation) = entity.execute_source("(+ 1 2)", Some(constraints));
    assert_eq!(violation, None);
    assert_eq!(result.to_number(), 3.0);
}
