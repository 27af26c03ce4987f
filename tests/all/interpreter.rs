use crate::{eval_number, eval_unparse, test_entity};

#[test]
fn arithmetic_and_sequencing() {
    // assignment writes the nearest frame and retrieve reads it back
    let result = eval_number(
        "(sequence (assign \"x\" 3) (assign \"x\" (+ (retrieve \"x\") 4)) (retrieve \"x\"))",
    );
    assert_eq!(result, 7.0);
}

#[test]
fn arithmetic_operators() {
    assert_eq!(eval_number("(+ 1 2 3)"), 6.0);
    assert_eq!(eval_number("(- 10 4)"), 6.0);
    assert_eq!(eval_number("(* 2 3 4)"), 24.0);
    assert_eq!(eval_number("(/ 12 4)"), 3.0);
    assert_eq!(eval_number("(mod 7 3)"), 1.0);
    assert_eq!(eval_number("(min 4 2 9)"), 2.0);
    assert_eq!(eval_number("(max 4 2 9)"), 9.0);
    assert_eq!(eval_number("(floor 2.7)"), 2.0);
    assert_eq!(eval_number("(ceil 2.1)"), 3.0);
}

#[test]
fn comparison_and_logic() {
    assert_eq!(eval_unparse("(< 1 2 3)"), "(true)");
    assert_eq!(eval_unparse("(< 1 3 2)"), "(false)");
    assert_eq!(eval_unparse("(>= 3 3 2)"), "(true)");
    assert_eq!(eval_unparse("(= 2 2 2)"), "(true)");
    assert_eq!(eval_unparse("(= 2 3)"), "(false)");
    assert_eq!(eval_unparse("(!= 1 2 3)"), "(true)");
    assert_eq!(eval_unparse("(and 1 2)"), "2");
    assert_eq!(eval_unparse("(and 1 0)"), "(false)");
    assert_eq!(eval_unparse("(or 0 5)"), "5");
    assert_eq!(eval_unparse("(not 0)"), "(true)");
    assert_eq!(eval_unparse("(xor 1 1 1)"), "(true)");
    assert_eq!(eval_unparse("(~ 1 2)"), "(true)");
    assert_eq!(eval_unparse("(~ 1 \"a\")"), "(false)");
}

#[test]
fn if_selects_branches() {
    assert_eq!(eval_number("(if (true) 1 2)"), 1.0);
    assert_eq!(eval_number("(if (false) 1 2)"), 2.0);
    assert_eq!(eval_number("(if (false) 1 (true) 3 2)"), 3.0);
    // no matching condition and no else yields null
    assert_eq!(eval_unparse("(if (false) 1)"), "(null)");
}

#[test]
fn while_tracks_index_and_previous_result() {
    // sums 0..5 using the construction stack's current_index
    let result = eval_number(
        "(sequence
           (assign \"total\" 0)
           (while (< (current_index) 5)
             (assign \"total\" (+ (retrieve \"total\") (current_index)))
             (retrieve \"total\"))
           (retrieve \"total\"))",
    );
    assert_eq!(result, 10.0);

    // the while's value is the last body result
    let result = eval_number(
        "(sequence
           (assign \"i\" 0)
           (while (< (retrieve \"i\") 3)
             (assign \"i\" (+ (retrieve \"i\") 1))
             (retrieve \"i\")))",
    );
    assert_eq!(result, 3.0);
}

#[test]
fn conclude_unwinds_one_sequence() {
    // conclude ends the enclosing sequence with its value
    assert_eq!(eval_number("(sequence 1 (conclude 5) 3)"), 5.0);
    // conclude in a while ends the loop
    assert_eq!(
        eval_number("(while (true) (conclude 9))"),
        9.0
    );
    // a conclude surfacing as an inner sequence's value is unwrapped by
    // the outer sequence, short-circuiting it
    assert_eq!(
        eval_number("(sequence (sequence (conclude 1)) 7)"),
        1.0
    );
}

#[test]
fn return_crosses_sequences_but_not_calls() {
    // return passes through sequence and is consumed by call
    assert_eq!(
        eval_number("(call (lambda (sequence (return 4) 9)))"),
        4.0
    );
    // without a call boundary the return node itself surfaces
    assert_eq!(eval_unparse("(sequence (return 4) 9)"), "(return 4)");
}

#[test]
fn let_declare_and_scoping() {
    assert_eq!(
        eval_number("(let (assoc \"a\" 2) (+ (retrieve \"a\") 1))"),
        3.0
    );
    // declare does not shadow an existing symbol in the top frame
    assert_eq!(
        eval_number(
            "(let (assoc \"a\" 2) (sequence (declare (assoc \"a\" 99)) (retrieve \"a\")))"
        ),
        2.0
    );
    // assignment finds the frame holding the symbol
    assert_eq!(
        eval_number(
            "(let (assoc \"a\" 1) (sequence (assign \"a\" 5) (retrieve \"a\")))"
        ),
        5.0
    );
}

#[test]
fn accum_combines_by_type() {
    assert_eq!(
        eval_number("(sequence (assign \"n\" 1) (accum \"n\" 4) (retrieve \"n\"))"),
        5.0
    );
    let entity = test_entity();
    let (result, _) = entity.execute_source(
        "(sequence (assign \"s\" \"ab\") (accum \"s\" \"cd\") (retrieve \"s\"))",
        None,
    );
    assert_eq!(result.to_string_value().as_deref(), Some("abcd"));
    assert_eq!(
        eval_unparse("(sequence (assign \"l\" (list 1)) (accum \"l\" 2) (retrieve \"l\"))"),
        "(list 1 2)"
    );
}

#[test]
fn call_builds_scope_from_args() {
    assert_eq!(
        eval_number("(call (lambda (+ (retrieve \"a\") (retrieve \"b\"))) (assoc \"a\" 3 \"b\" 4))"),
        7.0
    );
    // args reflection reads the frame the call pushed
    assert_eq!(
        eval_unparse("(call (lambda (get (args) \"k\")) (assoc \"k\" 11))"),
        "11"
    );
}

#[test]
fn get_and_set_traverse_paths() {
    assert_eq!(
        eval_number("(get (list 10 20 30) 1)"),
        20.0
    );
    // negative indices address from the end
    assert_eq!(eval_number("(get (list 10 20 30) -1)"), 30.0);
    assert_eq!(
        eval_number("(get (assoc \"a\" (list 5 6)) (list \"a\" 1))"),
        6.0
    );
    // NaN index fails to null
    assert_eq!(eval_unparse("(get (list 1 2) \"x\")"), "(null)");
    // set creates missing assoc keys
    assert_eq!(
        eval_unparse("(set (assoc) \"k\" 9)"),
        "(assoc \"k\" 9)"
    );
    // writing past the end of a list extends it
    assert_eq!(
        eval_unparse("(set (list 1) 2 7)"),
        "(list 1 (null) 7)"
    );
    // replace passes the old value through the function
    assert_eq!(
        eval_number("(get (replace (list 1 2) 0 (+ (current_value) 10)) 0)"),
        11.0
    );
}

#[test]
fn collection_transforms() {
    assert_eq!(
        eval_unparse("(map (lambda (* (current_value) 2)) (list 1 2 3))"),
        "(list 2 4 6)"
    );
    assert_eq!(
        eval_unparse("(filter (lambda (> (current_value) 1)) (list 0 1 2 3))"),
        "(list 2 3)"
    );
    // filter without a function removes nulls
    assert_eq!(
        eval_unparse("(filter (list 1 (null) 2))"),
        "(list 1 2)"
    );
    assert_eq!(
        eval_number("(reduce (lambda (+ (previous_result) (current_value))) (list 1 2 3 4))"),
        10.0
    );
    assert_eq!(eval_unparse("(reverse (list 1 2 3))"), "(list 3 2 1)");
    assert_eq!(eval_unparse("(sort (list 3 1 2))"), "(list 1 2 3)");
    assert_eq!(
        eval_unparse("(indices (assoc \"b\" 1 \"a\" 2))"),
        "(list \"a\" \"b\")"
    );
    assert_eq!(
        eval_unparse("(values (list 4 4 5) (true))"),
        "(list 4 5)"
    );
    assert_eq!(eval_unparse("(contains_index (assoc \"a\" 1) \"a\")"), "(true)");
    assert_eq!(eval_unparse("(contains_value (list 1 2) 2)"), "(true)");
    assert_eq!(eval_unparse("(remove (list 10 20 30) 1)"), "(list 10 30)");
    assert_eq!(eval_unparse("(keep (list 10 20 30) (list 0 2))"), "(list 10 30)");
    assert_eq!(
        eval_unparse("(zip (list \"a\" \"b\") (list 1 2))"),
        "(assoc \"a\" 1 \"b\" 2)"
    );
    assert_eq!(
        eval_unparse("(unzip (assoc \"a\" 1 \"b\" 2) (list \"b\" \"a\"))"),
        "(list 2 1)"
    );
    assert_eq!(
        eval_number("(get (associate \"k\" (+ 40 2)) \"k\")"),
        42.0
    );
    assert_eq!(eval_unparse("(weave (list 1 3) (list 2 4))"), "(list 1 2 3 4)");
    // apply re-types a collection and evaluates it
    assert_eq!(eval_number("(apply \"+\" (list 1 2 3))"), 6.0);
}

#[test]
fn rewrite_transforms_bottom_up() {
    // increment every number in the tree
    let result = eval_unparse(
        "(rewrite
           (lambda (if (~ (current_value) 0) (+ (current_value) 1) (current_value)))
           (list 1 (list 2 3)))",
    );
    assert_eq!(result, "(list 2 (list 3 4))");
}

#[test]
fn rand_is_deterministic_per_seed() {
    let a = eval_unparse("(sequence (set_rand_seed \"fixed\") (rand 100 4))");
    let b = eval_unparse("(sequence (set_rand_seed \"fixed\") (rand 100 4))");
    assert_eq!(a, b);

    // rand over a list picks an element of the list
    let entity = test_entity();
    let (result, _) = entity.execute_source("(rand (list 7 7 7))", None);
    assert_eq!(result.to_number(), 7.0);
}

#[test]
fn parse_and_unparse_opcodes() {
    assert_eq!(eval_number("(call (parse \"(+ 1 2)\"))"), 3.0);
    let entity = test_entity();
    let (result, _) = entity.execute_source("(unparse (lambda (+ 1 2)))", None);
    assert_eq!(result.to_string_value().as_deref(), Some("(+ 1 2)"));
    // a parse failure surfaces warnings in the optional second return
    let (result, _) = entity.execute_source("(parse \"(+ 1\" (true))", None);
    let warnings = result.node().child(1);
    assert!(warnings.num_child_nodes() > 0);
}

#[test]
fn type_mismatches_yield_null_and_continue() {
    // adding a list is not a number, and the sequence keeps going
    assert_eq!(
        eval_number("(sequence (+ (list) 1) 42)"),
        42.0
    );
    assert_eq!(eval_unparse("(get (null) \"missing\")"), "(null)");
    assert_eq!(eval_unparse("(retrieve \"never_bound\")"), "(null)");
}
