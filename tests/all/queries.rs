use crate::test_entity;
use amalgam::{string_pool, Entity};
use std::sync::Arc;

/// Entities e1..e4 exposing a numeric label `x` with values 0, 1, 4, 9.
fn populated_entity() -> Arc<Entity> {
    let entity = test_entity();
    let (_, violation) = entity.execute_source(
        "(sequence
           (create_entities \"e1\" (lambda (associate \"x\" 0)))
           (create_entities \"e2\" (lambda (associate \"x\" 1)))
           (create_entities \"e3\" (lambda (associate \"x\" 4)))
           (create_entities \"e4\" (lambda (associate \"x\" 9))))",
        None,
    );
    assert_eq!(violation, None);
    assert_eq!(entity.num_contained_entities(), 4);
    entity
}

#[test]
fn nearest_generalized_distance_returns_distances() {
    let entity = populated_entity();
    // k=2 around position 3 with p=2: e3 at distance 1, e2 at distance 2
    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities
           (query_nearest_generalized_distance 2 (list \"x\") (list 3) (null) (null) (null) (null) 2))",
        None,
    );
    let node = result.node();
    assert!(node.is_associative_array());
    assert_eq!(node.num_child_nodes(), 2);
    let pool = string_pool();
    let e3 = node.mapped_child(pool.id_of("e3").unwrap()).unwrap();
    let e2 = node.mapped_child(pool.id_of("e2").unwrap()).unwrap();
    assert_eq!(e3.number_value(), 1.0);
    assert_eq!(e2.number_value(), 2.0);
}

#[test]
fn within_generalized_distance_filters_by_radius() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities
           (query_within_generalized_distance 2.5 (list \"x\") (list 3) (null) (null) (null) (null) 2))",
        None,
    );
    // entities within distance 2.5 of x=3: e2 (2), e3 (1)
    let node = result.node();
    assert_eq!(node.num_child_nodes(), 2);
    let pool = string_pool();
    assert!(node.mapped_child(pool.id_of("e2").unwrap()).is_some());
    assert!(node.mapped_child(pool.id_of("e3").unwrap()).is_some());
}

#[test]
fn exists_and_between_narrow_the_set() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(contained_entities (query_exists \"x\"))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 4);

    let (result, _) = entity.execute_source(
        "(contained_entities (query_between \"x\" 1 4))",
        None,
    );
    let node = result.node();
    assert_eq!(node.num_child_nodes(), 2);

    let (result, _) = entity.execute_source(
        "(contained_entities (query_not_between \"x\" 1 4))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 2);
}

#[test]
fn equals_and_among_conditions() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(contained_entities (query_equals \"x\" 4))",
        None,
    );
    assert_eq!(result.unparse(), "(list \"e3\")");

    let (result, _) = entity.execute_source(
        "(contained_entities (query_among \"x\" (list 0 9)))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 2);

    let (result, _) = entity.execute_source(
        "(contained_entities (query_in_entity_list (list \"e1\" \"e4\")))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 2);
}

#[test]
fn min_max_and_ordering_conditions() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(contained_entities (query_min \"x\" 1))",
        None,
    );
    assert_eq!(result.unparse(), "(list \"e1\")");

    let (result, _) = entity.execute_source(
        "(contained_entities (query_max \"x\" 2))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 2);

    let (result, _) = entity.execute_source(
        "(contained_entities (query_less_or_equal_to \"x\" 1))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 2);
}

#[test]
fn aggregation_conditions() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities (query_sum \"x\"))",
        None,
    );
    assert_eq!(result.to_number(), 14.0);

    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities (query_quantile \"x\" 0.5))",
        None,
    );
    assert_eq!(result.to_number(), 1.0);

    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities (query_generalized_mean \"x\" 1))",
        None,
    );
    assert_eq!(result.to_number(), 3.5);

    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities (query_min_difference \"x\"))",
        None,
    );
    assert_eq!(result.to_number(), 1.0);

    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities (query_max_difference \"x\"))",
        None,
    );
    assert_eq!(result.to_number(), 5.0);
}

#[test]
fn value_masses_build_histograms() {
    let entity = test_entity();
    entity
        .execute_source(
            "(sequence
               (create_entities \"a\" (lambda (associate \"c\" \"red\")))
               (create_entities \"b\" (lambda (associate \"c\" \"red\")))
               (create_entities \"c\" (lambda (associate \"c\" \"blue\"))))",
            None,
        )
        .0;
    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities (query_value_masses \"c\"))",
        None,
    );
    let node = result.node();
    let pool = string_pool();
    let red = node.mapped_child(pool.id_of("red").unwrap()).unwrap();
    let blue = node.mapped_child(pool.id_of("blue").unwrap()).unwrap();
    assert_eq!(red.number_value(), 2.0);
    assert_eq!(blue.number_value(), 1.0);
}

#[test]
fn mode_returns_most_frequent_value() {
    let entity = test_entity();
    entity
        .execute_source(
            "(sequence
               (create_entities \"a\" (lambda (associate \"v\" 7)))
               (create_entities \"b\" (lambda (associate \"v\" 7)))
               (create_entities \"c\" (lambda (associate \"v\" 3))))",
            None,
        )
        .0;
    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities (query_mode \"v\"))",
        None,
    );
    assert_eq!(result.to_number(), 7.0);
}

#[test]
fn select_and_samples() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(contained_entities (query_select 2))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 2);

    let (result, _) = entity.execute_source(
        "(contained_entities (query_select 2 1))",
        None,
    );
    // offset 1 skips the first entity
    assert_eq!(result.unparse(), "(list \"e2\" \"e3\")");

    // seeded selections are reproducible
    let (a, _) = entity.execute_source("(contained_entities (query_select 2 0 \"s\"))", None);
    let (b, _) = entity.execute_source("(contained_entities (query_select 2 0 \"s\"))", None);
    assert_eq!(a.unparse(), b.unparse());

    let (result, _) = entity.execute_source(
        "(contained_entities (query_sample 10 \"seed\"))",
        None,
    );
    assert_eq!(result.node().num_child_nodes(), 10);

    let (result, _) = entity.execute_source(
        "(contained_entities (query_weighted_sample \"x\" 8 \"seed\"))",
        None,
    );
    // weight 0 makes e1 unsamplable
    let text = result.unparse();
    assert!(!text.contains("e1"), "{text}");
}

#[test]
fn chained_conditions_narrow_progressively() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(contained_entities (query_exists \"x\") (query_between \"x\" 1 9) (query_max \"x\" 1))",
        None,
    );
    assert_eq!(result.unparse(), "(list \"e4\")");
}

#[test]
fn distance_contributions_and_convictions() {
    let entity = populated_entity();
    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities
           (compute_entity_distance_contributions 1 (list \"x\") (null) (null) (null) (null) (null) 2))",
        None,
    );
    let node = result.node();
    assert_eq!(node.num_child_nodes(), 4);
    // e1 (x=0): nearest other entity is e2 at distance 1
    let pool = string_pool();
    let e1 = node.mapped_child(pool.id_of("e1").unwrap()).unwrap();
    assert_eq!(e1.number_value(), 1.0);

    let (result, _) = entity.execute_source(
        "(compute_on_contained_entities
           (compute_entity_convictions 1 (list \"x\") (null) (null) (null) (null) (null) 2))",
        None,
    );
    // convictions are positive and average to roughly 1
    let node = result.node();
    assert_eq!(node.num_child_nodes(), 4);
    for (_, value) in node.mapped_children_sorted() {
        assert!(value.number_value() > 0.0);
    }
}
