use crate::{test_entity, eval_number};
use amalgam::{string_pool, Entity, Permissions};

#[test]
fn create_and_retrieve_label() {
    let result = eval_number(
        "(sequence
           (create_entities \"E\" (lambda (associate \"a\" 42)))
           (retrieve_from_entity \"E\" \"a\"))",
    );
    assert_eq!(result, 42.0);
}

#[test]
fn create_entities_returns_ids() {
    let entity = test_entity();
    let (result, _) = entity.execute_source(
        "(create_entities \"child\" (lambda (associate \"v\" 1)))",
        None,
    );
    assert_eq!(result.unparse(), "(list \"child\")");
    assert_eq!(entity.num_contained_entities(), 1);
}

#[test]
fn autogenerated_ids_begin_with_underscore() {
    let entity = test_entity();
    let (result, _) = entity.execute_source(
        "(get (create_entities (lambda (associate \"v\" 1))) 0)",
        None,
    );
    let id = result.to_string_value().unwrap();
    assert!(id.starts_with('_'), "{id}");
}

#[test]
fn assign_to_entities_writes_labels() {
    let result = eval_number(
        "(sequence
           (create_entities \"E\" (lambda (associate \"a\" 1)))
           (assign_to_entities \"E\" (assoc \"a\" 10))
           (retrieve_from_entity \"E\" \"a\"))",
    );
    assert_eq!(result, 10.0);
}

#[test]
fn accum_to_entities_adds() {
    let result = eval_number(
        "(sequence
           (create_entities \"E\" (lambda (associate \"a\" 5)))
           (accum_to_entities \"E\" (assoc \"a\" 3))
           (retrieve_from_entity \"E\" \"a\"))",
    );
    assert_eq!(result, 8.0);
}

#[test]
fn clone_move_destroy_entities() {
    let entity = test_entity();
    let (_, _) = entity.execute_source(
        "(sequence
           (create_entities \"a\" (lambda (associate \"v\" 1)))
           (clone_entities \"a\" \"b\")
           (move_entities \"b\" \"c\"))",
        None,
    );
    let pool = string_pool();
    assert!(entity.get_contained_entity(pool.id_of("a").unwrap()).is_some());
    assert!(pool.id_of("b").is_none() || entity.get_contained_entity(pool.id_of("b").unwrap()).is_none());
    assert!(entity.get_contained_entity(pool.id_of("c").unwrap()).is_some());

    let (result, _) = entity.execute_source("(destroy_entities \"c\")", None);
    assert_eq!(result.unparse(), "(true)");
    assert_eq!(entity.num_contained_entities(), 1);
}

#[test]
fn call_entity_runs_labeled_code() {
    let result = eval_number(
        "(sequence
           (create_entities \"E\" (lambda (associate \"f\" (lambda (+ 2 3)))))
           (call_entity \"E\" \"f\"))",
    );
    assert_eq!(result, 5.0);
}

#[test]
fn entity_rand_seed_round_trip() {
    let entity = test_entity();
    let (_, _) = entity.execute_source(
        "(sequence
           (create_entities \"E\" (lambda (associate \"v\" 1)))
           (set_entity_rand_seed \"E\" \"stable seed\"))",
        None,
    );
    let child = entity
        .get_contained_entity(string_pool().id_of("E").unwrap())
        .unwrap();
    let expected = amalgam::RandomStream::from_seed_string("stable seed").state_string();
    assert_eq!(child.random_state_string(), expected);
}

#[test]
fn entity_roots_assign_and_retrieve() {
    let entity = test_entity();
    let (result, _) = entity.execute_source(
        "(sequence
           (create_entities \"E\" (lambda (associate \"v\" 1)))
           (assign_entity_roots \"E\" (lambda (list 1 2 3)))
           (retrieve_entity_root \"E\"))",
        None,
    );
    assert_eq!(result.unparse(), "(list 1 2 3)");
}

#[test]
fn permissions_gate_side_effect_opcodes() {
    let _ = env_logger::try_init();
    // an entity without permissions cannot print, load, or store
    let entity = Entity::new("locked");
    let (result, _) = entity.execute_source("(print \"nope\")", None);
    assert!(result.node().is_null_value());
    let (result, _) = entity.execute_source("(load \"/tmp/never.amlg\")", None);
    assert!(result.node().is_null_value());
    let (result, _) = entity.execute_source("(system \"cwd\")", None);
    assert!(result.node().is_null_value());
}

#[test]
fn permissions_grant_only_what_is_held() {
    let entity = test_entity();
    let (_, _) = entity.execute_source(
        "(create_entities \"E\" (lambda (associate \"v\" 1)))",
        None,
    );
    let child = entity
        .get_contained_entity(string_pool().id_of("E").unwrap())
        .unwrap();
    // restrict the child, then have the child try to re-grant everything
    child.set_permissions(Permissions::empty());
    let (_, _) = child.execute_source(
        "(set_entity_permissions (null) (assoc \"system\" (true)))",
        None,
    );
    assert!(!child.permissions().contains(Permissions::SYSTEM));
}

#[test]
fn created_entities_inherit_creator_permissions() {
    let entity = test_entity();
    let (_, _) = entity.execute_source(
        "(create_entities \"E\" (lambda (associate \"v\" 1)))",
        None,
    );
    let child = entity
        .get_contained_entity(string_pool().id_of("E").unwrap())
        .unwrap();
    assert_eq!(child.permissions(), Permissions::all_permissions());
}

#[test]
fn system_commands() {
    let entity = test_entity();
    let (result, _) = entity.execute_source("(system \"version\")", None);
    assert_eq!(
        result.to_string_value().as_deref(),
        Some(env!("CARGO_PKG_VERSION"))
    );
    let (result, _) = entity.execute_source("(system \"get_max_num_threads\")", None);
    assert!(result.to_number() >= 1.0);
    let (result, _) = entity.execute_source("(system \"validate\")", None);
    assert_eq!(result.unparse(), "(true)");
    // crypto collaborators are absent and return null
    let (result, _) = entity.execute_source("(system \"sign_key_pair\")", None);
    assert!(result.node().is_null_value());
}
