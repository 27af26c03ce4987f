use amalgam::node::manager::validate_node_tree;
use amalgam::node::{flags, NodeManager, NodeRef, NodeType};

fn init() {
    let _ = env_logger::try_init();
}

#[test]
fn allocations_without_references_are_fully_reclaimed() {
    init();
    let enm = NodeManager::new();
    let baseline = enm.number_of_used_nodes();
    for i in 0..1000 {
        enm.alloc_number_node(i as f64);
    }
    enm.clear_thread_local_allocation_buffer();
    enm.collect_garbage();
    // the live region returns to its pre-sequence size
    assert_eq!(enm.number_of_used_nodes(), baseline);
}

#[test]
fn gc_reclaims_unreferenced_cyclic_structure() {
    init();
    let enm = NodeManager::new();

    // a node whose ordered child list includes itself
    let a = enm.alloc_node(NodeType::List);
    a.append_ordered_child(a);
    flags::update_flags_for_node_tree(a);
    assert!(a.need_cycle_check());

    let referenced_before = enm.num_nodes_referenced();
    enm.clear_thread_local_allocation_buffer();
    enm.collect_garbage();

    assert_eq!(enm.number_of_used_nodes(), 0);
    assert_eq!(enm.num_nodes_referenced(), referenced_before);
}

#[test]
fn referenced_trees_survive_collection_and_stay_valid() {
    init();
    let enm = NodeManager::new();
    let keep = enm.alloc_list_node(&[
        enm.alloc_number_node(1.0),
        enm.alloc_string_node("two"),
    ]);
    enm.keep_node_reference(keep);

    for _ in 0..2000 {
        enm.alloc_number_node(0.0);
    }
    enm.clear_thread_local_allocation_buffer();
    enm.collect_garbage();

    assert!(validate_node_tree(keep));
    assert_eq!(keep.num_child_nodes(), 2);
    assert_eq!(keep.child(0).number_value(), 1.0);
    assert_eq!(keep.child(1).string_value(), "two");

    enm.free_node_reference(keep);
}

#[test]
fn execution_results_survive_collection() {
    init();
    let entity = crate::test_entity();
    let (result, _) = entity.execute_source("(map (lambda (* (current_value) 2)) (list 1 2 3))", None);
    // the pinned result outlives an explicit collection
    entity.node_manager().collect_garbage();
    assert_eq!(result.unparse(), "(list 2 4 6)");
}

#[test]
fn free_node_tree_if_possible_respects_sharing() {
    init();
    let enm = NodeManager::new();
    let shared = enm.alloc_number_node(5.0);
    let tree = enm.alloc_list_node(&[shared]);

    // a non-unique reference must not free
    enm.free_node_tree_if_possible(NodeRef::new(tree, false));
    assert_eq!(tree.node_type(), NodeType::List);

    // a unique reference frees the whole tree
    enm.free_node_tree_if_possible(NodeRef::new(tree, true));
    assert_eq!(tree.node_type(), NodeType::Deallocated);
    assert_eq!(shared.node_type(), NodeType::Deallocated);
}

#[test]
fn update_flags_marks_exactly_ancestors_of_revisits() {
    init();
    let enm = NodeManager::new();
    let shared = enm.alloc_number_node(1.0);
    let left = enm.alloc_list_node(&[shared]);
    let right = enm.alloc_list_node(&[shared]);
    let root = enm.alloc_list_node(&[left, right]);

    flags::update_flags_for_node_tree(root);
    // the second path to `shared` marks its ancestors
    assert!(root.need_cycle_check());
    assert!(right.need_cycle_check());
    assert!(!left.need_cycle_check());
    assert!(!shared.need_cycle_check());

    // a plain chain carries no cycle marks
    let chain = enm.alloc_list_node(&[enm.alloc_list_node(&[enm.alloc_number_node(2.0)])]);
    flags::update_flags_for_node_tree(chain);
    assert!(!chain.need_cycle_check());
}

#[test]
fn idempotency_propagates_bottom_up() {
    init();
    let enm = NodeManager::new();
    let pure = enm.alloc_node(NodeType::Add);
    pure.append_ordered_child(enm.alloc_number_node(1.0));
    pure.append_ordered_child(enm.alloc_number_node(2.0));
    flags::update_flags_for_node_tree(pure);
    assert!(pure.is_idempotent());

    let impure = enm.alloc_node(NodeType::Add);
    impure.append_ordered_child(enm.alloc_number_node(1.0));
    impure.append_ordered_child(enm.alloc_node(NodeType::Rand));
    flags::update_flags_for_node_tree(impure);
    assert!(!impure.is_idempotent());
}
