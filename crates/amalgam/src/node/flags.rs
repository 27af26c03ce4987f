//! Maintenance of the `NEED_CYCLE_CHECK` and `IS_IDEMPOTENT` node
//! attributes over whole trees.

use super::NodeHandle;
use hashbrown::HashSet;

/// Recomputes `NEED_CYCLE_CHECK` and `IS_IDEMPOTENT` across the tree:
/// the cycle bit is set exactly on ancestors of any revisited node, and the
/// idempotency bit on nodes whose own opcode is pure and whose descendants
/// are all idempotent.
pub fn update_flags_for_node_tree(tree: NodeHandle) {
    let mut checked = HashSet::new();
    update_flags_recurse(tree, &mut checked);
}

/// Returns true when `n` was already visited, meaning the caller lies on a
/// path to a revisited node.
fn update_flags_recurse(n: NodeHandle, checked: &mut HashSet<NodeHandle>) -> bool {
    if n.is_null() {
        return false;
    }
    if !checked.insert(n) {
        return true;
    }

    let mut need_cycle_check = false;
    let mut children_idempotent = true;
    for child in n.all_children() {
        if child.is_null() {
            continue;
        }
        if update_flags_recurse(child, checked) {
            need_cycle_check = true;
        } else if child.need_cycle_check() {
            need_cycle_check = true;
        }
        children_idempotent &= child.is_idempotent();
    }

    n.set_need_cycle_check(need_cycle_check);
    n.set_idempotent(n.node_type().is_potentially_idempotent() && children_idempotent);
    false
}

/// Returns true if the tree contains no cycles when traversing downward,
/// i.e. it could be duplicated into a flat copy. Shared-but-acyclic nodes
/// are allowed.
pub fn can_node_tree_be_flattened(n: NodeHandle) -> bool {
    if n.is_null() || !n.need_cycle_check() {
        return true;
    }
    let mut stack = Vec::new();
    can_flatten_recurse(n, &mut stack)
}

fn can_flatten_recurse(n: NodeHandle, stack: &mut Vec<NodeHandle>) -> bool {
    if stack.contains(&n) {
        return false;
    }
    stack.push(n);
    for child in n.all_children() {
        if child.is_null() {
            continue;
        }
        if !can_flatten_recurse(child, stack) {
            return false;
        }
    }
    stack.pop();
    true
}
