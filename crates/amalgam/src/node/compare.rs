//! Equality, ordering, truth, and type conversion over evaluable nodes.

use super::{NodeHandle, NodeType};
use crate::string_pool::{string_pool, StringId};
use hashbrown::{HashMap, HashSet};
use std::cmp::Ordering;

/// Returns true if this node evaluates to true: everything except null,
/// `false`, the number 0, and the empty string.
pub fn is_true(n: NodeHandle) -> bool {
    if n.is_null() {
        return false;
    }
    match n.node_type() {
        NodeType::Null | NodeType::False => false,
        NodeType::True => true,
        NodeType::Number => {
            let v = n.number_value();
            v != 0.0 && !v.is_nan()
        }
        NodeType::StringLiteral => {
            let id = n.string_id();
            id.is_string() && id != StringId::EMPTY_STRING
        }
        _ => true,
    }
}

/// Converts the node to a number; null becomes `value_if_null`, booleans
/// become 0/1, strings are parsed (NaN when unparseable).
pub fn to_number(n: NodeHandle, value_if_null: f64) -> f64 {
    if n.is_null() {
        return value_if_null;
    }
    match n.node_type() {
        NodeType::Null => value_if_null,
        NodeType::Number => n.number_value(),
        NodeType::True => 1.0,
        NodeType::False => 0.0,
        NodeType::StringLiteral | NodeType::Symbol => {
            let s = n.string_value();
            parse_number(&s).unwrap_or(f64::NAN)
        }
        _ => f64::NAN,
    }
}

/// Parses a number the way the language reads numeric tokens, including
/// the `.infinity` forms.
pub fn parse_number(s: &str) -> Option<f64> {
    match s {
        ".infinity" => Some(f64::INFINITY),
        "-.infinity" => Some(f64::NEG_INFINITY),
        ".nan" => Some(f64::NAN),
        _ => s.trim().parse::<f64>().ok(),
    }
}

/// Converts the node to a string when it has a direct representation.
pub fn to_string(n: NodeHandle) -> Option<String> {
    if n.is_null() {
        return None;
    }
    match n.node_type() {
        NodeType::Null => None,
        NodeType::Number => Some(amalgam_parser::format_number(n.number_value())),
        NodeType::StringLiteral | NodeType::Symbol => Some(n.string_value()),
        NodeType::True => Some("true".to_string()),
        NodeType::False => Some("false".to_string()),
        _ => None,
    }
}

/// Converts the node to an existing interned string id without creating a
/// reference; `NOT_A_STRING` when absent or null.
pub fn to_string_id_if_exists(n: NodeHandle) -> StringId {
    match n.node_type() {
        NodeType::StringLiteral | NodeType::Symbol => n.string_id(),
        _ => match to_string(n) {
            Some(s) => string_pool().id_of(&s).unwrap_or(StringId::NOT_A_STRING),
            None => StringId::NOT_A_STRING,
        },
    }
}

/// Converts the node to a string id, creating a reference the caller must
/// destroy. Numbers canonicalize through the shared formatter so equal
/// numbers always produce the same key.
pub fn to_string_id_with_reference(n: NodeHandle) -> StringId {
    match n.node_type() {
        NodeType::StringLiteral | NodeType::Symbol => {
            string_pool().create_reference_by_id(n.string_id())
        }
        _ => match to_string(n) {
            Some(s) => string_pool().create_reference(&s),
            None => StringId::NOT_A_STRING,
        },
    }
}

/// Shallow equality: type and immediate value only.
pub fn are_shallow_equal(a: NodeHandle, b: NodeHandle) -> bool {
    if a.is_null() || b.is_null() {
        // nulls and handles to Null nodes are interchangeable
        return a.is_null_value() && b.is_null_value();
    }

    let a_type = a.node_type();
    if a_type != b.node_type() {
        return false;
    }

    if a_type.uses_number_data() {
        let (x, y) = (a.number_value(), b.number_value());
        return x == y || (x.is_nan() && y.is_nan());
    }
    if a_type.uses_string_data() {
        return a.string_id() == b.string_id();
    }
    true
}

/// Deep structural equality. Uses a pairing map only when both sides may
/// contain cycles; otherwise the acyclic side exhausts and ends the
/// comparison.
pub fn are_deep_equal(a: NodeHandle, b: NodeHandle) -> bool {
    if a == b {
        return true;
    }
    if !are_shallow_equal(a, b) {
        return false;
    }
    if a.is_null() || b.is_null() {
        return true;
    }
    if a.node_type().is_immediate() && b.node_type().is_immediate() {
        return true;
    }

    if a.need_cycle_check() && b.need_cycle_check() {
        let mut checked: HashMap<NodeHandle, NodeHandle> = HashMap::new();
        deep_equal_given_shallow_equal(a, b, Some(&mut checked))
    } else {
        deep_equal_given_shallow_equal(a, b, None)
    }
}

fn deep_equal_given_shallow_equal(
    a: NodeHandle,
    b: NodeHandle,
    mut checked: Option<&mut HashMap<NodeHandle, NodeHandle>>,
) -> bool {
    if let Some(checked) = checked.as_mut() {
        if let Some(&paired) = checked.get(&a) {
            // a cycle is equal as long as the pairing stays consistent
            return paired == b;
        }
        checked.insert(a, b);
    }

    if a.is_associative_array() {
        let (a_map, b_map) = match (a.mapped_children(), b.mapped_children()) {
            (Some(x), Some(y)) => (x, y),
            _ => return false,
        };
        if a_map.len() != b_map.len() {
            return false;
        }
        for (&key, &a_child) in a_map {
            let Some(&b_child) = b_map.get(&key) else {
                return false;
            };
            if !node_pair_equal(a_child, b_child, checked.as_deref_mut()) {
                return false;
            }
        }
        return true;
    }

    let a_children = a.ordered_children();
    let b_children = b.ordered_children();
    if a_children.len() != b_children.len() {
        return false;
    }
    for (&a_child, &b_child) in a_children.iter().zip(b_children) {
        if !node_pair_equal(a_child, b_child, checked.as_deref_mut()) {
            return false;
        }
    }
    true
}

fn node_pair_equal(
    a: NodeHandle,
    b: NodeHandle,
    checked: Option<&mut HashMap<NodeHandle, NodeHandle>>,
) -> bool {
    if a == b {
        return true;
    }
    if !are_shallow_equal(a, b) {
        return false;
    }
    if a.is_null() || b.is_null() || a.node_type().is_immediate() {
        return true;
    }
    deep_equal_given_shallow_equal(a, b, checked)
}

/// Ordering, defined only on numbers and strings; all other pairs are
/// neither less nor greater.
pub fn compare(a: NodeHandle, b: NodeHandle) -> Option<Ordering> {
    let a_numeric = matches!(a.node_type(), NodeType::Number);
    let b_numeric = matches!(b.node_type(), NodeType::Number);
    if a_numeric && b_numeric {
        return a.number_value().partial_cmp(&b.number_value());
    }

    let a_string = a.node_type().uses_string_data();
    let b_string = b.node_type().uses_string_data();
    if a_string && b_string {
        let pool = string_pool();
        return Some(pool.string(a.string_id()).cmp(&pool.string(b.string_id())));
    }
    None
}

/// True when a precedes b under [`compare`]; `or_equal_to` admits equality.
pub fn is_less_than(a: NodeHandle, b: NodeHandle, or_equal_to: bool) -> bool {
    match compare(a, b) {
        Some(Ordering::Less) => true,
        Some(Ordering::Equal) => or_equal_to,
        _ => false,
    }
}

/// Number of nodes in the tree, counting shared nodes once.
pub fn deep_size(n: NodeHandle) -> usize {
    if n.is_null() {
        return 0;
    }
    let mut checked = HashSet::new();
    deep_size_recurse(n, &mut checked)
}

fn deep_size_recurse(n: NodeHandle, checked: &mut HashSet<NodeHandle>) -> usize {
    if n.is_null() || !checked.insert(n) {
        return 0;
    }
    let mut size = 1;
    for child in n.all_children() {
        size += deep_size_recurse(child, checked);
    }
    size
}
