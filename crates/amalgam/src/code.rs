//! Conversion between the parser's [`Sexpr`] AST and arena nodes.
//!
//! The parser crate owns the textual syntax and knows nothing about node
//! managers; this module is the seam where parsed trees become evaluable
//! nodes and back.

use crate::node::{flags, NodeHandle, NodeManager, NodeRef, NodeType};
use crate::string_pool::string_pool;
use amalgam_parser::{Sexpr, SexprKind};
use hashbrown::HashSet;

/// Parses source text into a tree allocated from `enm`, returning the tree
/// and any warnings. An unusable input yields a null reference.
pub fn parse_to_node(src: &str, enm: &NodeManager) -> (NodeRef, Vec<String>) {
    let outcome = amalgam_parser::parse(src);
    let mut warnings: Vec<String> = outcome.warnings.iter().map(|w| w.to_string()).collect();
    let node = match &outcome.node {
        Some(sexpr) => sexpr_to_node(sexpr, enm, &mut warnings),
        None => NodeHandle::NULL,
    };
    if !node.is_null() {
        flags::update_flags_for_node_tree(node);
    }
    (NodeRef::new(node, true), warnings)
}

/// Serializes a node tree to text.
pub fn unparse_node(n: NodeHandle) -> String {
    let mut visiting = HashSet::new();
    let sexpr = node_to_sexpr_recurse(n, &mut visiting);
    amalgam_parser::unparse(&sexpr)
}

/// Converts a parsed tree into nodes allocated from `enm`.
pub fn sexpr_to_node(sexpr: &Sexpr, enm: &NodeManager, warnings: &mut Vec<String>) -> NodeHandle {
    let node = match &sexpr.kind {
        SexprKind::Number(value) => enm.alloc_number_node(*value),
        SexprKind::StringLit(value) => enm.alloc_string_node(value),
        SexprKind::Symbol(name) => {
            let node = enm.alloc_node(NodeType::Symbol);
            node.set_string_value(name);
            node
        }
        SexprKind::Op { opcode, children } => match NodeType::from_keyword(opcode) {
            Some(NodeType::Assoc) => {
                let node = enm.alloc_node(NodeType::Assoc);
                let pool = string_pool();
                for pair in children.chunks(2) {
                    let key = match &pair[0].kind {
                        SexprKind::StringLit(s) | SexprKind::Symbol(s) => s.clone(),
                        SexprKind::Number(v) => amalgam_parser::format_number(*v),
                        SexprKind::Op { .. } => {
                            warnings.push("assoc keys must be immediate values".to_string());
                            continue;
                        }
                    };
                    let value = match pair.get(1) {
                        Some(v) => sexpr_to_node(v, enm, warnings),
                        None => NodeHandle::NULL,
                    };
                    // temporary reference so the id resolves; the map takes
                    // its own reference on insert
                    let key_id = pool.create_reference(&key);
                    node.set_mapped_child(key_id, value);
                    pool.destroy_reference(key_id);
                }
                node
            }
            Some(node_type) => {
                let node = enm.alloc_node(node_type);
                for child in children {
                    node.append_ordered_child(sexpr_to_node(child, enm, warnings));
                }
                node
            }
            None => {
                warnings.push(format!("unrecognized opcode `{opcode}`"));
                enm.alloc_node(NodeType::Null)
            }
        },
    };

    for label in &sexpr.labels {
        node.append_label(label);
    }
    if let Some(comment) = &sexpr.comment {
        node.set_comment_with_handoff(string_pool().create_reference(comment));
    }
    if sexpr.concurrent {
        node.set_concurrent(true);
    }
    node
}

/// Converts a node tree back to the parser AST. A cycle back into a node
/// currently being serialized is emitted as `(null)`.
pub fn node_to_sexpr(n: NodeHandle) -> Sexpr {
    let mut visiting = HashSet::new();
    node_to_sexpr_recurse(n, &mut visiting)
}

fn node_to_sexpr_recurse(n: NodeHandle, visiting: &mut HashSet<NodeHandle>) -> Sexpr {
    if n.is_null() {
        return Sexpr::op("null", Vec::new());
    }
    if n.need_cycle_check() && !visiting.insert(n) {
        return Sexpr::op("null", Vec::new());
    }

    let pool = string_pool();
    let mut sexpr = match n.node_type() {
        NodeType::Number => Sexpr::number(n.number_value()),
        NodeType::StringLiteral => Sexpr::string(&n.string_value()),
        NodeType::Symbol => Sexpr::symbol(&n.string_value()),
        NodeType::Assoc => {
            let mut children = Vec::new();
            for (key, value) in n.mapped_children_sorted() {
                children.push(Sexpr::string(&pool.string(key)));
                children.push(node_to_sexpr_recurse(value, visiting));
            }
            Sexpr::op("assoc", children)
        }
        node_type => {
            let keyword = node_type.keyword();
            let keyword = if keyword.is_empty() { "null" } else { keyword };
            let children = n
                .ordered_children()
                .iter()
                .map(|&child| node_to_sexpr_recurse(child, visiting))
                .collect();
            Sexpr::op(keyword, children)
        }
    };

    for label in n.labels() {
        sexpr.labels.push(pool.string(label));
    }
    let comment = n.comment_string_id();
    if comment.is_string() {
        sexpr.comment = Some(pool.string(comment));
    }
    sexpr.concurrent = n.concurrent();

    if n.need_cycle_check() {
        visiting.remove(&n);
    }
    sexpr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::compare::are_deep_equal;

    #[test]
    fn parse_unparse_is_a_fixpoint() {
        let enm = NodeManager::new();
        for src in [
            "(sequence (assign \"x\" 3) (assign \"x\" (+ (retrieve \"x\") 4)) (retrieve \"x\"))",
            "(list 1 2 3 (assoc \"a\" 1))",
            "#skill (lambda (* 2 4))",
            "(associate \"a\" 42)",
        ] {
            let (first, warnings) = parse_to_node(src, &enm);
            assert!(warnings.is_empty(), "{warnings:?}");
            let text = unparse_node(first.node);
            let (second, warnings) = parse_to_node(&text, &enm);
            assert!(warnings.is_empty(), "{warnings:?}");
            assert!(
                are_deep_equal(first.node, second.node),
                "{src} round-tripped to {text}"
            );
        }
    }

    #[test]
    fn unknown_opcodes_warn_and_become_null() {
        let enm = NodeManager::new();
        let (node, warnings) = parse_to_node("(frobnicate 1 2)", &enm);
        assert_eq!(node.node.node_type(), NodeType::Null);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("frobnicate"));
    }

    #[test]
    fn assoc_keys_intern_once() {
        let enm = NodeManager::new();
        let (node, _) = parse_to_node("(assoc \"k\" 1)", &enm);
        let key = string_pool().id_of("k").unwrap();
        assert_eq!(
            node.node.mapped_child(key).unwrap().number_value(),
            1.0
        );
    }
}
