//! Logic, comparison, and the small arithmetic set the entity and query
//! code rely on.

use super::Interpreter;
use crate::node::{compare, NodeHandle, NodeRef, NodeType};

impl Interpreter {
    /// `and` returns the last value when everything is true, else false.
    pub(crate) fn op_and(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let mut result = NodeRef::NULL;
        for &child in &children {
            self.enm().free_node_tree_if_possible(result);
            result = self.interpret_node(child, false);
            if !compare::is_true(result.node) {
                self.enm().free_node_tree_if_possible(result);
                return self.alloc_bool(false);
            }
        }
        result
    }

    /// `or` returns the first true value, else false.
    pub(crate) fn op_or(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        for &child in &children {
            let result = self.interpret_node(child, false);
            if compare::is_true(result.node) {
                return result;
            }
            self.enm().free_node_tree_if_possible(result);
        }
        self.alloc_bool(false)
    }

    /// `xor` is true when an odd number of operands are true.
    pub(crate) fn op_xor(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let mut num_true = 0usize;
        for &child in &children {
            if self.interpret_node_into_bool(child) {
                num_true += 1;
            }
        }
        self.alloc_bool(num_true % 2 == 1)
    }

    pub(crate) fn op_not(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let truth = children
            .first()
            .map(|&c| self.interpret_node_into_bool(c))
            .unwrap_or(false);
        self.alloc_bool(!truth)
    }

    /// `=` is true when all operands are deep-equal; `!=` when all pairs
    /// are distinct.
    pub(crate) fn op_equal(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let want_equal = en.node_type() == NodeType::Equal;

        let mut values: Vec<NodeRef> = Vec::with_capacity(children.len());
        for &child in &children {
            let value = self.interpret_node(child, false);
            self.push_opcode_stack(value.node);
            values.push(value);
        }

        let result = if want_equal {
            values
                .windows(2)
                .all(|pair| compare::are_deep_equal(pair[0].node, pair[1].node))
        } else {
            let mut all_distinct = true;
            'outer: for i in 0..values.len() {
                for j in i + 1..values.len() {
                    if compare::are_deep_equal(values[i].node, values[j].node) {
                        all_distinct = false;
                        break 'outer;
                    }
                }
            }
            all_distinct
        };

        for value in values.into_iter().rev() {
            self.pop_opcode_stack();
            self.enm().free_node_tree_if_possible(value);
        }
        self.alloc_bool(result)
    }

    /// The chained orderings `<`, `<=`, `>`, `>=`.
    pub(crate) fn op_compare(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return self.alloc_bool(false);
        }
        let node_type = en.node_type();

        let mut previous: Option<NodeRef> = None;
        for &child in &children {
            let value = self.interpret_node_for_immediate_use(child);
            if let Some(prev) = previous {
                let holds = match node_type {
                    NodeType::Less => compare::is_less_than(prev.node, value.node, false),
                    NodeType::Lequal => compare::is_less_than(prev.node, value.node, true),
                    NodeType::Greater => compare::is_less_than(value.node, prev.node, false),
                    _ => compare::is_less_than(value.node, prev.node, true),
                };
                // orderings are only defined when the pair is comparable
                let comparable = compare::compare(prev.node, value.node).is_some();
                self.enm().free_node_tree_if_possible(prev);
                if !holds || !comparable {
                    self.enm().free_node_tree_if_possible(value);
                    return self.alloc_bool(false);
                }
            }
            previous = Some(value);
        }
        if let Some(prev) = previous {
            self.enm().free_node_tree_if_possible(prev);
        }
        self.alloc_bool(true)
    }

    /// `~` / `!~`: same (or different) node types across all operands.
    pub(crate) fn op_type_equals(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let want_equal = en.node_type() == NodeType::TypeEquals;
        let mut types = Vec::with_capacity(children.len());
        for &child in &children {
            let value = self.interpret_node_for_immediate_use(child);
            types.push(value.node.node_type());
            self.enm().free_node_tree_if_possible(value);
        }
        let result = if want_equal {
            types.windows(2).all(|pair| pair[0] == pair[1])
        } else {
            let mut all_distinct = true;
            'outer: for i in 0..types.len() {
                for j in i + 1..types.len() {
                    if types[i] == types[j] {
                        all_distinct = false;
                        break 'outer;
                    }
                }
            }
            all_distinct
        };
        self.alloc_bool(result)
    }

    pub(crate) fn op_arithmetic(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let node_type = en.node_type();
        let mut accum: Option<f64> = None;
        for &child in &children {
            let value = self.interpret_node_into_number(child, f64::NAN);
            accum = Some(match accum {
                None => value,
                Some(left) => match node_type {
                    NodeType::Add => left + value,
                    NodeType::Subtract => left - value,
                    NodeType::Multiply => left * value,
                    NodeType::Divide => left / value,
                    NodeType::Modulus => left.rem_euclid(value),
                    NodeType::Min => left.min(value),
                    _ => left.max(value),
                },
            });
        }
        match accum {
            // NaN results canonicalize to null through the allocator
            Some(value) => self.alloc_number(value),
            None => NodeRef::NULL,
        }
    }

    pub(crate) fn op_rounding(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let value = self.interpret_node_into_number(first, f64::NAN);
        let rounded = if en.node_type() == NodeType::Floor {
            value.floor()
        } else {
            value.ceil()
        };
        self.alloc_number(rounded)
    }
}
