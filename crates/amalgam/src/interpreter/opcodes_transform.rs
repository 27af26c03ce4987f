//! Collection transforms: map, filter, reduce, weave, sort, zip, and the
//! rest of the container-shaping opcodes. `map` and `filter` dispatch
//! per-element to the thread pool when their node carries the concurrent
//! flag.

use super::concurrency_manager::ConcurrentTask;
use super::{IndexValue, Interpreter};
use crate::node::manager::MetadataModifier;
use crate::node::{compare, flags, NodeHandle, NodeRef, NodeType};
use crate::string_pool::{string_pool, StringId};

impl Interpreter {
    pub(crate) fn op_map(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let function = self.interpret_node_for_immediate_use(children[0]);
        self.push_opcode_stack(function.node);
        let collection = self.interpret_node_for_immediate_use(children[1]);
        self.push_opcode_stack(collection.node);

        let result = if collection.node.is_associative_array() {
            self.map_over_assoc(en, function.node, collection)
        } else {
            self.map_over_list(en, function.node, collection)
        };

        self.pop_opcode_stack();
        self.pop_opcode_stack();
        result
    }

    fn map_over_list(
        &mut self,
        en: NodeHandle,
        function: NodeHandle,
        collection: NodeRef,
    ) -> NodeRef {
        let elements = collection.node.children_copy();
        let mut result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        self.push_opcode_stack(result.node);

        if en.concurrent() && self.can_run_concurrently(elements.len()) {
            let tasks: Vec<ConcurrentTask> = elements
                .iter()
                .enumerate()
                .map(|(i, &value)| ConcurrentTask {
                    code: function,
                    current_value: value,
                    index_value: IndexValue::Number(i as f64),
                })
                .collect();
            let outcome = self.interpret_nodes_concurrently(en, result.node, tasks);
            // each task wrote its own pre-sized slot, so order is the
            // input order
            for value in &outcome.results {
                result.node.append_ordered_child(value.node);
            }
            result.unique = outcome.results_unique;
            result.node.set_need_cycle_check(outcome.results_need_cycle_check);
            result
                .node
                .set_idempotent(outcome.results_idempotent && !outcome.results_side_effect);
            if !outcome.results_side_effect {
                self.enm().free_node_tree_if_possible(collection);
            }
            self.pop_opcode_stack();
            return result;
        }

        self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
        for (i, &value) in elements.iter().enumerate() {
            self.set_construction_index(IndexValue::Number(i as f64));
            self.set_construction_current_value(value);
            let mapped = self.interpret_node(function, false);
            result.node.append_ordered_child(mapped.node);
            result.update_properties_based_on_attached_node(mapped);
        }
        self.pop_construction_context();
        self.pop_opcode_stack();
        result
    }

    fn map_over_assoc(
        &mut self,
        en: NodeHandle,
        function: NodeHandle,
        collection: NodeRef,
    ) -> NodeRef {
        let pairs = collection.node.mapped_children_sorted();
        let mut result = NodeRef::new(self.enm().alloc_node(NodeType::Assoc), true);
        self.push_opcode_stack(result.node);
        self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
        for (key, value) in pairs {
            self.set_construction_index(IndexValue::StringVal(key));
            self.set_construction_current_value(value);
            let mapped = self.interpret_node(function, false);
            result.node.set_mapped_child(key, mapped.node);
            result.update_properties_based_on_attached_node(mapped);
        }
        self.pop_construction_context();
        self.pop_opcode_stack();
        result
    }

    pub(crate) fn op_filter(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&last) = children.last() else {
            return NodeRef::NULL;
        };
        // with no function, filter removes nulls
        let function = if children.len() >= 2 {
            let f = self.interpret_node_for_immediate_use(children[0]);
            f.node
        } else {
            NodeHandle::NULL
        };
        self.push_opcode_stack(function);
        let collection = self.interpret_node_for_immediate_use(last);
        self.push_opcode_stack(collection.node);

        let result = if collection.node.is_associative_array() {
            let pairs = collection.node.mapped_children_sorted();
            let result = NodeRef::new(self.enm().alloc_node(NodeType::Assoc), true);
            self.push_opcode_stack(result.node);
            self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
            for (key, value) in pairs {
                let keep = if function.is_null() {
                    !value.is_null_value()
                } else {
                    self.set_construction_index(IndexValue::StringVal(key));
                    self.set_construction_current_value(value);
                    let verdict = self.interpret_node(function, true);
                    let keep = compare::is_true(verdict.node);
                    self.enm().free_node_tree_if_possible(verdict);
                    keep
                };
                if keep {
                    result.node.set_mapped_child(key, value);
                }
            }
            self.pop_construction_context();
            self.pop_opcode_stack();
            let mut result = result;
            result.unique = false;
            result.unique_top = true;
            result
        } else {
            let elements = collection.node.children_copy();

            if !function.is_null() && en.concurrent() && self.can_run_concurrently(elements.len())
            {
                let result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
                self.push_opcode_stack(result.node);
                let tasks: Vec<ConcurrentTask> = elements
                    .iter()
                    .enumerate()
                    .map(|(i, &value)| ConcurrentTask {
                        code: function,
                        current_value: value,
                        index_value: IndexValue::Number(i as f64),
                    })
                    .collect();
                let outcome = self.interpret_nodes_concurrently(en, result.node, tasks);
                for (verdict, &element) in outcome.results.iter().zip(&elements) {
                    if compare::is_true(verdict.node) {
                        result.node.append_ordered_child(element);
                    }
                    self.enm().free_node_tree_if_possible(*verdict);
                }
                self.pop_opcode_stack();
                let mut result = result;
                result.unique = false;
                result.unique_top = true;
                result
            } else {
                let result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
                self.push_opcode_stack(result.node);
                self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
                for (i, &value) in elements.iter().enumerate() {
                    let keep = if function.is_null() {
                        !value.is_null_value()
                    } else {
                        self.set_construction_index(IndexValue::Number(i as f64));
                        self.set_construction_current_value(value);
                        let verdict = self.interpret_node(function, true);
                        let keep = compare::is_true(verdict.node);
                        self.enm().free_node_tree_if_possible(verdict);
                        keep
                    };
                    if keep {
                        result.node.append_ordered_child(value);
                    }
                }
                self.pop_construction_context();
                self.pop_opcode_stack();
                let mut result = result;
                result.unique = false;
                result.unique_top = true;
                result
            }
        };

        self.pop_opcode_stack();
        self.pop_opcode_stack();
        result
    }

    pub(crate) fn op_reduce(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let function = self.interpret_node_for_immediate_use(children[0]);
        self.push_opcode_stack(function.node);
        let collection = self.interpret_node_for_immediate_use(children[1]);
        self.push_opcode_stack(collection.node);

        let elements: Vec<(IndexValue, NodeHandle)> = if collection.node.is_associative_array() {
            collection
                .node
                .mapped_children_sorted()
                .into_iter()
                .map(|(k, v)| (IndexValue::StringVal(k), v))
                .collect()
        } else {
            collection
                .node
                .ordered_children()
                .iter()
                .enumerate()
                .map(|(i, &v)| (IndexValue::Number(i as f64), v))
                .collect()
        };

        let mut result = NodeRef::NULL;
        if !elements.is_empty() {
            result = NodeRef::new(elements[0].1, false);
            self.push_construction_context(en, NodeHandle::NULL, NodeHandle::NULL, result);
            for &(index, value) in &elements[1..] {
                self.set_construction_index(index);
                self.set_construction_current_value(value);
                self.set_construction_previous_result(result);
                result = self.interpret_node(function.node, false);
            }
            self.pop_construction_context();
        }

        self.pop_opcode_stack();
        self.pop_opcode_stack();
        result
    }

    /// `weave f? xss...`: interleaves lists element by element; with a
    /// function, each index's tuple is passed as `current_value` and the
    /// function's result is appended.
    pub(crate) fn op_weave(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.is_empty() {
            return NodeRef::NULL;
        }
        // the first child is a function when it does not evaluate to a list
        let first = self.interpret_node_for_immediate_use(children[0]);
        let has_function = !first.node.is_null_value() && !first.node.is_ordered_array();
        self.push_opcode_stack(first.node);

        let mut lists: Vec<NodeRef> = Vec::new();
        if !has_function {
            lists.push(first);
        }
        for &child in &children[1..] {
            let list = self.interpret_node_for_immediate_use(child);
            self.push_opcode_stack(list.node);
            lists.push(list);
        }

        let longest = lists
            .iter()
            .map(|l| l.node.num_child_nodes())
            .max()
            .unwrap_or(0);
        let mut result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        self.push_opcode_stack(result.node);
        self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
        for i in 0..longest {
            if has_function {
                let tuple = self.enm().alloc_node(NodeType::List);
                for list in &lists {
                    tuple.append_ordered_child(list.node.child(i));
                }
                self.set_construction_index(IndexValue::Number(i as f64));
                self.set_construction_current_value(tuple);
                let woven = self.interpret_node(first.node, false);
                result.node.append_ordered_child(woven.node);
                result.update_properties_based_on_attached_node(woven);
            } else {
                for list in &lists {
                    if i < list.node.num_child_nodes() {
                        result.node.append_ordered_child(list.node.child(i));
                    }
                }
            }
        }
        self.pop_construction_context();
        self.pop_opcode_stack();
        if !has_function {
            result.unique = false;
            result.unique_top = true;
        }

        for _ in 0..lists.len() + usize::from(has_function) {
            self.pop_opcode_stack();
        }
        result
    }

    /// `apply type xs`: re-types the evaluated collection and interprets
    /// it, e.g. `(apply "+" (list 1 2 3))`.
    pub(crate) fn op_apply(&mut self, en: NodeHandle, immediate_result: bool) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let type_value = self.interpret_node_for_immediate_use(children[0]);
        let type_name = compare::to_string(type_value.node).unwrap_or_default();
        self.enm().free_node_tree_if_possible(type_value);
        let Some(new_type) = super::node_type_from_string(&type_name) else {
            return NodeRef::NULL;
        };

        let mut collection = self.interpret_node_for_immediate_use(children[1]);
        if collection.is_null() {
            return NodeRef::NULL;
        }
        self.enm()
            .ensure_node_is_modifiable(&mut collection, MetadataModifier::RemoveAll);
        collection.node.set_type(new_type);
        self.push_opcode_stack(collection.node);
        let result = self.interpret_node(collection.node, immediate_result);
        self.pop_opcode_stack();
        result
    }

    pub(crate) fn op_reverse(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let mut collection = self.interpret_node_for_immediate_use(first);
        self.enm()
            .ensure_node_is_modifiable(&mut collection, MetadataModifier::RemoveAll);
        if let Some(elements) = collection.node.ordered_children_mut() {
            elements.reverse();
        }
        collection
    }

    /// `sort [cmp] xs`: default ordering, or a comparator whose
    /// `current_value` is the pair `[a, b]` and whose truthy result means
    /// `a` sorts before `b`.
    pub(crate) fn op_sort(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.is_empty() {
            return NodeRef::NULL;
        }
        let (comparator, list_node) = if children.len() >= 2 {
            let f = self.interpret_node_for_immediate_use(children[0]);
            (f.node, children[1])
        } else {
            (NodeHandle::NULL, children[0])
        };
        self.push_opcode_stack(comparator);

        let mut collection = self.interpret_node_for_immediate_use(list_node);
        self.enm()
            .ensure_node_is_modifiable(&mut collection, MetadataModifier::RemoveAll);
        self.push_opcode_stack(collection.node);

        let mut elements = collection.node.children_copy().to_vec();
        if comparator.is_null() {
            elements.sort_by(|&a, &b| {
                compare::compare(a, b).unwrap_or_else(|| {
                    // mixed types order numbers before strings before code
                    sort_class(a).cmp(&sort_class(b))
                })
            });
        } else {
            // a comparator that allocates reorders via insertion to keep
            // evaluation counts predictable
            let mut sorted: Vec<NodeHandle> = Vec::with_capacity(elements.len());
            self.push_construction_context(en, collection.node, NodeHandle::NULL, NodeRef::NULL);
            for &element in &elements {
                let mut insert_at = sorted.len();
                for (i, &placed) in sorted.iter().enumerate() {
                    let pair = self.enm().alloc_list_node(&[element, placed]);
                    self.set_construction_current_value(pair);
                    let verdict = self.interpret_node(comparator, true);
                    let before = compare::is_true(verdict.node);
                    self.enm().free_node_tree_if_possible(verdict);
                    if before {
                        insert_at = i;
                        break;
                    }
                }
                sorted.insert(insert_at, element);
            }
            self.pop_construction_context();
            elements = sorted;
        }

        if let Some(slots) = collection.node.ordered_children_mut() {
            slots.clear();
            slots.extend_from_slice(&elements);
        }
        self.pop_opcode_stack();
        self.pop_opcode_stack();
        collection
    }

    pub(crate) fn op_indices(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let collection = self.interpret_node_for_immediate_use(first);
        let result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        if collection.node.is_associative_array() {
            for (key, _) in collection.node.mapped_children_sorted() {
                let node = self
                    .enm()
                    .alloc_string_node_with_handoff(string_pool().create_reference_by_id(key));
                result.node.append_ordered_child(node);
            }
        } else {
            for i in 0..collection.node.num_child_nodes() {
                result
                    .node
                    .append_ordered_child(self.enm().alloc_number_node(i as f64));
            }
        }
        self.enm().free_node_tree_if_possible(collection);
        result
    }

    pub(crate) fn op_values(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let collection = self.interpret_node_for_immediate_use(first);
        let only_unique = children
            .get(1)
            .map(|&n| self.interpret_node_into_bool(n))
            .unwrap_or(false);

        let values: Vec<NodeHandle> = if collection.node.is_associative_array() {
            collection
                .node
                .mapped_children_sorted()
                .into_iter()
                .map(|(_, v)| v)
                .collect()
        } else {
            collection.node.ordered_children().to_vec()
        };

        let result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        if only_unique {
            let mut seen: Vec<NodeHandle> = Vec::new();
            for value in values {
                if !seen.iter().any(|&s| compare::are_deep_equal(s, value)) {
                    seen.push(value);
                    result.node.append_ordered_child(value);
                }
            }
        } else {
            for value in values {
                result.node.append_ordered_child(value);
            }
        }
        let mut result = result;
        result.unique = false;
        result.unique_top = true;
        result
    }

    pub(crate) fn op_contains_index(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return self.alloc_bool(false);
        }
        let collection = self.interpret_node_for_immediate_use(children[0]);
        self.push_opcode_stack(collection.node);
        let index = self.interpret_node_for_immediate_use(children[1]);
        let found = self.traverse_address(collection.node, index.node).is_some();
        self.pop_opcode_stack();
        self.alloc_bool(found)
    }

    pub(crate) fn op_contains_value(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return self.alloc_bool(false);
        }
        let collection = self.interpret_node_for_immediate_use(children[0]);
        self.push_opcode_stack(collection.node);
        let value = self.interpret_node_for_immediate_use(children[1]);

        let found = if let Some(map) = collection.node.mapped_children() {
            map.values().any(|&v| compare::are_deep_equal(v, value.node))
        } else {
            collection
                .node
                .ordered_children()
                .iter()
                .any(|&v| compare::are_deep_equal(v, value.node))
        };
        self.pop_opcode_stack();
        self.alloc_bool(found)
    }

    /// `remove xs keys` / `keep xs keys`: drops or retains entries by key
    /// or index.
    pub(crate) fn op_remove_and_keep(&mut self, en: NodeHandle) -> NodeRef {
        let keep = en.node_type() == NodeType::Keep;
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let mut collection = self.interpret_node_for_immediate_use(children[0]);
        self.enm()
            .ensure_node_is_modifiable(&mut collection, MetadataModifier::RemoveAll);
        self.push_opcode_stack(collection.node);
        let keys = self.interpret_node_for_immediate_use(children[1]);

        let key_nodes: Vec<NodeHandle> =
            if keys.node.is_ordered_array() && !keys.node.node_type().is_immediate() {
                keys.node.ordered_children().to_vec()
            } else {
                vec![keys.node]
            };

        if collection.node.is_associative_array() {
            let key_ids: Vec<StringId> = key_nodes
                .iter()
                .map(|&k| compare::to_string_id_if_exists(k))
                .collect();
            if keep {
                let retained: Vec<(StringId, NodeHandle)> = collection
                    .node
                    .mapped_children_sorted()
                    .into_iter()
                    .filter(|(k, _)| key_ids.contains(k))
                    .collect();
                let replacement = self.enm().alloc_node(NodeType::Assoc);
                for (key, value) in retained {
                    replacement.set_mapped_child(key, value);
                }
                let mut new_ref = NodeRef::new(replacement, collection.unique);
                new_ref.unique_top = true;
                self.pop_opcode_stack();
                return new_ref;
            }
            for key in key_ids {
                collection.node.remove_mapped_child(key);
            }
        } else if let Some(elements) = collection.node.ordered_children_mut() {
            let len = elements.len();
            let mut indices: Vec<usize> = key_nodes
                .iter()
                .filter_map(|&k| {
                    let index = compare::to_number(k, f64::NAN);
                    if index.is_nan() {
                        return None;
                    }
                    let index = if index < 0.0 { len as f64 + index } else { index };
                    if index < 0.0 || index >= len as f64 {
                        return None;
                    }
                    Some(index as usize)
                })
                .collect();
            indices.sort_unstable();
            indices.dedup();
            if keep {
                let retained: Vec<NodeHandle> =
                    indices.iter().map(|&i| elements[i]).collect();
                elements.clear();
                elements.extend_from_slice(&retained);
            } else {
                for &index in indices.iter().rev() {
                    elements.remove(index);
                }
            }
        }
        self.pop_opcode_stack();
        collection
    }

    /// `associate k1 v1 ...`: builds an assoc evaluating both keys and
    /// values.
    pub(crate) fn op_associate(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let mut result = NodeRef::new(self.enm().alloc_node(NodeType::Assoc), true);
        self.push_opcode_stack(result.node);
        self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
        for pair in children.chunks(2) {
            let key = self.interpret_node_into_string_id_with_reference(pair[0]);
            if !key.is_string() {
                continue;
            }
            self.set_construction_index(IndexValue::StringVal(key));
            let value = match pair.get(1) {
                Some(&v) => self.interpret_node(v, false),
                None => NodeRef::NULL,
            };
            result.node.set_mapped_child(key, value.node);
            result.update_properties_based_on_attached_node(value);
            string_pool().destroy_reference(key);
        }
        self.pop_construction_context();
        self.pop_opcode_stack();
        result
    }

    /// `zip [f] keys values`: builds an assoc pairing keys with values;
    /// collisions resolve through `f` when given.
    pub(crate) fn op_zip(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.is_empty() {
            return NodeRef::NULL;
        }
        // leading function argument is optional
        let first = self.interpret_node_for_immediate_use(children[0]);
        let has_function = !first.node.is_null_value()
            && !first.node.is_ordered_array()
            && children.len() >= 3;
        self.push_opcode_stack(first.node);

        let keys = if has_function {
            self.interpret_node_for_immediate_use(children[1])
        } else {
            first
        };
        self.push_opcode_stack(keys.node);
        let values_index = if has_function { 2 } else { 1 };
        let values = children
            .get(values_index)
            .map(|&n| self.interpret_node_for_immediate_use(n))
            .unwrap_or(NodeRef::NULL);
        self.push_opcode_stack(values.node);

        let key_nodes = keys.node.children_copy();
        let mut result = NodeRef::new(self.enm().alloc_node(NodeType::Assoc), true);
        self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
        for (i, &key_node) in key_nodes.iter().enumerate() {
            let key = compare::to_string_id_with_reference(key_node);
            if !key.is_string() {
                continue;
            }
            let value = values.node.child(i);
            let final_value = match result.node.mapped_child(key) {
                Some(existing) if has_function => {
                    // collision: f decides with current_value [existing, new]
                    let pair = self.enm().alloc_list_node(&[existing, value]);
                    self.set_construction_index(IndexValue::StringVal(key));
                    self.set_construction_current_value(pair);
                    let merged = self.interpret_node(first.node, false);
                    merged.node
                }
                _ => value,
            };
            result.node.set_mapped_child(key, final_value);
            result.update_properties_based_on_attached_node(NodeRef::new(final_value, false));
            string_pool().destroy_reference(key);
        }
        self.pop_construction_context();
        self.pop_opcode_stack();
        self.pop_opcode_stack();
        self.pop_opcode_stack();
        result.unique = false;
        result.unique_top = true;
        result
    }

    /// `unzip assoc keys`: the values at each key, in key order.
    pub(crate) fn op_unzip(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let collection = self.interpret_node_for_immediate_use(first);
        self.push_opcode_stack(collection.node);

        let result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        match children.get(1) {
            Some(&keys_node) => {
                let keys = self.interpret_node_for_immediate_use(keys_node);
                for &key_node in keys.node.ordered_children() {
                    let value = self
                        .traverse_address(collection.node, key_node)
                        .unwrap_or(NodeHandle::NULL);
                    result.node.append_ordered_child(value);
                }
            }
            None => {
                for (_, value) in collection.node.mapped_children_sorted() {
                    result.node.append_ordered_child(value);
                }
            }
        }
        self.pop_opcode_stack();
        let mut result = result;
        result.unique = false;
        result.unique_top = true;
        result
    }

    /// `rewrite f tree`: bottom-up rewrite; `f` sees each subtree as
    /// `current_value` and its result replaces the subtree.
    pub(crate) fn op_rewrite(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let function = self.interpret_node_for_immediate_use(children[0]);
        self.push_opcode_stack(function.node);
        let tree = self.interpret_node_for_immediate_use(children[1]);
        // rewriting works on a private copy
        let copy = self
            .enm()
            .deep_alloc_copy(tree.node, MetadataModifier::NoChange);
        self.enm().free_node_tree_if_possible(tree);
        self.push_opcode_stack(copy.node);

        self.push_construction_context(en, copy.node, NodeHandle::NULL, NodeRef::NULL);
        let rewritten = self.rewrite_recurse(function.node, copy.node);
        self.pop_construction_context();

        self.pop_opcode_stack();
        self.pop_opcode_stack();
        if !rewritten.is_null() {
            flags::update_flags_for_node_tree(rewritten.node);
        }
        rewritten
    }

    fn rewrite_recurse(&mut self, function: NodeHandle, node: NodeHandle) -> NodeRef {
        // children first
        if let Some(elements) = node.ordered_children_mut() {
            let snapshot = elements.clone();
            for (i, &child) in snapshot.iter().enumerate() {
                if child.is_null() {
                    continue;
                }
                self.set_construction_index(IndexValue::Number(i as f64));
                let new_child = self.rewrite_recurse(function, child);
                node.ordered_children_mut().unwrap()[i] = new_child.node;
            }
        } else if let Some(map) = node.mapped_children() {
            let pairs: Vec<(StringId, NodeHandle)> = map.iter().map(|(&k, &v)| (k, v)).collect();
            for (key, child) in pairs {
                if child.is_null() {
                    continue;
                }
                self.set_construction_index(IndexValue::StringVal(key));
                let new_child = self.rewrite_recurse(function, child);
                node.set_mapped_child(key, new_child.node);
            }
        }
        self.set_construction_current_value(node);
        self.interpret_node(function, false)
    }

}

fn sort_class(n: NodeHandle) -> u8 {
    match n.node_type() {
        NodeType::Number => 0,
        NodeType::StringLiteral | NodeType::Symbol => 1,
        _ => 2,
    }
}
