//! Core opcodes: literals and data constructors, sequencing, binding,
//! control, function calls, reflection, data access, randomness, and the
//! `system` dispatch.

use super::{ConstraintViolation, IndexValue, Interpreter, InterpreterConstraints};
use crate::node::manager::MetadataModifier;
use crate::node::{compare, NodeHandle, NodeRef, NodeType};
use crate::permissions::Permissions;
use crate::string_pool::{string_pool, StringId};

impl Interpreter {
    pub(crate) fn has_permission(&self, permission: Permissions) -> bool {
        self.entity.permissions().contains(permission)
    }

    // --- literals and data constructors ---

    /// Numbers, strings, and booleans evaluate to themselves; a clone is
    /// only needed when metadata must be stripped off the program tree.
    pub(crate) fn op_immediate_literal(&mut self, en: NodeHandle, _immediate: bool) -> NodeRef {
        if en.num_labels() > 0 || en.comment_string_id().is_string() {
            return self.enm().deep_alloc_copy(en, MetadataModifier::RemoveAll);
        }
        NodeRef::new(en, false)
    }

    pub(crate) fn op_symbol(&mut self, en: NodeHandle) -> NodeRef {
        let sid = en.string_id();
        match self.get_call_stack_symbol(sid) {
            Some((value, _)) => NodeRef::new(value, false),
            None => NodeRef::NULL,
        }
    }

    pub(crate) fn op_list(&mut self, en: NodeHandle) -> NodeRef {
        if en.is_idempotent() {
            return self.op_immediate_literal(en, false);
        }
        let children = en.children_copy();
        let mut result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        self.push_opcode_stack(result.node);
        self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
        for (i, &child) in children.iter().enumerate() {
            self.set_construction_index(IndexValue::Number(i as f64));
            let value = self.interpret_node(child, false);
            result.node.append_ordered_child(value.node);
            result.update_properties_based_on_attached_node(value);
        }
        self.pop_construction_context();
        self.pop_opcode_stack();
        result
    }

    pub(crate) fn op_assoc(&mut self, en: NodeHandle) -> NodeRef {
        if en.is_idempotent() {
            return self.op_immediate_literal(en, false);
        }
        let pairs = en.mapped_children_sorted();
        let mut result = NodeRef::new(self.enm().alloc_node(NodeType::Assoc), true);
        self.push_opcode_stack(result.node);
        self.push_construction_context(en, result.node, NodeHandle::NULL, NodeRef::NULL);
        for (key, child) in pairs {
            self.set_construction_index(IndexValue::StringVal(key));
            let value = self.interpret_node(child, false);
            result.node.set_mapped_child(key, value.node);
            result.update_properties_based_on_attached_node(value);
        }
        self.pop_construction_context();
        self.pop_opcode_stack();
        result
    }

    // --- sequencing and control ---

    pub(crate) fn op_sequence(&mut self, en: NodeHandle, immediate_result: bool) -> NodeRef {
        let children = en.children_copy();
        let mut result = NodeRef::NULL;
        for (i, &child) in children.iter().enumerate() {
            if result.is_non_null_node() {
                match result.node.node_type() {
                    NodeType::Conclude => {
                        return self.remove_top_conclude_or_return_node(result);
                    }
                    NodeType::Return => return result,
                    _ => {}
                }
            }
            // free the previous iteration's result
            self.enm().free_node_tree_if_possible(result);
            // request immediate values when not last, since any allocation
            // for returns would be wasted
            result = self.interpret_node(child, immediate_result || i + 1 < children.len());
        }
        result
    }

    pub(crate) fn op_parallel(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if en.concurrent() && self.can_run_concurrently(children.len()) {
            self.evaluate_concurrently_discarding_results(&children);
            return NodeRef::NULL;
        }
        for &child in &children {
            let result = self.interpret_node(child, true);
            self.enm().free_node_tree_if_possible(result);
        }
        NodeRef::NULL
    }

    /// A lambda evaluates to its body, unevaluated; with a truthy second
    /// argument the body is evaluated first and wrapped back in a lambda.
    pub(crate) fn op_lambda(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        match children.len() {
            0 => NodeRef::NULL,
            1 => NodeRef::new(children[0], false),
            _ => {
                if !self.interpret_node_into_bool(children[1]) {
                    return NodeRef::new(children[0], false);
                }
                let evaluated = self.interpret_node(children[0], false);
                let mut result = NodeRef::new(self.enm().alloc_node(NodeType::Lambda), true);
                result.node.append_ordered_child(evaluated.node);
                result.update_properties_based_on_attached_node(evaluated);
                result
            }
        }
    }

    /// Wraps the evaluated child in a conclude/return marker node that each
    /// enclosing control context unwraps exactly one layer of.
    pub(crate) fn op_conclude_and_return(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.is_empty() {
            return NodeRef::new(en, false);
        }
        if en.is_idempotent() {
            return self.enm().deep_alloc_copy(en, MetadataModifier::RemoveAll);
        }
        let value = self.interpret_node(children[0], false);
        let mut result = NodeRef::new(self.enm().alloc_node(en.node_type()), true);
        result.node.append_ordered_child(value.node);
        result.update_properties_based_on_attached_node(value);
        result
    }

    pub(crate) fn op_if(&mut self, en: NodeHandle, immediate_result: bool) -> NodeRef {
        let children = en.children_copy();
        let mut i = 0;
        while i + 1 < children.len() {
            if self.interpret_node_into_bool(children[i]) {
                return self.interpret_node(children[i + 1], immediate_result);
            }
            i += 2;
        }
        // a trailing unpaired child is the else branch
        if i < children.len() {
            return self.interpret_node(children[i], immediate_result);
        }
        NodeRef::NULL
    }

    pub(crate) fn op_while(&mut self, en: NodeHandle, _immediate_result: bool) -> NodeRef {
        let children = en.children_copy();
        if children.is_empty() {
            return NodeRef::NULL;
        }
        self.push_construction_context(en, NodeHandle::NULL, NodeHandle::NULL, NodeRef::NULL);

        let mut iteration: f64 = 0.0;
        let mut conclusion: Option<NodeRef> = None;
        loop {
            if self.are_execution_resources_exhausted(false) {
                break;
            }
            // the index of the iteration about to run, visible to the
            // condition as well as the body
            self.set_construction_index(IndexValue::Number(iteration));
            iteration += 1.0;
            if !self.interpret_node_into_bool(children[0]) {
                break;
            }

            let mut body_result = NodeRef::NULL;
            let mut terminated = false;
            for (i, &child) in children[1..].iter().enumerate() {
                self.enm().free_node_tree_if_possible(body_result);
                body_result = self.interpret_node(child, i + 2 < children.len());
                if body_result.is_non_null_node() {
                    match body_result.node.node_type() {
                        NodeType::Conclude => {
                            conclusion = Some(self.remove_top_conclude_or_return_node(body_result));
                            terminated = true;
                            break;
                        }
                        NodeType::Return => {
                            conclusion = Some(body_result);
                            terminated = true;
                            break;
                        }
                        _ => {}
                    }
                }
            }
            if terminated {
                break;
            }
            self.set_construction_previous_result(body_result);
        }

        let result = match conclusion {
            Some(conclusion) => conclusion,
            None => {
                // the loop's value is the last completed iteration's result
                let previous = self
                    .get_construction_slot(0, super::PREVIOUS_RESULT_OFFSET)
                    .unwrap_or(NodeHandle::NULL);
                let unique = self
                    .get_construction_sidecar(0)
                    .is_some_and(|s| s.previous_result_unique);
                NodeRef::new(previous, unique)
            }
        };
        self.pop_construction_context();
        result
    }

    // --- binding ---

    pub(crate) fn op_let(&mut self, en: NodeHandle, immediate_result: bool) -> NodeRef {
        let children = en.children_copy();
        let mut context = NodeRef::NULL;
        if let Some(&first) = children.first() {
            context = self.interpret_node_for_immediate_use(first);
            self.enm()
                .ensure_node_is_modifiable(&mut context, MetadataModifier::RemoveAll);
        }
        self.push_new_call_stack_frame(context);

        let mut result = NodeRef::NULL;
        for (i, &child) in children.iter().enumerate().skip(1) {
            if result.is_non_null_node() {
                match result.node.node_type() {
                    NodeType::Conclude => {
                        let unwrapped = self.remove_top_conclude_or_return_node(result);
                        self.pop_call_stack_frame();
                        return unwrapped;
                    }
                    NodeType::Return => {
                        self.pop_call_stack_frame();
                        return result;
                    }
                    _ => {}
                }
            }
            self.enm().free_node_tree_if_possible(result);
            result = self.interpret_node(child, immediate_result || i + 1 < children.len());
        }
        self.pop_call_stack_frame();
        result
    }

    pub(crate) fn op_declare(&mut self, en: NodeHandle, immediate_result: bool) -> NodeRef {
        let children = en.children_copy();
        if let Some(&first) = children.first() {
            let context = self.interpret_node_for_immediate_use(first);
            if let Some(map) = context.node.mapped_children() {
                let pairs: Vec<(StringId, NodeHandle)> =
                    map.iter().map(|(&k, &v)| (k, v)).collect();
                for (key, value) in pairs {
                    // no shadowing: existing symbols keep their values
                    self.declare_call_stack_symbol(key, value);
                }
            }
        }

        let mut result = NodeRef::NULL;
        for (i, &child) in children.iter().enumerate().skip(1) {
            if result.is_non_null_node() {
                match result.node.node_type() {
                    NodeType::Conclude => {
                        return self.remove_top_conclude_or_return_node(result);
                    }
                    NodeType::Return => return result,
                    _ => {}
                }
            }
            self.enm().free_node_tree_if_possible(result);
            result = self.interpret_node(child, immediate_result || i + 1 < children.len());
        }
        result
    }

    pub(crate) fn op_assign_and_accum(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let accum = en.node_type() == NodeType::Accum;
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };

        // assoc form: each key is a symbol to write
        if children.len() == 1 {
            let assignments = self.interpret_node_for_immediate_use(first);
            if let Some(map) = assignments.node.mapped_children() {
                let pairs: Vec<(StringId, NodeHandle)> =
                    map.iter().map(|(&k, &v)| (k, v)).collect();
                for (key, value) in pairs {
                    self.write_symbol(key, NodeRef::new(value, false), accum);
                }
            }
            return NodeRef::NULL;
        }

        let sid = self.interpret_node_into_string_id_with_reference(first);
        if !sid.is_string() {
            return NodeRef::NULL;
        }
        let value = self.interpret_node(children[1], false);
        self.write_symbol(sid, value, accum);
        string_pool().destroy_reference(sid);
        NodeRef::NULL
    }

    fn write_symbol(&mut self, sid: StringId, value: NodeRef, accum: bool) {
        let new_value = if accum {
            let existing = self
                .get_call_stack_symbol(sid)
                .map(|(n, _)| n)
                .unwrap_or(NodeHandle::NULL);
            self.accum_values(NodeRef::new(existing, false), value)
        } else {
            value
        };
        self.set_call_stack_symbol(sid, new_value.node);
    }

    /// Accumulation semantics: numbers add, strings concatenate, lists
    /// append, assocs merge; a null base takes the addition's value.
    pub(crate) fn accum_values(&mut self, base: NodeRef, addition: NodeRef) -> NodeRef {
        let enm = self.enm();
        if base.node.is_null_value() {
            return addition;
        }
        match base.node.node_type() {
            NodeType::Number => {
                let sum = base.node.number_value() + compare::to_number(addition.node, f64::NAN);
                NodeRef::new(enm.alloc_number_node(sum), true)
            }
            NodeType::StringLiteral => {
                let mut text = base.node.string_value();
                if let Some(suffix) = compare::to_string(addition.node) {
                    text.push_str(&suffix);
                }
                NodeRef::new(enm.alloc_string_node(&text), true)
            }
            NodeType::Assoc => {
                let mut merged = base;
                enm.ensure_node_is_modifiable(&mut merged, MetadataModifier::NoChange);
                if let Some(map) = addition.node.mapped_children() {
                    let pairs: Vec<(StringId, NodeHandle)> =
                        map.iter().map(|(&k, &v)| (k, v)).collect();
                    for (key, value) in pairs {
                        merged.node.set_mapped_child(key, value);
                    }
                }
                merged.update_properties_based_on_attached_node(addition);
                merged
            }
            _ if base.node.is_ordered_array() => {
                let mut extended = base;
                enm.ensure_node_is_modifiable(&mut extended, MetadataModifier::NoChange);
                extended.node.append_ordered_child(addition.node);
                extended.update_properties_based_on_attached_node(addition);
                extended
            }
            _ => addition,
        }
    }

    pub(crate) fn op_retrieve(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let key = self.interpret_node_for_immediate_use(first);

        if key.node.is_ordered_array() && !key.node.node_type().is_immediate() {
            // list of symbols retrieves a list of values
            let names = key.node.children_copy();
            let result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
            for &name in &names {
                let sid = compare::to_string_id_if_exists(name);
                let value = self
                    .get_call_stack_symbol(sid)
                    .map(|(n, _)| n)
                    .unwrap_or(NodeHandle::NULL);
                result.node.append_ordered_child(value);
            }
            let mut result = result;
            result.unique = false;
            result.unique_top = true;
            return result;
        }

        let sid = compare::to_string_id_if_exists(key.node);
        self.enm().free_node_tree_if_possible(key);
        match self.get_call_stack_symbol(sid) {
            Some((value, _)) => NodeRef::new(value, false),
            None => NodeRef::NULL,
        }
    }

    // --- function calls ---

    pub(crate) fn op_call(&mut self, en: NodeHandle, immediate_result: bool) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let function = self.interpret_node_for_immediate_use(first);
        if function.node.is_null_value() {
            return NodeRef::NULL;
        }
        self.push_opcode_stack(function.node);

        // the scope frame for the call, when arguments were given
        let mut new_context = NodeRef::NULL;
        if let Some(&args) = children.get(1) {
            new_context = self.interpret_node_for_immediate_use(args);
            self.enm()
                .ensure_node_is_modifiable(&mut new_context, MetadataModifier::RemoveAll);
        }
        self.push_new_call_stack_frame(new_context);

        let mut result = self.interpret_node(function.node, immediate_result);

        self.pop_call_stack_frame();

        // calls consume the outer return opcode if there is one
        if result.is_non_null_node() && result.node.node_type() == NodeType::Return {
            result = self.remove_top_conclude_or_return_node(result);
        }
        self.pop_opcode_stack();
        result
    }

    /// `call_sandboxed f args max_steps max_nodes max_depth`: runs the
    /// function under a fresh budget and a disjoint scope stack. The
    /// sandbox's violation, if any, is reported on this interpreter.
    pub(crate) fn op_call_sandboxed(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let function = self.interpret_node_for_immediate_use(first);
        if function.node.is_null_value() {
            return NodeRef::NULL;
        }
        self.push_opcode_stack(function.node);

        let mut args = NodeRef::NULL;
        if let Some(&args_node) = children.get(1) {
            args = self.interpret_node_for_immediate_use(args_node);
        }
        self.push_opcode_stack(args.node);

        let mut sandbox_constraints = InterpreterConstraints {
            max_num_execution_steps: children
                .get(2)
                .map(|&n| self.interpret_node_into_number(n, 0.0).max(0.0) as u64)
                .unwrap_or(0),
            max_num_allocated_nodes: children
                .get(3)
                .map(|&n| self.interpret_node_into_number(n, 0.0).max(0.0) as usize)
                .unwrap_or(0),
            max_opcode_execution_depth: children
                .get(4)
                .map(|&n| self.interpret_node_into_number(n, 0.0).max(0.0) as usize)
                .unwrap_or(0),
            ..InterpreterConstraints::default()
        };
        sandbox_constraints.populate_performance_counters(
            self.constraints.as_ref(),
            self.enm().number_of_used_nodes(),
            self.opcode_stack.num_child_nodes(),
        );

        let mut sandbox = Interpreter::new_with_stream(
            self.entity.clone(),
            Some(sandbox_constraints),
            self.random_stream.create_other_stream_via_rand(),
        );
        sandbox.push_new_call_stack_frame(args);
        let mut result = sandbox.interpret_node(function.node, false);
        if result.is_non_null_node() && result.node.node_type() == NodeType::Return {
            result = sandbox.remove_top_conclude_or_return_node(result);
        }

        // surface the sandbox's violation on the outer interpreter
        if let Some(violation) = sandbox.constraint_violation() {
            self.constraint_violation = Some(violation);
            if let Some(constraints) = self.constraints.as_mut() {
                constraints.constraint_violation = Some(violation);
            }
        }
        drop(sandbox);

        self.pop_opcode_stack();
        self.pop_opcode_stack();
        result
    }

    // --- get / set / replace ---

    /// One step of address traversal; returns None when the step fails.
    pub(crate) fn traverse_step(&self, node: NodeHandle, addr: NodeHandle) -> Option<NodeHandle> {
        if node.is_null() {
            return None;
        }
        if node.is_associative_array() {
            let key = compare::to_string_id_if_exists(addr);
            return node.mapped_child(key);
        }
        if node.is_ordered_array() {
            let children = node.ordered_children();
            let index = compare::to_number(addr, f64::NAN);
            if index.is_nan() {
                return None;
            }
            let index = if index < 0.0 {
                // negative indices address from the end
                let from_end = children.len() as f64 + index;
                if from_end < 0.0 {
                    return None;
                }
                from_end as usize
            } else {
                index as usize
            };
            return children.get(index).copied();
        }
        None
    }

    pub(crate) fn traverse_address(&self, container: NodeHandle, addr: NodeHandle) -> Option<NodeHandle> {
        if addr.is_ordered_array() && !addr.node_type().is_immediate() {
            let mut cursor = container;
            for &step in addr.ordered_children() {
                cursor = self.traverse_step(cursor, step)?;
            }
            Some(cursor)
        } else {
            self.traverse_step(container, addr)
        }
    }

    pub(crate) fn op_get(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let container = self.interpret_node_for_immediate_use(first);
        self.push_opcode_stack(container.node);

        let result = if children.len() <= 2 {
            let addr = children
                .get(1)
                .map(|&a| self.interpret_node_for_immediate_use(a))
                .unwrap_or(NodeRef::NULL);
            match self.traverse_address(container.node, addr.node) {
                Some(found) => NodeRef::new(found, false),
                None => NodeRef::NULL,
            }
        } else {
            // multiple addresses return a list of each lookup
            let list = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
            for &addr_node in &children[1..] {
                let addr = self.interpret_node_for_immediate_use(addr_node);
                let found = self
                    .traverse_address(container.node, addr.node)
                    .unwrap_or(NodeHandle::NULL);
                list.node.append_ordered_child(found);
            }
            let mut list = list;
            list.unique = false;
            list.unique_top = true;
            list
        };
        self.pop_opcode_stack();
        result
    }

    /// Traverses for writing, creating missing assoc keys and extending
    /// lists; returns the parent container and final step address.
    pub(crate) fn traverse_for_write(
        &mut self,
        container: NodeHandle,
        addr: NodeHandle,
    ) -> Option<(NodeHandle, NodeHandle)> {
        let steps: Vec<NodeHandle> =
            if addr.is_ordered_array() && !addr.node_type().is_immediate() {
                addr.ordered_children().to_vec()
            } else {
                vec![addr]
            };
        if steps.is_empty() {
            return None;
        }

        let mut cursor = container;
        for &step in &steps[..steps.len() - 1] {
            cursor = match self.traverse_step(cursor, step) {
                Some(next) if !next.is_null() => next,
                _ => {
                    // create an intermediate assoc at the missing key
                    let created = self.enm().alloc_node(NodeType::Assoc);
                    if !self.write_at_step(cursor, step, created) {
                        return None;
                    }
                    created
                }
            };
        }
        Some((cursor, steps[steps.len() - 1]))
    }

    pub(crate) fn write_at_step(&mut self, node: NodeHandle, addr: NodeHandle, value: NodeHandle) -> bool {
        if node.is_associative_array() {
            let key = compare::to_string_id_with_reference(addr);
            if !key.is_string() {
                return false;
            }
            node.set_mapped_child(key, value);
            string_pool().destroy_reference(key);
            return true;
        }
        if node.is_ordered_array() {
            let index = compare::to_number(addr, f64::NAN);
            if index.is_nan() {
                return false;
            }
            let Some(children) = node.ordered_children_mut() else {
                return false;
            };
            let index = if index < 0.0 {
                let from_end = children.len() as f64 + index;
                if from_end < 0.0 {
                    return false;
                }
                from_end as usize
            } else {
                index as usize
            };
            // writing past the end extends the list
            while children.len() <= index {
                children.push(NodeHandle::NULL);
            }
            children[index] = value;
            return true;
        }
        false
    }

    pub(crate) fn op_set_and_replace(&mut self, en: NodeHandle) -> NodeRef {
        let replace = en.node_type() == NodeType::Replace;
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let mut container = self.interpret_node_for_immediate_use(first);
        if container.is_null() {
            return NodeRef::NULL;
        }
        // copy-on-write: the result must be independent of shared inputs
        if !container.unique {
            container = self
                .enm()
                .deep_alloc_copy(container.node, MetadataModifier::NoChange);
        }
        self.push_opcode_stack(container.node);

        let mut i = 1;
        while i + 1 < children.len() {
            let addr = self.interpret_node_for_immediate_use(children[i]);
            let new_value = if replace {
                let Some(&function) = children.get(i + 1) else {
                    break;
                };
                let old = self
                    .traverse_address(container.node, addr.node)
                    .unwrap_or(NodeHandle::NULL);
                self.push_construction_context(en, container.node, old, NodeRef::NULL);
                let replaced = self.interpret_node(function, false);
                self.pop_construction_context();
                replaced
            } else {
                match children.get(i + 1) {
                    Some(&value) => self.interpret_node(value, false),
                    None => break,
                }
            };

            if let Some((parent, step)) = self.traverse_for_write(container.node, addr.node) {
                self.write_at_step(parent, step, new_value.node);
                container.update_properties_based_on_attached_node(new_value);
            }
            i += 2;
        }

        self.note_side_effect();
        self.pop_opcode_stack();
        crate::node::flags::update_flags_for_node_tree(container.node);
        container
    }

    // --- reflection ---

    pub(crate) fn op_construction_reflection(&mut self, en: NodeHandle, offset: usize) -> NodeRef {
        let depth = en
            .ordered_children()
            .first()
            .map(|&d| self.interpret_node_into_number(d, 0.0).max(0.0) as usize)
            .unwrap_or(0);
        match self.get_construction_slot(depth, offset) {
            Some(node) => NodeRef::new(node, false),
            None => NodeRef::NULL,
        }
    }

    pub(crate) fn op_current_index(&mut self, en: NodeHandle) -> NodeRef {
        let depth = en
            .ordered_children()
            .first()
            .map(|&d| self.interpret_node_into_number(d, 0.0).max(0.0) as usize)
            .unwrap_or(0);
        match self.get_construction_sidecar(depth).map(|s| s.current_index) {
            Some(IndexValue::Number(value)) => self.alloc_number(value),
            Some(IndexValue::StringVal(sid)) => {
                let node = self
                    .enm()
                    .alloc_string_node_with_handoff(string_pool().create_reference_by_id(sid));
                NodeRef::new(node, true)
            }
            _ => NodeRef::NULL,
        }
    }

    pub(crate) fn op_opcode_stack(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if let Some(&depth_node) = children.first() {
            let depth = self.interpret_node_into_number(depth_node, 0.0);
            if !depth.is_nan() {
                let stack = self.opcode_stack.ordered_children();
                let index = stack.len() as f64 - 1.0 - depth.max(0.0);
                if index < 0.0 {
                    return NodeRef::NULL;
                }
                return NodeRef::new(stack[index as usize], false);
            }
        }
        self.enm()
            .deep_alloc_copy(self.opcode_stack, MetadataModifier::NoChange)
    }

    pub(crate) fn op_stack(&mut self, _en: NodeHandle) -> NodeRef {
        self.enm()
            .deep_alloc_copy(self.call_stack, MetadataModifier::NoChange)
    }

    pub(crate) fn op_args(&mut self, en: NodeHandle) -> NodeRef {
        let depth = en
            .ordered_children()
            .first()
            .map(|&d| self.interpret_node_into_number(d, 0.0).max(0.0) as usize)
            .unwrap_or(0);
        let frames = self.call_stack.ordered_children();
        if depth >= frames.len() {
            return NodeRef::NULL;
        }
        NodeRef::new(frames[frames.len() - 1 - depth], false)
    }

    // --- randomness, time, environment ---

    pub(crate) fn op_rand(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            let value = self.random_stream.rand_full();
            return self.alloc_number(value);
        };
        let param = self.interpret_node_for_immediate_use(first);

        let count = children
            .get(1)
            .map(|&n| self.interpret_node_into_number(n, 1.0).max(0.0) as usize);

        let mut draw = |interp: &mut Interpreter| -> NodeRef {
            if param.node.is_ordered_array() && !param.node.node_type().is_immediate() {
                let options = param.node.ordered_children();
                if options.is_empty() {
                    return NodeRef::NULL;
                }
                let pick = interp.random_stream.rand_size(options.len());
                NodeRef::new(options[pick], false)
            } else {
                let range = compare::to_number(param.node, 1.0);
                let value = interp.random_stream.rand_full() * range;
                interp.alloc_number(value)
            }
        };

        match count {
            None => draw(self),
            Some(count) => {
                let list = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
                let mut list = list;
                for _ in 0..count {
                    let value = draw(self);
                    list.node.append_ordered_child(value.node);
                    list.update_properties_based_on_attached_node(value);
                }
                list
            }
        }
    }

    pub(crate) fn op_get_rand_seed(&mut self, _en: NodeHandle) -> NodeRef {
        let state = self.random_stream.state_string();
        self.alloc_string(&state)
    }

    pub(crate) fn op_set_rand_seed(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let seed = self.interpret_node_for_immediate_use(first);
        let text = compare::to_string(seed.node).unwrap_or_default();
        self.random_stream.set_state(&text);
        seed
    }

    pub(crate) fn op_system_time(&mut self, _en: NodeHandle) -> NodeRef {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(f64::NAN);
        self.alloc_number(now)
    }

    pub(crate) fn op_get_defaults(&mut self, _en: NodeHandle) -> NodeRef {
        let pool = string_pool();
        let assoc = self.enm().alloc_node(NodeType::Assoc);
        let key = pool.create_reference("max_num_threads");
        assoc.set_mapped_child(
            key,
            self.enm()
                .alloc_number_node(crate::concurrency::max_num_threads() as f64),
        );
        pool.destroy_reference(key);
        NodeRef::new(assoc, true)
    }

    // --- code as data ---

    pub(crate) fn op_parse(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let text = self.interpret_node_for_immediate_use(first);
        let Some(src) = compare::to_string(text.node) else {
            return NodeRef::NULL;
        };
        self.enm().free_node_tree_if_possible(text);

        let (parsed, warnings) = crate::code::parse_to_node(&src, self.enm());

        // an optional truthy second argument also returns the warnings
        let want_warnings = children
            .get(1)
            .map(|&n| self.interpret_node_into_bool(n))
            .unwrap_or(false);
        if !want_warnings {
            return parsed;
        }
        let warning_nodes: Vec<NodeHandle> = warnings
            .iter()
            .map(|w| self.enm().alloc_string_node(w))
            .collect();
        let warning_list = self.enm().alloc_list_node(&warning_nodes);
        NodeRef::new(self.enm().alloc_list_node(&[parsed.node, warning_list]), true)
    }

    pub(crate) fn op_unparse(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let code = self.interpret_node_for_immediate_use(first);
        let text = crate::code::unparse_node(code.node);
        self.enm().free_node_tree_if_possible(code);
        self.alloc_string(&text)
    }

    pub(crate) fn op_print(&mut self, en: NodeHandle) -> NodeRef {
        if !self.has_permission(Permissions::STD_OUT_AND_STD_ERR) {
            return NodeRef::NULL;
        }
        let children = en.children_copy();
        let mut output = String::new();
        for &child in &children {
            let value = self.interpret_node_for_immediate_use(child);
            match compare::to_string(value.node) {
                Some(text) => output.push_str(&text),
                None => output.push_str(&crate::code::unparse_node(value.node)),
            }
            self.enm().free_node_tree_if_possible(value);
        }
        match &self.print_listener {
            Some(listener) => listener.log_print(&output),
            None => print!("{output}"),
        }
        NodeRef::NULL
    }

    // --- the system opcode ---

    pub(crate) fn op_system(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let Some(&first) = children.first() else {
            return NodeRef::NULL;
        };
        let command = self.interpret_node_for_immediate_use(first);
        let Some(command) = compare::to_string(command.node) else {
            return NodeRef::NULL;
        };

        match command.as_str() {
            "exit" => {
                if !self.has_permission(Permissions::SYSTEM) {
                    return NodeRef::NULL;
                }
                let code = children
                    .get(1)
                    .map(|&n| self.interpret_node_into_number(n, 0.0) as i32)
                    .unwrap_or(0);
                std::process::exit(code);
            }
            "readline" => {
                if !self.has_permission(Permissions::STD_IN) {
                    return NodeRef::NULL;
                }
                let mut line = String::new();
                match std::io::stdin().read_line(&mut line) {
                    Ok(_) => self.alloc_string(line.trim_end_matches('\n')),
                    Err(_) => NodeRef::NULL,
                }
            }
            "printline" => {
                if !self.has_permission(Permissions::STD_OUT_AND_STD_ERR) {
                    return NodeRef::NULL;
                }
                let text = children
                    .get(1)
                    .and_then(|&n| {
                        let v = self.interpret_node_for_immediate_use(n);
                        compare::to_string(v.node)
                    })
                    .unwrap_or_default();
                match &self.print_listener {
                    Some(listener) => listener.log_print(&format!("{text}\n")),
                    None => println!("{text}"),
                }
                NodeRef::NULL
            }
            "cwd" => {
                if !self.has_permission(Permissions::ENVIRONMENT) {
                    return NodeRef::NULL;
                }
                match std::env::current_dir() {
                    Ok(dir) => self.alloc_string(&dir.to_string_lossy()),
                    Err(_) => NodeRef::NULL,
                }
            }
            "system" => {
                if !self.has_permission(Permissions::SYSTEM) {
                    return NodeRef::NULL;
                }
                let Some(&cmd_node) = children.get(1) else {
                    return NodeRef::NULL;
                };
                let cmd = self.interpret_node_for_immediate_use(cmd_node);
                let Some(cmd) = compare::to_string(cmd.node) else {
                    return NodeRef::NULL;
                };
                for listener in &self.write_listeners {
                    listener.log_system_call(&cmd);
                }
                let output = if cfg!(windows) {
                    std::process::Command::new("cmd").args(["/C", &cmd]).output()
                } else {
                    std::process::Command::new("sh").args(["-c", &cmd]).output()
                };
                match output {
                    Ok(output) => {
                        let exit_code = output.status.code().unwrap_or(-1) as f64;
                        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                        let result = self.enm().alloc_list_node(&[
                            self.enm().alloc_number_node(exit_code),
                            self.enm().alloc_string_node(&stdout),
                        ]);
                        NodeRef::new(result, true)
                    }
                    Err(_) => NodeRef::NULL,
                }
            }
            "os" => {
                if !self.has_permission(Permissions::ENVIRONMENT) {
                    return NodeRef::NULL;
                }
                self.alloc_string(std::env::consts::OS)
            }
            "sleep" => {
                let seconds = children
                    .get(1)
                    .map(|&n| self.interpret_node_into_number(n, 0.0))
                    .unwrap_or(0.0);
                if seconds > 0.0 && seconds.is_finite() {
                    std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
                }
                NodeRef::NULL
            }
            "version" => self.alloc_string(env!("CARGO_PKG_VERSION")),
            "version_compatible" => {
                let requested = children
                    .get(1)
                    .and_then(|&n| {
                        let v = self.interpret_node_for_immediate_use(n);
                        compare::to_string(v.node)
                    })
                    .unwrap_or_default();
                let current_major = env!("CARGO_PKG_VERSION").split('.').next().unwrap_or("0");
                let requested_major = requested.split('.').next().unwrap_or("");
                self.alloc_bool(current_major == requested_major)
            }
            "est_mem_reserved" => {
                let nodes = self.enm().number_of_used_nodes() + self.enm().number_of_unused_nodes();
                self.alloc_number((nodes * std::mem::size_of::<crate::node::Node>()) as f64)
            }
            "est_mem_used" => {
                let nodes = self.entity.deep_used_node_count();
                self.alloc_number((nodes * std::mem::size_of::<crate::node::Node>()) as f64)
            }
            "mem_diagnostics" => {
                let text = format!(
                    "nodes in use: {}\nnodes reserved: {}\nnodes referenced: {}\ndynamic strings: {}\n",
                    self.enm().number_of_used_nodes(),
                    self.enm().number_of_unused_nodes(),
                    self.enm().num_nodes_referenced(),
                    string_pool().num_dynamic_strings(),
                );
                self.alloc_string(&text)
            }
            "validate" => {
                let valid = crate::node::manager::validate_node_tree(self.entity.root_node());
                self.alloc_bool(valid)
            }
            "rand" => {
                let num_bytes = children
                    .get(1)
                    .map(|&n| self.interpret_node_into_number(n, 0.0).max(0.0) as usize)
                    .unwrap_or(0);
                let mut bytes = vec![0u8; num_bytes];
                use rand::RngCore;
                self.random_stream.fill_bytes(&mut bytes);
                let text: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                self.alloc_string(&text)
            }
            // cryptographic primitives are an external collaborator this
            // build does not carry
            "sign_key_pair" | "encrypt_key_pair" => NodeRef::NULL,
            "debugging_info" => {
                let result = self.enm().alloc_list_node(&[
                    self.enm().alloc_bool_node(false),
                    self.enm().alloc_bool_node(false),
                ]);
                NodeRef::new(result, true)
            }
            "get_max_num_threads" => self.alloc_number(crate::concurrency::max_num_threads() as f64),
            "set_max_num_threads" => {
                if !self.has_permission(Permissions::ALTER_PERFORMANCE) {
                    return NodeRef::NULL;
                }
                let n = children
                    .get(1)
                    .map(|&node| self.interpret_node_into_number(node, 0.0) as i32)
                    .unwrap_or(0);
                crate::concurrency::set_max_num_threads(n);
                self.alloc_number(crate::concurrency::max_num_threads() as f64)
            }
            "built_in_data" => self.alloc_string(concat!("amalgam ", env!("CARGO_PKG_VERSION"))),
            _ => {
                log::debug!("unrecognized system command `{command}`");
                NodeRef::NULL
            }
        }
    }

    /// Propagates a sandbox-style violation out of helpers that create
    /// child interpreters.
    pub(crate) fn absorb_constraint_violation(&mut self, violation: Option<ConstraintViolation>) {
        if let Some(violation) = violation {
            self.constraint_violation = Some(violation);
        }
    }
}
