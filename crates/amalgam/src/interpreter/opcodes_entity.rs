//! Entity control opcodes, query dispatch, and asset persistence.

use super::Interpreter;
use crate::asset::{asset_manager, AssetParameters};
use crate::entity::query::{self, QueryCondition};
use crate::entity::Entity;
use crate::node::manager::MetadataModifier;
use crate::node::{compare, NodeHandle, NodeRef, NodeType};
use crate::permissions::Permissions;
use crate::string_pool::{string_pool, StringId};
use std::sync::Arc;

impl Interpreter {
    /// Evaluates an entity-id argument to the target entity: null means
    /// the current entity, a string a direct child, a list a path of ids.
    pub(crate) fn interpret_node_into_entity(&mut self, en: NodeHandle) -> Option<Arc<Entity>> {
        if en.is_null() {
            return Some(self.entity.clone());
        }
        let id_value = self.interpret_node_for_immediate_use(en);
        let result = self.entity_from_id_node(id_value.node);
        self.enm().free_node_tree_if_possible(id_value);
        result
    }

    fn entity_from_id_node(&self, id_node: NodeHandle) -> Option<Arc<Entity>> {
        if id_node.is_null_value() {
            return Some(self.entity.clone());
        }
        if id_node.is_ordered_array() && !id_node.node_type().is_immediate() {
            let path: Vec<StringId> = id_node
                .ordered_children()
                .iter()
                .map(|&segment| compare::to_string_id_if_exists(segment))
                .collect();
            return self.entity.get_deeply_contained_entity(&path);
        }
        let id = compare::to_string_id_if_exists(id_node);
        self.entity.get_contained_entity(id)
    }

    /// Checks entity-creation constraints: contained count, depth, and id
    /// length budgets.
    fn can_create_entity(&mut self, id: &str) -> bool {
        let Some(constraints) = self.constraints.as_ref() else {
            return true;
        };
        if constraints.max_entity_id_length > 0 && id.len() > constraints.max_entity_id_length {
            self.constraint_violation =
                Some(super::ConstraintViolation::ContainedEntitiesDepth);
            return false;
        }
        if constraints.max_num_contained_entities > 0
            && self.entity.num_contained_entities() >= constraints.max_num_contained_entities
        {
            self.constraint_violation =
                Some(super::ConstraintViolation::ContainedEntitiesDepth);
            return false;
        }
        if constraints.max_contained_entity_depth > 0 {
            let mut depth = 1;
            let mut cursor = self.entity.container();
            while let Some(container) = cursor {
                depth += 1;
                cursor = container.container();
            }
            if depth >= constraints.max_contained_entity_depth {
                self.constraint_violation =
                    Some(super::ConstraintViolation::ContainedEntitiesDepth);
                return false;
            }
        }
        true
    }

    /// `create_entities [id] code ...`: creates entities, returning the
    /// list of created ids (null entries for failures). The code argument
    /// is evaluated, then executed in the new entity's context; the
    /// execution result becomes the entity's root.
    pub(crate) fn op_create_entities(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let ids_list = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        self.push_opcode_stack(ids_list.node);

        let mut i = 0;
        while i < children.len() {
            // code is the last parameter of each pair
            let (id_node, code_node) = if i + 1 < children.len() {
                (Some(children[i]), children[i + 1])
            } else {
                (None, children[i])
            };

            let code = self.interpret_node_for_immediate_use(code_node);
            self.push_opcode_stack(code.node);

            let id_string = match id_node {
                Some(id_node) => {
                    let id_value = self.interpret_node_for_immediate_use(id_node);
                    let id = compare::to_string(id_value.node).unwrap_or_default();
                    self.enm().free_node_tree_if_possible(id_value);
                    id
                }
                None => String::new(),
            };

            if !self.can_create_entity(&id_string) {
                ids_list.node.append_ordered_child(NodeHandle::NULL);
                self.pop_opcode_stack();
                i += 2;
                continue;
            }

            let rand_state = self
                .entity
                .with_random_stream(|rs| rs.create_other_stream_state_via_string(&id_string));
            let new_entity = Entity::new(&rand_state);
            // a new entity cannot hold more permissions than its creator
            new_entity.set_permissions(self.entity.permissions());

            if !code.node.is_null_value() {
                let (result, violation) = new_entity.execute(code.node, self.constraints.clone());
                self.absorb_constraint_violation(violation);
                new_entity.set_root_copy(result.node(), MetadataModifier::NoChange);
            }

            let new_id = self.entity.add_contained_entity_str(
                new_entity,
                &id_string,
                &self.write_listeners,
            );
            if new_id.is_string() {
                let id_node = self
                    .enm()
                    .alloc_string_node_with_handoff(string_pool().create_reference_by_id(new_id));
                ids_list.node.append_ordered_child(id_node);
            } else {
                ids_list.node.append_ordered_child(NodeHandle::NULL);
            }
            self.pop_opcode_stack();
            i += 2;
        }

        self.pop_opcode_stack();
        ids_list
    }

    /// `clone_entities source [dest] ...`: deep-copies entities; returns
    /// the new ids.
    pub(crate) fn op_clone_entities(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let ids_list = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        self.push_opcode_stack(ids_list.node);

        let mut i = 0;
        while i < children.len() {
            let source = self.interpret_node_into_entity(children[i]);
            let dest_id = children
                .get(i + 1)
                .and_then(|&id_node| {
                    let value = self.interpret_node_for_immediate_use(id_node);
                    let id = compare::to_string(value.node);
                    self.enm().free_node_tree_if_possible(value);
                    id
                })
                .unwrap_or_default();

            match source {
                Some(source) if self.can_create_entity(&dest_id) => {
                    let clone = source.clone_entity();
                    let new_id = self.entity.add_contained_entity_str(
                        clone,
                        &dest_id,
                        &self.write_listeners,
                    );
                    if new_id.is_string() {
                        let id_node = self.enm().alloc_string_node_with_handoff(
                            string_pool().create_reference_by_id(new_id),
                        );
                        ids_list.node.append_ordered_child(id_node);
                    } else {
                        ids_list.node.append_ordered_child(NodeHandle::NULL);
                    }
                }
                _ => ids_list.node.append_ordered_child(NodeHandle::NULL),
            }
            i += 2;
        }
        self.pop_opcode_stack();
        ids_list
    }

    /// `move_entities source dest ...`: transfers ownership without
    /// cloning.
    pub(crate) fn op_move_entities(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let ids_list = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
        self.push_opcode_stack(ids_list.node);

        let mut i = 0;
        while i < children.len() {
            let source_id = {
                let value = self.interpret_node_for_immediate_use(children[i]);
                let id = compare::to_string_id_if_exists(value.node);
                self.enm().free_node_tree_if_possible(value);
                id
            };
            let dest_id = children
                .get(i + 1)
                .and_then(|&id_node| {
                    let value = self.interpret_node_for_immediate_use(id_node);
                    let id = compare::to_string(value.node);
                    self.enm().free_node_tree_if_possible(value);
                    id
                })
                .unwrap_or_default();

            let moved = self
                .entity
                .remove_contained_entity(source_id, &[])
                .map(|removed| {
                    self.entity
                        .add_contained_entity_str(removed, &dest_id, &self.write_listeners)
                });
            match moved {
                Some(new_id) if new_id.is_string() => {
                    let id_node = self
                        .enm()
                        .alloc_string_node_with_handoff(string_pool().create_reference_by_id(new_id));
                    ids_list.node.append_ordered_child(id_node);
                }
                _ => ids_list.node.append_ordered_child(NodeHandle::NULL),
            }
            i += 2;
        }
        self.pop_opcode_stack();
        ids_list
    }

    pub(crate) fn op_destroy_entities(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let mut all_destroyed = true;
        for &child in &children {
            let value = self.interpret_node_for_immediate_use(child);
            let id = compare::to_string_id_if_exists(value.node);
            self.enm().free_node_tree_if_possible(value);
            if self
                .entity
                .remove_contained_entity(id, &self.write_listeners)
                .is_none()
            {
                all_destroyed = false;
            }
        }
        self.alloc_bool(all_destroyed)
    }

    /// `contained_entities` / `compute_on_contained_entities`: evaluates
    /// children into query conditions and runs them against the current
    /// entity's children. With no conditions, returns all contained ids.
    pub(crate) fn op_contained_entities(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let mut conditions: Vec<QueryCondition> = Vec::new();
        let mut container = self.entity.clone();

        for &child in &children {
            let value = self.interpret_node_for_immediate_use(child);
            self.push_opcode_stack(value.node);
            if value.node.node_type().is_query() {
                if let Some(condition) = QueryCondition::from_node(value.node) {
                    conditions.push(condition);
                }
            } else if !value.node.is_null_value() {
                // a non-query argument selects the container entity
                if let Some(entity) = self.entity_from_id_node(value.node) {
                    container = entity;
                }
            }
        }

        let result = query::execute_query(&container, &conditions, self.enm());
        for _ in &children {
            self.pop_opcode_stack();
        }
        result
    }

    /// Evaluated query opcodes become data nodes consumed by
    /// `contained_entities`; children are evaluated into a fresh node of
    /// the same query type.
    pub(crate) fn op_query(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let mut result = NodeRef::new(self.enm().alloc_node(en.node_type()), true);
        self.push_opcode_stack(result.node);
        for &child in &children {
            let value = self.interpret_node(child, false);
            result.node.append_ordered_child(value.node);
            result.update_properties_based_on_attached_node(value);
        }
        self.pop_opcode_stack();
        result
    }

    /// `retrieve_from_entity id label`: reads a labeled value out of a
    /// contained entity, deep-copied into this interpreter's manager.
    pub(crate) fn op_retrieve_from_entity(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let Some(target) = self.interpret_node_into_entity(children[0]) else {
            return NodeRef::NULL;
        };
        let on_self = Arc::ptr_eq(&target, &self.entity);

        let label_value = self.interpret_node_for_immediate_use(children[1]);

        // a list of labels retrieves a list of values
        if label_value.node.is_ordered_array() && !label_value.node.node_type().is_immediate() {
            let labels = label_value.node.children_copy();
            let result = NodeRef::new(self.enm().alloc_node(NodeType::List), true);
            self.push_opcode_stack(result.node);
            for &label_node in &labels {
                let sid = compare::to_string_id_if_exists(label_node);
                let value = self.retrieve_entity_value(&target, sid, on_self);
                result.node.append_ordered_child(value.node);
            }
            self.pop_opcode_stack();
            return result;
        }

        let sid = compare::to_string_id_if_exists(label_value.node);
        self.enm().free_node_tree_if_possible(label_value);
        self.retrieve_entity_value(&target, sid, on_self)
    }

    fn retrieve_entity_value(
        &mut self,
        target: &Arc<Entity>,
        label: StringId,
        on_self: bool,
    ) -> NodeRef {
        target.value_at_label(label, Some(self.enm()), false, on_self)
    }

    /// `assign_to_entities id assoc` / `accum_to_entities id assoc`:
    /// writes label values into an entity.
    pub(crate) fn op_assign_to_entities(&mut self, en: NodeHandle) -> NodeRef {
        let accum = en.node_type() == NodeType::AccumToEntities;
        let children = en.children_copy();
        if children.is_empty() {
            return NodeRef::NULL;
        }

        // with a single argument, the target is the current entity
        let (target, assignments_node) = if children.len() == 1 {
            (Some(self.entity.clone()), children[0])
        } else {
            (self.interpret_node_into_entity(children[0]), children[1])
        };
        let Some(target) = target else {
            return self.alloc_bool(false);
        };
        let on_self = Arc::ptr_eq(&target, &self.entity);

        let assignments = self.interpret_node_for_immediate_use(assignments_node);
        let Some(map) = assignments.node.mapped_children() else {
            return self.alloc_bool(false);
        };
        let pairs: Vec<(StringId, NodeHandle)> = map.iter().map(|(&k, &v)| (k, v)).collect();

        let mut all_written = true;
        for (label, new_value) in pairs {
            let value_to_write = if accum {
                let existing = target.value_at_label(label, Some(self.enm()), false, on_self);
                let combined =
                    self.accum_values(existing, NodeRef::new(new_value, false));
                combined.node
            } else {
                new_value
            };
            let wrote = target.set_value_at_label(
                label,
                value_to_write,
                false,
                on_self,
                &self.write_listeners,
            );
            all_written &= wrote;
        }
        if all_written {
            self.note_side_effect();
        }
        self.alloc_bool(all_written)
    }

    /// `call_entity id label args`: evaluates the code at another
    /// entity's label in that entity's context; the result is copied back.
    pub(crate) fn op_call_entity(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let Some(target) = self.interpret_node_into_entity(children[0]) else {
            return NodeRef::NULL;
        };
        let label = {
            let value = self.interpret_node_for_immediate_use(children[1]);
            let sid = compare::to_string_id_if_exists(value.node);
            self.enm().free_node_tree_if_possible(value);
            sid
        };

        let code = target.value_at_label(label, None, true, false);
        if code.is_null() {
            return NodeRef::NULL;
        }

        let mut callee = Interpreter::new(target.clone(), self.constraints.clone());
        callee.write_listeners = self.write_listeners.clone();
        if let Some(&args_node) = children.get(2) {
            let args = self.interpret_node_for_immediate_use(args_node);
            let args_copy = target
                .node_manager()
                .deep_alloc_copy(args.node, MetadataModifier::RemoveAll);
            callee.push_new_call_stack_frame(args_copy);
        }
        let result = callee.evaluate(code.node);
        let violation = callee.constraint_violation();

        // copy the result home before the callee's stacks unpin it
        let copied = self
            .enm()
            .deep_alloc_copy(result.node, MetadataModifier::RemoveAll);
        drop(callee);
        self.absorb_constraint_violation(violation);
        copied
    }

    pub(crate) fn op_retrieve_entity_root(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let target = match children.first() {
            Some(&id_node) => self.interpret_node_into_entity(id_node),
            None => Some(self.entity.clone()),
        };
        match target {
            Some(target) => self
                .enm()
                .deep_alloc_copy(target.root_node(), MetadataModifier::NoChange),
            None => NodeRef::NULL,
        }
    }

    /// `assign_entity_roots id code` / `accum_entity_roots id code`.
    pub(crate) fn op_assign_entity_roots(&mut self, en: NodeHandle) -> NodeRef {
        let accum = en.node_type() == NodeType::AccumEntityRoots;
        let children = en.children_copy();
        if children.is_empty() {
            return self.alloc_bool(false);
        }
        let (target, code_node) = if children.len() == 1 {
            (Some(self.entity.clone()), children[0])
        } else {
            (self.interpret_node_into_entity(children[0]), children[1])
        };
        let Some(target) = target else {
            return self.alloc_bool(false);
        };

        let code = self.interpret_node_for_immediate_use(code_node);
        if accum {
            let root = target.root_node();
            if root.is_ordered_array() {
                let root_copy = self.enm().deep_alloc_copy(root, MetadataModifier::NoChange);
                let combined = self.accum_values(root_copy, code);
                target.set_root_copy(combined.node, MetadataModifier::NoChange);
            } else {
                target.set_root_copy(code.node, MetadataModifier::NoChange);
            }
        } else {
            target.set_root_copy(code.node, MetadataModifier::NoChange);
        }

        if !self.write_listeners.is_empty() {
            let path = target.path_string();
            let serialized = crate::code::unparse_node(target.root_node());
            for listener in &self.write_listeners {
                listener.log_write_to_entity(&path, &serialized);
            }
        }
        self.note_side_effect();
        self.alloc_bool(true)
    }

    pub(crate) fn op_get_entity_comments(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let target = match children.first() {
            Some(&id_node) => self.interpret_node_into_entity(id_node),
            None => Some(self.entity.clone()),
        };
        let Some(target) = target else {
            return NodeRef::NULL;
        };
        let comment = target.root_node().comment_string_id();
        if !comment.is_string() {
            return NodeRef::NULL;
        }
        let node = self
            .enm()
            .alloc_string_node_with_handoff(string_pool().create_reference_by_id(comment));
        NodeRef::new(node, true)
    }

    pub(crate) fn op_get_entity_rand_seed(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let target = match children.first() {
            Some(&id_node) => self.interpret_node_into_entity(id_node),
            None => Some(self.entity.clone()),
        };
        match target {
            Some(target) => self.alloc_string(&target.random_state_string()),
            None => NodeRef::NULL,
        }
    }

    /// `set_entity_rand_seed id seed [deep]`.
    pub(crate) fn op_set_entity_rand_seed(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let Some(target) = self.interpret_node_into_entity(children[0]) else {
            return NodeRef::NULL;
        };
        let seed = {
            let value = self.interpret_node_for_immediate_use(children[1]);
            let text = compare::to_string(value.node).unwrap_or_default();
            self.enm().free_node_tree_if_possible(value);
            text
        };
        let deep = children
            .get(2)
            .map(|&n| self.interpret_node_into_bool(n))
            .unwrap_or(false);
        target.set_random_state(&seed, deep);
        for listener in &self.write_listeners {
            listener.log_set_random_seed(&target.path_string(), &seed);
        }
        self.alloc_string(&seed)
    }

    pub(crate) fn op_get_entity_permissions(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        let target = match children.first() {
            Some(&id_node) => self.interpret_node_into_entity(id_node),
            None => Some(self.entity.clone()),
        };
        let Some(target) = target else {
            return NodeRef::NULL;
        };
        let permissions = target.permissions();
        let assoc = self.enm().alloc_node(NodeType::Assoc);
        let pool = string_pool();
        for (name, granted) in permissions.named_bits() {
            let key = pool.create_reference(name);
            assoc.set_mapped_child(key, self.enm().alloc_bool_node(granted));
            pool.destroy_reference(key);
        }
        NodeRef::new(assoc, true)
    }

    /// `set_entity_permissions id permissions`: an entity can only grant
    /// permissions it holds itself.
    pub(crate) fn op_set_entity_permissions(&mut self, en: NodeHandle) -> NodeRef {
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let own = self.entity.permissions();
        let Some(target) = self.interpret_node_into_entity(children[0]) else {
            return NodeRef::NULL;
        };
        let request = self.interpret_node_for_immediate_use(children[1]);

        let mut requested = Permissions::empty();
        if compare::is_true(request.node) && !request.node.is_associative_array() {
            requested = Permissions::all();
        } else if let Some(map) = request.node.mapped_children() {
            let pool = string_pool();
            for (&key, &value) in map {
                if let Some(bit) = Permissions::from_permission_name(&pool.string(key)) {
                    if compare::is_true(value) {
                        requested |= bit;
                    }
                }
            }
        }
        // grant only what the granter holds
        let granted = requested & own;
        target.set_permissions(granted);
        self.alloc_bool(granted == requested)
    }

    // --- persistence ---

    fn interpret_asset_parameters(
        &mut self,
        path_node: Option<&NodeHandle>,
        params_node: Option<&NodeHandle>,
    ) -> Option<AssetParameters> {
        let path = {
            let value = self.interpret_node_for_immediate_use(*path_node?);
            let path = compare::to_string(value.node)?;
            self.enm().free_node_tree_if_possible(value);
            path
        };
        let mut params = AssetParameters::new(&path);
        if let Some(&params_node) = params_node {
            let value = self.interpret_node_for_immediate_use(params_node);
            if let Some(map) = value.node.mapped_children() {
                let pool = string_pool();
                for (&key, &entry) in map {
                    if let Some(text) = compare::to_string(entry) {
                        let key_string = pool.string(key);
                        if key_string == "file_type" {
                            params.file_type = text;
                        } else {
                            params.params.insert(key_string, text);
                        }
                    }
                }
            }
            self.enm().free_node_tree_if_possible(value);
        }
        Some(params)
    }

    pub(crate) fn op_load(&mut self, en: NodeHandle) -> NodeRef {
        if !self.has_permission(Permissions::LOAD) {
            return NodeRef::NULL;
        }
        let children = en.children_copy();
        let Some(params) = self.interpret_asset_parameters(children.first(), children.get(1))
        else {
            return NodeRef::NULL;
        };
        match asset_manager().load(&params, self.enm()) {
            Ok((node, warnings)) => {
                for warning in warnings {
                    log::warn!("load {}: {warning}", params.resource_path);
                }
                node
            }
            Err(error) => {
                log::warn!("load failed: {error:#}");
                NodeRef::NULL
            }
        }
    }

    pub(crate) fn op_store(&mut self, en: NodeHandle) -> NodeRef {
        if !self.has_permission(Permissions::STORE) {
            return NodeRef::NULL;
        }
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let Some(params) = self.interpret_asset_parameters(children.first(), children.get(2))
        else {
            return NodeRef::NULL;
        };
        let value = self.interpret_node_for_immediate_use(children[1]);
        let stored = asset_manager().store(&params, value.node);
        self.enm().free_node_tree_if_possible(value);
        match stored {
            Ok(()) => self.alloc_bool(true),
            Err(error) => {
                log::warn!("store failed: {error:#}");
                NodeRef::NULL
            }
        }
    }

    pub(crate) fn op_load_entity(&mut self, en: NodeHandle) -> NodeRef {
        if !self.has_permission(Permissions::LOAD) {
            return NodeRef::NULL;
        }
        let children = en.children_copy();
        let Some(params) = self.interpret_asset_parameters(children.first(), children.get(2))
        else {
            return NodeRef::NULL;
        };
        let id_string = children
            .get(1)
            .and_then(|&id_node| {
                let value = self.interpret_node_for_immediate_use(id_node);
                let id = compare::to_string(value.node);
                self.enm().free_node_tree_if_possible(value);
                id
            })
            .unwrap_or_default();

        match asset_manager().load_entity(&params) {
            Ok(entity) => {
                let new_id =
                    self.entity
                        .add_contained_entity_str(entity, &id_string, &self.write_listeners);
                if !new_id.is_string() {
                    return NodeRef::NULL;
                }
                let node = self
                    .enm()
                    .alloc_string_node_with_handoff(string_pool().create_reference_by_id(new_id));
                NodeRef::new(node, true)
            }
            Err(error) => {
                log::warn!("load_entity failed: {error:#}");
                NodeRef::NULL
            }
        }
    }

    pub(crate) fn op_store_entity(&mut self, en: NodeHandle) -> NodeRef {
        if !self.has_permission(Permissions::STORE) {
            return NodeRef::NULL;
        }
        let children = en.children_copy();
        if children.len() < 2 {
            return NodeRef::NULL;
        }
        let Some(params) = self.interpret_asset_parameters(children.first(), children.get(2))
        else {
            return NodeRef::NULL;
        };
        let Some(target) = self.interpret_node_into_entity(children[1]) else {
            return NodeRef::NULL;
        };
        match asset_manager().store_entity(&params, &target) {
            Ok(()) => self.alloc_bool(true),
            Err(error) => {
                log::warn!("store_entity failed: {error:#}");
                NodeRef::NULL
            }
        }
    }
}
