//! Entities: named, hierarchical containers owning a node tree, a random
//! stream, a label index, permissions, and contained entities.

pub mod distance;
pub mod query;

use crate::node::{flags, manager::MetadataModifier, NodeHandle, NodeManager, NodeRef};
use crate::permissions::Permissions;
use crate::rand_stream::RandomStream;
use crate::string_pool::{string_pool, StringId};
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

struct ContainedEntities {
    entities: Vec<Arc<Entity>>,
    id_to_index: HashMap<StringId, usize>,
}

/// A named container owning its node arena and everything evaluated
/// against it. Entities form a tree; a container owns its children, and
/// cross-entity data transfer is always by deep copy.
pub struct Entity {
    enm: NodeManager,
    /// Id within the container; holds a pool reference.
    id: Mutex<StringId>,
    random_stream: Mutex<RandomStream>,
    /// Interned label id to the labeled node inside the root tree.
    /// Rebuilt atomically whenever the root changes.
    label_index: RwLock<HashMap<StringId, NodeHandle>>,
    contained: RwLock<Option<ContainedEntities>>,
    container: RwLock<Weak<Entity>>,
    permissions: AtomicU8,
}

impl Entity {
    /// Creates an entity with a null root and the given seed.
    pub fn new(rand_seed: &str) -> Arc<Entity> {
        Arc::new(Entity {
            enm: NodeManager::new(),
            id: Mutex::new(StringId::NOT_A_STRING),
            random_stream: Mutex::new(RandomStream::from_seed_string(rand_seed)),
            label_index: RwLock::new(HashMap::new()),
            contained: RwLock::new(None),
            container: RwLock::new(Weak::new()),
            permissions: AtomicU8::new(0),
        })
    }

    /// The entity's node manager.
    pub fn node_manager(&self) -> &NodeManager {
        &self.enm
    }

    /// The interned id of this entity within its container.
    pub fn id_string_id(&self) -> StringId {
        *self.id.lock().unwrap()
    }

    pub fn id_string(&self) -> String {
        string_pool().string(self.id_string_id())
    }

    /// Slash-separated path from the root entity, for listener events.
    pub fn path_string(&self) -> String {
        let mut segments = vec![self.id_string()];
        let mut cursor = self.container();
        while let Some(container) = cursor {
            segments.push(container.id_string());
            cursor = container.container();
        }
        segments.reverse();
        segments.join("/")
    }

    pub fn container(&self) -> Option<Arc<Entity>> {
        self.container.read().unwrap().upgrade()
    }

    // --- permissions ---

    pub fn permissions(&self) -> Permissions {
        Permissions::from_bits_retain(self.permissions.load(Ordering::Relaxed))
    }

    pub fn set_permissions(&self, permissions: Permissions) {
        self.permissions.store(permissions.bits(), Ordering::Relaxed);
    }

    // --- root and labels ---

    /// The root node of this entity's tree.
    pub fn root_node(&self) -> NodeHandle {
        self.enm.root_node()
    }

    /// Replaces the root with a deep copy of `code` (which may live in any
    /// manager) and rebuilds the label index atomically.
    pub fn set_root_copy(&self, code: NodeHandle, metadata: MetadataModifier) {
        let copy = self.enm.deep_alloc_copy(code, metadata);
        self.install_root(copy.node);
    }

    /// Installs a root already allocated from this entity's manager.
    pub fn set_root_directly(&self, root: NodeHandle) {
        self.install_root(root);
    }

    fn install_root(&self, root: NodeHandle) {
        if !root.is_null() {
            flags::update_flags_for_node_tree(root);
        }
        self.enm.set_root_node(root);
        let new_index = Entity::build_label_index(root);
        *self.label_index.write().unwrap() = new_index;
    }

    /// Collects every labeled node in the tree. The first occurrence of a
    /// label wins; later duplicates are ignored.
    fn build_label_index(root: NodeHandle) -> HashMap<StringId, NodeHandle> {
        let mut index = HashMap::new();
        let mut visited = hashbrown::HashSet::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if n.is_null() || !visited.insert(n) {
                continue;
            }
            for label in n.labels() {
                index.entry(label).or_insert(n);
            }
            for child in n.all_children() {
                stack.push(child);
            }
        }
        index
    }

    /// Rebuilds the label index from the current root, after in-place tree
    /// mutation introduced or removed labels.
    pub fn rebuild_label_index(&self) {
        let new_index = Entity::build_label_index(self.root_node());
        *self.label_index.write().unwrap() = new_index;
    }

    /// True when the label name marks it private to the entity.
    pub fn is_label_private(label: StringId) -> bool {
        string_pool().string(label).starts_with('#')
    }

    /// Finds the node a label addresses: the label index first, then the
    /// root's own assoc keys when the root is an associative array.
    fn lookup_label_node(&self, label: StringId) -> Option<NodeHandle> {
        if let Some(&node) = self.label_index.read().unwrap().get(&label) {
            return Some(node);
        }
        let root = self.root_node();
        if root.is_associative_array() {
            return root.mapped_child(label);
        }
        None
    }

    /// Returns the subtree at a label. With a destination manager the
    /// subtree is deep-copied so the caller's lifetime is independent of
    /// this entity; `direct` additionally preserves labels and comments on
    /// the copy. `on_self` grants access to private labels.
    pub fn value_at_label(
        &self,
        label: StringId,
        dest_enm: Option<&NodeManager>,
        direct: bool,
        on_self: bool,
    ) -> NodeRef {
        if !on_self && Entity::is_label_private(label) {
            return NodeRef::NULL;
        }
        let Some(node) = self.lookup_label_node(label) else {
            return NodeRef::NULL;
        };
        match dest_enm {
            Some(dest) => {
                let metadata = if direct {
                    MetadataModifier::NoChange
                } else {
                    MetadataModifier::RemoveAll
                };
                dest.deep_alloc_copy(node, metadata)
            }
            None => NodeRef::new(node, false),
        }
    }

    /// Writes into the label's node. When `direct`, the subtree is
    /// replaced wholesale and the label index rebuilt; otherwise the new
    /// value is copied over the labeled node in place, keeping its labels.
    /// Returns false when the label is absent or private.
    pub fn set_value_at_label(
        &self,
        label: StringId,
        new_value: NodeHandle,
        direct: bool,
        on_self: bool,
        write_listeners: &[Arc<dyn crate::listeners::WriteListener>],
    ) -> bool {
        if !on_self && Entity::is_label_private(label) {
            return false;
        }
        let Some(target) = self.lookup_label_node(label) else {
            return false;
        };

        // bring the value into this entity's manager before grafting
        let copy = self.enm.deep_alloc_copy(new_value, MetadataModifier::RemoveAll);
        copy_node_value_preserving_metadata(copy.node, target);

        if direct {
            flags::update_flags_for_node_tree(self.root_node());
            self.rebuild_label_index();
        }

        if !write_listeners.is_empty() {
            let path = self.path_string();
            let serialized = crate::code::unparse_node(target);
            for listener in write_listeners {
                listener.log_write_value_to_entity(&path, label, &serialized, direct);
            }
        }
        true
    }

    /// Labels visible from outside the entity.
    pub fn public_labels(&self) -> Vec<StringId> {
        let index = self.label_index.read().unwrap();
        index
            .keys()
            .copied()
            .filter(|&l| !Entity::is_label_private(l))
            .collect()
    }

    pub fn has_label(&self, label: StringId) -> bool {
        self.lookup_label_node(label).is_some()
    }

    // --- random stream ---

    pub fn random_state_string(&self) -> String {
        self.random_stream.lock().unwrap().state_string()
    }

    /// Sets the random state. With `deep`, every contained entity is
    /// re-seeded deterministically from this entity's stream and the
    /// child's id, in depth order.
    pub fn set_random_state(&self, state: &str, deep: bool) {
        self.random_stream.lock().unwrap().set_state(state);
        if deep {
            let children = self.contained_entities();
            for child in children {
                let child_state = self
                    .random_stream
                    .lock()
                    .unwrap()
                    .create_other_stream_state_via_string(&child.id_string());
                child.set_random_state(&child_state, true);
            }
        }
    }

    /// Draws from this entity's stream.
    pub fn with_random_stream<R>(&self, f: impl FnOnce(&mut RandomStream) -> R) -> R {
        f(&mut self.random_stream.lock().unwrap())
    }

    /// A split stream for a child interpreter or worker task.
    pub fn create_split_random_stream(&self) -> RandomStream {
        self.random_stream.lock().unwrap().create_other_stream_via_rand()
    }

    // --- contained entities ---

    pub fn has_contained_entities(&self) -> bool {
        self.contained
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|c| !c.entities.is_empty())
    }

    pub fn num_contained_entities(&self) -> usize {
        self.contained
            .read()
            .unwrap()
            .as_ref()
            .map_or(0, |c| c.entities.len())
    }

    /// Snapshot of the contained entities in insertion order.
    pub fn contained_entities(&self) -> Vec<Arc<Entity>> {
        self.contained
            .read()
            .unwrap()
            .as_ref()
            .map_or_else(Vec::new, |c| c.entities.clone())
    }

    pub fn get_contained_entity(&self, id: StringId) -> Option<Arc<Entity>> {
        let contained = self.contained.read().unwrap();
        let contained = contained.as_ref()?;
        let &index = contained.id_to_index.get(&id)?;
        Some(contained.entities[index].clone())
    }

    /// Resolves a `/`-free id path segment list from this entity downward.
    pub fn get_deeply_contained_entity(self: &Arc<Entity>, path: &[StringId]) -> Option<Arc<Entity>> {
        let mut cursor = self.clone();
        for &segment in path {
            cursor = cursor.get_contained_entity(segment)?;
        }
        Some(cursor)
    }

    /// Every deeply contained entity grouped by depth, acquiring read views
    /// in depth order so concurrent lockers cannot deadlock.
    pub fn all_deeply_contained_entities_grouped_by_depth(
        self: &Arc<Entity>,
    ) -> Vec<Vec<Arc<Entity>>> {
        let mut groups = Vec::new();
        let mut frontier = vec![self.clone()];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for entity in &frontier {
                next.extend(entity.contained_entities());
            }
            groups.push(std::mem::replace(&mut frontier, next));
        }
        groups
    }

    /// Inserts a contained entity by interned id. A `NOT_A_STRING` id
    /// autogenerates `_<rand>` ids until one is unique. Returns the child's
    /// id, or `NOT_A_STRING` when the id is already taken.
    ///
    /// The id-index insertion happens before the string reference is
    /// created; external listeners may observe that ordering.
    pub fn add_contained_entity(
        self: &Arc<Entity>,
        t: Arc<Entity>,
        id: StringId,
        write_listeners: &[Arc<dyn crate::listeners::WriteListener>],
    ) -> StringId {
        let pool = string_pool();
        let mut contained = self.contained.write().unwrap();
        let contained = contained.get_or_insert_with(|| ContainedEntities {
            entities: Vec::new(),
            id_to_index: HashMap::new(),
        });
        let t_index = contained.entities.len();
        let previous_t_sid = t.id_string_id();

        if !id.is_string() {
            loop {
                let new_id = format!(
                    "_{}",
                    self.random_stream.lock().unwrap().rand_uint32()
                );
                let new_sid = pool.create_reference(&new_id);
                if contained.id_to_index.contains_key(&new_sid) {
                    // already in use; free it and make another
                    pool.destroy_reference(new_sid);
                    continue;
                }
                contained.id_to_index.insert(new_sid, t_index);
                *t.id.lock().unwrap() = new_sid;
                break;
            }
        } else {
            // insert into the id index first, then create the reference
            if contained.id_to_index.contains_key(&id) {
                return StringId::NOT_A_STRING;
            }
            contained.id_to_index.insert(id, t_index);
            *t.id.lock().unwrap() = pool.create_reference_by_id(id);
        }

        contained.entities.push(t.clone());
        finish_add_contained_entity(self, &t, previous_t_sid, write_listeners)
    }

    /// Inserts a contained entity by id string; an empty string
    /// autogenerates an id. Unlike the interned-id form, the string
    /// reference is created before the index insertion is attempted, and
    /// destroyed again on collision.
    pub fn add_contained_entity_str(
        self: &Arc<Entity>,
        t: Arc<Entity>,
        id_string: &str,
        write_listeners: &[Arc<dyn crate::listeners::WriteListener>],
    ) -> StringId {
        let pool = string_pool();
        let mut contained = self.contained.write().unwrap();
        let contained = contained.get_or_insert_with(|| ContainedEntities {
            entities: Vec::new(),
            id_to_index: HashMap::new(),
        });
        let t_index = contained.entities.len();
        let previous_t_sid = t.id_string_id();

        if id_string.is_empty() {
            loop {
                let new_id = format!(
                    "_{}",
                    self.random_stream.lock().unwrap().rand_uint32()
                );
                let new_sid = pool.create_reference(&new_id);
                if contained.id_to_index.contains_key(&new_sid) {
                    pool.destroy_reference(new_sid);
                    continue;
                }
                contained.id_to_index.insert(new_sid, t_index);
                *t.id.lock().unwrap() = new_sid;
                break;
            }
        } else {
            // create the reference first, then attempt the index insert
            let new_sid = pool.create_reference(id_string);
            if contained.id_to_index.contains_key(&new_sid) {
                pool.destroy_reference(new_sid);
                return StringId::NOT_A_STRING;
            }
            contained.id_to_index.insert(new_sid, t_index);
            *t.id.lock().unwrap() = new_sid;
        }

        contained.entities.push(t.clone());
        finish_add_contained_entity(self, &t, previous_t_sid, write_listeners)
    }

    /// Swap-removes a contained entity, updating the displaced entity's
    /// index. Returns the removed entity, which the caller now owns.
    pub fn remove_contained_entity(
        &self,
        id: StringId,
        write_listeners: &[Arc<dyn crate::listeners::WriteListener>],
    ) -> Option<Arc<Entity>> {
        let removed = {
            let mut contained = self.contained.write().unwrap();
            let contained = contained.as_mut()?;
            let index = contained.id_to_index.remove(&id)?;
            let removed = contained.entities.swap_remove(index);
            if index < contained.entities.len() {
                let displaced_id = contained.entities[index].id_string_id();
                contained.id_to_index.insert(displaced_id, index);
            }
            removed
        };
        *removed.container.write().unwrap() = Weak::new();
        if !write_listeners.is_empty() {
            let path = removed.path_string();
            for listener in write_listeners {
                listener.log_destroy_entity(&path);
            }
        }
        Some(removed)
    }

    /// Deep-copies this entity: tree, random state, permissions, and all
    /// contained entities. The clone has no container.
    pub fn clone_entity(&self) -> Arc<Entity> {
        let clone = Entity::new("");
        clone
            .random_stream
            .lock()
            .unwrap()
            .set_state(&self.random_state_string());
        clone.set_permissions(self.permissions());
        let root = self.root_node();
        if !root.is_null() {
            clone.set_root_copy(root, MetadataModifier::NoChange);
        }
        for child in self.contained_entities() {
            let child_clone = child.clone_entity();
            clone.add_contained_entity(child_clone, child.id_string_id(), &[]);
        }
        clone
    }

    /// Total node count across this entity and everything contained.
    pub fn deep_used_node_count(&self) -> usize {
        let mut total = self.enm.number_of_used_nodes();
        for child in self.contained_entities() {
            total += child.deep_used_node_count();
        }
        total
    }

    /// Depth of the deepest contained-entity chain below this entity.
    pub fn contained_depth(&self) -> usize {
        self.contained_entities()
            .iter()
            .map(|c| 1 + c.contained_depth())
            .max()
            .unwrap_or(0)
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        let id = *self.id.lock().unwrap();
        string_pool().destroy_reference(id);
    }
}

/// Shared tail of both insert orderings: container backlink, listener
/// broadcast, release of the child's previous id.
fn finish_add_contained_entity(
    container: &Arc<Entity>,
    t: &Arc<Entity>,
    previous_t_sid: StringId,
    write_listeners: &[Arc<dyn crate::listeners::WriteListener>],
) -> StringId {
    string_pool().destroy_reference(previous_t_sid);
    *t.container.write().unwrap() = Arc::downgrade(container);
    if !write_listeners.is_empty() {
        let path = t.path_string();
        for listener in write_listeners {
            listener.log_create_entity(&path);
        }
    }
    t.id_string_id()
}

/// Copies `from`'s type and value over `to` in place, preserving `to`'s
/// labels so the label index stays valid for non-direct writes.
fn copy_node_value_preserving_metadata(from: NodeHandle, to: NodeHandle) {
    let pool = string_pool();
    let labels: Vec<StringId> = to
        .labels()
        .iter()
        .map(|&l| pool.create_reference_by_id(l))
        .collect();
    let comment = to.comment_string_id();
    let comment = if comment.is_string() {
        pool.create_reference_by_id(comment)
    } else {
        StringId::NOT_A_STRING
    };

    to.as_node_mut().invalidate();
    if from.is_null() {
        to.set_type_raw(crate::node::NodeType::Null);
    } else {
        to.set_type_raw(from.node_type());
        to.copy_core_value_from(from);
    }
    for label in labels {
        to.append_label_with_handoff(label);
    }
    if comment.is_string() {
        to.set_comment_with_handoff(comment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeType;

    fn entity_with_code(src: &str) -> Arc<Entity> {
        let entity = Entity::new("test seed");
        let scratch = NodeManager::new();
        let (code, warnings) = crate::code::parse_to_node(src, &scratch);
        assert!(warnings.is_empty(), "{warnings:?}");
        entity.set_root_copy(code.node, MetadataModifier::NoChange);
        entity
    }

    #[test]
    fn label_lookup_and_privacy() {
        let entity = entity_with_code("(list #visible 10 ##hidden 20)");
        let pool = string_pool();
        let visible = pool.create_reference("visible");
        let hidden = pool.create_reference("#hidden");

        let value = entity.value_at_label(visible, None, false, false);
        assert_eq!(value.node.number_value(), 10.0);

        // private from the outside, reachable on self
        assert!(entity.value_at_label(hidden, None, false, false).is_null());
        let value = entity.value_at_label(hidden, None, false, true);
        assert_eq!(value.node.number_value(), 20.0);

        pool.destroy_reference(visible);
        pool.destroy_reference(hidden);
    }

    #[test]
    fn set_value_at_label_in_place() {
        let entity = entity_with_code("(list #x 1)");
        let pool = string_pool();
        let x = pool.create_reference("x");

        let scratch = NodeManager::new();
        let replacement = scratch.alloc_number_node(42.0);
        assert!(entity.set_value_at_label(x, replacement, false, true, &[]));

        let value = entity.value_at_label(x, None, false, true);
        assert_eq!(value.node.number_value(), 42.0);
        // the labeled node kept its label
        assert_eq!(value.node.num_labels(), 1);
        pool.destroy_reference(x);
    }

    #[test]
    fn contained_entity_ids_and_collisions() {
        let parent = Entity::new("parent");
        let a = Entity::new("a");
        let b = Entity::new("b");
        let c = Entity::new("c");

        let a_id = parent.add_contained_entity_str(a.clone(), "alpha", &[]);
        assert_eq!(string_pool().string(a_id), "alpha");
        // collision returns NOT_A_STRING and the pool reference is balanced
        let collision = parent.add_contained_entity_str(b.clone(), "alpha", &[]);
        assert!(!collision.is_string());

        // autogenerated ids start with an underscore
        let c_id = parent.add_contained_entity(c.clone(), StringId::NOT_A_STRING, &[]);
        assert!(string_pool().string(c_id).starts_with('_'));

        assert_eq!(parent.num_contained_entities(), 2);
        assert!(parent.get_contained_entity(a_id).is_some());
        assert!(Arc::ptr_eq(&a.container().unwrap(), &parent));
    }

    #[test]
    fn remove_contained_entity_swaps_and_reindexes() {
        let parent = Entity::new("parent");
        for name in ["e1", "e2", "e3"] {
            parent.add_contained_entity_str(Entity::new(name), name, &[]);
        }
        let pool = string_pool();
        let e1 = pool.id_of("e1").unwrap();
        let e3 = pool.id_of("e3").unwrap();

        let removed = parent.remove_contained_entity(e1, &[]).unwrap();
        assert_eq!(removed.id_string(), "e1");
        assert_eq!(parent.num_contained_entities(), 2);
        // e3 was swapped into e1's slot and is still addressable
        assert_eq!(parent.get_contained_entity(e3).unwrap().id_string(), "e3");
    }

    #[test]
    fn deep_random_reseed_is_deterministic() {
        let build = || {
            let parent = Entity::new("");
            parent.add_contained_entity_str(Entity::new(""), "child", &[]);
            parent.set_random_state("shared state", true);
            parent
                .get_contained_entity(string_pool().id_of("child").unwrap())
                .unwrap()
                .random_state_string()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn clone_copies_tree_and_children() {
        let entity = entity_with_code("(list #a 42)");
        entity.add_contained_entity_str(Entity::new("inner"), "inner", &[]);
        let clone = entity.clone_entity();

        assert!(crate::node::compare::are_deep_equal(
            entity.root_node(),
            clone.root_node()
        ));
        assert_eq!(clone.num_contained_entities(), 1);
        assert!(clone.container().is_none());
        assert_eq!(clone.root_node().node_type(), NodeType::List);
    }
}
