//! Arena allocation and garbage collection of evaluable nodes.
//!
//! A `NodeManager` bulk-allocates short-lived tree nodes with amortized O(1)
//! allocation and reclaims them in bulk with a cooperative mark-and-sweep
//! collector. Node storage never moves: the manager's slot vector holds
//! handles to individually boxed nodes, so growing or compacting the vector
//! only rearranges handles.
//!
//! # Phase discipline
//!
//! A process-wide readers-writer lock distinguishes the mutation phase
//! (many threads holding it shared) from the collection phase (one thread
//! holding it exclusively). Every code path that dereferences node handles
//! either holds the shared lock or has registered its tree in the manager's
//! explicit root set. Worker threads clear their allocation buffers before
//! any point where a collection could observe them, because un-returned
//! buffer entries would otherwise look like garbage during the sweep.

use super::{Node, NodeHandle, NodeType};
use crate::string_pool::{string_pool, StringId};
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex, RwLock, RwLockReadGuard};

/// Factor by which the slot vector grows when allocation outpaces it.
const ALLOC_EXPANSION_FACTOR: f64 = 1.5;

/// Nodes handed to a thread-local allocation buffer per refill.
const TLAB_BATCH: usize = 24;

/// Minimum execution cycles between garbage collection attempts.
const MIN_CYCLES_BETWEEN_GC: u64 = 150_000;

/// Baseline live-node count that arms the collector.
const BASE_NODES_TO_TRIGGER_GC: usize = 8_192;

static MEMORY_MODIFICATION: LazyLock<RwLock<()>> = LazyLock::new(|| RwLock::new(()));

thread_local! {
    static MUTATION_PHASE_DEPTH: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// The process-wide lock distinguishing the mutation phase from the
/// collection phase. Interpreters hold it shared while executing.
pub fn memory_modification_lock() -> &'static RwLock<()> {
    &MEMORY_MODIFICATION
}

/// A shared hold on the mutation phase. Reentrant per thread: nested
/// interpreters on one thread share a single underlying read lock.
pub struct MemoryGuard {
    guard: Option<RwLockReadGuard<'static, ()>>,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        MUTATION_PHASE_DEPTH.with(|depth| depth.set(depth.get() - 1));
        self.guard.take();
    }
}

/// Enters the mutation phase, blocking while a collection is running.
pub fn enter_mutation_phase() -> MemoryGuard {
    let outermost = MUTATION_PHASE_DEPTH.with(|depth| {
        let current = depth.get();
        depth.set(current + 1);
        current == 0
    });
    let guard = if outermost {
        Some(MEMORY_MODIFICATION.read().unwrap())
    } else {
        None
    };
    MemoryGuard { guard }
}

/// How many mutation-phase holds this thread currently has.
pub fn mutation_phase_depth() -> usize {
    MUTATION_PHASE_DEPTH.with(|depth| depth.get())
}

/// How deep copies treat labels and comments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MetadataModifier {
    /// Copy labels, comments, and the concurrent flag unchanged.
    NoChange,
    /// Strip all labels and comments from the copy.
    RemoveAll,
}

/// The reference type every opcode produces and consumes: a node handle
/// plus ownership bits threaded through evaluation.
#[derive(Copy, Clone, Debug)]
pub struct NodeRef {
    pub node: NodeHandle,
    /// This reference is the only holder of the tree.
    pub unique: bool,
    /// The top node is additionally unreferenced by any label or stack and
    /// may be rewritten in place.
    pub unique_top: bool,
}

impl NodeRef {
    pub const NULL: NodeRef = NodeRef {
        node: NodeHandle::NULL,
        unique: true,
        unique_top: true,
    };

    pub fn new(node: NodeHandle, unique: bool) -> NodeRef {
        NodeRef {
            node,
            unique,
            unique_top: unique,
        }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.node.is_null()
    }

    /// True when this holds a non-null node whose type is not `Null`.
    #[inline]
    pub fn is_non_null_node(self) -> bool {
        !self.node.is_null_value()
    }

    /// Merges the properties of a subtree that was just attached beneath
    /// this reference's node: cycle-check ORs upward, idempotency ANDs
    /// upward, and uniqueness is lost if the attached tree was shared.
    pub fn update_properties_based_on_attached_node(&mut self, attached: NodeRef) {
        if attached.node.is_null() {
            return;
        }
        if !attached.unique {
            self.unique = false;
        }
        if attached.node.need_cycle_check() {
            self.node.set_need_cycle_check(true);
        }
        if !attached.node.is_idempotent() {
            self.node.set_idempotent(false);
        }
    }
}

struct Tlab {
    manager_id: u64,
    buffer: Vec<NodeHandle>,
}

thread_local! {
    static TLAB: RefCell<Tlab> = RefCell::new(Tlab { manager_id: 0, buffer: Vec::new() });
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Owner of an arena of evaluable nodes; one per entity.
pub struct NodeManager {
    id: u64,
    /// Slot vector; `[0, first_unused)` is the live region. Protected by
    /// its own RwLock so allocation can proceed shared and expansion or
    /// sweeping take it exclusively.
    nodes: RwLock<Vec<NodeHandle>>,
    first_unused_node_index: AtomicUsize,
    /// Explicit GC roots beyond the entity root: refcounts of nodes pinned
    /// by interpreters and result references.
    nodes_currently_referenced: Mutex<HashMap<NodeHandle, usize>>,
    /// True once an entity root has been installed at slot 0.
    root_set: AtomicBool,
    execution_cycles_since_last_gc: AtomicU64,
    num_nodes_to_trigger_gc: AtomicUsize,
}

// The raw handles inside are only dereferenced under the phase discipline
// described in the module docs.
unsafe impl Send for NodeManager {}
unsafe impl Sync for NodeManager {}

impl Default for NodeManager {
    fn default() -> Self {
        NodeManager::new()
    }
}

impl NodeManager {
    pub fn new() -> NodeManager {
        NodeManager {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            nodes: RwLock::new(Vec::new()),
            first_unused_node_index: AtomicUsize::new(0),
            nodes_currently_referenced: Mutex::new(HashMap::new()),
            root_set: AtomicBool::new(false),
            execution_cycles_since_last_gc: AtomicU64::new(0),
            num_nodes_to_trigger_gc: AtomicUsize::new(BASE_NODES_TO_TRIGGER_GC),
        }
    }

    // --- allocation ---

    /// Returns a node whose previous contents are undefined; the caller
    /// must initialize it. Fast path pops the thread's allocation buffer;
    /// the slow path refills the buffer from the shared free region; the
    /// expansion path grows the slot vector by the expansion factor.
    pub fn alloc_uninitialized_node(&self) -> NodeHandle {
        if let Some(node) = TLAB.with(|tlab| {
            let mut tlab = tlab.borrow_mut();
            if tlab.manager_id == self.id {
                tlab.buffer.pop()
            } else {
                // buffer belongs to another manager; abandon its entries
                // for that manager's sweep
                for handle in tlab.buffer.drain(..) {
                    handle.as_node_mut().invalidate();
                }
                tlab.manager_id = self.id;
                None
            }
        }) {
            node.as_node_mut().node_type = NodeType::Uninitialized;
            return node;
        }

        let batch = self.alloc_batch();
        TLAB.with(|tlab| {
            let mut tlab = tlab.borrow_mut();
            tlab.manager_id = self.id;
            tlab.buffer.extend(&batch[1..]);
        });
        let node = batch[0];
        node.as_node_mut().node_type = NodeType::Uninitialized;
        node
    }

    fn alloc_batch(&self) -> Vec<NodeHandle> {
        let start = self
            .first_unused_node_index
            .fetch_add(TLAB_BATCH, Ordering::AcqRel);
        let end = start + TLAB_BATCH;

        {
            let nodes = self.nodes.read().unwrap();
            if end <= nodes.len() {
                return nodes[start..end].to_vec();
            }
        }

        // expansion path
        let mut nodes = self.nodes.write().unwrap();
        if end > nodes.len() {
            let grown = (nodes.len() as f64 * ALLOC_EXPANSION_FACTOR) as usize;
            let new_size = grown.max(end).max(TLAB_BATCH * 4);
            log::trace!(
                "node manager {} expanding storage {} -> {}",
                self.id,
                nodes.len(),
                new_size
            );
            while nodes.len() < new_size {
                let boxed = Box::new(Node::new_uninitialized());
                nodes.push(NodeHandle {
                    ptr: Box::into_raw(boxed),
                });
            }
        }
        nodes[start..end].to_vec()
    }

    /// Clears this thread's allocation buffer, abandoning buffered nodes to
    /// the sweep. Must be called before a thread deschedules or before any
    /// exclusive manager lock is taken for collection.
    pub fn clear_thread_local_allocation_buffer(&self) {
        TLAB.with(|tlab| {
            let mut tlab = tlab.borrow_mut();
            if tlab.manager_id == self.id {
                for handle in tlab.buffer.drain(..) {
                    handle.as_node_mut().invalidate();
                }
            }
        });
    }

    /// Allocates a node of the given type with default-initialized value
    /// storage.
    pub fn alloc_node(&self, node_type: NodeType) -> NodeHandle {
        let node = self.alloc_uninitialized_node();
        {
            let n = node.as_node_mut();
            n.value = super::NodeValue::Core(Node::default_core_value(node_type));
            n.node_type = node_type;
            n.attributes.store(0, Ordering::Relaxed);
        }
        node.set_idempotent(node_type.is_potentially_idempotent());
        node
    }

    pub fn alloc_number_node(&self, value: f64) -> NodeHandle {
        // NaN canonicalizes to null
        if value.is_nan() {
            return self.alloc_node(NodeType::Null);
        }
        let node = self.alloc_node(NodeType::Number);
        node.set_number_value(value);
        node
    }

    pub fn alloc_string_node(&self, s: &str) -> NodeHandle {
        let node = self.alloc_node(NodeType::StringLiteral);
        node.set_string_value(s);
        node
    }

    /// Allocates a string node taking ownership of an existing pool
    /// reference; a `NOT_A_STRING` id becomes a null node.
    pub fn alloc_string_node_with_handoff(&self, id: StringId) -> NodeHandle {
        if !id.is_string() {
            return self.alloc_node(NodeType::Null);
        }
        let node = self.alloc_node(NodeType::StringLiteral);
        node.set_string_id_with_handoff(id);
        node
    }

    pub fn alloc_bool_node(&self, value: bool) -> NodeHandle {
        self.alloc_node(if value { NodeType::True } else { NodeType::False })
    }

    /// Allocates a list node owning the given children; flags are merged
    /// from the children.
    pub fn alloc_list_node(&self, children: &[NodeHandle]) -> NodeHandle {
        let node = self.alloc_node(NodeType::List);
        if let Some(slots) = node.ordered_children_mut() {
            slots.extend_from_slice(children);
        }
        let mut node_ref = NodeRef::new(node, true);
        for &child in children {
            node_ref.update_properties_based_on_attached_node(NodeRef::new(child, true));
        }
        node
    }

    /// Allocates a shallow copy of `n`'s type and immediate value
    /// (children are shared, labels and comments copied).
    pub fn alloc_shallow_copy(&self, n: NodeHandle) -> NodeHandle {
        if n.is_null() {
            return NodeHandle::NULL;
        }
        let copy = self.alloc_node(n.node_type());
        self.copy_value_and_metadata(n, copy, MetadataModifier::NoChange);
        copy
    }

    fn copy_value_and_metadata(&self, from: NodeHandle, to: NodeHandle, metadata: MetadataModifier) {
        let pool = string_pool();
        match from.node_type() {
            t if t.uses_number_data() => to.set_number_value(from.number_value()),
            t if t.uses_string_data() => {
                to.set_string_id_with_handoff(pool.create_reference_by_id(from.string_id()));
            }
            t if t.uses_assoc_data() => {
                if let Some(map) = from.mapped_children() {
                    for (&key, &child) in map {
                        to.set_mapped_child(key, child);
                    }
                }
            }
            _ => {
                if let (Some(dst), src) = (to.ordered_children_mut(), from.ordered_children()) {
                    dst.extend_from_slice(src);
                }
            }
        }
        to.as_node()
            .attributes
            .store(from.attributes().bits(), Ordering::Relaxed);
        to.set_known_to_be_in_use(false);
        if metadata == MetadataModifier::NoChange {
            for label in from.labels() {
                to.append_label_with_handoff(pool.create_reference_by_id(label));
            }
            let comment = from.comment_string_id();
            if comment.is_string() {
                to.set_comment_with_handoff(pool.create_reference_by_id(comment));
            }
        } else {
            to.set_concurrent(from.concurrent());
        }
    }

    // --- deep copy ---

    /// Copies the tree and everything underneath it into this manager,
    /// modifying labels as specified. The result is always unique.
    pub fn deep_alloc_copy(&self, tree: NodeHandle, metadata: MetadataModifier) -> NodeRef {
        if tree.is_null() {
            return NodeRef::NULL;
        }
        if tree.need_cycle_check() {
            let mut references = HashMap::new();
            let copy = self.cycle_deep_copy(tree, &mut references, metadata);
            NodeRef::new(copy, true)
        } else {
            NodeRef::new(self.non_cycle_deep_copy(tree, metadata), true)
        }
    }

    fn non_cycle_deep_copy(&self, tree: NodeHandle, metadata: MetadataModifier) -> NodeHandle {
        let copy = self.alloc_node(tree.node_type());
        self.copy_value_and_metadata(tree, copy, metadata);
        if let Some(children) = copy.ordered_children_mut() {
            for child in children.iter_mut() {
                if !child.is_null() {
                    *child = self.non_cycle_deep_copy(*child, metadata);
                }
            }
        } else if let Some(map) = copy.mapped_children_mut() {
            for child in map.values_mut() {
                if !child.is_null() {
                    *child = self.non_cycle_deep_copy(*child, metadata);
                }
            }
        }
        copy
    }

    fn cycle_deep_copy(
        &self,
        tree: NodeHandle,
        references: &mut HashMap<NodeHandle, NodeHandle>,
        metadata: MetadataModifier,
    ) -> NodeHandle {
        if let Some(&copy) = references.get(&tree) {
            return copy;
        }
        let copy = self.alloc_node(tree.node_type());
        references.insert(tree, copy);
        self.copy_value_and_metadata(tree, copy, metadata);
        if let Some(children) = copy.ordered_children_mut() {
            for child in children.iter_mut() {
                if !child.is_null() {
                    *child = self.cycle_deep_copy(*child, references, metadata);
                }
            }
        } else if let Some(map) = copy.mapped_children_mut() {
            for child in map.values_mut() {
                if !child.is_null() {
                    *child = self.cycle_deep_copy(*child, references, metadata);
                }
            }
        }
        copy
    }

    /// Ensures the reference's top node can be rewritten in place, cloning
    /// it into this manager when shared.
    pub fn ensure_node_is_modifiable(&self, original: &mut NodeRef, metadata: MetadataModifier) {
        if original.is_null() || original.unique_top {
            return;
        }
        let copy = self.alloc_shallow_copy(original.node);
        if metadata == MetadataModifier::RemoveAll {
            copy.clear_metadata();
        }
        let child_free = copy.num_child_nodes() == 0;
        *original = NodeRef {
            node: copy,
            unique: original.unique || child_free,
            unique_top: true,
        };
    }

    /// Reuses the candidate's top node when it is uniquely held, otherwise
    /// allocates fresh; either way the result has the requested type.
    pub fn reuse_or_alloc_node(&self, candidate: NodeRef, node_type: NodeType) -> NodeRef {
        if candidate.unique_top && !candidate.is_null() {
            self.free_node_child_nodes_if_owned(candidate);
            let node = candidate.node;
            // detach any remaining child handles before retyping
            if let Some(children) = node.ordered_children_mut() {
                children.clear();
            } else if let Some(map) = node.mapped_children_mut() {
                let pool = string_pool();
                for (key, _) in map.drain() {
                    pool.destroy_reference(key);
                }
            }
            node.clear_metadata();
            node.set_type(node_type);
            NodeRef {
                node,
                unique: true,
                unique_top: true,
            }
        } else {
            NodeRef::new(self.alloc_node(node_type), true)
        }
    }

    fn free_node_child_nodes_if_owned(&self, candidate: NodeRef) {
        if !candidate.unique || candidate.node.need_cycle_check() {
            return;
        }
        for child in candidate.node.all_children() {
            if !child.is_null() {
                self.free_node_tree(NodeRef::new(child, true));
            }
        }
    }

    // --- freeing ---

    /// Invalidates just this node; its children are untouched.
    pub fn free_node(&self, n: NodeHandle) {
        if !n.is_null() {
            n.as_node_mut().invalidate();
        }
    }

    /// Invalidates a whole tree. Cyclic or shared trees take the
    /// cycle-aware path that detaches children before invalidating each
    /// node, preventing re-entry.
    pub fn free_node_tree(&self, enr: NodeRef) {
        if enr.is_null() {
            return;
        }
        if enr.node.need_cycle_check() {
            self.free_node_tree_with_cycles_recurse(enr.node);
        } else {
            self.free_node_tree_recurse(enr.node);
        }
    }

    /// Frees the tree only when this reference uniquely owns it; shared or
    /// ambiguous trees are left for the sweep.
    pub fn free_node_tree_if_possible(&self, enr: NodeRef) {
        if enr.unique && !enr.is_null() {
            self.free_node_tree(enr);
        }
    }

    fn free_node_tree_recurse(&self, n: NodeHandle) {
        for child in n.all_children() {
            if !child.is_null() && child.node_type() != NodeType::Deallocated {
                self.free_node_tree_recurse(child);
            }
        }
        n.as_node_mut().invalidate();
    }

    fn free_node_tree_with_cycles_recurse(&self, n: NodeHandle) {
        if n.node_type() == NodeType::Deallocated {
            return;
        }
        // detach children before invalidating so a cycle back to n finds a
        // deallocated node and stops
        let children = n.all_children();
        n.as_node_mut().invalidate();
        for child in children {
            if !child.is_null() && child.node_type() != NodeType::Deallocated {
                self.free_node_tree_with_cycles_recurse(child);
            }
        }
    }

    // --- explicit roots ---

    /// Registers a node as a GC root until released.
    pub fn keep_node_reference(&self, n: NodeHandle) {
        if n.is_null() {
            return;
        }
        let mut referenced = self.nodes_currently_referenced.lock().unwrap();
        *referenced.entry(n).or_insert(0) += 1;
    }

    /// Releases a root registered with
    /// [`keep_node_reference`](Self::keep_node_reference).
    pub fn free_node_reference(&self, n: NodeHandle) {
        if n.is_null() {
            return;
        }
        let mut referenced = self.nodes_currently_referenced.lock().unwrap();
        if let Some(count) = referenced.get_mut(&n) {
            *count -= 1;
            if *count == 0 {
                referenced.remove(&n);
            }
        }
    }

    pub fn num_nodes_referenced(&self) -> usize {
        self.nodes_currently_referenced.lock().unwrap().len()
    }

    // --- root node ---

    /// The entity root: the node at slot 0 of the live region, if one has
    /// been installed.
    pub fn root_node(&self) -> NodeHandle {
        if !self.root_set.load(Ordering::Acquire)
            || self.first_unused_node_index.load(Ordering::Acquire) == 0
        {
            return NodeHandle::NULL;
        }
        let nodes = self.nodes.read().unwrap();
        nodes.first().copied().unwrap_or(NodeHandle::NULL)
    }

    /// Makes `new_root` the entity root by swapping it into slot 0. The
    /// node must have been allocated from this manager.
    pub fn set_root_node(&self, new_root: NodeHandle) {
        if new_root.is_null() {
            self.root_set.store(false, Ordering::Release);
            return;
        }
        let mut nodes = self.nodes.write().unwrap();
        let first_unused = self.first_unused_node_index.load(Ordering::Acquire);
        if let Some(pos) = nodes[..first_unused].iter().position(|&n| n == new_root) {
            nodes.swap(0, pos);
            self.root_set.store(true, Ordering::Release);
        }
    }

    // --- statistics ---

    pub fn number_of_used_nodes(&self) -> usize {
        self.first_unused_node_index.load(Ordering::Acquire)
    }

    pub fn number_of_unused_nodes(&self) -> usize {
        let nodes = self.nodes.read().unwrap();
        nodes.len() - self.number_of_used_nodes().min(nodes.len())
    }

    /// Pulls `first_unused_node_index` back over any trailing deallocated
    /// nodes so they can be handed out again without a full collection.
    pub fn reclaim_freed_nodes_at_end(&self) {
        let nodes = self.nodes.write().unwrap();
        let mut first_unused = self.first_unused_node_index.load(Ordering::Acquire);
        while first_unused > 0 {
            let tail = nodes[first_unused - 1];
            if tail.is_null() || tail.node_type() != NodeType::Deallocated {
                break;
            }
            first_unused -= 1;
        }
        self.first_unused_node_index
            .store(first_unused, Ordering::Release);
    }

    // --- garbage collection ---

    /// Notes one opcode execution toward the collection trigger.
    #[inline]
    pub fn note_execution_cycle(&self) {
        self.execution_cycles_since_last_gc
            .fetch_add(1, Ordering::Relaxed);
    }

    /// True when enough execution has elapsed and the live region is
    /// approaching the backing capacity. Collection is optional;
    /// interpreters consult this between opcodes.
    pub fn recommend_garbage_collection(&self) -> bool {
        let cycles = self.execution_cycles_since_last_gc.load(Ordering::Relaxed);
        let threads = crate::concurrency::num_active_threads().max(1) as u64;
        if cycles < MIN_CYCLES_BETWEEN_GC / threads {
            return false;
        }
        self.number_of_used_nodes() >= self.num_nodes_to_trigger_gc.load(Ordering::Relaxed)
    }

    /// Makes collection more likely to trigger at the next opportunity.
    pub fn advance_garbage_collection_trigger(&self) {
        let used = self.number_of_used_nodes();
        self.num_nodes_to_trigger_gc
            .fetch_min(used.max(1), Ordering::Relaxed);
        self.execution_cycles_since_last_gc
            .store(u64::MAX / 2, Ordering::Relaxed);
    }

    /// Runs a collection from a thread that is not inside the mutation
    /// phase (e.g. an entity at rest).
    pub fn collect_garbage(&self) {
        let _exclusive = memory_modification_lock().write().unwrap();
        self.collect_garbage_locked();
    }

    /// Runs a collection from a thread currently holding the shared
    /// mutation lock. The guard is released, the exclusive lock acquired
    /// (or the collection skipped if another thread finishes it first), and
    /// the shared guard reacquired before returning.
    pub fn collect_garbage_with_mutation_lock(&self, guard: &mut Option<MemoryGuard>) {
        self.clear_thread_local_allocation_buffer();
        *guard = None;

        // a nested interpreter on this thread still pins the phase; the
        // collection will happen at an outer safe point instead
        if mutation_phase_depth() > 0 {
            *guard = Some(enter_mutation_phase());
            return;
        }

        loop {
            match memory_modification_lock().try_write() {
                Ok(_exclusive) => {
                    if self.recommend_garbage_collection() {
                        self.collect_garbage_locked();
                    }
                    break;
                }
                Err(_) => {
                    // another thread holds the lock; once collection is no
                    // longer recommended it has done the work for us
                    if !self.recommend_garbage_collection() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        }

        *guard = Some(enter_mutation_phase());
    }

    fn collect_garbage_locked(&self) {
        self.clear_thread_local_allocation_buffer();
        let cur_first_unused = self.first_unused_node_index.swap(0, Ordering::AcqRel);
        if cur_first_unused == 0 {
            self.execution_cycles_since_last_gc
                .store(0, Ordering::Relaxed);
            return;
        }

        log::debug!(
            "node manager {} collecting garbage over {} nodes",
            self.id,
            cur_first_unused
        );

        // mark phase: the entity root plus every explicitly referenced node
        let mut roots: Vec<NodeHandle> = Vec::new();
        if self.root_set.load(Ordering::Acquire) {
            let nodes = self.nodes.read().unwrap();
            if let Some(&root) = nodes.first() {
                roots.push(root);
            }
        }
        {
            let referenced = self.nodes_currently_referenced.lock().unwrap();
            roots.extend(referenced.keys().copied());
        }

        const PARALLEL_MARK_THRESHOLD: usize = 8;
        if roots.len() >= PARALLEL_MARK_THRESHOLD {
            // a large root set marks in parallel on the urgent pool; the
            // mark bit doubles as the visited set, so racing markers on
            // shared subtrees are benign
            let pool = crate::concurrency::urgent_thread_pool().clone();
            let task_set = std::sync::Arc::new(pool.create_countable_task_set(roots.len()));
            let mut lock = pool.acquire_task_lock();
            for root in roots {
                let task_set = task_set.clone();
                lock.batch_enqueue_task(move || {
                    mark_reachable(root);
                    task_set.mark_task_completed();
                });
            }
            task_set.wait_for_tasks(Some(lock));
        } else {
            for root in roots {
                mark_reachable(root);
            }
        }

        // sweep phase: compact marked nodes to the front, invalidating and
        // pushing garbage to the end of the live region
        let mut nodes = self.nodes.write().unwrap();
        let mut lo = 0;
        let mut hi = cur_first_unused.min(nodes.len());
        while lo < hi {
            let node = nodes[lo];
            if !node.is_null() && node.known_to_be_in_use() {
                node.set_known_to_be_in_use(false);
                lo += 1;
            } else {
                if !node.is_null() && node.node_type() != NodeType::Deallocated {
                    node.as_node_mut().invalidate();
                }
                nodes.swap(lo, hi - 1);
                hi -= 1;
            }
        }
        drop(nodes);

        self.first_unused_node_index.store(lo, Ordering::Release);
        self.num_nodes_to_trigger_gc.store(
            (lo * 2).max(BASE_NODES_TO_TRIGGER_GC),
            Ordering::Relaxed,
        );
        self.execution_cycles_since_last_gc
            .store(0, Ordering::Relaxed);
        log::debug!(
            "node manager {} collection kept {} of {} nodes",
            self.id,
            lo,
            cur_first_unused
        );
    }

    /// Invalidates every node and resets the live region; the caller must
    /// guarantee no references into this manager remain.
    pub fn free_all_nodes(&self) {
        self.clear_thread_local_allocation_buffer();
        let nodes = self.nodes.write().unwrap();
        let first_unused = self.first_unused_node_index.swap(0, Ordering::AcqRel);
        for &node in &nodes[..first_unused.min(nodes.len())] {
            if !node.is_null() && node.node_type() != NodeType::Deallocated {
                node.as_node_mut().invalidate();
            }
        }
    }
}

/// Marks every node reachable from `root`. The mark bit doubles as the
/// visited set; marking is idempotent so concurrent markers may race
/// benignly on shared subtrees.
fn mark_reachable(root: NodeHandle) {
    if root.is_null() {
        return;
    }
    let mut stack = vec![root];
    while let Some(n) = stack.pop() {
        if n.is_null() || n.known_to_be_in_use() {
            continue;
        }
        n.set_known_to_be_in_use(true);
        for child in n.all_children() {
            if !child.is_null() && !child.known_to_be_in_use() {
                stack.push(child);
            }
        }
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        self.clear_thread_local_allocation_buffer();
        let nodes = self.nodes.get_mut().unwrap();
        for handle in nodes.drain(..) {
            if !handle.is_null() {
                drop(unsafe { Box::from_raw(handle.ptr) });
            }
        }
    }
}

/// Walks the tree and verifies no reachable node is deallocated; the
/// backing check of `system validate`.
pub fn validate_node_tree(root: NodeHandle) -> bool {
    fn recurse(n: NodeHandle, visited: &mut HashSet<NodeHandle>) -> bool {
        if n.is_null() || !visited.insert(n) {
            return true;
        }
        if n.node_type() == NodeType::Deallocated || n.node_type() == NodeType::Uninitialized {
            return false;
        }
        n.all_children().into_iter().all(|c| recurse(c, visited))
    }
    let mut visited = HashSet::new();
    recurse(root, &mut visited)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_collect_everything() {
        let enm = NodeManager::new();
        let baseline = enm.number_of_used_nodes();
        for _ in 0..500 {
            let n = enm.alloc_number_node(1.0);
            assert_eq!(n.node_type(), NodeType::Number);
        }
        enm.clear_thread_local_allocation_buffer();
        // nothing is rooted, so everything is reclaimed
        enm.collect_garbage();
        assert_eq!(enm.number_of_used_nodes(), baseline);
    }

    #[test]
    fn collect_keeps_rooted_trees() {
        let enm = NodeManager::new();
        let list = enm.alloc_list_node(&[
            enm.alloc_number_node(1.0),
            enm.alloc_number_node(2.0),
        ]);
        enm.keep_node_reference(list);
        for _ in 0..100 {
            enm.alloc_number_node(9.0);
        }
        enm.clear_thread_local_allocation_buffer();
        enm.collect_garbage();

        assert_eq!(enm.num_nodes_referenced(), 1);
        assert_eq!(list.node_type(), NodeType::List);
        assert_eq!(list.num_child_nodes(), 2);
        assert_eq!(list.child(0).number_value(), 1.0);
        // only the rooted tree survives
        assert_eq!(enm.number_of_used_nodes(), 3);

        enm.free_node_reference(list);
        enm.collect_garbage();
        assert_eq!(enm.number_of_used_nodes(), 0);
    }

    #[test]
    fn collect_reclaims_unreferenced_cycle() {
        let enm = NodeManager::new();
        let a = enm.alloc_node(NodeType::List);
        a.append_ordered_child(a);
        a.set_need_cycle_check(true);

        let referenced_before = enm.num_nodes_referenced();
        enm.clear_thread_local_allocation_buffer();
        enm.collect_garbage();
        assert_eq!(enm.number_of_used_nodes(), 0);
        assert_eq!(enm.num_nodes_referenced(), referenced_before);
    }

    #[test]
    fn free_node_tree_handles_cycles() {
        let enm = NodeManager::new();
        let a = enm.alloc_node(NodeType::List);
        let b = enm.alloc_node(NodeType::List);
        a.append_ordered_child(b);
        b.append_ordered_child(a);
        a.set_need_cycle_check(true);
        b.set_need_cycle_check(true);

        enm.free_node_tree(NodeRef::new(a, true));
        assert_eq!(a.node_type(), NodeType::Deallocated);
        assert_eq!(b.node_type(), NodeType::Deallocated);
    }

    #[test]
    fn deep_copy_preserves_structure_and_cycles() {
        let src = NodeManager::new();
        let shared = src.alloc_number_node(7.0);
        let tree = src.alloc_list_node(&[shared, shared]);
        crate::node::flags::update_flags_for_node_tree(tree);
        assert!(tree.need_cycle_check());

        let dst = NodeManager::new();
        let copy = dst.deep_alloc_copy(tree, MetadataModifier::NoChange);
        assert!(copy.unique);
        assert_eq!(copy.node.num_child_nodes(), 2);
        // sharing is preserved, not duplicated
        assert_eq!(copy.node.child(0), copy.node.child(1));
        assert!(crate::node::compare::are_deep_equal(tree, copy.node));
    }

    #[test]
    fn reclaim_freed_nodes_at_end_shrinks_live_region() {
        let enm = NodeManager::new();
        let keep = enm.alloc_number_node(1.0);
        enm.keep_node_reference(keep);
        enm.clear_thread_local_allocation_buffer();
        enm.collect_garbage();
        let live = enm.number_of_used_nodes();

        let extra = enm.alloc_number_node(2.0);
        enm.clear_thread_local_allocation_buffer();
        enm.free_node(extra);
        enm.reclaim_freed_nodes_at_end();
        assert_eq!(enm.number_of_used_nodes(), live);
        enm.free_node_reference(keep);
    }
}
