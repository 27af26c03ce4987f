//! The evaluable node: the universal tree node of the runtime.
//!
//! A node carries a type discriminant, a value union, optional labels, an
//! optional comment, and a small attribute byte. Node storage is owned by a
//! [`NodeManager`](manager::NodeManager); everything else in the runtime
//! refers to nodes through [`NodeHandle`]s.
//!
//! # Handle discipline
//!
//! `NodeHandle` is a raw pointer into manager-owned storage. Handles stay
//! valid under the runtime's phase discipline: any thread dereferencing
//! handles either holds the shared memory-modification lock (normal
//! execution) or has registered the tree in its manager's root set. During a
//! sweep the collector holds the lock exclusively, so no reader can observe
//! a node being invalidated. Logical exclusivity of mutation is the
//! interpreter's responsibility: two threads never mutate the same node, and
//! shared scope frames are written only under the call-stack write lock.

use crate::string_pool::{string_pool, StringId};
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU8, Ordering};

pub mod compare;
pub mod flags;
pub mod manager;

pub use manager::{NodeManager, NodeRef};

/// Associative child storage; keys hold string-pool references.
pub type AssocMap = HashMap<StringId, NodeHandle>;

bitflags::bitflags! {
    /// The node attribute byte.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct NodeAttributes: u8 {
        /// The value union holds the extended overflow record.
        const HAS_EXTENDED_VALUE = 1 << 0;
        /// This node or a descendant may be shared or cyclic; traversals
        /// must keep a visited set.
        const NEED_CYCLE_CHECK = 1 << 1;
        /// Interpreting this subtree has no side effects and yields an
        /// equal value each call.
        const IS_IDEMPOTENT = 1 << 2;
        /// The node opts its child evaluation into the thread pool.
        const CONCURRENT = 1 << 3;
        /// Garbage-collection mark bit.
        const KNOWN_TO_BE_IN_USE = 1 << 4;
    }
}

macro_rules! node_types {
    ($(($variant:ident, $keyword:expr),)*) => {
        /// Type discriminant of an evaluable node: opcode or literal tag.
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        #[repr(u8)]
        pub enum NodeType {
            $($variant,)*
        }

        impl NodeType {
            /// Every built-in keyword, pre-interned by the string pool.
            pub const KEYWORDS: &'static [&'static str] = &[$($keyword,)*];

            const ALL: &'static [NodeType] = &[$(NodeType::$variant,)*];

            /// The textual keyword for this type.
            pub fn keyword(self) -> &'static str {
                NodeType::KEYWORDS[self as usize]
            }

            /// Looks up a type by its keyword.
            pub fn from_keyword(keyword: &str) -> Option<NodeType> {
                NodeType::KEYWORDS
                    .iter()
                    .position(|&k| k == keyword && !k.is_empty())
                    .map(|i| NodeType::ALL[i])
            }
        }
    };
}

node_types! {
    // bookkeeping states; never parsed
    (Uninitialized, ""),
    (Deallocated, ""),

    // immediates and data constructors
    (Null, "null"),
    (True, "true"),
    (False, "false"),
    (Number, "number"),
    (StringLiteral, "string"),
    (Symbol, "symbol"),
    (List, "list"),
    (Assoc, "assoc"),

    // sequencing and control
    (Sequence, "sequence"),
    (Parallel, "parallel"),
    (Lambda, "lambda"),
    (Conclude, "conclude"),
    (Return, "return"),
    (If, "if"),
    (While, "while"),

    // binding
    (Let, "let"),
    (Declare, "declare"),
    (Assign, "assign"),
    (Accum, "accum"),
    (Retrieve, "retrieve"),

    // function application
    (Call, "call"),
    (CallSandboxed, "call_sandboxed"),

    // data access
    (Get, "get"),
    (SetOp, "set"),
    (Replace, "replace"),

    // reflection
    (Target, "target"),
    (CurrentIndex, "current_index"),
    (CurrentValue, "current_value"),
    (PreviousResult, "previous_result"),
    (OpcodeStack, "opcode_stack"),
    (Stack, "stack"),
    (Args, "args"),

    // randomness and environment
    (Rand, "rand"),
    (GetRandSeed, "get_rand_seed"),
    (SetRandSeed, "set_rand_seed"),
    (SystemTime, "system_time"),
    (System, "system"),
    (GetDefaults, "get_defaults"),

    // code as data
    (Parse, "parse"),
    (Unparse, "unparse"),
    (Print, "print"),

    // logic
    (And, "and"),
    (Or, "or"),
    (Xor, "xor"),
    (Not, "not"),

    // comparison
    (Equal, "="),
    (Nequal, "!="),
    (Less, "<"),
    (Lequal, "<="),
    (Greater, ">"),
    (Gequal, ">="),
    (TypeEquals, "~"),
    (TypeNequals, "!~"),

    // arithmetic used throughout entity and query code
    (Add, "+"),
    (Subtract, "-"),
    (Multiply, "*"),
    (Divide, "/"),
    (Modulus, "mod"),
    (Min, "min"),
    (Max, "max"),
    (Floor, "floor"),
    (Ceiling, "ceil"),

    // collection transforms
    (Map, "map"),
    (Filter, "filter"),
    (Weave, "weave"),
    (Reduce, "reduce"),
    (Apply, "apply"),
    (Reverse, "reverse"),
    (Sort, "sort"),
    (Indices, "indices"),
    (Values, "values"),
    (ContainsIndex, "contains_index"),
    (ContainsValue, "contains_value"),
    (Remove, "remove"),
    (Keep, "keep"),
    (Associate, "associate"),
    (Zip, "zip"),
    (Unzip, "unzip"),
    (Rewrite, "rewrite"),

    // entity control
    (CreateEntities, "create_entities"),
    (CloneEntities, "clone_entities"),
    (MoveEntities, "move_entities"),
    (DestroyEntities, "destroy_entities"),
    (ContainedEntities, "contained_entities"),
    (ComputeOnContainedEntities, "compute_on_contained_entities"),
    (RetrieveFromEntity, "retrieve_from_entity"),
    (AssignToEntities, "assign_to_entities"),
    (AccumToEntities, "accum_to_entities"),
    (CallEntity, "call_entity"),
    (RetrieveEntityRoot, "retrieve_entity_root"),
    (AssignEntityRoots, "assign_entity_roots"),
    (AccumEntityRoots, "accum_entity_roots"),
    (GetEntityComments, "get_entity_comments"),
    (GetEntityRandSeed, "get_entity_rand_seed"),
    (SetEntityRandSeed, "set_entity_rand_seed"),
    (GetEntityPermissions, "get_entity_permissions"),
    (SetEntityPermissions, "set_entity_permissions"),

    // persistence
    (Load, "load"),
    (LoadEntity, "load_entity"),
    (Store, "store"),
    (StoreEntity, "store_entity"),

    // queries
    (QueryExists, "query_exists"),
    (QueryNotExists, "query_not_exists"),
    (QueryEquals, "query_equals"),
    (QueryNotEquals, "query_not_equals"),
    (QueryBetween, "query_between"),
    (QueryNotBetween, "query_not_between"),
    (QueryAmong, "query_among"),
    (QueryNotAmong, "query_not_among"),
    (QueryLessOrEqualTo, "query_less_or_equal_to"),
    (QueryGreaterOrEqualTo, "query_greater_or_equal_to"),
    (QueryInEntityList, "query_in_entity_list"),
    (QueryNotInEntityList, "query_not_in_entity_list"),
    (QueryMin, "query_min"),
    (QueryMax, "query_max"),
    (QuerySum, "query_sum"),
    (QueryMode, "query_mode"),
    (QueryQuantile, "query_quantile"),
    (QueryGeneralizedMean, "query_generalized_mean"),
    (QueryMinDifference, "query_min_difference"),
    (QueryMaxDifference, "query_max_difference"),
    (QueryValueMasses, "query_value_masses"),
    (QuerySelect, "query_select"),
    (QuerySample, "query_sample"),
    (QueryWeightedSample, "query_weighted_sample"),
    (QueryWithinGeneralizedDistance, "query_within_generalized_distance"),
    (QueryNearestGeneralizedDistance, "query_nearest_generalized_distance"),
    (ComputeEntityConvictions, "compute_entity_convictions"),
    (ComputeEntityKlDivergences, "compute_entity_kl_divergences"),
    (ComputeEntityDistanceContributions, "compute_entity_distance_contributions"),
}

impl NodeType {
    /// Immediate types carry no child nodes.
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            NodeType::Number
                | NodeType::StringLiteral
                | NodeType::Symbol
                | NodeType::Null
                | NodeType::True
                | NodeType::False
        )
    }

    pub fn uses_number_data(self) -> bool {
        self == NodeType::Number
    }

    pub fn uses_string_data(self) -> bool {
        matches!(self, NodeType::StringLiteral | NodeType::Symbol)
    }

    pub fn uses_assoc_data(self) -> bool {
        self == NodeType::Assoc
    }

    pub fn uses_ordered_data(self) -> bool {
        !self.uses_number_data() && !self.uses_string_data() && !self.uses_assoc_data()
    }

    /// Query condition opcodes consumed by `contained_entities` /
    /// `compute_on_contained_entities`.
    pub fn is_query(self) -> bool {
        (self as u8) >= (NodeType::QueryExists as u8)
    }

    /// True for types whose evaluation is a pure function of idempotent
    /// children; the basis of bottom-up idempotency propagation.
    pub fn is_potentially_idempotent(self) -> bool {
        use NodeType::*;
        matches!(
            self,
            Null | True | False | Number | StringLiteral | List | Assoc | Sequence | Lambda
                | Conclude | Return | If | While | Let | And | Or | Xor | Not | Equal | Nequal
                | Less | Lequal | Greater | Gequal | TypeEquals | TypeNequals | Add | Subtract
                | Multiply | Divide | Modulus | Min | Max | Floor | Ceiling | Map | Filter
                | Weave | Reduce | Apply | Reverse | Sort | Indices | Values | ContainsIndex
                | ContainsValue | Remove | Keep | Associate | Zip | Unzip | Rewrite | Get
                | Unparse
        )
    }
}

/// The compact value alternatives of a node.
pub enum CoreValue {
    /// A floating-point number plus up to one inline label.
    Number { value: f64, label: StringId },
    /// An interned string plus up to one inline label.
    StringVal { id: StringId, label: StringId },
    /// Ordered child nodes; meaning depends on the node type.
    Ordered(Vec<NodeHandle>),
    /// Mapped child nodes; keys hold string-pool references.
    Mapped(AssocMap),
}

/// Overflow record for nodes that need more than the compact
/// representation, e.g. multiple labels together with child nodes, or a
/// comment.
pub struct ExtendedValue {
    pub value: CoreValue,
    pub labels: Vec<StringId>,
    pub comment: StringId,
}

/// The value union; the node type discriminant is authoritative for which
/// shape is meaningful.
pub enum NodeValue {
    Core(CoreValue),
    Extended(Box<ExtendedValue>),
}

/// A single evaluable node. Allocated and owned by a `NodeManager`.
pub struct Node {
    pub(crate) node_type: NodeType,
    pub(crate) attributes: AtomicU8,
    pub(crate) value: NodeValue,
}

impl Node {
    pub(crate) fn new_uninitialized() -> Node {
        Node {
            node_type: NodeType::Uninitialized,
            attributes: AtomicU8::new(0),
            value: NodeValue::Core(CoreValue::Ordered(Vec::new())),
        }
    }

    fn default_core_value(node_type: NodeType) -> CoreValue {
        if node_type.uses_number_data() {
            CoreValue::Number {
                value: 0.0,
                label: StringId::NOT_A_STRING,
            }
        } else if node_type.uses_string_data() {
            CoreValue::StringVal {
                id: StringId::NOT_A_STRING,
                label: StringId::NOT_A_STRING,
            }
        } else if node_type.uses_assoc_data() {
            CoreValue::Mapped(AssocMap::new())
        } else {
            CoreValue::Ordered(Vec::new())
        }
    }

    fn core(&self) -> &CoreValue {
        match &self.value {
            NodeValue::Core(core) => core,
            NodeValue::Extended(ext) => &ext.value,
        }
    }

    fn core_mut(&mut self) -> &mut CoreValue {
        match &mut self.value {
            NodeValue::Core(core) => core,
            NodeValue::Extended(ext) => &mut ext.value,
        }
    }

    /// Releases every string-pool reference held by the value, labels, and
    /// comment, leaving the node in the deallocated state.
    pub(crate) fn invalidate(&mut self) {
        let pool = string_pool();
        let value = std::mem::replace(
            &mut self.value,
            NodeValue::Core(CoreValue::Ordered(Vec::new())),
        );
        match value {
            NodeValue::Core(core) => Node::release_core(core),
            NodeValue::Extended(ext) => {
                Node::release_core(ext.value);
                for label in ext.labels {
                    pool.destroy_reference(label);
                }
                pool.destroy_reference(ext.comment);
            }
        }
        self.node_type = NodeType::Deallocated;
        self.attributes.store(0, Ordering::Relaxed);
    }

    fn release_core(core: CoreValue) {
        let pool = string_pool();
        match core {
            CoreValue::Number { label, .. } => pool.destroy_reference(label),
            CoreValue::StringVal { id, label } => {
                pool.destroy_reference(id);
                pool.destroy_reference(label);
            }
            CoreValue::Ordered(_) => {}
            CoreValue::Mapped(map) => {
                for (key, _) in map {
                    pool.destroy_reference(key);
                }
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.node_type != NodeType::Deallocated {
            self.invalidate();
        }
    }
}

/// Handle to a node in manager-owned storage; defaults to
/// [`NodeHandle::NULL`]. See the module docs for the validity discipline.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle {
    pub(crate) ptr: *mut Node,
}

impl Default for NodeHandle {
    fn default() -> Self {
        NodeHandle::NULL
    }
}

// Handles are shared across worker threads under the phase discipline
// described in the module docs; the pointee is never freed while any thread
// is in the mutation phase.
unsafe impl Send for NodeHandle {}
unsafe impl Sync for NodeHandle {}

impl NodeHandle {
    /// The null handle; represents the absent node / null value.
    pub const NULL: NodeHandle = NodeHandle {
        ptr: std::ptr::null_mut(),
    };

    #[inline]
    pub fn is_null(self) -> bool {
        self.ptr.is_null()
    }

    #[inline]
    pub(crate) fn as_node<'a>(self) -> &'a Node {
        debug_assert!(!self.ptr.is_null());
        unsafe { &*self.ptr }
    }

    #[inline]
    pub(crate) fn as_node_mut<'a>(self) -> &'a mut Node {
        debug_assert!(!self.ptr.is_null());
        unsafe { &mut *self.ptr }
    }

    /// The node's type; the null handle reports [`NodeType::Null`].
    #[inline]
    pub fn node_type(self) -> NodeType {
        if self.is_null() {
            NodeType::Null
        } else {
            self.as_node().node_type
        }
    }

    /// True if the handle is null or the node's type is `Null`.
    #[inline]
    pub fn is_null_value(self) -> bool {
        self.is_null() || self.as_node().node_type == NodeType::Null
    }

    /// Changes the node's type. Value storage is preserved when the old and
    /// new types share a shape and destroyed and re-defaulted otherwise;
    /// string references are released with the old shape.
    pub fn set_type(self, new_type: NodeType) {
        let node = self.as_node_mut();
        let same_shape = {
            let old = node.node_type;
            (old.uses_number_data() && new_type.uses_number_data())
                || (old.uses_string_data() && new_type.uses_string_data())
                || (old.uses_assoc_data() && new_type.uses_assoc_data())
                || (old.uses_ordered_data() && new_type.uses_ordered_data())
        };
        if !same_shape {
            let old_core = std::mem::replace(node.core_mut(), Node::default_core_value(new_type));
            Node::release_core(old_core);
        }
        node.node_type = new_type;
        let children_idempotent = self
            .all_children()
            .iter()
            .all(|c| c.is_null() || c.is_idempotent());
        self.set_idempotent(new_type.is_potentially_idempotent() && children_idempotent);
    }

    /// Re-initializes a deallocated or uninitialized node to a fresh
    /// default value of the given type.
    pub(crate) fn set_type_raw(self, node_type: NodeType) {
        let node = self.as_node_mut();
        node.value = NodeValue::Core(Node::default_core_value(node_type));
        node.node_type = node_type;
        node.attributes.store(0, Ordering::Relaxed);
        self.set_idempotent(node_type.is_potentially_idempotent());
    }

    /// Copies `from`'s value union into this node (which must share its
    /// shape): string data takes a fresh pool reference, children are
    /// shared, and the cycle/idempotency/concurrency bits follow. Labels
    /// and comments are not copied.
    pub(crate) fn copy_core_value_from(self, from: NodeHandle) {
        let pool = string_pool();
        match from.as_node().core() {
            CoreValue::Number { value, .. } => self.set_number_value(*value),
            CoreValue::StringVal { id, .. } => {
                self.set_string_id_with_handoff(pool.create_reference_by_id(*id));
            }
            CoreValue::Ordered(children) => {
                if let Some(dst) = self.ordered_children_mut() {
                    dst.extend_from_slice(children);
                }
            }
            CoreValue::Mapped(map) => {
                for (&key, &child) in map {
                    self.set_mapped_child(key, child);
                }
            }
        }
        self.set_need_cycle_check(from.need_cycle_check());
        self.set_idempotent(from.is_idempotent());
        self.set_concurrent(from.concurrent());
    }

    // --- attributes ---

    #[inline]
    pub fn attributes(self) -> NodeAttributes {
        NodeAttributes::from_bits_retain(self.as_node().attributes.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_attribute(self, attribute: NodeAttributes, on: bool) {
        let attribs = &self.as_node().attributes;
        if on {
            attribs.fetch_or(attribute.bits(), Ordering::Relaxed);
        } else {
            attribs.fetch_and(!attribute.bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn need_cycle_check(self) -> bool {
        self.attributes().contains(NodeAttributes::NEED_CYCLE_CHECK)
    }

    #[inline]
    pub fn set_need_cycle_check(self, on: bool) {
        self.set_attribute(NodeAttributes::NEED_CYCLE_CHECK, on);
    }

    #[inline]
    pub fn is_idempotent(self) -> bool {
        self.attributes().contains(NodeAttributes::IS_IDEMPOTENT)
    }

    #[inline]
    pub fn set_idempotent(self, on: bool) {
        self.set_attribute(NodeAttributes::IS_IDEMPOTENT, on);
    }

    #[inline]
    pub fn concurrent(self) -> bool {
        self.attributes().contains(NodeAttributes::CONCURRENT)
    }

    #[inline]
    pub fn set_concurrent(self, on: bool) {
        self.set_attribute(NodeAttributes::CONCURRENT, on);
    }

    #[inline]
    pub(crate) fn known_to_be_in_use(self) -> bool {
        self.attributes()
            .contains(NodeAttributes::KNOWN_TO_BE_IN_USE)
    }

    #[inline]
    pub(crate) fn set_known_to_be_in_use(self, on: bool) {
        self.set_attribute(NodeAttributes::KNOWN_TO_BE_IN_USE, on);
    }

    // --- immediate values ---

    /// The number value; 0.0 for non-number nodes.
    #[inline]
    pub fn number_value(self) -> f64 {
        match self.as_node().core() {
            CoreValue::Number { value, .. } => *value,
            _ => 0.0,
        }
    }

    pub fn set_number_value(self, value: f64) {
        if let CoreValue::Number { value: slot, .. } = self.as_node_mut().core_mut() {
            *slot = value;
        }
    }

    /// The string id; `NOT_A_STRING` for non-string nodes.
    #[inline]
    pub fn string_id(self) -> StringId {
        match self.as_node().core() {
            CoreValue::StringVal { id, .. } => *id,
            _ => StringId::NOT_A_STRING,
        }
    }

    /// Replaces the string id, taking ownership of `id`'s reference and
    /// releasing the previous one.
    pub fn set_string_id_with_handoff(self, id: StringId) {
        if let CoreValue::StringVal { id: slot, .. } = self.as_node_mut().core_mut() {
            let old = std::mem::replace(slot, id);
            string_pool().destroy_reference(old);
        } else {
            string_pool().destroy_reference(id);
        }
    }

    pub fn set_string_value(self, s: &str) {
        self.set_string_id_with_handoff(string_pool().create_reference(s));
    }

    /// The string text for string-data nodes.
    pub fn string_value(self) -> String {
        string_pool().string(self.string_id())
    }

    // --- children ---

    /// Number of child nodes in either storage shape.
    pub fn num_child_nodes(self) -> usize {
        if self.is_null() {
            return 0;
        }
        match self.as_node().core() {
            CoreValue::Ordered(children) => children.len(),
            CoreValue::Mapped(map) => map.len(),
            _ => 0,
        }
    }

    pub fn is_ordered_array(self) -> bool {
        !self.is_null() && self.node_type().uses_ordered_data()
    }

    pub fn is_associative_array(self) -> bool {
        !self.is_null() && self.node_type().uses_assoc_data()
    }

    /// Borrows the ordered children; empty for other shapes. The slice is
    /// valid until this node's children are mutated.
    pub fn ordered_children<'a>(self) -> &'a [NodeHandle] {
        if self.is_null() {
            return &[];
        }
        match self.as_node().core() {
            CoreValue::Ordered(children) => children,
            _ => &[],
        }
    }

    /// Copies the ordered children into a scratch vector.
    pub fn children_copy(self) -> SmallVec<[NodeHandle; 4]> {
        SmallVec::from_slice(self.ordered_children())
    }

    pub fn child(self, i: usize) -> NodeHandle {
        self.ordered_children().get(i).copied().unwrap_or(NodeHandle::NULL)
    }

    pub(crate) fn ordered_children_mut<'a>(self) -> Option<&'a mut Vec<NodeHandle>> {
        match self.as_node_mut().core_mut() {
            CoreValue::Ordered(children) => Some(children),
            _ => None,
        }
    }

    pub fn append_ordered_child(self, child: NodeHandle) {
        if let Some(children) = self.ordered_children_mut() {
            children.push(child);
        }
    }

    /// Borrows the mapped children; `None` for other shapes.
    pub fn mapped_children<'a>(self) -> Option<&'a AssocMap> {
        if self.is_null() {
            return None;
        }
        match self.as_node().core() {
            CoreValue::Mapped(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn mapped_children_mut<'a>(self) -> Option<&'a mut AssocMap> {
        match self.as_node_mut().core_mut() {
            CoreValue::Mapped(map) => Some(map),
            _ => None,
        }
    }

    /// Copies the mapped children as key/value pairs, sorted by key string
    /// for deterministic iteration.
    pub fn mapped_children_sorted(self) -> Vec<(StringId, NodeHandle)> {
        let Some(map) = self.mapped_children() else {
            return Vec::new();
        };
        let pool = string_pool();
        let mut pairs: Vec<(StringId, NodeHandle)> = map.iter().map(|(&k, &v)| (k, v)).collect();
        pairs.sort_by(|a, b| pool.string(a.0).cmp(&pool.string(b.0)));
        pairs
    }

    /// Looks up a mapped child by key string without creating references.
    pub fn mapped_child(self, key: StringId) -> Option<NodeHandle> {
        self.mapped_children().and_then(|map| map.get(&key).copied())
    }

    /// Inserts or replaces a mapped child, managing the key's reference;
    /// returns the previous child if the key was present.
    pub fn set_mapped_child(self, key: StringId, child: NodeHandle) -> Option<NodeHandle> {
        let map = self.mapped_children_mut()?;
        match map.entry(key) {
            hashbrown::hash_map::Entry::Occupied(mut occupied) => {
                Some(std::mem::replace(occupied.get_mut(), child))
            }
            hashbrown::hash_map::Entry::Vacant(vacant) => {
                string_pool().create_reference_by_id(key);
                vacant.insert(child);
                None
            }
        }
    }

    /// Removes a mapped child, releasing the key's reference.
    pub fn remove_mapped_child(self, key: StringId) -> Option<NodeHandle> {
        let map = self.mapped_children_mut()?;
        let removed = map.remove(&key);
        if removed.is_some() {
            string_pool().destroy_reference(key);
        }
        removed
    }

    /// Every child handle regardless of shape, for traversals.
    pub fn all_children(self) -> SmallVec<[NodeHandle; 4]> {
        if self.is_null() {
            return SmallVec::new();
        }
        match self.as_node().core() {
            CoreValue::Ordered(children) => SmallVec::from_slice(children),
            CoreValue::Mapped(map) => map.values().copied().collect(),
            _ => SmallVec::new(),
        }
    }

    // --- labels and comments ---

    fn ensure_extended(self) {
        let node = self.as_node_mut();
        if let NodeValue::Core(_) = node.value {
            let core = std::mem::replace(
                &mut node.value,
                NodeValue::Core(CoreValue::Ordered(Vec::new())),
            );
            let NodeValue::Core(mut core) = core else {
                unreachable!()
            };
            // hoist an inline label into the extended label vector
            let mut labels = Vec::new();
            let inline = match &mut core {
                CoreValue::Number { label, .. } | CoreValue::StringVal { label, .. } => {
                    std::mem::replace(label, StringId::NOT_A_STRING)
                }
                _ => StringId::NOT_A_STRING,
            };
            if inline.is_string() {
                labels.push(inline);
            }
            node.value = NodeValue::Extended(Box::new(ExtendedValue {
                value: core,
                labels,
                comment: StringId::NOT_A_STRING,
            }));
            self.set_attribute(NodeAttributes::HAS_EXTENDED_VALUE, true);
        }
    }

    /// The node's labels.
    pub fn labels(self) -> SmallVec<[StringId; 1]> {
        if self.is_null() {
            return SmallVec::new();
        }
        match &self.as_node().value {
            NodeValue::Extended(ext) => SmallVec::from_slice(&ext.labels),
            NodeValue::Core(CoreValue::Number { label, .. })
            | NodeValue::Core(CoreValue::StringVal { label, .. })
                if label.is_string() =>
            {
                smallvec::smallvec![*label]
            }
            _ => SmallVec::new(),
        }
    }

    pub fn num_labels(self) -> usize {
        self.labels().len()
    }

    /// Appends a label, taking ownership of `label`'s pool reference.
    pub fn append_label_with_handoff(self, label: StringId) {
        if !label.is_string() {
            return;
        }
        let node = self.as_node_mut();
        match &mut node.value {
            NodeValue::Core(CoreValue::Number { label: slot, .. })
            | NodeValue::Core(CoreValue::StringVal { label: slot, .. })
                if !slot.is_string() =>
            {
                *slot = label;
                return;
            }
            _ => {}
        }
        self.ensure_extended();
        let NodeValue::Extended(ext) = &mut self.as_node_mut().value else {
            unreachable!()
        };
        ext.labels.push(label);
    }

    pub fn append_label(self, label: &str) {
        self.append_label_with_handoff(string_pool().create_reference(label));
    }

    /// Releases all labels.
    pub fn clear_labels(self) {
        let pool = string_pool();
        let node = self.as_node_mut();
        match &mut node.value {
            NodeValue::Extended(ext) => {
                for label in ext.labels.drain(..) {
                    pool.destroy_reference(label);
                }
            }
            NodeValue::Core(CoreValue::Number { label, .. })
            | NodeValue::Core(CoreValue::StringVal { label, .. }) => {
                let old = std::mem::replace(label, StringId::NOT_A_STRING);
                pool.destroy_reference(old);
            }
            _ => {}
        }
    }

    /// The comment string id, if any.
    pub fn comment_string_id(self) -> StringId {
        if self.is_null() {
            return StringId::NOT_A_STRING;
        }
        match &self.as_node().value {
            NodeValue::Extended(ext) => ext.comment,
            _ => StringId::NOT_A_STRING,
        }
    }

    /// Sets the comment, taking ownership of the reference.
    pub fn set_comment_with_handoff(self, comment: StringId) {
        if !comment.is_string() {
            self.clear_comment();
            return;
        }
        self.ensure_extended();
        let NodeValue::Extended(ext) = &mut self.as_node_mut().value else {
            unreachable!()
        };
        let old = std::mem::replace(&mut ext.comment, comment);
        string_pool().destroy_reference(old);
    }

    pub fn clear_comment(self) {
        if let NodeValue::Extended(ext) = &mut self.as_node_mut().value {
            let old = std::mem::replace(&mut ext.comment, StringId::NOT_A_STRING);
            string_pool().destroy_reference(old);
        }
    }

    /// Clears comments, labels, and the concurrent flag.
    pub fn clear_metadata(self) {
        self.clear_comment();
        self.clear_labels();
        self.set_concurrent(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_round_trip() {
        for &ty in NodeType::ALL {
            let keyword = ty.keyword();
            if !keyword.is_empty() {
                assert_eq!(NodeType::from_keyword(keyword), Some(ty), "{keyword}");
            }
        }
        assert_eq!(NodeType::from_keyword("no_such_opcode"), None);
        assert_eq!(NodeType::from_keyword(""), None);
    }

    #[test]
    fn query_types_form_a_suffix() {
        assert!(NodeType::QueryExists.is_query());
        assert!(NodeType::ComputeEntityDistanceContributions.is_query());
        assert!(!NodeType::Map.is_query());
        assert!(!NodeType::Null.is_query());
    }

    #[test]
    fn immediate_types_have_no_children() {
        for &ty in NodeType::ALL {
            if ty.is_immediate() && !ty.uses_ordered_data() {
                assert!(ty.uses_number_data() || ty.uses_string_data());
            }
        }
    }
}
