//! The tree-walking interpreter: opcode dispatch over evaluable nodes with
//! the scope, opcode, and construction stacks.
//!
//! The three stacks are arena list nodes registered as GC roots, so
//! everything the interpreter is holding stays reachable across a
//! collection; handlers additionally pin interim results on the opcode
//! stack before recursing. The interpreter holds the shared
//! memory-modification lock for its whole evaluation except while blocked
//! on concurrent subtasks.

pub mod concurrency_manager;
pub mod constraints;
mod opcodes_base;
mod opcodes_entity;
mod opcodes_logic;
mod opcodes_transform;

pub use constraints::{ConstraintViolation, InterpreterConstraints};

use crate::entity::Entity;
use crate::listeners::{PrintListener, WriteListener};
use crate::node::manager::{enter_mutation_phase, MemoryGuard, MetadataModifier};
use crate::node::{compare, NodeHandle, NodeManager, NodeRef, NodeType};
use crate::rand_stream::RandomStream;
use crate::string_pool::StringId;
use std::sync::{Arc, RwLock};

/// Index value of a construction frame, for `current_index` reflection.
#[derive(Copy, Clone, Debug, Default)]
pub enum IndexValue {
    #[default]
    None,
    Number(f64),
    StringVal(StringId),
}

/// Sidecar state of one construction frame; the four node slots live on
/// the construction stack list node.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConstructionSidecar {
    pub current_index: IndexValue,
    pub previous_result_unique: bool,
    pub side_effect_occurred: bool,
}

const CONSTRUCTION_NODES_PER_FRAME: usize = 4;
const TARGET_ORIGIN_OFFSET: usize = 0;
const TARGET_OFFSET: usize = 1;
const CURRENT_VALUE_OFFSET: usize = 2;
const PREVIOUS_RESULT_OFFSET: usize = 3;

/// One interpreter: strictly sequential within its thread; concurrency is
/// opt-in per opcode and spawns further interpreters.
pub struct Interpreter {
    pub(crate) entity: Arc<Entity>,
    pub(crate) random_stream: RandomStream,
    /// Scope stack: a list node whose children are assoc frames, innermost
    /// last.
    pub(crate) call_stack: NodeHandle,
    /// Frames below this index are shared with other threads and written
    /// only under `call_stack_lock`.
    pub(crate) call_stack_unique_access_starting_depth: usize,
    pub(crate) call_stack_lock: Arc<RwLock<()>>,
    /// Opcode stack: currently-executing nodes plus pinned interim results.
    pub(crate) opcode_stack: NodeHandle,
    /// Construction stack: four node slots per frame plus the sidecar.
    pub(crate) construction_stack: NodeHandle,
    pub(crate) construction_sidecar: Vec<ConstructionSidecar>,
    pub(crate) constraints: Option<InterpreterConstraints>,
    /// The most recent violation observed here or in a sandboxed call.
    pub(crate) constraint_violation: Option<ConstraintViolation>,
    pub(crate) write_listeners: Vec<Arc<dyn WriteListener>>,
    pub(crate) print_listener: Option<Arc<dyn PrintListener>>,
    pub(crate) memory_guard: Option<MemoryGuard>,
}

impl Interpreter {
    /// Creates an interpreter rooted at `entity`. Stacks are allocated
    /// from the entity's manager and registered as GC roots.
    pub fn new(entity: Arc<Entity>, constraints: Option<InterpreterConstraints>) -> Interpreter {
        let random_stream = entity.create_split_random_stream();
        Interpreter::new_with_stream(entity, constraints, random_stream)
    }

    pub(crate) fn new_with_stream(
        entity: Arc<Entity>,
        mut constraints: Option<InterpreterConstraints>,
        random_stream: RandomStream,
    ) -> Interpreter {
        let guard = enter_mutation_phase();
        let enm = entity.node_manager();
        let call_stack = enm.alloc_node(NodeType::List);
        let opcode_stack = enm.alloc_node(NodeType::List);
        let construction_stack = enm.alloc_node(NodeType::List);
        for &stack in &[call_stack, opcode_stack, construction_stack] {
            stack.set_need_cycle_check(true);
            enm.keep_node_reference(stack);
        }
        // the outermost scope frame
        let top_frame = enm.alloc_node(NodeType::Assoc);
        call_stack.append_ordered_child(top_frame);

        if let Some(constraints) = constraints.as_mut() {
            constraints.populate_performance_counters(None, enm.number_of_used_nodes(), 0);
        }

        Interpreter {
            entity,
            random_stream,
            call_stack,
            call_stack_unique_access_starting_depth: 0,
            call_stack_lock: Arc::new(RwLock::new(())),
            opcode_stack,
            construction_stack,
            construction_sidecar: Vec::new(),
            constraints,
            constraint_violation: None,
            write_listeners: Vec::new(),
            print_listener: None,
            memory_guard: Some(guard),
        }
    }

    pub fn set_write_listeners(&mut self, listeners: Vec<Arc<dyn WriteListener>>) {
        self.write_listeners = listeners;
    }

    pub fn set_print_listener(&mut self, listener: Arc<dyn PrintListener>) {
        self.print_listener = Some(listener);
    }

    #[inline]
    pub(crate) fn enm(&self) -> &NodeManager {
        self.entity.node_manager()
    }

    /// The constraints, for callers inspecting budgets after evaluation.
    pub fn constraints(&self) -> Option<&InterpreterConstraints> {
        self.constraints.as_ref()
    }

    /// The most recent budget violation, including one reported by a
    /// sandboxed call.
    pub fn constraint_violation(&self) -> Option<ConstraintViolation> {
        self.constraint_violation
    }

    /// Top-level evaluation entry.
    pub fn evaluate(&mut self, code: NodeHandle) -> NodeRef {
        if self.memory_guard.is_none() {
            self.memory_guard = Some(enter_mutation_phase());
        }
        let result = self.interpret_node(code, false);
        self.enm().clear_thread_local_allocation_buffer();
        result
    }

    /// Evaluates and pins the result as a GC root in the entity's manager;
    /// the caller owns the pin.
    pub fn evaluate_and_keep(&mut self, code: NodeHandle) -> NodeRef {
        let result = self.evaluate(code);
        if !result.is_null() {
            self.enm().keep_node_reference(result.node);
        }
        result
    }

    // --- the dispatch loop ---

    /// Evaluates one node. The `immediate_result` hint tells leaf opcodes
    /// the caller only needs the value, letting them skip metadata copies.
    pub(crate) fn interpret_node(&mut self, en: NodeHandle, immediate_result: bool) -> NodeRef {
        if en.is_null() {
            return NodeRef::NULL;
        }

        if self.are_execution_resources_exhausted(true) {
            return NodeRef::NULL;
        }

        self.opcode_stack.append_ordered_child(en);
        self.collect_garbage_if_recommended();

        use NodeType::*;
        let result = match en.node_type() {
            Uninitialized | Deallocated | Null => NodeRef::NULL,
            True | False | Number | StringLiteral => self.op_immediate_literal(en, immediate_result),
            Symbol => self.op_symbol(en),
            List => self.op_list(en),
            Assoc => self.op_assoc(en),
            Sequence => self.op_sequence(en, immediate_result),
            Parallel => self.op_parallel(en),
            Lambda => self.op_lambda(en),
            Conclude | Return => self.op_conclude_and_return(en),
            If => self.op_if(en, immediate_result),
            While => self.op_while(en, immediate_result),
            Let => self.op_let(en, immediate_result),
            Declare => self.op_declare(en, immediate_result),
            Assign | Accum => self.op_assign_and_accum(en),
            Retrieve => self.op_retrieve(en),
            Call => self.op_call(en, immediate_result),
            CallSandboxed => self.op_call_sandboxed(en),
            Get => self.op_get(en),
            SetOp | Replace => self.op_set_and_replace(en),
            Target => self.op_construction_reflection(en, TARGET_OFFSET),
            CurrentValue => self.op_construction_reflection(en, CURRENT_VALUE_OFFSET),
            PreviousResult => self.op_construction_reflection(en, PREVIOUS_RESULT_OFFSET),
            CurrentIndex => self.op_current_index(en),
            OpcodeStack => self.op_opcode_stack(en),
            Stack => self.op_stack(en),
            Args => self.op_args(en),
            Rand => self.op_rand(en),
            GetRandSeed => self.op_get_rand_seed(en),
            SetRandSeed => self.op_set_rand_seed(en),
            SystemTime => self.op_system_time(en),
            System => self.op_system(en),
            GetDefaults => self.op_get_defaults(en),
            Parse => self.op_parse(en),
            Unparse => self.op_unparse(en),
            Print => self.op_print(en),
            And => self.op_and(en),
            Or => self.op_or(en),
            Xor => self.op_xor(en),
            Not => self.op_not(en),
            Equal | Nequal => self.op_equal(en),
            Less | Lequal | Greater | Gequal => self.op_compare(en),
            TypeEquals | TypeNequals => self.op_type_equals(en),
            Add | Subtract | Multiply | Divide | Modulus | Min | Max => self.op_arithmetic(en),
            Floor | Ceiling => self.op_rounding(en),
            Map => self.op_map(en),
            Filter => self.op_filter(en),
            Weave => self.op_weave(en),
            Reduce => self.op_reduce(en),
            Apply => self.op_apply(en, immediate_result),
            Reverse => self.op_reverse(en),
            Sort => self.op_sort(en),
            Indices => self.op_indices(en),
            Values => self.op_values(en),
            ContainsIndex => self.op_contains_index(en),
            ContainsValue => self.op_contains_value(en),
            Remove | Keep => self.op_remove_and_keep(en),
            Associate => self.op_associate(en),
            Zip => self.op_zip(en),
            Unzip => self.op_unzip(en),
            Rewrite => self.op_rewrite(en),
            CreateEntities => self.op_create_entities(en),
            CloneEntities => self.op_clone_entities(en),
            MoveEntities => self.op_move_entities(en),
            DestroyEntities => self.op_destroy_entities(en),
            ContainedEntities | ComputeOnContainedEntities => self.op_contained_entities(en),
            RetrieveFromEntity => self.op_retrieve_from_entity(en),
            AssignToEntities | AccumToEntities => self.op_assign_to_entities(en),
            CallEntity => self.op_call_entity(en),
            RetrieveEntityRoot => self.op_retrieve_entity_root(en),
            AssignEntityRoots | AccumEntityRoots => self.op_assign_entity_roots(en),
            GetEntityComments => self.op_get_entity_comments(en),
            GetEntityRandSeed => self.op_get_entity_rand_seed(en),
            SetEntityRandSeed => self.op_set_entity_rand_seed(en),
            GetEntityPermissions => self.op_get_entity_permissions(en),
            SetEntityPermissions => self.op_set_entity_permissions(en),
            Load => self.op_load(en),
            LoadEntity => self.op_load_entity(en),
            Store => self.op_store(en),
            StoreEntity => self.op_store_entity(en),
            query_type if query_type.is_query() => self.op_query(en),
            _ => NodeRef::NULL,
        };

        self.pop_opcode_stack();
        result
    }

    /// Evaluates a child for consumption by the current opcode only.
    #[inline]
    pub(crate) fn interpret_node_for_immediate_use(&mut self, en: NodeHandle) -> NodeRef {
        self.interpret_node(en, true)
    }

    // --- budgets and collection ---

    pub(crate) fn are_execution_resources_exhausted(&mut self, increment_step: bool) -> bool {
        let used = self.enm().number_of_used_nodes();
        let depth = self.opcode_stack.num_child_nodes();
        match self.constraints.as_mut() {
            Some(constraints) => {
                let exhausted =
                    constraints.are_execution_resources_exhausted(used, depth, increment_step);
                if exhausted && self.constraint_violation.is_none() {
                    self.constraint_violation = constraints.constraint_violation;
                    log::debug!("constraints exceeded: {:?}", self.constraint_violation);
                }
                exhausted
            }
            None => false,
        }
    }

    fn collect_garbage_if_recommended(&mut self) {
        let enm = self.enm();
        enm.note_execution_cycle();
        if enm.recommend_garbage_collection() {
            self.entity
                .node_manager()
                .collect_garbage_with_mutation_lock(&mut self.memory_guard);
        }
    }

    /// Pins an interim result on the opcode stack across a recursive
    /// interpretation; pop with [`pop_opcode_stack`](Self::pop_opcode_stack).
    #[inline]
    pub(crate) fn push_opcode_stack(&mut self, n: NodeHandle) {
        self.opcode_stack.append_ordered_child(n);
    }

    #[inline]
    pub(crate) fn pop_opcode_stack(&mut self) {
        if let Some(children) = self.opcode_stack.ordered_children_mut() {
            children.pop();
        }
    }

    // --- scope stack ---

    pub(crate) fn call_stack_depth(&self) -> usize {
        self.call_stack.num_child_nodes()
    }

    /// Pushes a new scope frame; `context` becomes the frame when it is an
    /// assoc, otherwise an empty frame is pushed.
    pub(crate) fn push_new_call_stack_frame(&mut self, context: NodeRef) {
        let frame = if context.node.is_associative_array() {
            context.node
        } else {
            self.enm().alloc_node(NodeType::Assoc)
        };
        self.call_stack.append_ordered_child(frame);
    }

    pub(crate) fn pop_call_stack_frame(&mut self) {
        if let Some(children) = self.call_stack.ordered_children_mut() {
            if children.len() > 1 {
                children.pop();
            }
        }
    }

    fn frame_is_shared(&self, frame_index: usize) -> bool {
        frame_index < self.call_stack_unique_access_starting_depth
    }

    /// Walks the scope stack from the top down for `sid`, returning the
    /// value and the frame index holding it.
    pub(crate) fn get_call_stack_symbol(&self, sid: StringId) -> Option<(NodeHandle, usize)> {
        let frames = self.call_stack.ordered_children();
        for (index, frame) in frames.iter().enumerate().rev() {
            let shared = self.frame_is_shared(index);
            let _read_guard = if shared {
                Some(self.call_stack_lock.read().unwrap())
            } else {
                None
            };
            if let Some(value) = frame.mapped_child(sid) {
                return Some((value, index));
            }
        }
        None
    }

    /// Writes `value` into the nearest frame holding `sid`, creating the
    /// symbol in the top frame when absent. Shared frames take the
    /// call-stack write lock. Returns the replaced value, if any.
    pub(crate) fn set_call_stack_symbol(&mut self, sid: StringId, value: NodeHandle) {
        let frames = self.call_stack.ordered_children();
        let mut target_index = frames.len() - 1;
        for (index, frame) in frames.iter().enumerate().rev() {
            if frame.mapped_child(sid).is_some() {
                target_index = index;
                break;
            }
        }
        let frame = frames[target_index];
        let _write_guard = if self.frame_is_shared(target_index) {
            Some(self.call_stack_lock.write().unwrap())
        } else {
            None
        };
        frame.set_mapped_child(sid, value);
        drop(_write_guard);
        self.note_side_effect();
    }

    /// Adds `sid` to the top frame only when not already present there;
    /// returns false when the symbol already existed in that frame.
    pub(crate) fn declare_call_stack_symbol(&mut self, sid: StringId, value: NodeHandle) -> bool {
        let frames = self.call_stack.ordered_children();
        let top = frames[frames.len() - 1];
        if top.mapped_child(sid).is_some() {
            return false;
        }
        top.set_mapped_child(sid, value);
        true
    }

    // --- construction stack ---

    pub(crate) fn push_construction_context(
        &mut self,
        target_origin: NodeHandle,
        target: NodeHandle,
        current_value: NodeHandle,
        previous_result: NodeRef,
    ) {
        self.construction_stack.append_ordered_child(target_origin);
        self.construction_stack.append_ordered_child(target);
        self.construction_stack.append_ordered_child(current_value);
        self.construction_stack
            .append_ordered_child(previous_result.node);
        self.construction_sidecar.push(ConstructionSidecar {
            current_index: IndexValue::None,
            previous_result_unique: previous_result.unique,
            side_effect_occurred: false,
        });
    }

    pub(crate) fn pop_construction_context(&mut self) {
        if let Some(children) = self.construction_stack.ordered_children_mut() {
            let new_len = children.len().saturating_sub(CONSTRUCTION_NODES_PER_FRAME);
            children.truncate(new_len);
        }
        self.construction_sidecar.pop();
    }

    pub(crate) fn set_construction_index(&mut self, index: IndexValue) {
        if let Some(sidecar) = self.construction_sidecar.last_mut() {
            sidecar.current_index = index;
        }
    }

    pub(crate) fn set_construction_current_value(&mut self, value: NodeHandle) {
        let depth = self.construction_sidecar.len();
        if depth == 0 {
            return;
        }
        if let Some(children) = self.construction_stack.ordered_children_mut() {
            children[(depth - 1) * CONSTRUCTION_NODES_PER_FRAME + CURRENT_VALUE_OFFSET] = value;
        }
    }

    pub(crate) fn set_construction_previous_result(&mut self, result: NodeRef) {
        let depth = self.construction_sidecar.len();
        if depth == 0 {
            return;
        }
        if let Some(children) = self.construction_stack.ordered_children_mut() {
            children[(depth - 1) * CONSTRUCTION_NODES_PER_FRAME + PREVIOUS_RESULT_OFFSET] =
                result.node;
        }
        if let Some(sidecar) = self.construction_sidecar.last_mut() {
            sidecar.previous_result_unique = result.unique;
        }
    }

    /// Reads one slot of the construction frame `depth` levels up.
    pub(crate) fn get_construction_slot(&self, depth: usize, offset: usize) -> Option<NodeHandle> {
        let frames = self.construction_sidecar.len();
        if depth >= frames {
            return None;
        }
        let frame = frames - 1 - depth;
        self.construction_stack
            .ordered_children()
            .get(frame * CONSTRUCTION_NODES_PER_FRAME + offset)
            .copied()
    }

    pub(crate) fn get_construction_sidecar(&self, depth: usize) -> Option<&ConstructionSidecar> {
        let frames = self.construction_sidecar.len();
        if depth >= frames {
            return None;
        }
        Some(&self.construction_sidecar[frames - 1 - depth])
    }

    /// Marks a memory write on every construction frame, preventing
    /// aggressive freeing of inputs by concurrent reducers.
    pub(crate) fn note_side_effect(&mut self) {
        for sidecar in &mut self.construction_sidecar {
            sidecar.side_effect_occurred = true;
        }
    }

    // --- shared helpers for opcode modules ---

    /// Unwraps one `conclude`/`return` layer, freeing the wrapper node.
    pub(crate) fn remove_top_conclude_or_return_node(&mut self, result: NodeRef) -> NodeRef {
        if result.is_null() {
            return NodeRef::NULL;
        }
        let children = result.node.children_copy();
        let inner = children.first().copied().unwrap_or(NodeHandle::NULL);
        if result.unique_top {
            // detach the child so freeing the wrapper leaves it alive
            if let Some(wrapper_children) = result.node.ordered_children_mut() {
                wrapper_children.clear();
            }
            self.enm().free_node(result.node);
        }
        NodeRef {
            node: inner,
            unique: result.unique,
            unique_top: result.unique,
        }
    }

    /// Evaluates a child to an interned string id with a reference the
    /// caller must destroy.
    pub(crate) fn interpret_node_into_string_id_with_reference(
        &mut self,
        en: NodeHandle,
    ) -> StringId {
        let value = self.interpret_node_for_immediate_use(en);
        let sid = compare::to_string_id_with_reference(value.node);
        self.enm().free_node_tree_if_possible(value);
        sid
    }

    /// Evaluates a child to a number.
    pub(crate) fn interpret_node_into_number(&mut self, en: NodeHandle, default: f64) -> f64 {
        let value = self.interpret_node_for_immediate_use(en);
        let number = compare::to_number(value.node, default);
        self.enm().free_node_tree_if_possible(value);
        number
    }

    /// Evaluates a child to a boolean.
    pub(crate) fn interpret_node_into_bool(&mut self, en: NodeHandle) -> bool {
        let value = self.interpret_node_for_immediate_use(en);
        let truth = compare::is_true(value.node);
        self.enm().free_node_tree_if_possible(value);
        truth
    }

    /// Allocates the boolean result nodes opcodes return.
    pub(crate) fn alloc_bool(&self, value: bool) -> NodeRef {
        NodeRef::new(self.enm().alloc_bool_node(value), true)
    }

    pub(crate) fn alloc_number(&self, value: f64) -> NodeRef {
        NodeRef::new(self.enm().alloc_number_node(value), true)
    }

    pub(crate) fn alloc_string(&self, value: &str) -> NodeRef {
        NodeRef::new(self.enm().alloc_string_node(value), true)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        let enm = self.entity.node_manager();
        enm.clear_thread_local_allocation_buffer();
        for &stack in &[self.call_stack, self.opcode_stack, self.construction_stack] {
            enm.free_node_reference(stack);
        }
    }
}

/// An evaluation result pinned in its entity's manager; the pin is
/// released on drop.
pub struct ExecutionResult {
    pub value: NodeRef,
    entity: Arc<Entity>,
}

impl ExecutionResult {
    pub fn node(&self) -> NodeHandle {
        self.value.node
    }

    /// The result as a number, NaN when not numeric.
    pub fn to_number(&self) -> f64 {
        compare::to_number(self.value.node, f64::NAN)
    }

    pub fn to_string_value(&self) -> Option<String> {
        compare::to_string(self.value.node)
    }

    pub fn unparse(&self) -> String {
        crate::code::unparse_node(self.value.node)
    }
}

impl Drop for ExecutionResult {
    fn drop(&mut self) {
        if !self.value.is_null() {
            self.entity.node_manager().free_node_reference(self.value.node);
        }
    }
}

impl Entity {
    /// Top-level evaluation entry: creates an interpreter rooted at this
    /// entity and evaluates `code` (which may live in any manager; it is
    /// copied in first).
    pub fn execute(
        self: &Arc<Entity>,
        code: NodeHandle,
        constraints: Option<InterpreterConstraints>,
    ) -> (ExecutionResult, Option<ConstraintViolation>) {
        let mut interpreter = Interpreter::new(self.clone(), constraints);
        let local = self
            .node_manager()
            .deep_alloc_copy(code, MetadataModifier::NoChange);
        let result = interpreter.evaluate_and_keep(local.node);
        let violation = interpreter.constraint_violation();
        (
            ExecutionResult {
                value: result,
                entity: self.clone(),
            },
            violation,
        )
    }

    /// Parses and evaluates source text against this entity.
    pub fn execute_source(
        self: &Arc<Entity>,
        src: &str,
        constraints: Option<InterpreterConstraints>,
    ) -> (ExecutionResult, Option<ConstraintViolation>) {
        let mut interpreter = Interpreter::new(self.clone(), constraints);
        let (code, warnings) = crate::code::parse_to_node(src, self.node_manager());
        for warning in &warnings {
            log::warn!("parse: {warning}");
        }
        let result = interpreter.evaluate_and_keep(code.node);
        let violation = interpreter.constraint_violation();
        (
            ExecutionResult {
                value: result,
                entity: self.clone(),
            },
            violation,
        )
    }

    /// Evaluates the code at a label, the way `call_entity` enters an
    /// entity from outside.
    pub fn execute_label(
        self: &Arc<Entity>,
        label: StringId,
        constraints: Option<InterpreterConstraints>,
    ) -> (ExecutionResult, Option<ConstraintViolation>) {
        let code = self.value_at_label(label, None, true, false);
        self.execute(code.node, constraints)
    }
}

/// Resolves a string to the keyword's node type, for `apply` and friends.
pub(crate) fn node_type_from_string(s: &str) -> Option<NodeType> {
    NodeType::from_keyword(s)
}
