//! Concurrent evaluation of suitable opcodes over the thread pool.
//!
//! Each task gets a one-way split of the parent's random stream (reserved
//! up front so results are reproducible), a scope stack sharing the
//! parent's frames below the split point (writes there take the shared
//! call-stack write lock; frames the task pushes are private), and a
//! pre-sized result slot so output order matches input order. The parent
//! releases the shared memory-modification lock while blocked on the task
//! set and reacquires it on resume; workers pin their results in the
//! manager's root set until the parent has collected them.

use super::{ConstructionSidecar, IndexValue, Interpreter, InterpreterConstraints};
use crate::entity::Entity;
use crate::node::manager::enter_mutation_phase;
use crate::node::{NodeHandle, NodeRef, NodeType};
use crate::rand_stream::RandomStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// One unit of concurrent work: evaluate `code` with the construction
/// frame's index and value set for it.
pub(crate) struct ConcurrentTask {
    pub code: NodeHandle,
    pub current_value: NodeHandle,
    pub index_value: IndexValue,
}

/// Reduced properties of a batch of concurrent results.
pub(crate) struct ConcurrentOutcome {
    pub results: Vec<NodeRef>,
    pub results_unique: bool,
    pub results_need_cycle_check: bool,
    pub results_idempotent: bool,
    pub results_side_effect: bool,
}

struct SharedTaskState {
    results: Mutex<Vec<NodeRef>>,
    any_side_effect: AtomicBool,
}

impl Interpreter {
    /// True when the pool has a spare thread for a batch of this size.
    pub(crate) fn can_run_concurrently(&self, num_tasks: usize) -> bool {
        if num_tasks < 2 {
            return false;
        }
        let lock = crate::concurrency::thread_pool().acquire_task_lock();
        lock.are_threads_available()
    }

    /// Runs the tasks over the pool, returning results in task order.
    /// `parent_node` is the opcode that opted in; `target` is the
    /// container under construction, visible to tasks via reflection.
    pub(crate) fn interpret_nodes_concurrently(
        &mut self,
        parent_node: NodeHandle,
        target: NodeHandle,
        tasks: Vec<ConcurrentTask>,
    ) -> ConcurrentOutcome {
        let num_tasks = tasks.len();

        // reserve a seed per task before anything runs
        let streams: Vec<RandomStream> = (0..num_tasks)
            .map(|_| self.random_stream.create_other_stream_via_rand())
            .collect();

        let shared = Arc::new(SharedTaskState {
            results: Mutex::new(vec![NodeRef::NULL; num_tasks]),
            any_side_effect: AtomicBool::new(false),
        });

        // tasks share the frames at and below the current depth
        let frames: Vec<NodeHandle> = self.call_stack.ordered_children().to_vec();
        let shared_lock = self.call_stack_lock.clone();
        let constraints = self.constraints.clone();

        let pool = crate::concurrency::thread_pool().clone();
        let task_set = Arc::new(pool.create_countable_task_set(num_tasks));

        let mut enqueue_lock = pool.acquire_task_lock();
        for (task_index, (task, stream)) in tasks.into_iter().zip(streams).enumerate() {
            let entity = self.entity.clone();
            let frames = frames.clone();
            let shared_lock = shared_lock.clone();
            let shared = shared.clone();
            let task_set = task_set.clone();
            let constraints = constraints.clone();
            enqueue_lock.batch_enqueue_task(move || {
                let result = run_concurrent_task(
                    entity,
                    frames,
                    shared_lock,
                    stream,
                    constraints,
                    parent_node,
                    target,
                    task,
                    &shared.any_side_effect,
                );
                shared.results.lock().unwrap()[task_index] = result;
                task_set.mark_task_completed();
            });
        }

        // release the mutation phase while blocked so a collection (or the
        // workers' own progress) is never stalled on this thread
        self.enm().clear_thread_local_allocation_buffer();
        self.memory_guard = None;
        task_set.wait_for_tasks(Some(enqueue_lock));
        self.memory_guard = Some(enter_mutation_phase());

        let results = std::mem::take(&mut *shared.results.lock().unwrap());
        let mut outcome = ConcurrentOutcome {
            results_unique: true,
            results_need_cycle_check: false,
            results_idempotent: true,
            results_side_effect: shared.any_side_effect.load(Ordering::Relaxed),
            results: Vec::new(),
        };
        for result in &results {
            outcome.results_unique &= result.unique;
            if !result.is_null() {
                outcome.results_need_cycle_check |= result.node.need_cycle_check();
                outcome.results_idempotent &= result.node.is_idempotent();
                // release the worker's pin now that this thread holds the
                // mutation phase again
                self.enm().free_node_reference(result.node);
            }
        }
        outcome.results = results;
        if outcome.results_side_effect {
            self.note_side_effect();
        }
        outcome
    }

    /// Concurrent evaluation where results are discarded (`parallel`).
    pub(crate) fn evaluate_concurrently_discarding_results(&mut self, children: &[NodeHandle]) {
        let tasks: Vec<ConcurrentTask> = children
            .iter()
            .map(|&code| ConcurrentTask {
                code,
                current_value: NodeHandle::NULL,
                index_value: IndexValue::None,
            })
            .collect();
        let outcome =
            self.interpret_nodes_concurrently(NodeHandle::NULL, NodeHandle::NULL, tasks);
        for result in outcome.results {
            self.enm().free_node_tree_if_possible(result);
        }
    }
}

/// Body of one worker task: builds a child interpreter over the shared
/// frames, evaluates, and pins the result for the parent.
#[allow(clippy::too_many_arguments)]
fn run_concurrent_task(
    entity: Arc<Entity>,
    frames: Vec<NodeHandle>,
    shared_lock: Arc<RwLock<()>>,
    random_stream: RandomStream,
    constraints: Option<InterpreterConstraints>,
    parent_node: NodeHandle,
    target: NodeHandle,
    task: ConcurrentTask,
    any_side_effect: &AtomicBool,
) -> NodeRef {
    let guard = enter_mutation_phase();
    let enm = entity.node_manager();

    let call_stack = enm.alloc_node(NodeType::List);
    if let Some(children) = call_stack.ordered_children_mut() {
        children.extend_from_slice(&frames);
    }
    call_stack.set_need_cycle_check(true);
    let opcode_stack = enm.alloc_node(NodeType::List);
    let construction_stack = enm.alloc_node(NodeType::List);
    for &stack in &[call_stack, opcode_stack, construction_stack] {
        enm.keep_node_reference(stack);
    }

    let mut interpreter = Interpreter {
        entity: entity.clone(),
        random_stream,
        call_stack,
        call_stack_unique_access_starting_depth: frames.len(),
        call_stack_lock: shared_lock,
        opcode_stack,
        construction_stack,
        construction_sidecar: Vec::new(),
        constraints,
        constraint_violation: None,
        write_listeners: Vec::new(),
        print_listener: None,
        memory_guard: Some(guard),
    };

    if !parent_node.is_null() {
        interpreter.push_construction_context(
            parent_node,
            target,
            task.current_value,
            NodeRef::NULL,
        );
        interpreter.set_construction_index(task.index_value);
    }

    let result = interpreter.interpret_node(task.code, false);

    let side_effect = interpreter
        .construction_sidecar
        .first()
        .map(|s: &ConstructionSidecar| s.side_effect_occurred)
        .unwrap_or(false);
    if side_effect {
        any_side_effect.store(true, Ordering::Relaxed);
    }

    // pin the result across the gap between this worker finishing and the
    // parent reacquiring the mutation phase
    if !result.is_null() {
        enm.keep_node_reference(result.node);
    }
    result
}
