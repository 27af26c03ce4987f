//! A flexible thread pool for generic tasks aimed at keeping a specified
//! number of CPU cores worth of compute active at any one time. Because
//! threads are sometimes idle waiting on other threads to complete, the total
//! number of threads in the pool may exceed the number of allowed active
//! threads.
//!
//! Threads have four states:
//!
//! * *available* -- ready and waiting for a task
//! * *active* -- currently executing a task
//! * *waiting* -- idle, waiting for other threads to finish tasks; this
//!   allows another thread to be created or to move from reserve to available
//! * *reserved* -- idle, but not accepting tasks because the number of active
//!   plus available threads already equals the maximum number of active
//!   threads
//!
//! The reserved-thread protocol exists to avoid deadlock on nested waits: an
//! active worker that blocks on a set of subtasks it just enqueued gives its
//! slot up first, so there is always a thread left to run those subtasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    /// Tasks for the pool to complete.
    task_queue: VecDeque<Task>,
    /// The number of threads that can be active at any time. The total
    /// number of threads is active + reserved + idle.
    max_num_active_threads: i32,
    /// Number of threads currently running a task (or the main thread).
    num_active_threads: i32,
    /// Number of threads currently held in reserve that can be activated to
    /// replace an existing thread that is blocked.
    num_reserved_threads: i32,
    /// If positive, threads becoming available should transition to
    /// reserved and decrement this; if negative, reserved threads should
    /// increment it and become available again.
    num_threads_to_transition_to_reserved: i32,
    /// When true, all threads should end work so they can be joined.
    shutdown_threads: bool,
    /// Join handles for every spawned worker.
    threads: Vec<thread::JoinHandle<()>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Notifies threads when work arrives (or shutdown begins).
    wait_for_task: Condvar,
    /// Notifies reserved threads when one should activate (or shutdown).
    wait_for_activate: Condvar,
}

/// A fixed-roster worker pool with a FIFO task queue and the
/// reserved-thread protocol described in the crate docs.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

/// A held lock on the task queue, used to enqueue a group of tasks
/// atomically via [`ThreadPool::batch_enqueue_task`].
pub struct TaskLock<'a> {
    guard: Option<MutexGuard<'a, PoolState>>,
    shared: &'a PoolShared,
}

impl TaskLock<'_> {
    /// Returns true if there is at least one spare thread available beyond
    /// the tasks already queued. Callers use this to decide whether a batch
    /// of interdependent tasks can safely run concurrently.
    pub fn are_threads_available(&self) -> bool {
        let state = self.guard.as_ref().expect("task lock already released");
        let num_threads_requested = (state.num_active_threads
            - state.num_threads_to_transition_to_reserved)
            + state.task_queue.len() as i32;
        num_threads_requested < state.max_num_active_threads
    }

    /// Enqueues a task without notifying workers; the notification happens
    /// when the lock is released.
    pub fn batch_enqueue_task(&mut self, task: impl FnOnce() + Send + 'static) {
        let state = self.guard.as_mut().expect("task lock already released");
        state.task_queue.push_back(Box::new(task));
    }

    /// Releases the lock and wakes all workers to drain the batch.
    pub fn unlock_and_notify(mut self) {
        drop(self.guard.take());
        self.shared.wait_for_task.notify_all();
    }
}

impl Drop for TaskLock<'_> {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            self.shared.wait_for_task.notify_all();
        }
    }
}

impl ThreadPool {
    /// Creates a pool that will keep `max_num_active_threads` cores busy; 0
    /// selects the hardware concurrency.
    pub fn new(max_num_active_threads: i32) -> Self {
        let pool = ThreadPool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    task_queue: VecDeque::new(),
                    max_num_active_threads: 1,
                    // the main thread counts as one active thread
                    num_active_threads: 1,
                    num_reserved_threads: 0,
                    num_threads_to_transition_to_reserved: 0,
                    shutdown_threads: false,
                    threads: Vec::new(),
                }),
                wait_for_task: Condvar::new(),
                wait_for_activate: Condvar::new(),
            }),
        };
        pool.set_max_num_active_threads(max_num_active_threads);
        pool
    }

    /// Changes the maximum number of active threads. If
    /// `max_num_active_threads` is 0, uses the number of cores reported by
    /// the hardware.
    pub fn set_max_num_active_threads(&self, max_num_active_threads: i32) {
        let mut new_max = max_num_active_threads;
        if new_max == 0 {
            new_max = thread::available_parallelism().map_or(1, |n| n.get() as i32);
        }

        let mut state = self.shared.state.lock().unwrap();
        if new_max == state.max_num_active_threads || new_max < 1 {
            return;
        }

        // if reducing the thread count, drain all jobs and clear out all
        // threads before building back up
        if new_max < state.max_num_active_threads {
            drop(state);
            self.shutdown_all_threads();
            state = self.shared.state.lock().unwrap();

            state.threads.clear();
            state.shutdown_threads = false;
            state.max_num_active_threads = 1;
            state.num_active_threads = 1;
            state.num_reserved_threads = 0;
        }

        // the current thread counts as one
        for _ in state.threads.len() as i32..new_max - 1 {
            self.add_new_thread(&mut state);
        }
        state.max_num_active_threads = new_max;
        log::debug!("thread pool sized to {new_max} active threads");

        drop(state);
        self.shared.wait_for_task.notify_all();
    }

    /// Returns the current maximum number of active threads.
    pub fn max_num_active_threads(&self) -> i32 {
        self.shared.state.lock().unwrap().max_num_active_threads
    }

    /// Returns the number of threads currently performing tasks.
    pub fn num_active_threads(&self) -> i32 {
        self.shared.state.lock().unwrap().num_active_threads
    }

    /// Enqueues a task; it is up to the caller to determine when the task is
    /// complete.
    pub fn enqueue_task(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.task_queue.push_back(Box::new(task));
        }
        self.shared.wait_for_task.notify_one();
    }

    /// Acquires the queue lock to enqueue a batch of tasks atomically or to
    /// query thread availability.
    pub fn acquire_task_lock(&self) -> TaskLock<'_> {
        TaskLock {
            guard: Some(self.shared.state.lock().unwrap()),
            shared: &self.shared,
        }
    }

    /// Changes the current thread state from active to waiting. Intended to
    /// be called before blocking on other threads' tasks; converts a
    /// reserved thread back to available or grows the pool so the tasks
    /// being waited on can actually run.
    pub fn change_current_thread_state_from_active_to_waiting(&self) {
        let mut state = self.shared.state.lock().unwrap();

        let task_queue_size = state.task_queue.len();
        let mut num_threads_needed = state.max_num_active_threads;
        if task_queue_size < state.max_num_active_threads as usize {
            num_threads_needed = task_queue_size as i32;
        }

        let cur_thread_pool_size = state.threads.len() as i32;
        let needed_thread_pool_size = (state.num_reserved_threads
            + state.num_threads_to_transition_to_reserved)
            + num_threads_needed;
        if cur_thread_pool_size < needed_thread_pool_size {
            // if there are reserved threads, use one, otherwise create new
            // threads
            if state.num_reserved_threads > 0 {
                state.num_threads_to_transition_to_reserved -= 1;
                self.shared.wait_for_activate.notify_one();
            } else {
                for _ in cur_thread_pool_size..needed_thread_pool_size {
                    self.add_new_thread(&mut state);
                    self.shared.wait_for_task.notify_one();
                }
            }
        }

        state.num_active_threads -= 1;
    }

    /// Changes the current thread state from waiting back to active, as the
    /// counterpart of
    /// [`change_current_thread_state_from_active_to_waiting`](Self::change_current_thread_state_from_active_to_waiting).
    pub fn change_current_thread_state_from_waiting_to_active(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.num_active_threads += 1;

        // if there are now more active threads than allowed, transition
        // another one to reserved
        if state.num_active_threads > state.max_num_active_threads {
            state.num_threads_to_transition_to_reserved += 1;
            self.shared.wait_for_task.notify_one();
        }
    }

    /// Creates a [`CountableTaskSet`] for this pool.
    pub fn create_countable_task_set(self: &Arc<Self>, num_tasks: usize) -> CountableTaskSet {
        CountableTaskSet::new(self.clone(), num_tasks)
    }

    fn add_new_thread(&self, state: &mut PoolState) {
        let shared = self.shared.clone();
        state.threads.push(thread::spawn(move || {
            let mut state = shared.state.lock().unwrap();

            // count this thread as active during startup; the loop assumes
            // the default state of the thread is to count itself so the
            // number of active threads doesn't change when switching between
            // a completed task and a new one
            state.num_active_threads += 1;

            loop {
                if state.num_threads_to_transition_to_reserved > 0 {
                    // go into reserve
                    state.num_active_threads -= 1;
                    state.num_threads_to_transition_to_reserved -= 1;
                    state.num_reserved_threads += 1;

                    state = shared
                        .wait_for_activate
                        .wait_while(state, |s| {
                            s.num_threads_to_transition_to_reserved >= 0 && !s.shutdown_threads
                        })
                        .unwrap();

                    if state.shutdown_threads {
                        return;
                    }

                    // coming out of reserve
                    state.num_active_threads += 1;
                    state.num_threads_to_transition_to_reserved += 1;
                    state.num_reserved_threads -= 1;
                } else {
                    if state.task_queue.is_empty() {
                        state.num_active_threads -= 1;

                        state = shared
                            .wait_for_task
                            .wait_while(state, |s| {
                                s.task_queue.is_empty()
                                    && s.num_threads_to_transition_to_reserved <= 0
                                    && !s.shutdown_threads
                            })
                            .unwrap();

                        if state.shutdown_threads {
                            return;
                        }

                        state.num_active_threads += 1;

                        // if transitioning to reserved, don't grab a task
                        if state.num_threads_to_transition_to_reserved > 0 {
                            continue;
                        }
                        if state.task_queue.is_empty() {
                            continue;
                        }
                    }

                    let task = state.task_queue.pop_front().unwrap();
                    drop(state);
                    task();
                    state = shared.state.lock().unwrap();
                }
            }
        }));
    }

    fn shutdown_all_threads(&self) {
        let threads;
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown_threads = true;
            threads = std::mem::take(&mut state.threads);
        }

        self.shared.wait_for_task.notify_all();
        self.shared.wait_for_activate.notify_all();
        for worker in threads {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown_all_threads();
    }
}

struct TaskSetState {
    num_tasks: usize,
    num_tasks_completed: usize,
}

/// A counter for a set of tasks; [`CountableTaskSet::wait_for_tasks`]
/// returns once every task has been marked complete.
pub struct CountableTaskSet {
    // the counters are not atomic as the condvar needs a mutex around any
    // change of value anyway
    state: Mutex<TaskSetState>,
    cond_var: Condvar,
    thread_pool: Arc<ThreadPool>,
    any_failure: AtomicBool,
}

impl CountableTaskSet {
    /// Creates a set expecting `num_tasks` completions on `thread_pool`.
    pub fn new(thread_pool: Arc<ThreadPool>, num_tasks: usize) -> Self {
        CountableTaskSet {
            state: Mutex::new(TaskSetState {
                num_tasks,
                num_tasks_completed: 0,
            }),
            cond_var: Condvar::new(),
            thread_pool,
            any_failure: AtomicBool::new(false),
        }
    }

    /// Increments the number of expected tasks by `num_new_tasks`.
    pub fn add_task(&self, num_new_tasks: usize) {
        let mut state = self.state.lock().unwrap();
        state.num_tasks += num_new_tasks;
    }

    /// Returns when all the tasks have been completed. If
    /// `task_enqueue_lock` is provided it is released first so the batch can
    /// begin execution. Performs the active→waiting transition around the
    /// block so a worker slot is freed for the subtasks.
    pub fn wait_for_tasks(&self, task_enqueue_lock: Option<TaskLock<'_>>) {
        if let Some(lock) = task_enqueue_lock {
            lock.unlock_and_notify();
        }

        self.thread_pool
            .change_current_thread_state_from_active_to_waiting();

        {
            let state = self.state.lock().unwrap();
            let _unused = self
                .cond_var
                .wait_while(state, |s| s.num_tasks_completed < s.num_tasks)
                .unwrap();
        }

        self.thread_pool
            .change_current_thread_state_from_waiting_to_active();
    }

    /// Marks one task as completed.
    pub fn mark_task_completed(&self) {
        let mut state = self.state.lock().unwrap();
        state.num_tasks_completed += 1;
        if state.num_tasks_completed == state.num_tasks {
            drop(state);
            self.cond_var.notify_all();
        }
    }

    /// Marks one task as completed from the thread setting up the tasks,
    /// before `wait_for_tasks` has been entered.
    pub fn mark_task_completed_before_wait_for_tasks(&self) {
        let mut state = self.state.lock().unwrap();
        state.num_tasks_completed += 1;
    }

    /// Records that a task failed; readable after the wait completes.
    pub fn set_failure(&self) {
        self.any_failure.store(true, Ordering::Relaxed);
    }

    /// Returns true if any task called [`set_failure`](Self::set_failure).
    pub fn any_failure(&self) -> bool {
        self.any_failure.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_simple_tasks() {
        let pool = Arc::new(ThreadPool::new(4));
        let counter = Arc::new(AtomicUsize::new(0));

        let task_set = Arc::new(pool.create_countable_task_set(16));
        for _ in 0..16 {
            let counter = counter.clone();
            let task_set = task_set.clone();
            pool.enqueue_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                task_set.mark_task_completed();
            });
        }
        task_set.wait_for_tasks(None);
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn nested_waits_do_not_deadlock() {
        let pool = Arc::new(ThreadPool::new(2));
        let done = Arc::new(AtomicUsize::new(0));

        // every worker waits on a subtask; without the reserved-thread
        // protocol two workers waiting on two subtasks would deadlock
        let outer = Arc::new(pool.create_countable_task_set(2));
        for _ in 0..2 {
            let pool = pool.clone();
            let outer = outer.clone();
            let done = done.clone();
            pool.clone().enqueue_task(move || {
                let inner = Arc::new(pool.create_countable_task_set(1));
                let inner2 = inner.clone();
                let done2 = done.clone();
                pool.enqueue_task(move || {
                    done2.fetch_add(1, Ordering::SeqCst);
                    inner2.mark_task_completed();
                });
                inner.wait_for_tasks(None);
                outer.mark_task_completed();
            });
        }
        outer.wait_for_tasks(None);
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_enqueue_runs_atomically() {
        let pool = Arc::new(ThreadPool::new(3));
        let counter = Arc::new(AtomicUsize::new(0));
        let task_set = Arc::new(pool.create_countable_task_set(8));

        let mut lock = pool.acquire_task_lock();
        for _ in 0..8 {
            let counter = counter.clone();
            let task_set = task_set.clone();
            lock.batch_enqueue_task(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                task_set.mark_task_completed();
            });
        }
        task_set.wait_for_tasks(Some(lock));
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
