//! Process-lifetime concurrency services.
//!
//! The runtime shares one thread pool across all interpreters; per-opcode
//! concurrency and parallel GC marking both schedule onto it.

use amalgam_thread_pool::ThreadPool;
use std::sync::{Arc, LazyLock};

static THREAD_POOL: LazyLock<Arc<ThreadPool>> = LazyLock::new(|| Arc::new(ThreadPool::new(0)));

static URGENT_THREAD_POOL: LazyLock<Arc<ThreadPool>> =
    LazyLock::new(|| Arc::new(ThreadPool::new(0)));

/// The process-wide thread pool service.
pub fn thread_pool() -> &'static Arc<ThreadPool> {
    &THREAD_POOL
}

/// A separate pool for work that must not queue behind interpreter tasks,
/// such as parallel GC marking while the collector holds the exclusive
/// memory-modification lock.
pub fn urgent_thread_pool() -> &'static Arc<ThreadPool> {
    &URGENT_THREAD_POOL
}

/// Number of threads currently executing tasks.
pub fn num_active_threads() -> i32 {
    THREAD_POOL.num_active_threads()
}

/// Maximum number of concurrently active threads.
pub fn max_num_threads() -> i32 {
    THREAD_POOL.max_num_active_threads()
}

/// Resizes the pool; gated by the `alter_performance` permission at the
/// opcode layer.
pub fn set_max_num_threads(n: i32) {
    THREAD_POOL.set_max_num_active_threads(n);
}
