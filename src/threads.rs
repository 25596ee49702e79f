//! Named worker pools with awaitable task handles.
//!
//! Two pools exist: `Common` for CPU-bound query merges and `DiskIo`,
//! sized to a single thread so compaction writes are strictly
//! serialized. Posting returns a handle the caller may wait on, poll,
//! or drop. In debug builds every task asserts it runs on the pool it
//! was declared for.

use crate::error::StoreError;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Workload category a task is posted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Common,
    DiskIo,
}

/// Context handed to every running task.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    pub kind: ThreadKind,
    pub thread_number: usize,
}

type Task = Box<dyn FnOnce(&ThreadInfo) + Send + 'static>;

#[derive(Debug, Default)]
struct DoneState {
    done: Mutex<bool>,
    cv: Condvar,
}

/// Completion handle for a posted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<DoneState>,
}

impl TaskHandle {
    fn new() -> Self {
        TaskHandle { state: Arc::new(DoneState::default()) }
    }

    fn mark_done(&self) {
        if let Ok(mut d) = self.state.done.lock() {
            *d = true;
        }
        self.state.cv.notify_all();
    }

    /// Blocks until the task has run (or panicked).
    pub fn wait(&self) {
        let Ok(mut d) = self.state.done.lock() else { return };
        while !*d {
            match self.state.cv.wait(d) {
                Ok(guard) => d = guard,
                Err(_) => return,
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.done.lock().map(|d| *d).unwrap_or(true)
    }
}

struct PoolState {
    tasks: VecDeque<(Task, TaskHandle)>,
    running: usize,
    stop: bool,
}

struct Pool {
    state: Arc<(Mutex<PoolState>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    fn start(kind: ThreadKind, threads: usize) -> Pool {
        let state = Arc::new((
            Mutex::new(PoolState { tasks: VecDeque::new(), running: 0, stop: false }),
            Condvar::new(),
        ));
        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let state = Arc::clone(&state);
            let info = ThreadInfo { kind, thread_number: n };
            let name = format!("strata-{}-{}", kind_name(kind), n);
            workers.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || worker_loop(state, info))
                    .expect("spawn pool worker"),
            );
        }
        Pool { state, workers: Mutex::new(workers) }
    }

    fn post(&self, task: Task) -> Result<TaskHandle, StoreError> {
        let handle = TaskHandle::new();
        {
            let (lock, cv) = &*self.state;
            let mut st = lock.lock()?;
            if st.stop {
                return Err(StoreError::AlreadyStopped);
            }
            st.tasks.push_back((task, handle.clone()));
            // notify_all: flush() waits on the same condvar, so a single
            // wakeup could land on it instead of a worker.
            cv.notify_all();
        }
        Ok(handle)
    }

    /// Waits until the queue is empty and nothing is running.
    fn flush(&self) -> Result<(), StoreError> {
        let (lock, cv) = &*self.state;
        let mut st = lock.lock()?;
        while !st.tasks.is_empty() || st.running > 0 {
            st = cv.wait(st)?;
        }
        Ok(())
    }

    fn stop(&self) {
        let _ = self.flush();
        {
            let (lock, cv) = &*self.state;
            if let Ok(mut st) = lock.lock() {
                st.stop = true;
            }
            cv.notify_all();
        }
        let drained: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(_) => return,
        };
        for w in drained {
            let _ = w.join();
        }
    }
}

fn kind_name(kind: ThreadKind) -> &'static str {
    match kind {
        ThreadKind::Common => "common",
        ThreadKind::DiskIo => "disk-io",
    }
}

fn worker_loop(state: Arc<(Mutex<PoolState>, Condvar)>, info: ThreadInfo) {
    let (lock, cv) = &*state;
    loop {
        let (task, handle) = {
            let Ok(mut st) = lock.lock() else { return };
            loop {
                if let Some(entry) = st.tasks.pop_front() {
                    st.running += 1;
                    break entry;
                }
                if st.stop {
                    return;
                }
                match cv.wait(st) {
                    Ok(guard) => st = guard,
                    Err(_) => return,
                }
            }
        };

        // A panicking task must not take the worker down with it.
        let _ = catch_unwind(AssertUnwindSafe(|| task(&info)));
        handle.mark_done();

        if let Ok(mut st) = lock.lock() {
            st.running -= 1;
        }
        cv.notify_all();
    }
}

/// The engine's thread pools, one per workload category.
pub struct ThreadManager {
    common: Pool,
    disk_io: Pool,
}

impl std::fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadManager").finish_non_exhaustive()
    }
}

pub const COMMON_THREADS: usize = 4;
pub const DISK_IO_THREADS: usize = 1;

impl ThreadManager {
    pub fn start() -> ThreadManager {
        ThreadManager {
            common: Pool::start(ThreadKind::Common, COMMON_THREADS),
            disk_io: Pool::start(ThreadKind::DiskIo, DISK_IO_THREADS),
        }
    }

    /// Posts a task under a pool kind; returns an awaitable handle.
    pub fn post<F>(&self, kind: ThreadKind, f: F) -> Result<TaskHandle, StoreError>
    where
        F: FnOnce(&ThreadInfo) + Send + 'static,
    {
        let pool = self.pool(kind);
        pool.post(Box::new(move |ti: &ThreadInfo| {
            debug_assert_eq!(ti.kind, kind, "task posted to the wrong pool");
            f(ti)
        }))
    }

    /// Waits for both pools to drain.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.common.flush()?;
        self.disk_io.flush()?;
        Ok(())
    }

    /// Drains pending work and joins all workers. Idempotent.
    pub fn stop(&self) {
        self.common.stop();
        self.disk_io.stop();
    }

    fn pool(&self, kind: ThreadKind) -> &Pool {
        match kind {
            ThreadKind::Common => &self.common,
            ThreadKind::DiskIo => &self.disk_io,
        }
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn posted_tasks_run_and_handles_wait() {
        let tm = ThreadManager::start();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let c = Arc::clone(&counter);
            handles.push(
                tm.post(ThreadKind::Common, move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for h in handles {
            h.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn disk_io_pool_is_single_threaded() {
        let tm = ThreadManager::start();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            handles.push(
                tm.post(ThreadKind::DiskIo, move |_| {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    std::thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for h in handles {
            h.wait();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0, "disk-io tasks overlapped");
    }

    #[test]
    fn tasks_see_their_declared_kind() {
        let tm = ThreadManager::start();
        let h = tm
            .post(ThreadKind::DiskIo, |ti| {
                assert_eq!(ti.kind, ThreadKind::DiskIo);
            })
            .unwrap();
        h.wait();
    }

    #[test]
    fn flush_waits_for_queue_to_drain() {
        let tm = ThreadManager::start();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let c = Arc::clone(&counter);
            tm.post(ThreadKind::Common, move |_| {
                std::thread::sleep(Duration::from_millis(1));
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        tm.flush().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn stop_is_idempotent_and_rejects_new_work() {
        let tm = ThreadManager::start();
        tm.stop();
        tm.stop();
        let err = tm.post(ThreadKind::Common, |_| {}).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyStopped));
    }

    #[test]
    fn panicking_task_does_not_kill_the_pool() {
        let tm = ThreadManager::start();
        let h = tm.post(ThreadKind::Common, |_| panic!("boom")).unwrap();
        h.wait();
        let ok = tm.post(ThreadKind::Common, |_| {}).unwrap();
        ok.wait();
    }
}
