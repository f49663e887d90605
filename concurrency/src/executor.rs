//! An elastic thread pool with low/high watermarks, a bounded backlog, and
//! idle-timeout-driven reaping.
//!
//! Workers are joinable (`JoinHandle`) rather than detached threads that
//! self-remove from a shared vector; `stop(true)` joins every handle after
//! the pool reaches `Stopped`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Run,
    Stopping,
    Stopped,
}

struct PoolState {
    run_state: RunState,
    tasks: VecDeque<Task>,
    worker_count: usize,
    busy: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<PoolState>,
    non_empty: Condvar,
    all_stopped: Condvar,
    low: usize,
    high: usize,
    max_queue: usize,
    idle_time: Duration,
}

/// A bounded worker pool. Construction immediately starts `low` workers;
/// `execute` admits closures under a fixed ordered policy;
/// `stop` drains and, if `await` is requested, blocks until every worker
/// has exited.
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    /// Starts a pool with `low` workers running immediately. Requires
    /// `low <= high`.
    pub fn new(low: usize, high: usize, max_queue: usize, idle_time: Duration) -> Self {
        assert!(low <= high, "low watermark must not exceed high watermark");

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                run_state: RunState::Run,
                tasks: VecDeque::new(),
                worker_count: 0,
                busy: 0,
                handles: Vec::new(),
            }),
            non_empty: Condvar::new(),
            all_stopped: Condvar::new(),
            low,
            high,
            max_queue,
            idle_time,
        });

        {
            let mut guard = shared.state.lock().unwrap();
            for _ in 0..low {
                spawn_worker(&shared, &mut guard);
            }
        }

        Self { shared }
    }

    /// Attempts to admit `task` for execution. Returns whether it was
    /// admitted, per the ordered admission policy: reuse an idle worker,
    /// else spawn up to `high`, else queue up to `max_queue`, else reject.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.shared.state.lock().unwrap();

        if guard.run_state != RunState::Run {
            return false;
        }

        if guard.worker_count > guard.busy {
            guard.tasks.push_back(Box::new(task));
            self.shared.non_empty.notify_one();
            return true;
        }

        if guard.worker_count < self.shared.high {
            spawn_worker(&self.shared, &mut guard);
            guard.tasks.push_back(Box::new(task));
            self.shared.non_empty.notify_one();
            return true;
        }

        if guard.tasks.len() < self.shared.max_queue {
            guard.tasks.push_back(Box::new(task));
            return true;
        }

        false
    }

    /// Signals the pool to stop accepting new tasks. Already-enqueued tasks
    /// still run to completion. If `await` is set, blocks until every
    /// worker has exited and joins their handles.
    pub fn stop(&self, await_completion: bool) {
        let handles = {
            let mut guard = self.shared.state.lock().unwrap();
            if guard.run_state == RunState::Run {
                guard.run_state = RunState::Stopping;
            }
            self.shared.non_empty.notify_all();

            if guard.worker_count == 0 {
                guard.run_state = RunState::Stopped;
                self.shared.all_stopped.notify_all();
            }

            if !await_completion {
                return;
            }

            while guard.run_state != RunState::Stopped {
                guard = self.shared.all_stopped.wait(guard).unwrap();
            }
            std::mem::take(&mut guard.handles)
        };

        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Number of workers currently alive. Exposed for tests and metrics;
    /// not part of the admission contract.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().unwrap().worker_count
    }

    /// Number of tasks presently enqueued and not yet picked up.
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().unwrap().tasks.len()
    }

    /// Number of workers currently executing a task. Exposed for tests.
    pub fn busy_count(&self) -> usize {
        self.shared.state.lock().unwrap().busy
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn spawn_worker(shared: &Arc<Shared>, guard: &mut PoolState) {
    guard.worker_count += 1;
    let shared = shared.clone();
    let handle = thread::spawn(move || worker_loop(shared));
    guard.handles.push(handle);
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut guard = shared.state.lock().unwrap();
            loop {
                if let Some(task) = guard.tasks.pop_front() {
                    guard.busy += 1;
                    break task;
                }

                if guard.run_state != RunState::Run {
                    guard.worker_count -= 1;
                    if guard.worker_count == 0 {
                        guard.run_state = RunState::Stopped;
                        shared.all_stopped.notify_all();
                    }
                    return;
                }

                let (next_guard, timeout) = shared
                    .non_empty
                    .wait_timeout(guard, shared.idle_time)
                    .unwrap();
                guard = next_guard;

                if timeout.timed_out() && guard.tasks.is_empty() && guard.run_state == RunState::Run
                {
                    if guard.worker_count > shared.low {
                        guard.worker_count -= 1;
                        debug!("reaping idle worker above low watermark");
                        return;
                    }
                    // At the floor: keep waiting regardless of timeout.
                }
            }
        };

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("task panicked; pool continues");
        }

        let mut guard = shared.state.lock().unwrap();
        guard.busy -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn starts_with_low_workers() {
        let exec = Executor::new(2, 4, 8, Duration::from_millis(50));
        assert_eq!(exec.worker_count(), 2);
        exec.stop(true);
    }

    #[test]
    fn admission_policy_spawns_up_to_high_then_queues_then_rejects() {
        let exec = Executor::new(2, 4, 2, Duration::from_secs(10));
        let release = Arc::new((Mutex::new(false), Condvar::new()));

        let mut admitted = 0;
        for i in 0..8 {
            let release = release.clone();
            let ok = exec.execute(move || {
                let (lock, cv) = &*release;
                let mut done = lock.lock().unwrap();
                while !*done {
                    done = cv.wait(done).unwrap();
                }
            });
            if ok {
                admitted += 1;
            }

            // Give a just-spawned/just-woken worker time to dequeue and
            // mark itself busy before the next admission decision is made,
            // so the admission policy below is exercised deterministically.
            let expect_busy = (i + 1).min(4);
            for _ in 0..200 {
                if exec.busy_count() >= expect_busy {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        // 4 running (spawned up to high) + 2 queued = 6 admitted, 2 rejected.
        assert_eq!(admitted, 6);
        assert_eq!(exec.worker_count(), 4);

        {
            let (lock, cv) = &*release;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        exec.stop(true);
    }

    #[test]
    fn idle_workers_above_low_are_reaped() {
        let exec = Executor::new(1, 4, 8, Duration::from_millis(30));
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let count = count.clone();
            exec.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        // Give the instant tasks time to run, then let idle-reap kick in.
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(exec.worker_count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 4);
        exec.stop(true);
    }

    #[test]
    fn stop_await_runs_every_submitted_task_and_rejects_new_ones() {
        let exec = Executor::new(2, 2, 8, Duration::from_millis(50));
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let count = count.clone();
            exec.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        exec.stop(true);
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(!exec.execute(|| {}));
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let exec = Executor::new(1, 1, 8, Duration::from_millis(50));
        assert!(exec.execute(|| panic!("boom")));

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        assert!(exec.execute(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        exec.stop(true);
    }

    #[test]
    fn zero_low_watermark_stops_cleanly_with_no_workers_ever_spawned() {
        let exec = Executor::new(0, 2, 4, Duration::from_millis(50));
        assert_eq!(exec.worker_count(), 0);
        exec.stop(true);
    }
}
