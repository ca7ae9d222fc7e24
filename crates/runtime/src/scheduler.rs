//! Work-stealing scheduler
//!
//! A process-wide pool of OS-thread workers backs async task spawning.
//! Each worker owns a Chase–Lev deque; a single bounded submission queue
//! (mutex + condvar, FIFO) accepts work from outside the pool.
//!
//! ## Worker loop
//!
//! 1. Pop from the worker's own deque (LIFO).
//! 2. Pop one item from the global submission queue (non-blocking).
//! 3. Steal from a random victim, retrying a bounded number of times with
//!    LCG victim selection.
//! 4. Block on the global queue with a short timeout and start over.
//!
//! Submissions from a worker thread go to that worker's own deque (cache
//! locality, no contention on the global queue); external submitters go
//! through the global queue.
//!
//! ## Lifecycle statistics
//!
//! Spawn/complete counters and the concurrency high-water mark are
//! lock-free atomics; the diagnostics dump reads them without stopping the
//! pool. TOTAL_SPAWNED − TOTAL_COMPLETED − in-flight > 0 indicates lost
//! work items.

use crate::deque::StealDeque;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

/// Lifetime count of submitted work items.
pub static TOTAL_SPAWNED: AtomicU64 = AtomicU64::new(0);
/// Lifetime count of completed work items.
pub static TOTAL_COMPLETED: AtomicU64 = AtomicU64::new(0);
/// High-water mark of in-flight work items.
pub static PEAK_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Default worker count: 2 × CPU count, clamped below. The pool is sized
/// past the CPU count because tasks block (join, channel ops, FFI).
const WORKER_MIN: usize = 2;
const WORKER_MAX: usize = 256;

/// Bounded submission queue depth.
const SUBMIT_CAPACITY: usize = 4096;

/// Default bounded steal attempts before falling back to the global queue.
const DEFAULT_STEAL_ATTEMPTS: usize = 8;

/// How long an idle worker parks on the submission queue per round.
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Parse a positive integer environment override, warning and falling back
/// on invalid values.
fn parse_env_count(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(text) => match text.parse::<usize>() {
            Ok(0) => {
                eprintln!("Warning: {}=0 is invalid, using default {}", name, default);
                default
            }
            Ok(n) => n,
            Err(_) => {
                eprintln!(
                    "Warning: {}='{}' is not a valid number, using default {}",
                    name, text, default
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus * 2).clamp(WORKER_MIN, WORKER_MAX)
}

/// One schedulable unit: the job closure plus a completion rendezvous for
/// joiners.
pub struct WorkItem {
    job: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    completed: AtomicBool,
    done: Mutex<bool>,
    cond: Condvar,
}

impl WorkItem {
    fn new(job: Box<dyn FnOnce() + Send + 'static>) -> Arc<WorkItem> {
        Arc::new(WorkItem {
            job: Mutex::new(Some(job)),
            completed: AtomicBool::new(false),
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Execute the job (first caller wins), then publish completion with
    /// release ordering and wake joiners.
    fn run(&self) {
        let job = self.job.lock().expect("work item poisoned").take();
        if let Some(job) = job {
            job();
        }
        self.completed.store(true, Ordering::Release);
        let mut done = self.done.lock().expect("work item poisoned");
        *done = true;
        self.cond.notify_all();

        IN_FLIGHT.fetch_sub(1, Ordering::AcqRel);
        TOTAL_COMPLETED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Block until the item has executed.
    pub fn wait(&self) {
        let mut done = self.done.lock().expect("work item poisoned");
        while !*done {
            done = self
                .cond
                .wait(done)
                .expect("work item poisoned during wait");
        }
    }
}

/// Global FIFO submission queue (mutex + condvar, bounded).
struct SubmitQueue {
    inner: Mutex<VecDeque<*mut WorkItem>>,
    not_empty: Condvar,
    not_full: Condvar,
}

unsafe impl Send for SubmitQueue {}
unsafe impl Sync for SubmitQueue {}

impl SubmitQueue {
    fn new() -> SubmitQueue {
        SubmitQueue {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn push(&self, item: *mut WorkItem) {
        let mut queue = self.inner.lock().expect("submit queue poisoned");
        while queue.len() >= SUBMIT_CAPACITY {
            queue = self
                .not_full
                .wait(queue)
                .expect("submit queue poisoned during push wait");
        }
        queue.push_back(item);
        self.not_empty.notify_one();
    }

    fn try_pop(&self) -> Option<*mut WorkItem> {
        let mut queue = self.inner.lock().expect("submit queue poisoned");
        let item = queue.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Timed blocking pop used by idle workers.
    fn pop_timeout(&self, timeout: Duration) -> Option<*mut WorkItem> {
        let mut queue = self.inner.lock().expect("submit queue poisoned");
        if queue.is_empty() {
            let (guard, _) = self
                .not_empty
                .wait_timeout(queue, timeout)
                .expect("submit queue poisoned during pop wait");
            queue = guard;
        }
        let item = queue.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    fn broadcast(&self) {
        let _queue = self.inner.lock().expect("submit queue poisoned");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

struct PoolShared {
    deques: Vec<StealDeque<WorkItem>>,
    submit: SubmitQueue,
    shutdown: AtomicBool,
    /// Held while flipping `shutdown`, so the flag and the broadcast form
    /// one event for workers blocked on the queue.
    shutdown_mutex: Mutex<()>,
    steal_attempts: usize,
    /// Per-worker executed counts (fairness diagnostics).
    executed: Vec<AtomicU64>,
}

thread_local! {
    /// Index of the pool worker running on this thread, if any.
    static WORKER_INDEX: std::cell::Cell<Option<usize>> =
        const { std::cell::Cell::new(None) };
}

pub struct Pool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Pool {
    /// Build a pool with an explicit worker count (tests); `Pool::global`
    /// applies the environment configuration.
    pub fn new(workers: usize) -> Pool {
        let workers = workers.max(1);
        let steal_attempts =
            parse_env_count("ALDER_STEAL_ATTEMPTS", DEFAULT_STEAL_ATTEMPTS);
        let shared = Arc::new(PoolShared {
            deques: (0..workers).map(|_| StealDeque::new()).collect(),
            submit: SubmitQueue::new(),
            shutdown: AtomicBool::new(false),
            shutdown_mutex: Mutex::new(()),
            steal_attempts,
            executed: (0..workers).map(|_| AtomicU64::new(0)).collect(),
        });

        let threads = (0..workers)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("alder-worker-{index}"))
                    .spawn(move || worker_loop(shared, index))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(workers, steal_attempts, "scheduler pool started");
        Pool {
            shared,
            threads: Mutex::new(threads),
        }
    }

    /// The process-wide pool, started on first use. Worker count honors
    /// `ALDER_WORKERS`.
    pub fn global() -> &'static Pool {
        static POOL: OnceLock<Pool> = OnceLock::new();
        POOL.get_or_init(|| {
            Pool::new(parse_env_count("ALDER_WORKERS", default_worker_count()))
        })
    }

    pub fn worker_count(&self) -> usize {
        self.shared.deques.len()
    }

    /// Submit a job; returns its work item for joining.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Arc<WorkItem> {
        let item = WorkItem::new(Box::new(job));
        TOTAL_SPAWNED.fetch_add(1, Ordering::Relaxed);
        let in_flight = IN_FLIGHT.fetch_add(1, Ordering::AcqRel) + 1;
        let mut peak = PEAK_IN_FLIGHT.load(Ordering::Acquire);
        while in_flight > peak {
            match PEAK_IN_FLIGHT.compare_exchange_weak(
                peak,
                in_flight,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }

        // One strong reference travels through the deque as a raw pointer.
        let raw = Arc::into_raw(Arc::clone(&item)) as *mut WorkItem;

        let own_deque = WORKER_INDEX.with(|cell| cell.get()).and_then(|index| {
            // Submitting from inside the pool: prefer the local deque.
            self.shared.deques.get(index)
        });
        match own_deque {
            Some(deque) => {
                if deque.push(raw).is_err() {
                    // Deque at capacity; overflow to the global queue.
                    self.shared.submit.push(raw);
                }
                // No wakeup needed: idle workers re-check steal targets on
                // their park timeout.
            }
            None => self.shared.submit.push(raw),
        }
        item
    }

    /// Per-worker executed counts snapshot.
    pub fn executed_counts(&self) -> Vec<u64> {
        self.shared
            .executed
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect()
    }

    /// Set the shutdown flag, wake everyone, and join the workers. Each
    /// worker drains its deque and the submission queue before exiting.
    pub fn shutdown(&self) {
        {
            let _guard = self
                .shared
                .shutdown_mutex
                .lock()
                .expect("shutdown mutex poisoned");
            self.shared.shutdown.store(true, Ordering::Release);
            self.shared.submit.broadcast();
        }
        let mut threads = self.threads.lock().expect("pool threads poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("scheduler pool stopped");
    }
}

/// Reclaim one deque pointer into its owning Arc and run it.
fn run_raw(shared: &PoolShared, index: usize, raw: *mut WorkItem) {
    let item = unsafe { Arc::from_raw(raw as *const WorkItem) };
    item.run();
    shared.executed[index].fetch_add(1, Ordering::Relaxed);
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    WORKER_INDEX.with(|cell| cell.set(Some(index)));
    tracing::trace!(worker = index, "worker online");

    // Victim selection: a per-worker LCG (Knuth's MMIX constants), cheap
    // and adequately uniform for picking steal targets.
    let mut lcg: u64 = 0x9E37_79B9_7F4A_7C15_u64.wrapping_mul(index as u64 + 1) | 1;
    let workers = shared.deques.len();

    loop {
        // 1. Own deque, LIFO.
        if let Some(raw) = shared.deques[index].pop() {
            run_raw(&shared, index, raw);
            continue;
        }

        // 2. Global submission queue, non-blocking.
        if let Some(raw) = shared.submit.try_pop() {
            run_raw(&shared, index, raw);
            continue;
        }

        // 3. Random-victim stealing, bounded attempts.
        let mut stolen = false;
        if workers > 1 {
            for _ in 0..shared.steal_attempts {
                lcg = lcg
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                let victim = ((lcg >> 33) as usize) % workers;
                if victim == index {
                    continue;
                }
                if let Some(raw) = shared.deques[victim].steal() {
                    run_raw(&shared, index, raw);
                    stolen = true;
                    break;
                }
            }
        }
        if stolen {
            continue;
        }

        if shared.shutdown.load(Ordering::Acquire) {
            // Drain before exit: own deque first, then the global queue.
            while let Some(raw) = shared.deques[index].pop() {
                run_raw(&shared, index, raw);
            }
            while let Some(raw) = shared.submit.try_pop() {
                run_raw(&shared, index, raw);
            }
            break;
        }

        // 4. Idle: park briefly on the global queue.
        if let Some(raw) = shared.submit.pop_timeout(IDLE_WAIT) {
            run_raw(&shared, index, raw);
        }
    }
    tracing::trace!(worker = index, "worker offline");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_submit_and_wait() {
        let pool = Pool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        let item = {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        item.wait();
        assert!(item.is_completed());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn test_counter_storm() {
        let pool = Pool::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        let items: Vec<_> = (0..10_000)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for item in &items {
            item.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10_000);
        let executed = pool.executed_counts();
        assert_eq!(executed.iter().sum::<u64>(), 10_000);
        pool.shutdown();
    }

    #[test]
    fn test_nested_submission_uses_local_deque() {
        let pool = Arc::new(Pool::new(2));
        let counter = Arc::new(AtomicU32::new(0));
        let outer = {
            let counter = Arc::clone(&counter);
            let pool_ref = Arc::clone(&pool);
            pool.submit(move || {
                // Runs on a worker thread: inner submissions take the
                // local-deque path.
                let inner: Vec<_> = (0..16)
                    .map(|_| {
                        let counter = Arc::clone(&counter);
                        pool_ref.submit(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })
                    })
                    .collect();
                for item in inner {
                    item.wait();
                }
            })
        };
        outer.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drains_pending_work() {
        let pool = Pool::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_lifecycle_counters_move() {
        let before_spawned = TOTAL_SPAWNED.load(Ordering::Relaxed);
        let before_completed = TOTAL_COMPLETED.load(Ordering::Relaxed);
        let pool = Pool::new(2);
        let items: Vec<_> = (0..10).map(|_| pool.submit(|| {})).collect();
        for item in items {
            item.wait();
        }
        assert!(TOTAL_SPAWNED.load(Ordering::Relaxed) >= before_spawned + 10);
        assert!(TOTAL_COMPLETED.load(Ordering::Relaxed) >= before_completed + 10);
        pool.shutdown();
    }

    #[test]
    fn test_env_parse_fallbacks() {
        assert_eq!(parse_env_count("ALDER_TEST_UNSET_VAR", 7), 7);
    }
}
