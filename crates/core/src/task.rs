//! Task handles: one-shot rendezvous between a spawner and a worker
//!
//! A task handle pairs an id with a completion rendezvous: an atomic
//! completed flag for the lock-free fast path, a value slot and a condvar
//! for blocking joiners. Completion stores exactly once; later joins return
//! the stored outcome without blocking.
//!
//! Detach transfers cleanup responsibility to the scheduler; cancellation
//! is cooperative (a flag checked at blocking primitives).

use crate::value::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// What a task run produced: a value, or the exception payload it failed
/// with (rethrown by the joiner).
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(Value),
}

#[derive(Debug)]
pub struct TaskCell {
    pub id: u64,
    /// Release-stored by the completing worker, acquire-loaded by joiners.
    completed: AtomicBool,
    result: Mutex<Option<TaskOutcome>>,
    cond: Condvar,
    detached: AtomicBool,
    cancelled: AtomicBool,
}

impl TaskCell {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            completed: AtomicBool::new(false),
            result: Mutex::new(None),
            cond: Condvar::new(),
            detached: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Store the outcome and wake all joiners. A second completion is a
    /// scheduler bug and is ignored (the first store wins).
    pub fn complete(&self, outcome: TaskOutcome) {
        let mut slot = self.result.lock().expect("task rendezvous poisoned");
        if slot.is_some() {
            return;
        }
        *slot = Some(outcome);
        // The flag must become visible no later than the wakeup.
        self.completed.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Block until the task completes; returns the stored outcome.
    pub fn wait(&self) -> TaskOutcome {
        let mut slot = self.result.lock().expect("task rendezvous poisoned");
        while slot.is_none() {
            slot = self
                .cond
                .wait(slot)
                .expect("task rendezvous poisoned during wait");
        }
        slot.as_ref().expect("checked above").clone()
    }

    /// Timed wait; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let deadline = std::time::Instant::now() + timeout;
        let mut slot = self.result.lock().expect("task rendezvous poisoned");
        while slot.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(slot, deadline - now)
                .expect("task rendezvous poisoned during wait");
            slot = guard;
        }
        slot.clone()
    }

    /// Non-blocking probe.
    pub fn try_outcome(&self) -> Option<TaskOutcome> {
        if !self.is_completed() {
            return None;
        }
        self.result
            .lock()
            .expect("task rendezvous poisoned")
            .clone()
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation; checked at blocking primitives.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_complete_then_wait() {
        let task = TaskCell::new(1);
        task.complete(TaskOutcome::Completed(Value::I32(42)));
        assert!(task.is_completed());
        match task.wait() {
            TaskOutcome::Completed(Value::I32(42)) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_wait_blocks_until_complete() {
        let task = Arc::new(TaskCell::new(2));
        let worker = {
            let task = Arc::clone(&task);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                task.complete(TaskOutcome::Completed(Value::Bool(true)));
            })
        };
        match task.wait() {
            TaskOutcome::Completed(Value::Bool(true)) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        worker.join().unwrap();
    }

    #[test]
    fn test_first_completion_wins() {
        let task = TaskCell::new(3);
        task.complete(TaskOutcome::Completed(Value::I32(1)));
        task.complete(TaskOutcome::Completed(Value::I32(2)));
        match task.wait() {
            TaskOutcome::Completed(Value::I32(1)) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_wait_timeout_expires() {
        let task = TaskCell::new(4);
        assert!(task.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_detach_and_cancel_flags() {
        let task = TaskCell::new(5);
        assert!(!task.is_detached());
        task.detach();
        assert!(task.is_detached());
        assert!(!task.is_cancelled());
        task.cancel();
        assert!(task.is_cancelled());
    }
}
