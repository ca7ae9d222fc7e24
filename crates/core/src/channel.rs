//! Bounded channels for task communication
//!
//! A channel is a capacity-bounded FIFO of values guarded by one mutex and
//! two condvars (`not_full` for senders, `not_empty` for receivers).
//! Ordering guarantees: FIFO per sender-receiver pair, and a happens-before
//! edge from each `send` to the `recv` that takes the value (the mutex
//! provides it).
//!
//! ## Close semantics
//!
//! - `close` wakes everyone on both condvars.
//! - `send` on a closed channel fails.
//! - `recv` drains remaining values, then reports `Closed` (the VM maps
//!   closed+empty to `null`).
//!
//! Never hold two channel locks at once; `select` works on one channel at a
//! time for exactly that reason.

use crate::value::Value;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Why a channel operation did not deliver a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    Closed,
    TimedOut,
    /// Cooperative cancellation observed while blocked.
    Cancelled,
    /// `try_` variant found no capacity / no value.
    WouldBlock,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::TimedOut => write!(f, "channel operation timed out"),
            ChannelError::Cancelled => write!(f, "channel operation cancelled"),
            ChannelError::WouldBlock => write!(f, "channel operation would block"),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Debug)]
struct ChanInner {
    queue: VecDeque<Value>,
    closed: bool,
}

#[derive(Debug)]
pub struct ChannelCell {
    capacity: usize,
    inner: Mutex<ChanInner>,
    not_full: Condvar,
    not_empty: Condvar,
}

/// Interval at which blocked channel operations re-check cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(10);

impl ChannelCell {
    /// A zero capacity is clamped to 1: the queue always admits at least
    /// one in-flight value.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(ChanInner {
                queue: VecDeque::new(),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("channel poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("channel poisoned").closed
    }

    /// Block until capacity is available or the channel closes.
    ///
    /// `deadline` bounds the wait; `cancel` is polled while blocked and, if
    /// it returns true, the send fails with `Cancelled`.
    pub fn send_inner(
        &self,
        value: Value,
        deadline: Option<Instant>,
        cancel: Option<&dyn Fn() -> bool>,
    ) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("channel poisoned");
        loop {
            if inner.closed {
                return Err(ChannelError::Closed);
            }
            if inner.queue.len() < self.capacity {
                inner.queue.push_back(value);
                self.not_empty.notify_one();
                return Ok(());
            }
            if let Some(cancel) = cancel {
                if cancel() {
                    return Err(ChannelError::Cancelled);
                }
            }
            let wait = wait_slice(deadline)?;
            let (guard, _) = self
                .not_full
                .wait_timeout(inner, wait)
                .expect("channel poisoned during send wait");
            inner = guard;
        }
    }

    pub fn send(&self, value: Value) -> Result<(), ChannelError> {
        self.send_inner(value, None, None)
    }

    pub fn send_timeout(&self, value: Value, timeout: Duration) -> Result<(), ChannelError> {
        self.send_inner(value, Some(Instant::now() + timeout), None)
    }

    /// Block until a value is available or the channel is closed and empty.
    pub fn recv_inner(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&dyn Fn() -> bool>,
    ) -> Result<Value, ChannelError> {
        let mut inner = self.inner.lock().expect("channel poisoned");
        loop {
            if let Some(value) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Ok(value);
            }
            if inner.closed {
                return Err(ChannelError::Closed);
            }
            if let Some(cancel) = cancel {
                if cancel() {
                    return Err(ChannelError::Cancelled);
                }
            }
            let wait = wait_slice(deadline)?;
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, wait)
                .expect("channel poisoned during recv wait");
            inner = guard;
        }
    }

    pub fn recv(&self) -> Result<Value, ChannelError> {
        self.recv_inner(None, None)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Value, ChannelError> {
        self.recv_inner(Some(Instant::now() + timeout), None)
    }

    /// Non-blocking receive, used by `select`.
    pub fn try_recv(&self) -> Result<Value, ChannelError> {
        let mut inner = self.inner.lock().expect("channel poisoned");
        if let Some(value) = inner.queue.pop_front() {
            self.not_full.notify_one();
            return Ok(value);
        }
        if inner.closed {
            Err(ChannelError::Closed)
        } else {
            Err(ChannelError::WouldBlock)
        }
    }

    /// Non-blocking send.
    pub fn try_send(&self, value: Value) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("channel poisoned");
        if inner.closed {
            return Err(ChannelError::Closed);
        }
        if inner.queue.len() < self.capacity {
            inner.queue.push_back(value);
            self.not_empty.notify_one();
            Ok(())
        } else {
            Err(ChannelError::WouldBlock)
        }
    }

    /// Close and wake all blocked senders and receivers.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("channel poisoned");
        inner.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

/// How long to sleep on the condvar this round: the remaining time to the
/// deadline, capped at the cancellation poll interval.
fn wait_slice(deadline: Option<Instant>) -> Result<Duration, ChannelError> {
    match deadline {
        None => Ok(CANCEL_POLL),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(ChannelError::TimedOut)
            } else {
                Ok((deadline - now).min(CANCEL_POLL))
            }
        }
    }
}
