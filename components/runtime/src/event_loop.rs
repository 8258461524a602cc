//! Promise state and the microtask queue.
//!
//! Promise transitions settle exactly once. Completions produced off the
//! main context (async function bodies) are delivered through a crossbeam
//! channel and applied by the event loop; callers never share memory with
//! the settling side.

use core_types::Value;
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

/// Handle to a promise owned by a [`PromiseTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseId(pub u32);

/// The state of a promise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PromiseState {
    /// Not yet settled
    Pending,
    /// Settled with a value
    Fulfilled(Value),
    /// Settled with a rejection reason
    Rejected(Value),
}

/// All promises of a realm.
#[derive(Debug, Default)]
pub struct PromiseTable {
    promises: Vec<PromiseState>,
}

impl PromiseTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending promise.
    pub fn create(&mut self) -> PromiseId {
        let id = PromiseId(self.promises.len() as u32);
        self.promises.push(PromiseState::Pending);
        id
    }

    /// Current state of a promise.
    pub fn state(&self, id: PromiseId) -> PromiseState {
        self.promises[id.0 as usize]
    }

    /// Fulfill a pending promise. Settling twice is a no-op.
    pub fn fulfill(&mut self, id: PromiseId, value: Value) -> bool {
        self.settle(id, PromiseState::Fulfilled(value))
    }

    /// Reject a pending promise. Settling twice is a no-op.
    pub fn reject(&mut self, id: PromiseId, reason: Value) -> bool {
        self.settle(id, PromiseState::Rejected(reason))
    }

    fn settle(&mut self, id: PromiseId, state: PromiseState) -> bool {
        let slot = &mut self.promises[id.0 as usize];
        if *slot != PromiseState::Pending {
            return false;
        }
        *slot = state;
        true
    }
}

/// A queued microtask.
#[derive(Debug, Clone, Copy)]
pub enum Microtask {
    /// Fulfill the promise with the value
    Fulfill(PromiseId, Value),
    /// Reject the promise with the reason
    Reject(PromiseId, Value),
}

/// The context's microtask queue.
///
/// The sender half may be cloned into worker threads; the queue itself is
/// drained only by the owning context, between suspension points.
pub struct EventLoop {
    sender: Sender<Microtask>,
    receiver: Receiver<Microtask>,
}

impl EventLoop {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// A sender handle for completion delivery.
    pub fn sender(&self) -> Sender<Microtask> {
        self.sender.clone()
    }

    /// Enqueue a microtask from the owning context.
    pub fn enqueue(&self, task: Microtask) {
        // Sending to an unbounded channel we hold both ends of cannot fail
        let _ = self.sender.send(task);
    }

    /// Drain and apply all queued microtasks; returns how many ran.
    pub fn run_jobs(&self, promises: &mut PromiseTable) -> usize {
        let mut ran = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(Microtask::Fulfill(id, value)) => {
                    promises.fulfill(id, value);
                    ran += 1;
                }
                Ok(Microtask::Reject(id, reason)) => {
                    promises.reject(id, reason);
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        ran
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
