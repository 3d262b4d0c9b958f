//! Caller priorities.
//!
//! Every thread carries a current [`Priority`]. It is sampled when a flush is
//! enqueued: requests that carry a completion callback are ordered by it, and
//! the worker temporarily runs at that priority while servicing them.

use std::cell::Cell;

/// Scheduling priority of a caller or of the flush worker. Higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u32);

impl Priority {
    /// Baseline of the idle flush worker and of periodic full flushes.
    pub const BACKGROUND: Priority = Priority(1);
    /// Default for ordinary service threads.
    pub const SERVICE: Priority = Priority(2);
    /// Threads answering an operator or a remote request.
    pub const INTERACTIVE: Priority = Priority(3);
    /// Device driver threads; also the worker during initial load.
    pub const DRIVER: Priority = Priority(4);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::SERVICE
    }
}

thread_local! {
    static CURRENT: Cell<Priority> = const { Cell::new(Priority::SERVICE) };
}

/// Priority of the calling thread.
#[must_use]
pub fn current() -> Priority {
    CURRENT.with(Cell::get)
}

/// Sets the calling thread's priority until changed again.
pub fn set_current(priority: Priority) {
    CURRENT.with(|c| c.set(priority));
}

/// Runs the calling thread at `priority` until the returned guard is dropped.
#[must_use = "the previous priority is restored when the guard is dropped"]
pub fn scoped(priority: Priority) -> PriorityGuard {
    let previous = current();
    set_current(priority);
    PriorityGuard { previous }
}

/// Restores the previous thread priority on drop.
#[derive(Debug)]
pub struct PriorityGuard {
    previous: Priority,
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        set_current(self.previous);
    }
}
