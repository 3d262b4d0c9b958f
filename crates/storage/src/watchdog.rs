//! Liveness heartbeat consumed by the flush worker.

use std::time::Duration;

/// Opaque handle to a registered watchdog slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(pub usize);

/// A watchdog the flush worker keeps fed.
///
/// The storage registers one slot at construction with a budget of
/// `flush_interval * watchdog_multiplier`, activates it, and services it once
/// per worker iteration and once per dequeued request.
pub trait Watchdog: Send + Sync {
    /// Registers a slot that must be serviced at least every `budget`.
    fn register_slot(&self, budget: Duration) -> SlotHandle;

    /// Starts enforcing the slot's budget.
    fn activate_slot(&self, slot: SlotHandle);

    /// Heartbeat.
    fn service_slot(&self, slot: SlotHandle);
}
