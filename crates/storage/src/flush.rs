//! Flush requests and the priority queue the worker drains.
//!
//! Ordering, highest first:
//!
//! 1. Index flushes.
//! 2. Requests with a completion callback, by the submitting thread's priority.
//! 3. Silent requests.
//!
//! Ties go to the older request.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::priority::{self, Priority};
use crate::{PersistentStorage, Shared, StorageError};

/// Callback run by the worker once a request's pages are durable.
pub type Completion = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct FlushRequest {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) priority: Priority,
    pub(crate) complete: Option<Completion>,
    pub(crate) index_flush: bool,
    pub(crate) requested_at: Instant,
    seq: u64,
}

impl FlushRequest {
    pub(crate) fn is_blocking(&self) -> bool {
        self.complete.is_some()
    }

    fn rank(&self) -> (bool, bool, Priority) {
        let priority = if self.index_flush || self.is_blocking() {
            self.priority
        } else {
            Priority(0)
        };
        (self.index_flush, self.is_blocking(), priority)
    }
}

impl std::fmt::Debug for FlushRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushRequest")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("priority", &self.priority)
            .field("blocking", &self.is_blocking())
            .field("index_flush", &self.index_flush)
            .field("seq", &self.seq)
            .finish()
    }
}

impl PartialEq for FlushRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FlushRequest {}

impl PartialOrd for FlushRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlushRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            // lower sequence number is older and wins
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending flush requests.
#[derive(Debug, Default)]
pub(crate) struct FlushQueue {
    heap: BinaryHeap<FlushRequest>,
    next_seq: u64,
    pub(crate) shutdown: bool,
}

impl FlushQueue {
    fn make(
        &mut self,
        start: usize,
        end: usize,
        priority: Priority,
        complete: Option<Completion>,
        index_flush: bool,
    ) -> FlushRequest {
        let seq = self.next_seq;
        self.next_seq += 1;
        FlushRequest {
            start,
            end,
            priority,
            complete,
            index_flush,
            requested_at: Instant::now(),
            seq,
        }
    }

    /// Queues a data flush of `[start, end)`.
    ///
    /// A request with a callback lifts a pending index flush to its own
    /// priority, since the index flush will be serviced first.
    pub(crate) fn push(
        &mut self,
        start: usize,
        end: usize,
        priority: Priority,
        complete: Option<Completion>,
    ) {
        if complete.is_some() {
            if let Some(mut top) = self.heap.peek_mut() {
                if top.index_flush && top.priority < priority {
                    top.priority = priority;
                }
            }
        }
        let request = self.make(start, end, priority, complete, false);
        self.heap.push(request);
    }

    /// Queues a flush of the first `len` bytes of the image, or extends the
    /// index flush already pending.
    pub(crate) fn push_index(&mut self, len: usize) {
        if let Some(mut top) = self.heap.peek_mut() {
            if top.index_flush {
                top.end = top.end.max(len);
                return;
            }
        }
        let priority = self
            .heap
            .peek()
            .map_or(Priority::BACKGROUND, |top| top.priority);
        let request = self.make(0, len, priority, None, true);
        self.heap.push(request);
    }

    /// Queues the periodic silent full-device flush.
    pub(crate) fn push_background(&mut self, total_size: usize) {
        let request = self.make(0, total_size, Priority::BACKGROUND, None, false);
        self.heap.push(request);
    }

    pub(crate) fn pop(&mut self) -> Option<FlushRequest> {
        self.heap.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_index_flushes(&self) -> usize {
        self.heap.iter().filter(|r| r.index_flush).count()
    }

    /// End and priority of the pending index flush, if any.
    #[cfg(test)]
    pub(crate) fn index_flush(&self) -> Option<(usize, Priority)> {
        self.heap
            .iter()
            .find(|r| r.index_flush)
            .map(|r| (r.end, r.priority))
    }
}

impl Shared {
    /// Schedules a flush of the header and index as they currently stand.
    pub(crate) fn flush_index(&self) {
        let len = {
            let live = self.live.read();
            index::index_len(&live)
        };
        self.trace_index();
        if self.is_halted() {
            return;
        }
        self.queue.lock().push_index(len);
        self.wake.notify_one();
    }

    fn enqueue(
        &self,
        start: usize,
        end: usize,
        complete: Option<Completion>,
    ) -> Result<(), StorageError> {
        if self.is_halted() {
            return Err(StorageError::Halted);
        }
        let priority = priority::current();
        let blocking = complete.is_some();
        trace!(
            target: "pstore::flush",
            start,
            end,
            priority = priority.0,
            blocking,
            "flush requested"
        );
        self.queue.lock().push(start, end, priority, complete);
        if blocking {
            self.raise_worker_priority(priority);
        }
        self.wake.notify_one();
        Ok(())
    }
}

impl PersistentStorage {
    /// Schedules `[start, start + len)` to be written back.
    ///
    /// If `complete` is given it runs on the worker thread once those pages
    /// are durable; the request is then ordered by the calling thread's
    /// [`priority`](crate::priority::current).
    ///
    /// # Errors
    ///
    /// - [`StorageError::RangeOutOfBounds`] if the range leaves the device.
    /// - [`StorageError::Halted`] if flushing has been disabled. `complete`
    ///   is dropped without being called.
    pub fn flush_range(
        &self,
        start: usize,
        len: usize,
        complete: Option<Completion>,
    ) -> Result<(), StorageError> {
        self.wait_loaded();
        let size = self.total_size();
        let end = match start.checked_add(len) {
            Some(end) if end <= size => end,
            _ => return Err(StorageError::RangeOutOfBounds { start, len, size }),
        };
        self.shared.enqueue(start, end, complete)
    }

    /// Schedules the whole device to be written back.
    pub fn flush(&self, complete: Option<Completion>) -> Result<(), StorageError> {
        self.flush_range(0, self.total_size(), complete)
    }

    /// Writes back `[start, start + len)` and blocks until it is durable.
    pub fn sync_range(&self, start: usize, len: usize) -> Result<(), StorageError> {
        let (tx, rx) = mpsc::channel();
        self.flush_range(start, len, Some(done_signal(tx)))?;
        // the sender is dropped uncalled only when flushing halts
        rx.recv().map_err(|_| StorageError::Halted)
    }

    /// Writes back the whole device and blocks until it is durable.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.sync_range(0, self.total_size())
    }

    /// Like [`sync_range`](Self::sync_range), giving up after `timeout`.
    ///
    /// The request stays queued after a timeout and is still serviced.
    pub fn sync_range_timeout(
        &self,
        start: usize,
        len: usize,
        timeout: Duration,
    ) -> Result<(), StorageError> {
        let (tx, rx) = mpsc::channel();
        self.flush_range(start, len, Some(done_signal(tx)))?;
        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                debug!(target: "pstore::flush", start, len, ?timeout, "sync timed out");
                Err(StorageError::Timeout)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(StorageError::Halted),
        }
    }
}

fn done_signal(tx: mpsc::Sender<()>) -> Completion {
    Box::new(move || {
        // the waiter may have timed out and gone away
        let _ = tx.send(());
    })
}
