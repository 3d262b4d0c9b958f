//! The background flush worker.
//!
//! ```text
//! load device ──► WAIT_FOR_WORK ──► DRAIN_QUEUE ──┐
//!                      ▲                          │
//!                      └──────────────────────────┘
//! ```
//!
//! The wait ends when a request is queued, when shutdown is requested, or
//! when the background deadline passes. The deadline is absolute: a
//! full-device flush is synthesized at least once per interval whether or not
//! callers have been flushing in the meantime.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, trace, warn};

use crate::flush::FlushRequest;
use crate::priority::Priority;
use crate::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    shared.load();

    let interval = shared.config.flush_interval;
    let mut deadline = Instant::now() + interval;
    loop {
        service_watchdog(&shared);

        let shutdown = {
            let mut queue = shared.queue.lock();
            while queue.is_empty() && !queue.shutdown {
                if shared.wake.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                queue.push_background(shared.geometry.total_size());
                shared.stats.lock().background_flushes += 1;
                deadline = now + interval;
            }
            queue.shutdown
        };

        drain(&shared);

        if shutdown {
            // Drop only runs once no borrower is left, so nothing can be queued now.
            if !shared.is_halted() {
                let pages = 0..shared.geometry.total_pages();
                if let Err(page) = flush_pages(&shared, pages) {
                    integrity_fault(&shared, page);
                }
            }
            let stats = *shared.stats.lock();
            info!(target: "pstore::worker", ?stats, "flush worker stopped");
            return;
        }
    }
}

fn service_watchdog(shared: &Shared) {
    if let Some((watchdog, slot)) = &shared.watchdog {
        watchdog.service_slot(*slot);
    }
}

/// Services queued requests until the queue is empty.
fn drain(shared: &Shared) {
    loop {
        let Some(request) = shared.queue.lock().pop() else {
            shared.set_worker_priority(Priority::BACKGROUND);
            return;
        };
        service_watchdog(shared);
        shared.stats.lock().requests += 1;

        if request.index_flush || request.is_blocking() {
            shared.set_worker_priority(request.priority);
        } else {
            shared.set_worker_priority(Priority::BACKGROUND);
        }

        if shared.is_halted() {
            // completion callbacks are dropped uncalled
            debug!(target: "pstore::worker", ?request, "discarding flush request, storage halted");
            continue;
        }
        service(shared, request);
    }
}

fn service(shared: &Shared, request: FlushRequest) {
    let page_size = shared.geometry.page_size();
    // an empty request still completes but touches no page
    let pages = if request.start == request.end {
        0..0
    } else {
        request.start / page_size..shared.geometry.page_ceil(request.end) / page_size
    };

    if let Err(page) = flush_pages(shared, pages) {
        integrity_fault(shared, page);
        return;
    }

    trace!(
        target: "pstore::worker",
        start = request.start,
        end = request.end,
        index_flush = request.index_flush,
        latency = ?request.requested_at.elapsed(),
        "flush serviced"
    );

    if let Some(complete) = request.complete {
        if panic::catch_unwind(AssertUnwindSafe(complete)).is_err() {
            error!(target: "pstore::worker", "flush completion callback panicked");
        }
    }
}

fn integrity_fault(shared: &Shared, page: usize) {
    shared.halted.store(true, Ordering::Release);
    error!(
        target: "pstore::worker",
        page,
        "shadow checksum mismatch, memory corruption detected; persistent storage flushing halted"
    );
}

/// Writes every page in `pages` whose live content differs from the shadow.
///
/// Returns the first page whose shadow checksum no longer matches; nothing is
/// written in that case. A failed page write leaves the shadow untouched so
/// the page stays dirty and is retried by a later flush.
pub(crate) fn flush_pages(shared: &Shared, pages: Range<usize>) -> Result<(), usize> {
    let page_size = shared.geometry.page_size();
    let mut shadow = shared.shadow.lock();
    shadow.verify(pages.clone())?;

    let mut buf = vec![0u8; page_size];
    for page in pages {
        let offset = page * page_size;
        {
            let live = shared.live.read();
            let current = &live[offset..offset + page_size];
            if current == shadow.page(page) {
                continue;
            }
            buf.copy_from_slice(current);
        }

        match shared.eeprom.write(offset, &buf) {
            Ok(written) if written == page_size => {
                shadow.commit(page, &buf);
                shared.stats.lock().pages_written += 1;
            }
            Ok(written) => {
                warn!(
                    target: "pstore::worker",
                    page,
                    written,
                    expected = page_size,
                    "short page write, page left dirty"
                );
                shared.stats.lock().write_failures += 1;
            }
            Err(err) => {
                error!(target: "pstore::worker", page, error = %err, "page write failed, page left dirty");
                shared.stats.lock().write_failures += 1;
            }
        }
    }
    Ok(())
}
