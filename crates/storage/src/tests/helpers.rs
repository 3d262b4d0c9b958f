use crate::*;
use anyhow::Result;
use config::StorageConfig;
use eeprom::{EepromError, MemEeprom};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Config whose background flush never fires during a test.
pub(super) fn quiet_config() -> StorageConfig {
    StorageConfig::default().with_flush_interval(Duration::from_secs(3600))
}

/// Storage on a fresh in-memory device, with the initial format already
/// written and the write log cleared.
pub(super) fn open_mem(total: usize, page: usize) -> Result<(Arc<MemEeprom>, PersistentStorage)> {
    let dev = Arc::new(MemEeprom::new(total, page));
    let storage = PersistentStorage::new(dev.clone(), quiet_config())?;
    storage.sync()?;
    dev.clear_write_log();
    Ok((dev, storage))
}

/// Polls `cond` until it holds or five seconds pass.
pub(super) fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Completion that reports on a channel.
pub(super) fn signal() -> (Completion, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel();
    let complete: Completion = Box::new(move || {
        let _ = tx.send(());
    });
    (complete, rx)
}

// -------------------- HoldEeprom --------------------

#[derive(Default)]
struct HoldState {
    held: bool,
    blocked: usize,
}

/// In-memory device whose writes can be paused, so the worker can be parked
/// mid-request while a test queues more work behind it.
pub(super) struct HoldEeprom {
    inner: MemEeprom,
    state: Mutex<HoldState>,
    cond: Condvar,
}

impl HoldEeprom {
    pub(super) fn new(total: usize, page: usize) -> Self {
        Self {
            inner: MemEeprom::new(total, page),
            state: Mutex::new(HoldState::default()),
            cond: Condvar::new(),
        }
    }

    pub(super) fn inner(&self) -> &MemEeprom {
        &self.inner
    }

    pub(super) fn hold(&self) {
        self.state.lock().held = true;
    }

    pub(super) fn release(&self) {
        self.state.lock().held = false;
        self.cond.notify_all();
    }

    /// Blocks until a write is parked on the hold.
    pub(super) fn wait_until_blocked(&self) {
        let mut state = self.state.lock();
        while state.blocked == 0 {
            self.cond.wait(&mut state);
        }
    }
}

impl Eeprom for HoldEeprom {
    fn total_size(&self) -> usize {
        self.inner.total_size()
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, EepromError> {
        self.inner.read(offset, buf)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, EepromError> {
        {
            let mut state = self.state.lock();
            while state.held {
                state.blocked += 1;
                self.cond.notify_all();
                self.cond.wait(&mut state);
                state.blocked -= 1;
            }
        }
        self.inner.write(offset, buf)
    }
}

// -------------------- FailingReadEeprom --------------------

/// Device whose reads always fail. Writes are recorded by the inner device.
pub(super) struct FailingReadEeprom {
    pub(super) inner: MemEeprom,
}

impl Eeprom for FailingReadEeprom {
    fn total_size(&self) -> usize {
        self.inner.total_size()
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, EepromError> {
        Err(EepromError::Io(std::io::Error::other("bus fault")))
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, EepromError> {
        self.inner.write(offset, buf)
    }
}

// -------------------- CountingWatchdog --------------------

#[derive(Default)]
pub(super) struct CountingWatchdog {
    pub(super) budget: Mutex<Option<Duration>>,
    pub(super) activated: AtomicUsize,
    pub(super) serviced: AtomicUsize,
}

impl Watchdog for CountingWatchdog {
    fn register_slot(&self, budget: Duration) -> SlotHandle {
        *self.budget.lock() = Some(budget);
        SlotHandle(7)
    }

    fn activate_slot(&self, slot: SlotHandle) {
        assert_eq!(slot, SlotHandle(7));
        self.activated.fetch_add(1, Ordering::SeqCst);
    }

    fn service_slot(&self, slot: SlotHandle) {
        assert_eq!(slot, SlotHandle(7));
        self.serviced.fetch_add(1, Ordering::SeqCst);
    }
}
