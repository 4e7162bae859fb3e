//! Write-behind coalescing queue.
//!
//! Satellite relays can deliver the same physical transmission more than
//! once. Records rest here for a settle time so near-simultaneous
//! duplicates merge into one in-memory record before the single
//! persistence write. A singleton drain worker persists settled entries
//! in FIFO order, committing in batches.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::models::{StationAddress, XmitRecord};
use crate::storage::XmitStore;

/// Two resident records with the same address within this window are the
/// same physical transmission.
pub const COALESCE_WINDOW_MS: i64 = 120_000;

/// How often the drain worker wakes.
const DRAIN_WAKE: Duration = Duration::from_secs(1);

/// Writes per storage commit on a drain pass.
const COMMIT_EVERY: usize = 50;

struct Entry {
    record: XmitRecord,
    inserted: Instant,
}

/// Counters exposed through the server health snapshot.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub coalesced: AtomicU64,
    pub written: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct WriteQueue {
    /// Single lock covering both producer and consumer operations so
    /// scan-then-append and scan-then-remove stay atomic with respect to
    /// each other.
    inner: Mutex<VecDeque<Entry>>,
    capacity: usize,
    settle: Duration,
    shutdown: AtomicBool,
    pub stats: QueueStats,
}

impl WriteQueue {
    pub fn new(capacity: usize, settle: Duration) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            settle,
            shutdown: AtomicBool::new(false),
            stats: QueueStats::default(),
        }
    }

    /// Find a resident record for `address` within the coalescing window
    /// of `approx_time_ms` and mutate it in place. Returns whether a
    /// record was found. The mutation happens under the queue lock, so a
    /// found record cannot be dequeued mid-update.
    pub fn find_update<F>(&self, address: StationAddress, approx_time_ms: i64, f: F) -> bool
    where
        F: FnOnce(&mut XmitRecord),
    {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.iter_mut() {
            if entry.record.address == address
                && (entry.record.goes_time_ms() - approx_time_ms).abs() < COALESCE_WINDOW_MS
            {
                f(&mut entry.record);
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Append a record. A record whose key (address, day, second-of-day)
    /// is already resident is considered the same record and counted once.
    /// Returns the record back to the caller when the queue is at
    /// capacity; retry policy is the caller's.
    pub fn enqueue(&self, record: XmitRecord) -> Result<(), XmitRecord> {
        let mut inner = self.inner.lock().unwrap();
        let resident = inner.iter().any(|e| {
            e.record.address == record.address
                && e.record.day == record.day
                && e.record.sec_of_day == record.sec_of_day
        });
        if resident {
            return Ok(());
        }
        if inner.len() >= self.capacity {
            return Err(record);
        }
        inner.push_back(Entry {
            record,
            inserted: Instant::now(),
        });
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove and return the oldest entry once it has settled, or early
    /// when the queue is at least half full (back-pressure drain) or the
    /// system is shutting down.
    pub fn dequeue(&self) -> Option<XmitRecord> {
        let mut inner = self.inner.lock().unwrap();
        let drain_all =
            self.shutdown.load(Ordering::SeqCst) || inner.len() >= self.capacity / 2;
        let ready = inner
            .front()
            .map(|e| drain_all || e.inserted.elapsed() >= self.settle)
            .unwrap_or(false);
        if ready {
            inner.pop_front().map(|e| e.record)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Flag shutdown: the next drain passes flush everything resident,
    /// bypassing the settle time.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Singleton consumer loop. Wakes every second, persists every settled
/// entry in FIFO order, and exits once shutdown is flagged and the queue
/// has been flushed. A persistence failure drops the record; it never
/// stops the worker.
pub async fn run_drain_worker(queue: Arc<WriteQueue>, store: Arc<dyn XmitStore>) {
    info!("Drain worker started");
    loop {
        tokio::time::sleep(DRAIN_WAKE).await;
        drain_pass(&queue, store.as_ref());
        if queue.is_shutdown() && queue.is_empty() {
            break;
        }
    }
    info!("Drain worker exiting after final flush");
}

fn drain_pass(queue: &WriteQueue, store: &dyn XmitStore) {
    let mut writes = 0usize;
    let mut in_tx = false;
    while let Some(record) = queue.dequeue() {
        if !in_tx {
            if let Err(e) = store.begin() {
                warn!("Could not open write transaction: {e}");
            } else {
                in_tx = true;
            }
        }
        match store.write(&record) {
            Ok(()) => {
                queue.stats.written.fetch_add(1, Ordering::Relaxed);
                writes += 1;
            }
            Err(e) => {
                queue.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    address = %record.address,
                    day = record.day,
                    "Dropping record, persistence write failed: {e}"
                );
            }
        }
        if in_tx && writes % COMMIT_EVERY == 0 && writes > 0 {
            if let Err(e) = store.commit() {
                warn!("Commit failed: {e}");
            }
            in_tx = false;
        }
    }
    if in_tx {
        if let Err(e) = store.commit() {
            warn!("Commit failed: {e}");
        }
    }
    if writes > 0 {
        debug!("Drain pass persisted {writes} records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DcpMonError;
    use crate::storage::QueryScope;

    fn addr(s: &str) -> StationAddress {
        StationAddress::try_from(s).unwrap()
    }

    fn record(a: &str, day: i32, sod: u32) -> XmitRecord {
        XmitRecord::new(addr(a), day, sod)
    }

    struct MemStore {
        written: Mutex<Vec<XmitRecord>>,
        commits: AtomicU64,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
                written: Mutex::new(Vec::new()),
                commits: AtomicU64::new(0),
            }
        }
    }

    impl XmitStore for MemStore {
        fn write(&self, rec: &XmitRecord) -> Result<(), DcpMonError> {
            self.written.lock().unwrap().push(rec.clone());
            Ok(())
        }
        fn query(&self, _: &QueryScope, _: i32) -> Result<Vec<XmitRecord>, DcpMonError> {
            Ok(Vec::new())
        }
        fn find(
            &self,
            _: StationAddress,
            _: i32,
            _: i64,
        ) -> Result<Option<XmitRecord>, DcpMonError> {
            Ok(None)
        }
        fn delete_before(&self, _: i32) -> Result<usize, DcpMonError> {
            Ok(0)
        }
        fn begin(&self) -> Result<(), DcpMonError> {
            Ok(())
        }
        fn commit(&self) -> Result<(), DcpMonError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn enqueue_idempotent_on_key() {
        let q = WriteQueue::new(10, Duration::from_secs(5));
        assert!(q.enqueue(record("CE123456", 100, 3600)).is_ok());
        assert!(q.enqueue(record("CE123456", 100, 3600)).is_ok());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn enqueue_rejects_at_capacity() {
        let q = WriteQueue::new(2, Duration::from_secs(5));
        assert!(q.enqueue(record("CE123456", 100, 0)).is_ok());
        assert!(q.enqueue(record("CE123456", 100, 3600)).is_ok());
        let rejected = q.enqueue(record("CE123456", 100, 7200));
        assert!(rejected.is_err());
        assert_eq!(rejected.unwrap_err().sec_of_day, 7200);
    }

    #[test]
    fn find_update_matches_address_and_window() {
        let q = WriteQueue::new(10, Duration::from_secs(5));
        let rec = record("CE123456", 100, 3600);
        let t = rec.goes_time_ms();
        q.enqueue(rec).unwrap();

        // Within window, same address.
        assert!(q.find_update(addr("CE123456"), t + 90_000, |r| {
            r.failure_codes.add('?');
        }));
        // Outside window.
        assert!(!q.find_update(addr("CE123456"), t + 150_000, |_| {}));
        // Different address, matching time.
        assert!(!q.find_update(addr("11111112"), t, |_| {}));

        q.begin_shutdown();
        let merged = q.dequeue().unwrap();
        assert!(merged.failure_codes.has('?'));
    }

    #[test]
    fn dequeue_waits_for_settle() {
        let q = WriteQueue::new(10, Duration::from_secs(60));
        q.enqueue(record("CE123456", 100, 0)).unwrap();
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn dequeue_drains_early_at_half_capacity() {
        let q = WriteQueue::new(4, Duration::from_secs(60));
        q.enqueue(record("CE123456", 100, 0)).unwrap();
        assert!(q.dequeue().is_none());
        q.enqueue(record("CE123456", 100, 3600)).unwrap();
        // Two resident of capacity four: back-pressure drain kicks in.
        assert!(q.dequeue().is_some());
    }

    #[test]
    fn dequeue_is_fifo_on_shutdown_flush() {
        let q = WriteQueue::new(10, Duration::from_secs(60));
        q.enqueue(record("CE123456", 100, 0)).unwrap();
        q.enqueue(record("CE123456", 100, 3600)).unwrap();
        q.enqueue(record("CE123456", 100, 7200)).unwrap();
        q.begin_shutdown();
        assert_eq!(q.dequeue().unwrap().sec_of_day, 0);
        assert_eq!(q.dequeue().unwrap().sec_of_day, 3600);
        assert_eq!(q.dequeue().unwrap().sec_of_day, 7200);
        assert!(q.dequeue().is_none());
    }

    #[tokio::test]
    async fn drain_worker_flushes_on_shutdown() {
        let q = Arc::new(WriteQueue::new(10, Duration::from_secs(60)));
        let store = Arc::new(MemStore::new());
        for i in 0..3 {
            q.enqueue(record("CE123456", 100, i * 3600)).unwrap();
        }
        q.begin_shutdown();
        run_drain_worker(q.clone(), store.clone()).await;

        let written = store.written.lock().unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(written[0].sec_of_day, 0);
        assert!(q.is_empty());
        assert!(store.commits.load(Ordering::SeqCst) >= 1);
    }
}
