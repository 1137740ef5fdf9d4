//! Per-phase submission pools and the barrier primitive.
//!
//! Many connection handlers write into a pool concurrently; the round task
//! waits until every expected submitter has arrived or the phase deadline
//! elapses, then freezes the membership with a snapshot. Handlers that race
//! past the freeze still land in the pool, but the frozen set no longer
//! changes — the phase is closed.

use secagg_core::ClientId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct PhasePool<V> {
    entries: Mutex<BTreeMap<ClientId, V>>,
    /// Submitter count the barrier waits for; also used by handler logging.
    expected: AtomicUsize,
    notify: Notify,
}

impl<V: Clone> PhasePool<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            expected: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Record one client's submission. The first submission per client
    /// wins; returns `false` on a duplicate.
    pub fn submit(&self, id: ClientId, value: V) -> bool {
        let inserted = {
            let mut entries = self.entries.lock().expect("phase pool poisoned");
            match entries.entry(id) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(value);
                    true
                }
                std::collections::btree_map::Entry::Occupied(_) => false,
            }
        };
        if inserted {
            self.notify.notify_waiters();
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("phase pool poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_expected(&self, expected: usize) {
        self.expected.store(expected, Ordering::Relaxed);
    }

    pub fn expected(&self) -> usize {
        self.expected.load(Ordering::Relaxed)
    }

    /// Wait until `expected` submissions have arrived or `window` elapses,
    /// whichever comes first. Returns the submission count at that moment.
    pub async fn wait(&self, expected: usize, window: Duration) -> usize {
        let deadline = Instant::now() + window;
        loop {
            // register before checking the count so a submit between the
            // check and the await cannot be missed
            let notified = self.notify.notified();
            let count = self.len();
            if count >= expected {
                return count;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len();
            }
        }
    }

    /// Freeze the phase: the membership and payloads at this instant.
    pub fn snapshot(&self) -> BTreeMap<ClientId, V> {
        self.entries.lock().expect("phase pool poisoned").clone()
    }
}

impl<V: Clone> Default for PhasePool<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn barrier_opens_when_expected_count_reached() {
        let pool = Arc::new(PhasePool::new());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait(3, Duration::from_secs(30)).await })
        };

        for id in ["1", "2", "3"] {
            assert!(pool.submit(ClientId::from(id), id.len()));
        }

        let count = waiter.await.unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn barrier_times_out_with_partial_submissions() {
        let pool: PhasePool<u32> = PhasePool::new();
        pool.submit(ClientId::from("1"), 7);

        let count = pool.wait(3, Duration::from_millis(200)).await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn duplicate_submissions_keep_the_first() {
        let pool = PhasePool::new();

        assert!(pool.submit(ClientId::from("1"), 10));
        assert!(!pool.submit(ClientId::from("1"), 20));

        assert_eq!(pool.snapshot()[&ClientId::from("1")], 10);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn late_submissions_do_not_change_a_snapshot() {
        let pool = PhasePool::new();
        pool.submit(ClientId::from("1"), 1);

        let frozen = pool.snapshot();
        pool.submit(ClientId::from("2"), 2);

        assert_eq!(frozen.len(), 1);
        assert_eq!(pool.len(), 2);
    }
}
