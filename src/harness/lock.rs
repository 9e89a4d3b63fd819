//! The shared harness lock and the condition-wait built on it
//!
//! Receive threads take the lock for one counter or map update at a time;
//! the driver thread takes it for one snapshot or one predicate evaluation.
//! Predicates are handed the state itself, never the lock, and a second
//! acquisition on a thread that already holds the lock panics instead of
//! deadlocking.

use crate::core::BlockHash;
use crate::error::{HarnessError, Result};
use crate::network::{Message, MessageKind};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Identifies one harness peer connection within a [`HarnessState`]
pub type HarnessPeerId = u64;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

thread_local! {
    // Addresses of the P2pLocks held by this thread
    static HELD_LOCKS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Bookkeeping for one harness peer connection
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    /// Block fingerprint -> number of `block` frames carrying it
    pub block_receipts: HashMap<BlockHash, u64>,
    pub message_counts: BTreeMap<MessageKind, u64>,
    pub last_messages: HashMap<MessageKind, Message>,
    pub last_pong: Option<u64>,
    pub connected: bool,
    /// Why the connection died, if the remote side or the stream ended it
    pub error: Option<HarnessError>,
}

impl PeerStats {
    pub fn receipt_count(&self, hash: &BlockHash) -> u64 {
        self.block_receipts.get(hash).copied().unwrap_or(0)
    }

    pub fn message_count(&self, kind: MessageKind) -> u64 {
        self.message_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn last_message(&self, kind: MessageKind) -> Option<&Message> {
        self.last_messages.get(&kind)
    }

    /// True when the set of received blocks is exactly `hashes`
    pub fn received_exactly(&self, hashes: &[BlockHash]) -> bool {
        let expected: HashSet<&BlockHash> = hashes.iter().collect();
        expected.len() == self.block_receipts.len()
            && expected.iter().all(|h| self.block_receipts.contains_key(*h))
    }

    /// Blocks that arrived more than once
    pub fn duplicates(&self) -> Vec<(BlockHash, u64)> {
        let mut dups: Vec<(BlockHash, u64)> = self
            .block_receipts
            .iter()
            .filter(|(_, count)| **count != 1)
            .map(|(hash, count)| (*hash, *count))
            .collect();
        dups.sort();
        dups
    }
}

/// All state shared between receive threads and the driver thread
#[derive(Debug, Default)]
pub struct HarnessState {
    peers: HashMap<HarnessPeerId, PeerStats>,
    next_peer_id: HarnessPeerId,
}

impl HarnessState {
    pub fn peer(&self, id: HarnessPeerId) -> Option<&PeerStats> {
        self.peers.get(&id)
    }

    pub fn peer_ids(&self) -> Vec<HarnessPeerId> {
        let mut ids: Vec<HarnessPeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn register_peer(&mut self) -> HarnessPeerId {
        let id = self.next_peer_id;
        self.next_peer_id += 1;
        self.peers.insert(id, PeerStats::default());
        id
    }

    pub(crate) fn peer_mut(&mut self, id: HarnessPeerId) -> &mut PeerStats {
        self.peers.entry(id).or_default()
    }

    pub(crate) fn remove_peer(&mut self, id: HarnessPeerId) -> Option<PeerStats> {
        self.peers.remove(&id)
    }
}

/// The one lock guarding [`HarnessState`], shared by cloning
#[derive(Debug, Clone)]
pub struct P2pLock {
    inner: Arc<Mutex<HarnessState>>,
    poll_interval: Duration,
}

impl Default for P2pLock {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl P2pLock {
    pub fn new(poll_interval: Duration) -> P2pLock {
        P2pLock {
            inner: Arc::new(Mutex::new(HarnessState::default())),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run a read-only closure under the lock
    pub fn with<R>(&self, f: impl FnOnce(&HarnessState) -> R) -> R {
        let _held = self.enter();
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Run a mutation under the lock; receive paths keep these O(1)
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut HarnessState) -> R) -> R {
        let _held = self.enter();
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Block until `predicate` holds or `timeout` elapses.
    ///
    /// The predicate runs with the lock held and is re-evaluated every poll
    /// interval, so this returns within `timeout` plus one interval.
    pub fn wait_until<P>(&self, description: &str, timeout: Duration, mut predicate: P) -> Result<()>
    where
        P: FnMut(&HarnessState) -> bool,
    {
        self.try_wait_until(description, timeout, |state| Ok(predicate(state)))
    }

    /// Like [`wait_until`](Self::wait_until), but a predicate error ends the
    /// wait immediately with that error.
    pub fn try_wait_until<P>(&self, description: &str, timeout: Duration, mut predicate: P) -> Result<()>
    where
        P: FnMut(&HarnessState) -> Result<bool>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if self.with(|state| predicate(state))? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(HarnessError::Timeout {
                    description: description.to_string(),
                    timeout,
                });
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn enter(&self) -> HeldGuard {
        let addr = Arc::as_ptr(&self.inner) as usize;
        HELD_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            if held.contains(&addr) {
                panic!(
                    "P2pLock acquired reentrantly; predicates and snapshots receive the \
                     harness state and must not take the lock again"
                );
            }
            held.push(addr);
        });
        HeldGuard { addr }
    }
}

struct HeldGuard {
    addr: usize,
}

impl Drop for HeldGuard {
    fn drop(&mut self) {
        HELD_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|a| *a == self.addr) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_wait_until_sees_update_from_other_thread() {
        let lock = P2pLock::new(Duration::from_millis(5));
        let id = lock.update(|state| state.register_peer());
        let hash = BlockHash([3u8; 32]);

        let writer = lock.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.update(|state| {
                *state.peer_mut(id).block_receipts.entry(hash).or_insert(0) += 1;
            });
        });

        lock.wait_until("block recorded", Duration::from_secs(2), |state| {
            state.peer(id).map(|p| p.receipt_count(&hash)) == Some(1)
        })
        .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_always_false_predicate_times_out_within_bound() {
        let poll = Duration::from_millis(20);
        let timeout = Duration::from_millis(150);
        let lock = P2pLock::new(poll);

        let started = Instant::now();
        let result = lock.wait_until("never", timeout, |_| false);
        let elapsed = started.elapsed();

        assert_eq!(
            result,
            Err(HarnessError::Timeout {
                description: "never".to_string(),
                timeout
            })
        );
        assert!(elapsed >= timeout);
        // generous slack for scheduler jitter on loaded CI machines
        assert!(elapsed < timeout + poll + Duration::from_millis(200));
    }

    #[test]
    fn test_predicate_error_aborts_wait() {
        let lock = P2pLock::default();
        let result = lock.try_wait_until("connection alive", Duration::from_secs(5), |_| {
            Err(HarnessError::Connection("gone".to_string()))
        });
        assert_eq!(result, Err(HarnessError::Connection("gone".to_string())));
    }

    #[test]
    fn test_reentrant_acquisition_panics() {
        let lock = P2pLock::default();
        let inner = lock.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.with(|_| inner.with(|_| ()));
        }));
        assert!(result.is_err());

        // The guard was released while unwinding, so the lock is usable again
        let reached = AtomicBool::new(false);
        lock.with(|_| reached.store(true, Ordering::SeqCst));
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_distinct_locks_can_nest() {
        let a = P2pLock::default();
        let b = P2pLock::default();
        let peers = a.with(|_| b.with(|state| state.peer_ids().len()));
        assert_eq!(peers, 0);
    }

    #[test]
    fn test_received_exactly_and_duplicates() {
        let mut stats = PeerStats::default();
        let a = BlockHash([1u8; 32]);
        let b = BlockHash([2u8; 32]);
        stats.block_receipts.insert(a, 1);
        stats.block_receipts.insert(b, 2);

        assert!(stats.received_exactly(&[a, b]));
        assert!(stats.received_exactly(&[b, a]));
        assert!(!stats.received_exactly(&[a]));
        assert_eq!(stats.duplicates(), vec![(b, 2)]);
    }
}
