//! Node state (spec §3): the shared registries every session reads
//! and mutates, plus the lock-ordered operations that keep the
//! invariants in spec §3/§5 true.
//!
//! Each registry has its own `parking_lot::Mutex`. Handlers never hold
//! more than one of these guards across an `.await` point: the
//! pattern throughout is "copy what's needed under the guard, drop
//! the guard, then do I/O" (spec §5's recommended design). The fixed
//! acquisition order, whenever more than one guard is needed at once,
//! is:
//!
//!     unverified_peers -> verified_peers -> subscriptions
//!         -> pending_validations -> cache -> api_sessions

use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::{api::ApiHandle, config::Config, peer::PeerHandle};

pub struct PendingValidation {
    pub ttl: u8,
    pub data_type: u16,
    pub data: Bytes,
    pub source: Weak<PeerHandle>,
    pub awaiting: HashSet<u64>,
}

/// Outcome of applying a `GOSSIP_VALIDATION` to a pending announce
/// (spec §4.5).
pub enum ValidationOutcome {
    /// `message_id` is absent — log and ignore.
    Unknown,
    /// `message_id` is present but this session isn't in `awaiting` —
    /// the caller is misbehaving, fatal for its API session.
    Unauthorized,
    /// `valid=0`: the entry is popped and the source peer must be closed.
    Invalid(PendingValidation),
    /// `valid=1`, other validators remain: nothing to flood yet.
    StillPending,
    /// `valid=1` and this was the last outstanding validator: flood now.
    Complete(PendingValidation),
}

/// Bounded FIFO of dedup fingerprints, paired with a hash set for O(1)
/// membership (spec §9 design note).
struct DedupCache {
    order: VecDeque<[u8; 20]>,
    seen: HashSet<[u8; 20]>,
    capacity: usize,
}

impl DedupCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` if `fingerprint` was newly inserted (i.e. this is
    /// the first time it's been seen); `false` if it was already present.
    fn insert(&mut self, fingerprint: [u8; 20]) -> bool {
        if !self.seen.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub fn announce_fingerprint(data_type: u16, data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data_type.to_be_bytes());
    hasher.update(data);
    hasher.finalize().into()
}

pub struct NodeState {
    pub config: Config,
    pub self_addr: SocketAddr,

    next_session_id: AtomicU64,

    api_sessions: Mutex<HashMap<u64, Arc<ApiHandle>>>,
    subscriptions: Mutex<HashMap<u16, HashSet<u64>>>,
    verified_peers: Mutex<VecDeque<Arc<PeerHandle>>>,
    unverified_peers: Mutex<VecDeque<Arc<PeerHandle>>>,
    pending_validations: Mutex<HashMap<u16, PendingValidation>>,
    cache: Mutex<DedupCache>,
}

impl NodeState {
    pub fn new(config: Config, self_addr: SocketAddr) -> Self {
        let cache_size = config.cache_size;
        Self {
            config,
            self_addr,
            next_session_id: AtomicU64::new(1),
            api_sessions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            verified_peers: Mutex::new(VecDeque::new()),
            unverified_peers: Mutex::new(VecDeque::new()),
            pending_validations: Mutex::new(HashMap::new()),
            cache: Mutex::new(DedupCache::new(cache_size)),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- peer registries -------------------------------------------------

    /// Appends `peer` to the unverified FIFO, evicting and closing the
    /// oldest entry if the set is already at `degree` capacity.
    pub fn register_unverified_peer(&self, peer: Arc<PeerHandle>) {
        let mut unverified = self.unverified_peers.lock();
        if unverified.len() >= self.config.degree {
            if let Some(evicted) = unverified.pop_front() {
                debug!(peer = %evicted.remote_addr, "evicting oldest unverified peer");
                evicted.close();
            }
        }
        unverified.push_back(peer);
    }

    /// Atomically moves `peer` from unverified to verified, evicting
    /// the oldest verified peer if the verified set is full (spec
    /// §4.2). Lock order: unverified before verified.
    pub fn promote_to_verified(&self, peer: &Arc<PeerHandle>) {
        let mut unverified = self.unverified_peers.lock();
        let mut verified = self.verified_peers.lock();

        unverified.retain(|p| !Arc::ptr_eq(p, peer));

        if verified.len() >= self.config.degree {
            if let Some(evicted) = verified.pop_front() {
                debug!(peer = %evicted.remote_addr, "evicting oldest verified peer over degree");
                evicted.close();
            }
        }
        peer.mark_validated();
        verified.push_back(peer.clone());
    }

    /// Removes `peer` from whichever registry (or both) it's in. The
    /// original implementation only checked the verified set while
    /// removing from the unverified one (spec §9 Open Questions); this
    /// treats both registries symmetrically.
    pub fn remove_peer_from_all(&self, peer: &Arc<PeerHandle>) {
        let mut unverified = self.unverified_peers.lock();
        let mut verified = self.verified_peers.lock();
        unverified.retain(|p| !Arc::ptr_eq(p, peer));
        verified.retain(|p| !Arc::ptr_eq(p, peer));
    }

    pub fn verified_peer_count(&self) -> usize {
        self.verified_peers.lock().len()
    }

    pub fn unverified_peer_count(&self) -> usize {
        self.unverified_peers.lock().len()
    }

    pub fn verified_peers_snapshot(&self) -> Vec<Arc<PeerHandle>> {
        self.verified_peers.lock().iter().cloned().collect()
    }

    pub fn verified_peers_except(&self, exclude: &Weak<PeerHandle>) -> Vec<Arc<PeerHandle>> {
        self.verified_peers
            .lock()
            .iter()
            .filter(|p| match exclude.upgrade() {
                Some(excluded) => !Arc::ptr_eq(p, &excluded),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// `true` if either registry already has a peer at `(addr, port)`,
    /// matched against either the advertised listening port or the
    /// ephemeral remote port (spec §4.4).
    pub fn has_duplicate_peer(&self, addr: std::net::IpAddr, port: u16) -> bool {
        let unverified = self.unverified_peers.lock();
        let verified = self.verified_peers.lock();
        unverified
            .iter()
            .chain(verified.iter())
            .any(|p| p.remote_addr == addr && p.matches_port(port))
    }

    // ---- API sessions / subscriptions -------------------------------------

    pub fn register_api_session(&self, handle: Arc<ApiHandle>) {
        self.api_sessions.lock().insert(handle.id, handle);
    }

    pub fn has_api_session(&self, id: u64) -> bool {
        self.api_sessions.lock().contains_key(&id)
    }

    pub fn is_subscribed(&self, data_type: u16, id: u64) -> bool {
        self.subscriptions
            .lock()
            .get(&data_type)
            .is_some_and(|subscribers| subscribers.contains(&id))
    }

    /// Removes the session from `api_sessions` and every
    /// `subscriptions[t]` it appears in (spec §3 invariant).
    pub fn unregister_api_session(&self, id: u64) {
        let mut subscriptions = self.subscriptions.lock();
        let mut api_sessions = self.api_sessions.lock();
        for subscribers in subscriptions.values_mut() {
            subscribers.remove(&id);
        }
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        api_sessions.remove(&id);
    }

    /// Idempotent: repeated calls with the same `(data_type, id)` leave
    /// membership unchanged (spec §8 property 7).
    pub fn subscribe(&self, data_type: u16, id: u64) {
        self.subscriptions.lock().entry(data_type).or_default().insert(id);
    }

    /// Snapshot of subscriber handles for `data_type`, taken under the
    /// subscriptions guard and resolved to live handles under the
    /// api_sessions guard (order: subscriptions then api_sessions).
    pub fn subscribers_snapshot(&self, data_type: u16) -> Vec<Arc<ApiHandle>> {
        let subscriptions = self.subscriptions.lock();
        let Some(ids) = subscriptions.get(&data_type) else {
            return Vec::new();
        };
        if ids.is_empty() {
            return Vec::new();
        }
        let ids: Vec<u64> = ids.iter().copied().collect();
        let api_sessions = self.api_sessions.lock();
        ids.into_iter().filter_map(|id| api_sessions.get(&id).cloned()).collect()
    }

    // ---- dedup cache -------------------------------------------------------

    /// `true` if `fingerprint` had not been seen before (and is now
    /// recorded); `false` if it's a duplicate (spec §4.3 step 2).
    pub fn check_and_record(&self, fingerprint: [u8; 20]) -> bool {
        self.cache.lock().insert(fingerprint)
    }

    // ---- pending validations -------------------------------------------------

    /// Picks a fresh `message_id` not currently in `pending_validations`
    /// (spec §4.3 step 3). Used both when an entry will be recorded
    /// (`ttl != 1`) and, on its own, when `ttl == 1` — step 3 allocates
    /// the id unconditionally, before step 4's ttl check decides
    /// whether to record a pending entry at all.
    fn alloc_message_id(pending: &HashMap<u16, PendingValidation>) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(1..=u16::MAX);
            if !pending.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Allocates a `message_id` for a `ttl == 1` announce without
    /// recording a pending-validation entry — it will never be
    /// re-flooded, so there is nothing to track (spec §4.3 step 4).
    pub fn alloc_transient_message_id(&self) -> u16 {
        let pending = self.pending_validations.lock();
        Self::alloc_message_id(&pending)
    }

    /// Allocates a fresh `message_id`, inserts the pending-validation
    /// entry, and returns the id, all under one critical section so
    /// concurrent announces never race on the same id (spec §3).
    pub fn insert_pending_validation(
        &self,
        ttl: u8,
        data_type: u16,
        data: Bytes,
        source: Weak<PeerHandle>,
        awaiting: HashSet<u64>,
    ) -> u16 {
        let mut pending = self.pending_validations.lock();
        let message_id = Self::alloc_message_id(&pending);
        pending.insert(
            message_id,
            PendingValidation {
                ttl,
                data_type,
                data,
                source,
                awaiting,
            },
        );
        message_id
    }

    /// Applies one `GOSSIP_VALIDATION(message_id, valid)` from
    /// `session_id` (spec §4.5). The membership check — "is this
    /// session even one we're waiting on" — applies before branching
    /// on `valid`, matching the spec's stated order.
    pub fn apply_validation(&self, message_id: u16, session_id: u64, valid: bool) -> ValidationOutcome {
        let mut pending = self.pending_validations.lock();
        let Some(entry) = pending.get(&message_id) else {
            return ValidationOutcome::Unknown;
        };
        if !entry.awaiting.contains(&session_id) {
            return ValidationOutcome::Unauthorized;
        }
        if !valid {
            let entry = pending.remove(&message_id).expect("just matched above");
            return ValidationOutcome::Invalid(entry);
        }
        let entry_mut = pending.get_mut(&message_id).expect("just matched above");
        entry_mut.awaiting.remove(&session_id);
        if entry_mut.awaiting.is_empty() {
            let entry = pending.remove(&message_id).expect("just matched above");
            ValidationOutcome::Complete(entry)
        } else {
            ValidationOutcome::StillPending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_cache_evicts_oldest_on_overflow() {
        let mut cache = DedupCache::new(2);
        let a = [1u8; 20];
        let b = [2u8; 20];
        let c = [3u8; 20];
        assert!(cache.insert(a));
        assert!(cache.insert(b));
        // Pushes the window to [b, c], evicting `a`.
        assert!(cache.insert(c));
        assert!(cache.insert(a));
        // `c` is still within the window and stays a duplicate.
        assert!(!cache.insert(c));
    }

    #[test]
    fn dedup_cache_rejects_duplicate() {
        let mut cache = DedupCache::new(8);
        let fp = [9u8; 20];
        assert!(cache.insert(fp));
        assert!(!cache.insert(fp));
    }

    #[test]
    fn fingerprint_is_stable_for_same_input() {
        let a = announce_fingerprint(1337, b"deadbeef");
        let b = announce_fingerprint(1337, b"deadbeef");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_for_different_data_type() {
        let a = announce_fingerprint(1337, b"deadbeef");
        let b = announce_fingerprint(7, b"deadbeef");
        assert_ne!(a, b);
    }

    fn test_config() -> Config {
        Config {
            hostkey: "node.pem".into(),
            cache_size: 8,
            degree: 4,
            bootstrapper: "127.0.0.1:6001".into(),
            p2p_address: "127.0.0.1:6000".into(),
            api_address: "127.0.0.1:7000".into(),
            challenge_timeout: 5,
            challenge_difficulty: 1,
            discovery_cooldown: 60,
        }
    }

    fn test_state() -> NodeState {
        NodeState::new(test_config(), "127.0.0.1:6000".parse().unwrap())
    }

    fn pending_with_awaiting(awaiting: HashSet<u64>) -> PendingValidation {
        PendingValidation {
            ttl: 3,
            data_type: 1337,
            data: Bytes::from_static(b"deadbeef"),
            source: Weak::new(),
            awaiting,
        }
    }

    #[test]
    fn apply_validation_unknown_message_id_is_ignored() {
        let state = test_state();
        assert!(matches!(state.apply_validation(42, 1, true), ValidationOutcome::Unknown));
    }

    #[test]
    fn apply_validation_rejects_non_awaiting_session() {
        let state = test_state();
        let message_id = {
            let mut pending = state.pending_validations.lock();
            let entry = pending_with_awaiting(HashSet::from([1]));
            pending.insert(99, entry);
            99
        };
        assert!(matches!(
            state.apply_validation(message_id, 2, true),
            ValidationOutcome::Unauthorized
        ));
    }

    #[test]
    fn apply_validation_all_valid_completes_and_removes_entry() {
        let state = test_state();
        {
            let mut pending = state.pending_validations.lock();
            pending.insert(7, pending_with_awaiting(HashSet::from([1, 2])));
        }
        assert!(matches!(
            state.apply_validation(7, 1, true),
            ValidationOutcome::StillPending
        ));
        assert!(matches!(
            state.apply_validation(7, 2, true),
            ValidationOutcome::Complete(_)
        ));
        assert!(state.pending_validations.lock().get(&7).is_none());
    }

    #[test]
    fn apply_validation_invalid_pops_entry_immediately() {
        let state = test_state();
        {
            let mut pending = state.pending_validations.lock();
            pending.insert(3, pending_with_awaiting(HashSet::from([1, 2])));
        }
        assert!(matches!(
            state.apply_validation(3, 1, false),
            ValidationOutcome::Invalid(_)
        ));
        assert!(state.pending_validations.lock().get(&3).is_none());
    }
}
