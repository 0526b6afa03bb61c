//! In-process admission store
//!
//! Mirrors the Redis semantics the limiter relies on (sets, counters,
//! per-key expiry, glob deletion) behind a single mutex, which makes every
//! operation trivially atomic. Suitable for single-instance deployments and
//! tests; limits only hold within one process.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::keys::glob_match;
use crate::domain::{LimiterConfig, SlotKeys};
use crate::error::StoreError;
use crate::ports::{
    AdmissionStore, ReleaseOutcome, ReserveLimits, ReserveOutcome, StoreConnector,
};

enum Value {
    Set(HashSet<String>),
    Counter(i64),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Drop `key` if it has expired, then return it
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn set_size(&mut self, key: &str, now: Instant) -> u64 {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => members.len() as u64,
            _ => 0,
        }
    }

    fn is_member(&mut self, key: &str, member: &str, now: Instant) -> bool {
        matches!(
            self.live(key, now),
            Some(Entry { value: Value::Set(members), .. }) if members.contains(member)
        )
    }

    fn counter(&mut self, key: &str, now: Instant) -> i64 {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Counter(n),
                ..
            }) => *n,
            _ => 0,
        }
    }

    fn record(&mut self, slot: &SlotKeys, ttl: Duration, now: Instant) -> i64 {
        let expires_at = Some(now + ttl);

        self.live(&slot.set_key, now);
        let set = self
            .entries
            .entry(slot.set_key.clone())
            .or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at,
            });
        if !matches!(set.value, Value::Set(_)) {
            set.value = Value::Set(HashSet::new());
        }
        if let Value::Set(members) = &mut set.value {
            members.insert(slot.member.clone());
        }
        set.expires_at = expires_at;

        self.live(&slot.counter_key, now);
        let counter = self
            .entries
            .entry(slot.counter_key.clone())
            .or_insert_with(|| Entry {
                value: Value::Counter(0),
                expires_at,
            });
        let next = match counter.value {
            Value::Counter(n) => n + 1,
            Value::Set(_) => 1,
        };
        counter.value = Value::Counter(next);
        counter.expires_at = expires_at;
        next
    }

    fn remove_member(&mut self, set_key: &str, member: &str, now: Instant) {
        let emptied = match self.live(set_key, now) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.remove(member);
                members.is_empty()
            }
            _ => false,
        };
        // Redis deletes a set once its last member is removed
        if emptied {
            self.entries.remove(set_key);
        }
    }
}

/// Mutex-guarded in-memory [`AdmissionStore`]
#[derive(Default)]
pub struct InMemoryAdmissionStore {
    keyspace: Mutex<Keyspace>,
    unavailable: AtomicBool,
    reads_failing: AtomicBool,
}

impl InMemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make reads fail while writes keep succeeding, as during a partial outage
    pub fn set_reads_failing(&self, failing: bool) {
        self.reads_failing.store(failing, Ordering::SeqCst);
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Remaining lifetime of a key, `None` when absent or without expiry
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();
        keyspace
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn read_guard(&self, op: &'static str) -> Result<(), StoreError> {
        self.guard()?;
        if self.reads_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout {
                op,
                after: Duration::ZERO,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AdmissionStore for InMemoryAdmissionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.guard()
    }

    async fn set_size(&self, set_key: &str) -> Result<u64, StoreError> {
        self.read_guard("scard")?;
        Ok(self.keyspace.lock().set_size(set_key, Instant::now()))
    }

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        self.read_guard("sismember")?;
        Ok(self
            .keyspace
            .lock()
            .is_member(set_key, member, Instant::now()))
    }

    async fn counter(&self, counter_key: &str) -> Result<i64, StoreError> {
        self.read_guard("get")?;
        Ok(self.keyspace.lock().counter(counter_key, Instant::now()))
    }

    async fn record(&self, slot: &SlotKeys, ttl: Duration) -> Result<i64, StoreError> {
        self.guard()?;
        Ok(self.keyspace.lock().record(slot, ttl, Instant::now()))
    }

    async fn release(&self, slot: &SlotKeys) -> Result<ReleaseOutcome, StoreError> {
        self.guard()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();

        let remaining = match keyspace.live(&slot.counter_key, now) {
            Some(Entry {
                value: Value::Counter(n),
                ..
            }) => {
                *n -= 1;
                *n
            }
            _ => return Ok(ReleaseOutcome::Missing),
        };

        if remaining > 0 {
            return Ok(ReleaseOutcome::Decremented(remaining));
        }

        keyspace.remove_member(&slot.set_key, &slot.member, now);
        keyspace.entries.remove(&slot.counter_key);
        Ok(ReleaseOutcome::Removed)
    }

    async fn try_reserve(
        &self,
        slot: &SlotKeys,
        limits: ReserveLimits,
        ttl: Duration,
    ) -> Result<ReserveOutcome, StoreError> {
        self.guard()?;
        let now = Instant::now();
        let mut keyspace = self.keyspace.lock();

        let size = keyspace.set_size(&slot.set_key, now);
        if size >= u64::from(limits.max_addresses)
            && !keyspace.is_member(&slot.set_key, &slot.member, now)
        {
            return Ok(ReserveOutcome::AddressLimit(size));
        }

        let count = keyspace.counter(&slot.counter_key, now);
        if count >= i64::from(limits.max_connections) {
            return Ok(ReserveOutcome::ConnectionLimit(count));
        }

        Ok(ReserveOutcome::Reserved(keyspace.record(slot, ttl, now)))
    }

    async fn members(&self, set_key: &str) -> Result<HashSet<String>, StoreError> {
        self.read_guard("smembers")?;
        let now = Instant::now();
        match self.keyspace.lock().live(set_key, now) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.clone()),
            _ => Ok(HashSet::new()),
        }
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        self.guard()?;
        let mut keyspace = self.keyspace.lock();
        let before = keyspace.entries.len();
        keyspace.entries.retain(|key, _| !glob_match(pattern, key));
        let deleted = (before - keyspace.entries.len()) as u64;
        debug!(pattern = pattern, deleted = deleted, "Deleted in-memory keys");
        Ok(deleted)
    }
}

/// Connector handing out one shared [`InMemoryAdmissionStore`]
#[derive(Default)]
pub struct InMemoryConnector {
    store: Arc<InMemoryAdmissionStore>,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing store, e.g. to simulate several instances
    pub fn with_store(store: Arc<InMemoryAdmissionStore>) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn store(&self) -> Arc<InMemoryAdmissionStore> {
        Arc::clone(&self.store)
    }

    /// Number of times `connect` has been invoked
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make `connect` fail, simulating an unreachable store
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for InMemoryConnector {
    async fn connect(&self, config: &LimiterConfig) -> Result<Arc<dyn AdmissionStore>, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // Give concurrent initializers a chance to pile up behind this attempt
        tokio::task::yield_now().await;

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(StoreError::Connect {
                addr: config.store_endpoint(),
                message: "connection refused".into(),
            });
        }
        Ok(self.store() as Arc<dyn AdmissionStore>)
    }
}
