//! Outbound Ports (Driven Ports)
//!
//! Dependencies the limiter needs from the outside world: the shared keyed
//! store, a settings source, and the hook that acts on a rejection.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{AdmissionDecision, LimiterConfig, SlotKeys};
use crate::error::StoreError;

/// Result of releasing one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Counter decremented and still positive
    Decremented(i64),
    /// Counter reached zero; address removed from the set and counter deleted
    Removed,
    /// No counter existed; nothing was changed
    Missing,
}

/// Result of an atomic check-and-reserve
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Recorded; carries the new counter value
    Reserved(i64),
    /// Address not in the set and the set is full; carries the set size
    AddressLimit(u64),
    /// Counter already at the limit; carries the counter value
    ConnectionLimit(i64),
}

/// Limits applied by [`AdmissionStore::try_reserve`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveLimits {
    pub max_addresses: u32,
    pub max_connections: u32,
}

/// Shared keyed store (Driven Port)
///
/// The store is the single authority for admission state. Compound writes
/// must be applied atomically so that concurrent readers in other processes
/// never observe half of them.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<(), StoreError>;

    /// Number of members in a set (0 when absent)
    async fn set_size(&self, set_key: &str) -> Result<u64, StoreError>;

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, StoreError>;

    /// Counter value (0 when absent)
    async fn counter(&self, counter_key: &str) -> Result<i64, StoreError>;

    /// Atomically add the member, increment the counter and reset both expiries.
    ///
    /// Returns the new counter value.
    async fn record(&self, slot: &SlotKeys, ttl: Duration) -> Result<i64, StoreError>;

    /// Decrement the counter; at zero remove the member and delete the counter.
    async fn release(&self, slot: &SlotKeys) -> Result<ReleaseOutcome, StoreError>;

    /// Check both limits and record in one atomic step.
    async fn try_reserve(
        &self,
        slot: &SlotKeys,
        limits: ReserveLimits,
        ttl: Duration,
    ) -> Result<ReserveOutcome, StoreError>;

    async fn members(&self, set_key: &str) -> Result<HashSet<String>, StoreError>;

    /// Delete every key matching a `*` glob; returns how many were deleted
    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError>;
}

/// Factory for the store handle (Driven Port)
///
/// Invoked at most once per successful controller initialization.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, config: &LimiterConfig) -> Result<Arc<dyn AdmissionStore>, StoreError>;
}

/// Key/value settings provider (Driven Port)
pub trait SettingsSource: Send + Sync {
    /// Raw value for `key`, `None` when the key is absent
    fn get(&self, key: &str) -> Option<String>;
}

/// A connection the limiter refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub identifier: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub session: Option<u64>,
    pub decision: AdmissionDecision,
}

/// Acts on a rejected admission (Driven Port)
///
/// The limiter only observes logs after the fact; severing the connection
/// is the proxy engine's business. Implementations forward the rejection
/// to whatever mechanism the deployment has.
#[async_trait]
pub trait ConnectionEnforcer: Send + Sync {
    async fn reject(&self, rejection: &Rejection);
}
