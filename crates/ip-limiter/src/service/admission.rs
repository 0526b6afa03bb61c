//! Admission Controller
//!
//! Tracks, per credential, which client addresses are connected and how
//! many connections each address holds, in a store shared by every limiter
//! instance.
//!
//! ## Failure model
//!
//! The limiter is a soft guard in front of a proxy that keeps working
//! without it. Every operation fails open:
//!
//! | Condition                   | check      | add / remove / clear | active ips |
//! |-----------------------------|------------|----------------------|------------|
//! | disabled                    | allow      | no-op                | empty      |
//! | store not initialized       | allow      | no-op                | empty      |
//! | store error or timeout      | allow      | logged, skipped      | empty      |
//!
//! Only [`AdmissionController::initialize`] reports an error to its caller.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AdmissionDecision, AdmissionMode, AdmissionOutcome, KeyNamespace, LimiterConfig, SharedConfig,
    SlotKeys,
};
use crate::error::{LimiterError, StoreError};
use crate::metrics::{AdmissionMetrics, MetricsSnapshot};
use crate::ports::{
    AdmissionApi, AdmissionStore, ReleaseOutcome, ReserveLimits, ReserveOutcome, StoreConnector,
};

/// Distributed per-credential admission controller
///
/// Implements the `AdmissionApi` port on top of an [`AdmissionStore`]
/// obtained from the injected [`StoreConnector`].
pub struct AdmissionController {
    config: SharedConfig,
    connector: Arc<dyn StoreConnector>,
    /// Set once by the first successful `initialize`
    store: OnceCell<Arc<dyn AdmissionStore>>,
    metrics: AdmissionMetrics,
}

impl AdmissionController {
    pub fn new(config: SharedConfig, connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            config,
            connector,
            store: OnceCell::new(),
            metrics: AdmissionMetrics::new(),
        }
    }

    /// Connect to the store and probe it.
    ///
    /// Runs the connector at most once across all callers: concurrent
    /// callers wait for the attempt in flight, and once a store handle is
    /// established later calls return immediately. A failed attempt leaves
    /// the controller inactive; the next call tries again.
    ///
    /// A disabled limiter returns `Ok` without connecting.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), LimiterError> {
        let config = self.config.snapshot();
        if !config.enabled {
            info!("Connection limiting disabled; store connection skipped");
            return Ok(());
        }
        config.validate()?;

        let result = self
            .store
            .get_or_try_init(|| async {
                let store = self.connector.connect(&config).await?;
                store.ping().await?;
                info!(
                    store = %config.store_endpoint(),
                    db = config.store_index,
                    mode = ?config.admission_mode,
                    "Admission store connected"
                );
                Ok::<_, StoreError>(store)
            })
            .await;

        if let Err(e) = result {
            self.metrics.record_store_error();
            warn!(
                store = %config.store_endpoint(),
                error = %e,
                "Admission store unavailable; connections will be allowed untracked"
            );
            return Err(e.into());
        }
        Ok(())
    }

    /// Enabled and holding a store handle
    pub fn is_active(&self) -> bool {
        self.config.is_enabled() && self.store.initialized()
    }

    /// Current configuration
    pub fn config(&self) -> LimiterConfig {
        self.config.snapshot()
    }

    /// Replace the configuration at runtime.
    ///
    /// Limits, TTL, prefix and mode apply to the next operation. The store
    /// handle is kept; enabling a limiter that was never initialized needs
    /// a call to [`initialize`](Self::initialize).
    pub fn update_config(&self, config: LimiterConfig) {
        info!(
            enabled = config.enabled,
            max_addresses = config.max_addresses_per_credential,
            max_connections = config.max_connections_per_address,
            mode = ?config.admission_mode,
            "Limiter configuration replaced"
        );
        self.config.replace(config);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn counters(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    /// Store handle and configuration, when operations should touch the store
    fn ready(&self) -> Option<(Arc<dyn AdmissionStore>, LimiterConfig)> {
        let config = self.config.snapshot();
        if !config.enabled {
            return None;
        }
        let store = Arc::clone(self.store.get()?);
        Some((store, config))
    }

    fn store_failed(&self, op: &str, identifier: &str, address: &str, error: &StoreError) {
        self.metrics.record_store_error();
        warn!(
            op = op,
            identifier = %identifier,
            address = %address,
            error = %error,
            "Admission store operation failed"
        );
    }

    /// Check both limits and report why a connection would be refused
    pub async fn evaluate(&self, identifier: &str, address: &str) -> AdmissionDecision {
        let decision = match self.ready() {
            None => AdmissionDecision::FailOpen,
            Some((store, config)) => {
                let slot = KeyNamespace::new(config.key_prefix.as_str()).slot(identifier, address);
                match check_limits(store.as_ref(), &config, &slot).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        self.store_failed("check", identifier, address, &e);
                        AdmissionDecision::FailOpen
                    }
                }
            }
        };

        self.metrics.record_decision(&decision);
        decision
    }

    /// `true` unless a limit is exceeded
    pub async fn check_connection(&self, identifier: &str, address: &str) -> bool {
        self.evaluate(identifier, address).await.is_allowed()
    }

    /// Record one connection and refresh the entry expiry.
    ///
    /// Returns whether the store counted it.
    pub async fn add_connection(&self, identifier: &str, address: &str) -> bool {
        let Some((store, config)) = self.ready() else {
            return false;
        };
        let slot = KeyNamespace::new(config.key_prefix.as_str()).slot(identifier, address);

        match store.record(&slot, config.entry_ttl).await {
            Ok(count) => {
                self.metrics.record_added();
                debug!(
                    identifier = %identifier,
                    address = %address,
                    count = count,
                    "Connection recorded"
                );
                true
            }
            Err(e) => {
                self.store_failed("record", identifier, address, &e);
                false
            }
        }
    }

    /// Release one connection; the address leaves the set at zero
    pub async fn remove_connection(&self, identifier: &str, address: &str) {
        let Some((store, config)) = self.ready() else {
            return;
        };
        let slot = KeyNamespace::new(config.key_prefix.as_str()).slot(identifier, address);

        match store.release(&slot).await {
            Ok(ReleaseOutcome::Decremented(count)) => {
                self.metrics.record_released();
                debug!(
                    identifier = %identifier,
                    address = %address,
                    count = count,
                    "Connection released"
                );
            }
            Ok(ReleaseOutcome::Removed) => {
                self.metrics.record_released();
                debug!(
                    identifier = %identifier,
                    address = %address,
                    "Last connection released; address removed"
                );
            }
            Ok(ReleaseOutcome::Missing) => {
                self.metrics.record_underflow();
                warn!(
                    identifier = %identifier,
                    address = %address,
                    "Release without a tracked connection; treated as zero"
                );
            }
            Err(e) => self.store_failed("release", identifier, address, &e),
        }
    }

    /// Delete every key in the limiter namespace
    #[instrument(skip(self))]
    pub async fn clear_all_connections(&self) {
        let Some((store, config)) = self.ready() else {
            return;
        };
        let pattern = KeyNamespace::new(config.key_prefix.as_str()).pattern();

        match store.delete_matching(&pattern).await {
            Ok(deleted) => info!(pattern = %pattern, deleted = deleted, "Cleared tracked connections"),
            Err(e) => {
                self.metrics.record_store_error();
                warn!(pattern = %pattern, error = %e, "Failed to clear tracked connections");
            }
        }
    }

    /// Addresses currently tracked for `identifier`
    pub async fn get_active_ips(&self, identifier: &str) -> HashSet<String> {
        let Some((store, config)) = self.ready() else {
            return HashSet::new();
        };
        let set_key = KeyNamespace::new(config.key_prefix.as_str()).address_set(identifier);

        match store.members(&set_key).await {
            Ok(members) => members,
            Err(e) => {
                self.metrics.record_store_error();
                warn!(identifier = %identifier, error = %e, "Failed to read active addresses");
                HashSet::new()
            }
        }
    }

    /// Check and record a connection according to the configured mode.
    ///
    /// `CheckThenRecord` leaves a window between the check and the record in
    /// which another instance may admit the same slot. `AtomicReserve`
    /// performs both in one store-side step.
    pub async fn try_admit(&self, identifier: &str, address: &str) -> AdmissionDecision {
        self.admit(identifier, address).await.decision
    }

    /// [`try_admit`](Self::try_admit), also reporting whether the connection
    /// was counted.
    ///
    /// A fail-open check can still be followed by a successful record once
    /// the store answers again; such a connection is `recorded` and must be
    /// released like any other.
    pub async fn admit(&self, identifier: &str, address: &str) -> AdmissionOutcome {
        let mode = self.config.read(|c| c.admission_mode);
        match mode {
            AdmissionMode::CheckThenRecord => {
                let decision = self.evaluate(identifier, address).await;
                let recorded =
                    decision.is_allowed() && self.add_connection(identifier, address).await;
                AdmissionOutcome { decision, recorded }
            }
            AdmissionMode::AtomicReserve => self.reserve(identifier, address).await,
        }
    }

    async fn reserve(&self, identifier: &str, address: &str) -> AdmissionOutcome {
        let Some((store, config)) = self.ready() else {
            self.metrics.record_decision(&AdmissionDecision::FailOpen);
            return AdmissionOutcome::untracked(AdmissionDecision::FailOpen);
        };
        let slot = KeyNamespace::new(config.key_prefix.as_str()).slot(identifier, address);
        let limits = ReserveLimits {
            max_addresses: config.max_addresses_per_credential,
            max_connections: config.max_connections_per_address,
        };

        let outcome = match store.try_reserve(&slot, limits, config.entry_ttl).await {
            Ok(ReserveOutcome::Reserved(count)) => {
                self.metrics.record_added();
                debug!(
                    identifier = %identifier,
                    address = %address,
                    count = count,
                    "Connection reserved"
                );
                AdmissionOutcome {
                    decision: AdmissionDecision::Allowed,
                    recorded: true,
                }
            }
            Ok(ReserveOutcome::AddressLimit(active)) => {
                AdmissionOutcome::untracked(AdmissionDecision::AddressLimit {
                    active,
                    max: limits.max_addresses,
                })
            }
            Ok(ReserveOutcome::ConnectionLimit(count)) => {
                AdmissionOutcome::untracked(AdmissionDecision::ConnectionLimit {
                    count,
                    max: limits.max_connections,
                })
            }
            Err(e) => {
                self.store_failed("reserve", identifier, address, &e);
                AdmissionOutcome::untracked(AdmissionDecision::FailOpen)
            }
        };

        self.metrics.record_decision(&outcome.decision);
        outcome
    }
}

/// Read-only evaluation of both limits
async fn check_limits(
    store: &dyn AdmissionStore,
    config: &LimiterConfig,
    slot: &SlotKeys,
) -> Result<AdmissionDecision, StoreError> {
    let max_addresses = config.max_addresses_per_credential;
    let active = store.set_size(&slot.set_key).await?;
    if active >= u64::from(max_addresses) && !store.is_member(&slot.set_key, &slot.member).await? {
        return Ok(AdmissionDecision::AddressLimit {
            active,
            max: max_addresses,
        });
    }

    let max_connections = config.max_connections_per_address;
    let count = store.counter(&slot.counter_key).await?;
    if count >= i64::from(max_connections) {
        return Ok(AdmissionDecision::ConnectionLimit {
            count,
            max: max_connections,
        });
    }

    Ok(AdmissionDecision::Allowed)
}

#[async_trait]
impl AdmissionApi for AdmissionController {
    async fn check_connection(&self, identifier: &str, address: &str) -> bool {
        AdmissionController::check_connection(self, identifier, address).await
    }

    async fn add_connection(&self, identifier: &str, address: &str) {
        AdmissionController::add_connection(self, identifier, address).await;
    }

    async fn remove_connection(&self, identifier: &str, address: &str) {
        AdmissionController::remove_connection(self, identifier, address).await
    }

    async fn clear_all_connections(&self) {
        AdmissionController::clear_all_connections(self).await
    }

    async fn get_active_ips(&self, identifier: &str) -> HashSet<String> {
        AdmissionController::get_active_ips(self, identifier).await
    }

    async fn try_admit(&self, identifier: &str, address: &str) -> AdmissionDecision {
        AdmissionController::try_admit(self, identifier, address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryConnector;
    use crate::domain::config::DEFAULT_ENTRY_TTL;
    use std::time::Duration;

    fn enabled(max_addresses: u32, max_connections: u32) -> LimiterConfig {
        LimiterConfig::default()
            .with_enabled(true)
            .with_max_addresses_per_credential(max_addresses)
            .with_max_connections_per_address(max_connections)
    }

    async fn controller(config: LimiterConfig) -> (AdmissionController, Arc<InMemoryConnector>) {
        let connector = Arc::new(InMemoryConnector::new());
        let controller = AdmissionController::new(SharedConfig::new(config), connector.clone());
        controller.initialize().await.unwrap();
        (controller, connector)
    }

    #[tokio::test]
    async fn test_disabled_initialize_skips_connect() {
        let (controller, connector) = controller(LimiterConfig::default()).await;
        assert_eq!(connector.connect_count(), 0);
        assert!(!controller.is_active());
        assert!(controller.check_connection("U", "1.1.1.1").await);
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let connector = Arc::new(InMemoryConnector::new());
        let controller = AdmissionController::new(
            SharedConfig::new(enabled(0, 1)),
            connector.clone(),
        );
        assert!(matches!(
            controller.initialize().await,
            Err(LimiterError::Config(_))
        ));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_initialize_can_retry() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.set_fail_connect(true);
        let controller = AdmissionController::new(SharedConfig::new(enabled(2, 2)), connector.clone());

        assert!(matches!(
            controller.initialize().await,
            Err(LimiterError::Store(StoreError::Connect { .. }))
        ));
        assert!(!controller.is_active());

        connector.set_fail_connect(false);
        controller.initialize().await.unwrap();
        assert!(controller.is_active());

        controller.initialize().await.unwrap();
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_ping_leaves_inactive() {
        let connector = Arc::new(InMemoryConnector::new());
        connector.store().set_unavailable(true);
        let controller = AdmissionController::new(SharedConfig::new(enabled(2, 2)), connector.clone());

        assert!(controller.initialize().await.is_err());
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn test_evaluate_reports_reason() {
        let (controller, _) = controller(enabled(1, 2)).await;

        controller.add_connection("U", "1.1.1.1").await;
        assert_eq!(
            controller.evaluate("U", "2.2.2.2").await,
            AdmissionDecision::AddressLimit { active: 1, max: 1 }
        );

        controller.add_connection("U", "1.1.1.1").await;
        assert_eq!(
            controller.evaluate("U", "1.1.1.1").await,
            AdmissionDecision::ConnectionLimit { count: 2, max: 2 }
        );
        assert_eq!(
            controller.evaluate("V", "1.1.1.1").await,
            AdmissionDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (controller, connector) = controller(enabled(1, 1)).await;
        controller.add_connection("U", "1.1.1.1").await;
        assert!(!controller.check_connection("U", "2.2.2.2").await);

        connector.store().set_unavailable(true);
        assert_eq!(
            controller.evaluate("U", "2.2.2.2").await,
            AdmissionDecision::FailOpen
        );
        assert!(controller.get_active_ips("U").await.is_empty());
        controller.add_connection("U", "2.2.2.2").await;
        controller.remove_connection("U", "1.1.1.1").await;

        let metrics = controller.metrics();
        assert_eq!(metrics.fail_open, 1);
        assert_eq!(metrics.store_errors, 4);

        connector.store().set_unavailable(false);
        assert_eq!(
            controller.get_active_ips("U").await,
            HashSet::from(["1.1.1.1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_add_connection_sets_entry_ttl_on_both_keys() {
        tokio::time::pause();
        let (controller, connector) = controller(enabled(2, 2)).await;
        let slot = KeyNamespace::default().slot("U", "1.1.1.1");
        let store = connector.store();

        assert!(controller.add_connection("U", "1.1.1.1").await);
        assert_eq!(store.ttl(&slot.set_key), Some(DEFAULT_ENTRY_TTL));
        assert_eq!(store.ttl(&slot.counter_key), Some(DEFAULT_ENTRY_TTL));

        // Every write pushes the expiry out again
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(
            store.ttl(&slot.counter_key),
            Some(DEFAULT_ENTRY_TTL - Duration::from_secs(3600))
        );
        assert!(controller.add_connection("U", "1.1.1.1").await);
        assert_eq!(store.ttl(&slot.set_key), Some(DEFAULT_ENTRY_TTL));
        assert_eq!(store.ttl(&slot.counter_key), Some(DEFAULT_ENTRY_TTL));
    }

    #[tokio::test]
    async fn test_add_connection_reports_skipped_write() {
        let (controller, connector) = controller(enabled(2, 2)).await;
        connector.store().set_unavailable(true);
        assert!(!controller.add_connection("U", "1.1.1.1").await);

        controller.update_config(controller.config().with_enabled(false));
        connector.store().set_unavailable(false);
        assert!(!controller.add_connection("U", "1.1.1.1").await);
    }

    #[tokio::test]
    async fn test_admit_reports_recorded_after_fail_open_check() {
        let (controller, connector) = controller(enabled(1, 1)).await;
        connector.store().set_reads_failing(true);

        let outcome = controller.admit("U", "1.1.1.1").await;
        assert_eq!(
            outcome,
            AdmissionOutcome {
                decision: AdmissionDecision::FailOpen,
                recorded: true,
            }
        );

        connector.store().set_reads_failing(false);
        assert_eq!(
            controller.get_active_ips("U").await,
            HashSet::from(["1.1.1.1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_remove_untracked_counts_underflow() {
        let (controller, _) = controller(enabled(2, 2)).await;
        controller.remove_connection("U", "1.1.1.1").await;

        let metrics = controller.metrics();
        assert_eq!(metrics.underflows, 1);
        assert_eq!(metrics.released, 0);
        assert!(controller.get_active_ips("U").await.is_empty());
    }

    #[tokio::test]
    async fn test_update_config_applies_to_next_check() {
        let (controller, _) = controller(enabled(1, 5)).await;
        controller.add_connection("U", "1.1.1.1").await;
        assert!(!controller.check_connection("U", "2.2.2.2").await);

        controller.update_config(enabled(2, 5));
        assert!(controller.check_connection("U", "2.2.2.2").await);

        controller.update_config(controller.config().with_enabled(false));
        assert!(!controller.is_active());
        assert!(controller.check_connection("U", "9.9.9.9").await);
        assert!(controller.get_active_ips("U").await.is_empty());
    }

    #[tokio::test]
    async fn test_try_admit_check_then_record() {
        let (controller, _) = controller(enabled(2, 1)).await;

        assert_eq!(controller.try_admit("U", "1.1.1.1").await, AdmissionDecision::Allowed);
        assert_eq!(
            controller.try_admit("U", "1.1.1.1").await,
            AdmissionDecision::ConnectionLimit { count: 1, max: 1 }
        );
        assert_eq!(controller.metrics().recorded, 1);
    }

    #[tokio::test]
    async fn test_try_admit_atomic_reserve() {
        let config = enabled(1, 2).with_admission_mode(AdmissionMode::AtomicReserve);
        let (controller, _) = controller(config).await;

        assert!(controller.admit("U", "1.1.1.1").await.recorded);
        assert_eq!(
            controller.admit("U", "2.2.2.2").await,
            AdmissionOutcome::untracked(AdmissionDecision::AddressLimit { active: 1, max: 1 })
        );
        assert_eq!(controller.try_admit("U", "1.1.1.1").await, AdmissionDecision::Allowed);
        assert_eq!(
            controller.try_admit("U", "1.1.1.1").await,
            AdmissionDecision::ConnectionLimit { count: 2, max: 2 }
        );

        let metrics = controller.metrics();
        assert_eq!(metrics.recorded, 2);
        assert_eq!(metrics.rejected(), 2);
    }

    #[tokio::test]
    async fn test_key_prefix_isolates_namespaces() {
        let connector = Arc::new(InMemoryConnector::new());
        let a = AdmissionController::new(SharedConfig::new(enabled(1, 1)), connector.clone());
        let b = AdmissionController::new(
            SharedConfig::new(enabled(1, 1).with_key_prefix("edge")),
            connector.clone(),
        );
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        a.add_connection("U", "1.1.1.1").await;
        assert!(b.check_connection("U", "2.2.2.2").await);

        b.clear_all_connections().await;
        assert_eq!(a.get_active_ips("U").await.len(), 1);
    }
}
