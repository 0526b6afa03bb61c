//! # Admission Controller Integration Tests
//!
//! Exercises the public API against the in-memory store.
//!
//! ## Properties
//!
//! 1. Disabled limiter allows everything
//! 2. The (k+1)-th distinct address of a credential is refused
//! 3. The connection limit per address frees up after a release
//! 4. n adds followed by n removes leave no trace
//! 5. Clear empties every credential
//!
//! Plus the reference two-address scenario, multi-instance sharing and
//! concurrency of initialization and atomic admission.

use std::collections::HashSet;
use std::sync::Arc;

use ip_limiter::{
    AdmissionController, AdmissionDecision, AdmissionMode, InMemoryAdmissionStore,
    InMemoryConnector, LimiterConfig, SharedConfig,
};
use proptest::prelude::*;

fn limits(max_addresses: u32, max_connections: u32) -> LimiterConfig {
    LimiterConfig::default()
        .with_enabled(true)
        .with_max_addresses_per_credential(max_addresses)
        .with_max_connections_per_address(max_connections)
}

async fn ready_controller(config: LimiterConfig) -> AdmissionController {
    let controller = AdmissionController::new(
        SharedConfig::new(config),
        Arc::new(InMemoryConnector::new()),
    );
    controller.initialize().await.expect("in-memory store connects");
    controller
}

// ─────────────────────────────────────────────────────────────────────────────
// Property 1: disabled limiter allows everything
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn prop_disabled_limiter_allows_everything(
        identifier in "[a-zA-Z0-9\\-]{1,36}",
        address in "[0-9a-f:.]{1,39}",
        max_addresses in 1u32..4,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let allowed = rt.block_on(async {
            let config = limits(max_addresses, 1).with_enabled(false);
            let controller = ready_controller(config).await;

            // Writes while disabled are skipped, so nothing can accumulate
            for _ in 0..3 {
                controller.add_connection(&identifier, &address).await;
            }
            controller.check_connection(&identifier, &address).await
        });

        prop_assert!(allowed);
    }
}

/// An enabled limiter whose store never connected also allows.
#[tokio::test]
async fn test_unreachable_store_allows() {
    let connector = Arc::new(InMemoryConnector::new());
    connector.set_fail_connect(true);
    let controller = AdmissionController::new(SharedConfig::new(limits(1, 1)), connector);

    assert!(controller.initialize().await.is_err());
    for address in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
        controller.add_connection("U", address).await;
        assert!(controller.check_connection("U", address).await);
    }
    assert!(controller.get_active_ips("U").await.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties 2-5
// ─────────────────────────────────────────────────────────────────────────────

/// After k distinct addresses with `max_addresses = k`, address k+1 is refused
/// while the first k still pass.
#[tokio::test]
async fn test_address_limit_refuses_next_address() {
    for k in 1..=4u32 {
        let controller = ready_controller(limits(k, 10)).await;
        let addresses: Vec<String> = (1..=k).map(|i| format!("10.0.0.{i}")).collect();

        for address in &addresses {
            controller.add_connection("U", address).await;
        }

        assert!(!controller.check_connection("U", "10.0.1.1").await, "k = {k}");
        for address in &addresses {
            assert!(controller.check_connection("U", address).await, "k = {k}");
        }
    }
}

/// After m records with `max_connections = m` the pair is refused; one
/// release makes room again.
#[tokio::test]
async fn test_connection_limit_frees_after_release() {
    let m = 3;
    let controller = ready_controller(limits(5, m)).await;

    for _ in 0..m {
        controller.add_connection("U", "1.1.1.1").await;
    }
    assert!(!controller.check_connection("U", "1.1.1.1").await);

    controller.remove_connection("U", "1.1.1.1").await;
    assert!(controller.check_connection("U", "1.1.1.1").await);
}

/// n adds then n removes leave the address untracked.
#[tokio::test]
async fn test_balanced_add_remove_leaves_no_trace() {
    let controller = ready_controller(limits(5, 10)).await;

    for n in [1, 2, 7] {
        for _ in 0..n {
            controller.add_connection("U", "1.1.1.1").await;
        }
        assert!(controller.get_active_ips("U").await.contains("1.1.1.1"));

        for _ in 0..n {
            controller.remove_connection("U", "1.1.1.1").await;
        }
        assert!(
            !controller.get_active_ips("U").await.contains("1.1.1.1"),
            "n = {n}"
        );
    }
    assert_eq!(controller.metrics().underflows, 0);
}

/// Clear removes every credential's state.
#[tokio::test]
async fn test_clear_empties_everything() {
    let controller = ready_controller(limits(5, 10)).await;
    controller.add_connection("U", "1.1.1.1").await;
    controller.add_connection("U", "2.2.2.2").await;
    controller.add_connection("V", "3.3.3.3").await;

    controller.clear_all_connections().await;

    assert!(controller.get_active_ips("U").await.is_empty());
    assert!(controller.get_active_ips("V").await.is_empty());
    assert!(controller.check_connection("U", "4.4.4.4").await);
}

/// Reference scenario with limits 2 / 1.
#[tokio::test]
async fn test_two_address_scenario() {
    let controller = ready_controller(limits(2, 1)).await;

    controller.add_connection("U", "1.1.1.1").await;
    controller.add_connection("U", "2.2.2.2").await;

    assert!(!controller.check_connection("U", "3.3.3.3").await);
    assert!(!controller.check_connection("U", "1.1.1.1").await);

    controller.remove_connection("U", "1.1.1.1").await;
    assert!(controller.check_connection("U", "1.1.1.1").await);
    assert_eq!(
        controller.get_active_ips("U").await,
        HashSet::from(["2.2.2.2".to_string()])
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Sharing and concurrency
// ─────────────────────────────────────────────────────────────────────────────

/// Two instances on one store enforce one limit.
#[tokio::test]
async fn test_limit_holds_across_instances() {
    let store = Arc::new(InMemoryAdmissionStore::new());
    let instance = |config: LimiterConfig| {
        AdmissionController::new(
            SharedConfig::new(config),
            Arc::new(InMemoryConnector::with_store(store.clone())),
        )
    };
    let a = instance(limits(2, 5));
    let b = instance(limits(2, 5));
    a.initialize().await.unwrap();
    b.initialize().await.unwrap();

    a.add_connection("U", "1.1.1.1").await;
    b.add_connection("U", "2.2.2.2").await;

    assert!(!a.check_connection("U", "3.3.3.3").await);
    assert!(!b.check_connection("U", "3.3.3.3").await);

    b.remove_connection("U", "1.1.1.1").await;
    assert!(a.check_connection("U", "3.3.3.3").await);
}

/// Concurrent `initialize` calls run the connector once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initialize_connects_once() {
    let connector = Arc::new(InMemoryConnector::new());
    let controller = Arc::new(AdmissionController::new(
        SharedConfig::new(limits(2, 2)),
        connector.clone(),
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.initialize().await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(connector.connect_count(), 1);
    assert!(controller.is_active());
}

/// Atomic reservation never admits more addresses than the limit, however
/// many callers race.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_atomic_reserve_never_over_admits_addresses() {
    let config = limits(3, 100).with_admission_mode(AdmissionMode::AtomicReserve);
    let controller = Arc::new(ready_controller(config).await);

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.try_admit("U", &format!("10.0.0.{i}")).await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() == AdmissionDecision::Allowed {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 3);
    assert_eq!(controller.get_active_ips("U").await.len(), 3);
}

/// Same for the per-address connection limit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_atomic_reserve_never_over_admits_connections() {
    let config = limits(2, 5).with_admission_mode(AdmissionMode::AtomicReserve);
    let controller = Arc::new(ready_controller(config).await);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.try_admit("U", "1.1.1.1").await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap().is_allowed() {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 5);
    let metrics = controller.metrics();
    assert_eq!(metrics.recorded, 5);
    assert_eq!(metrics.rejected_connection_limit, 15);
}
