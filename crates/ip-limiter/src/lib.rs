//! # IP Limiter
//!
//! Per-credential connection admission control for a multi-protocol proxy.
//! The limiter watches the proxy's log stream, pairs each accepted
//! connection with the credential that authenticated it, and enforces two
//! limits at once:
//!
//! - distinct client addresses per credential
//! - concurrent connections per (credential, address)
//!
//! State lives in a shared keyed store (Redis), so every limiter instance
//! pointed at the same store enforces the same limits.
//!
//! ## Architecture
//!
//! This crate follows Hexagonal Architecture (Ports & Adapters):
//!
//! - **Domain Layer** (`domain/`): Pure logic, no I/O
//!   - `LimiterConfig` / `SharedConfig`: Configuration and its runtime holder
//!   - `extract_credentials`: Inbound client lists from a proxy config
//!   - `parse_line`: Accept / identify / close recognition
//!   - `KeyNamespace`: Store key layout
//!   - `AdmissionDecision`: Why a connection was allowed or refused
//!
//! - **Ports Layer** (`ports/`): Trait definitions
//!   - `AdmissionApi`, `CredentialLookup`: Driving ports
//!   - `AdmissionStore`, `StoreConnector`, `SettingsSource`,
//!     `ConnectionEnforcer`: Driven ports
//!
//! - **Service Layer** (`service/`): Orchestration
//!   - `AdmissionController`: Implements `AdmissionApi`
//!   - `EventCorrelator`: Log lines to admission operations
//!   - `CredentialRegistry`: Implements `CredentialLookup`
//!
//! - **Adapters Layer** (`adapters/`): External connections
//!   - `RedisConnector` / `RedisAdmissionStore`: Shared store
//!   - `InMemoryConnector` / `InMemoryAdmissionStore`: Single-process store
//!   - `MapSettings` / `JsonSettings`: Settings sources
//!   - `LogOnlyEnforcer` / `ChannelEnforcer`: Rejection handling
//!
//! ## Invariants
//!
//! - An address is in `<prefix>:<id>:ips` exactly while its counter is positive
//! - Every write refreshes a rolling expiry on both keys
//! - Disabled, uninitialized or failing store: every check allows
//!
//! ## Usage Example
//!
//! ```ignore
//! use ip_limiter::{
//!     AdmissionController, CorrelatorConfig, EventCorrelator, LimiterConfig, LogOnlyEnforcer,
//!     RedisConnector, SharedConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = LimiterConfig::default()
//!     .with_enabled(true)
//!     .with_max_addresses_per_credential(2);
//! let controller = Arc::new(AdmissionController::new(
//!     SharedConfig::new(config.clone()),
//!     Arc::new(RedisConnector),
//! ));
//! controller.initialize().await?;
//!
//! let correlator = EventCorrelator::new(
//!     controller.clone(),
//!     Arc::new(LogOnlyEnforcer),
//!     CorrelatorConfig::from_limiter(&config),
//! );
//! correlator
//!     .process_line("accept a vless connection from 1.1.1.1:443 identifier: abc-123")
//!     .await;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod adapters;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod service;

// Re-exports
pub use adapters::{
    load_limiter_config, ChannelEnforcer, InMemoryAdmissionStore, InMemoryConnector, JsonSettings,
    LogOnlyEnforcer, MapSettings,
};
#[cfg(feature = "redis-store")]
pub use adapters::{RedisAdmissionStore, RedisConnector};
pub use domain::{
    parse_line, AdmissionDecision, AdmissionMode, AdmissionOutcome, KeyNamespace, LimiterConfig,
    ProtocolKind, SharedConfig,
};
pub use error::{ConfigError, DocumentError, LimiterError, StoreError};
pub use metrics::{AdmissionMetrics, MetricsSnapshot};
pub use ports::{
    AdmissionApi, AdmissionStore, ConnectionEnforcer, CredentialLookup, Rejection,
    SettingsSource, StoreConnector,
};
pub use service::{
    cleanup_task, AdmissionController, CorrelatorConfig, CredentialRegistry, EventCorrelator,
    LineOutcome, RebuildSummary,
};
