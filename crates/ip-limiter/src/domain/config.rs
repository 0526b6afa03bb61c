//! Limiter configuration and validation
//!
//! # Example
//!
//! ```ignore
//! use ip_limiter::domain::{LimiterConfig, SharedConfig};
//!
//! let config = LimiterConfig::default()
//!     .with_enabled(true)
//!     .with_max_addresses_per_credential(3)
//!     .with_max_connections_per_address(5);
//! config.validate()?;
//!
//! let shared = SharedConfig::new(config);
//! assert!(shared.is_enabled());
//! ```

use crate::error::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default store host
pub const DEFAULT_STORE_ADDR: &str = "127.0.0.1";
/// Default store port
pub const DEFAULT_STORE_PORT: u16 = 6379;
/// Default distinct addresses per credential
pub const DEFAULT_MAX_ADDRESSES: u32 = 2;
/// Default concurrent connections per address
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
/// Rolling expiry applied to every set and counter write
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Upper bound for any single store round trip
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long an accept event waits for its identify event
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(5);
/// Namespace shared by every key this limiter writes
pub const DEFAULT_KEY_PREFIX: &str = "user";

/// How a connection is admitted and recorded
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionMode {
    /// Read-only check followed by a separate record.
    ///
    /// Two concurrent callers may both pass the check before either records,
    /// over-admitting by one slot. Acceptable for a soft limit.
    #[default]
    CheckThenRecord,
    /// Single server-side conditional check-and-increment.
    AtomicReserve,
}

impl std::str::FromStr for AdmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "check-then-record" | "check" => Ok(AdmissionMode::CheckThenRecord),
            "atomic" | "atomic-reserve" => Ok(AdmissionMode::AtomicReserve),
            other => Err(format!("unknown admission mode: {other}")),
        }
    }
}

/// Admission limiter configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Master switch; when false every operation fails open
    pub enabled: bool,
    /// Store host
    pub store_addr: String,
    /// Store port
    pub store_port: u16,
    /// Store password (empty = no AUTH)
    pub store_auth: String,
    /// Store database index
    pub store_index: u32,
    /// Distinct client addresses allowed per credential
    pub max_addresses_per_credential: u32,
    /// Concurrent connections allowed per (credential, address)
    pub max_connections_per_address: u32,
    /// Bound on every store round trip
    pub store_timeout: Duration,
    /// Rolling expiry for set and counter entries
    pub entry_ttl: Duration,
    /// Key namespace prefix
    pub key_prefix: String,
    /// Check-then-record or atomic reserve
    pub admission_mode: AdmissionMode,
    /// Lifetime of an uncorrelated accept event
    pub pending_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store_addr: DEFAULT_STORE_ADDR.to_string(),
            store_port: DEFAULT_STORE_PORT,
            store_auth: String::new(),
            store_index: 0,
            max_addresses_per_credential: DEFAULT_MAX_ADDRESSES,
            max_connections_per_address: DEFAULT_MAX_CONNECTIONS,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            entry_ttl: DEFAULT_ENTRY_TTL,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            admission_mode: AdmissionMode::default(),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

impl LimiterConfig {
    /// Validate limits, timeouts and namespace
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_addresses_per_credential == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_addresses_per_credential cannot be 0".into(),
            ));
        }

        if self.max_connections_per_address == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_connections_per_address cannot be 0".into(),
            ));
        }

        if self.store_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "store_timeout cannot be 0".into(),
            ));
        }

        if self.pending_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "pending_timeout cannot be 0".into(),
            ));
        }

        // EXPIRE has one second resolution
        if self.entry_ttl.as_secs() == 0 {
            return Err(ConfigError::InvalidTtl);
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::EmptyKeyPrefix);
        }

        Ok(())
    }

    /// `host:port` of the shared store
    pub fn store_endpoint(&self) -> String {
        format!("{}:{}", self.store_addr, self.store_port)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_addresses_per_credential(mut self, max: u32) -> Self {
        self.max_addresses_per_credential = max;
        self
    }

    pub fn with_max_connections_per_address(mut self, max: u32) -> Self {
        self.max_connections_per_address = max;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_admission_mode(mut self, mode: AdmissionMode) -> Self {
        self.admission_mode = mode;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }
}

/// Configuration shared between the controller and its callers.
///
/// Read on every admission operation, written only when an operator
/// toggles the feature. A write is visible to every subsequent read.
#[derive(Clone, Debug, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<LimiterConfig>>,
}

impl SharedConfig {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Clone of the current configuration
    pub fn snapshot(&self) -> LimiterConfig {
        self.inner.read().clone()
    }

    /// Replace the configuration wholesale
    pub fn replace(&self, config: LimiterConfig) {
        *self.inner.write() = config;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.read().enabled
    }

    /// Run `f` against the current configuration without cloning it
    pub fn read<R>(&self, f: impl FnOnce(&LimiterConfig) -> R) -> R {
        f(&self.inner.read())
    }
}
