//! Settings source adapters and the settings -> configuration mapping
//!
//! | Key             | Meaning                               | Default     |
//! |-----------------|---------------------------------------|-------------|
//! | `enableIpLimit` | `"true"` enables the limiter          | disabled    |
//! | `redisAddr`     | store host                            | `127.0.0.1` |
//! | `redisPort`     | store port (1..=65535)                | `6379`      |
//! | `redisPassword` | store password                        | empty       |
//! | `redisDb`       | store database index (>= 0)           | `0`         |
//! | `maxIpLimit`    | distinct addresses per credential (>0)| `2`         |
//! | `maxIpPerConn`  | connections per address (>0)          | `10`        |
//!
//! Missing or invalid values fall back to the default. A missing source,
//! or any `enableIpLimit` other than `"true"`, disables the limiter and
//! nothing else is read.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::domain::LimiterConfig;
use crate::error::DocumentError;
use crate::ports::SettingsSource;

pub const KEY_ENABLE: &str = "enableIpLimit";
pub const KEY_STORE_ADDR: &str = "redisAddr";
pub const KEY_STORE_PORT: &str = "redisPort";
pub const KEY_STORE_PASSWORD: &str = "redisPassword";
pub const KEY_STORE_DB: &str = "redisDb";
pub const KEY_MAX_ADDRESSES: &str = "maxIpLimit";
pub const KEY_MAX_CONNECTIONS: &str = "maxIpPerConn";

/// Settings held in memory
#[derive(Clone, Debug, Default)]
pub struct MapSettings {
    values: HashMap<String, String>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl FromIterator<(String, String)> for MapSettings {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl SettingsSource for MapSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Settings read from a flat JSON object, e.g. `{"enableIpLimit": "true", "maxIpLimit": 3}`.
///
/// Non-string scalars are stringified; nested values are ignored.
#[derive(Clone, Debug, Default)]
pub struct JsonSettings {
    inner: MapSettings,
}

impl JsonSettings {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let root: Value = serde_json::from_slice(bytes)?;
        let object = root.as_object().ok_or(DocumentError::NotAnObject)?;

        let inner = object
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((key.clone(), value))
            })
            .collect();

        Ok(Self { inner })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }
}

impl SettingsSource for JsonSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }
}

fn parse_bounded<T: std::str::FromStr + PartialOrd>(raw: Option<String>, min: T) -> Option<T> {
    raw.filter(|v| !v.is_empty())
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v >= min)
}

/// Build a [`LimiterConfig`] from a settings source.
///
/// Operational fields not covered by the settings keys keep their defaults.
pub fn load_limiter_config(source: Option<&dyn SettingsSource>) -> LimiterConfig {
    let mut config = LimiterConfig::default();

    let Some(source) = source else {
        warn!("No settings source available; connection limiting disabled");
        return config;
    };

    match source.get(KEY_ENABLE) {
        Some(v) if v == "true" => config.enabled = true,
        _ => return config,
    }

    if let Some(addr) = source.get(KEY_STORE_ADDR).filter(|a| !a.is_empty()) {
        config.store_addr = addr;
    }
    if let Some(port) = parse_bounded::<u16>(source.get(KEY_STORE_PORT), 1) {
        config.store_port = port;
    }
    if let Some(password) = source.get(KEY_STORE_PASSWORD) {
        config.store_auth = password;
    }
    if let Some(db) = parse_bounded::<u32>(source.get(KEY_STORE_DB), 0) {
        config.store_index = db;
    }
    if let Some(max) = parse_bounded::<u32>(source.get(KEY_MAX_ADDRESSES), 1) {
        config.max_addresses_per_credential = max;
    }
    if let Some(max) = parse_bounded::<u32>(source.get(KEY_MAX_CONNECTIONS), 1) {
        config.max_connections_per_address = max;
    }

    info!(
        enabled = config.enabled,
        store = %config.store_endpoint(),
        max_addresses = config.max_addresses_per_credential,
        max_connections = config.max_connections_per_address,
        "Connection limit settings loaded"
    );

    config
}
