//! Adapters Layer
//!
//! Concrete implementations of the driven ports:
//! - `RedisAdmissionStore` / `RedisConnector`: shared store across instances
//! - `InMemoryAdmissionStore` / `InMemoryConnector`: single-process store
//! - `MapSettings` / `JsonSettings`: settings sources
//! - `LogOnlyEnforcer` / `ChannelEnforcer`: rejection handling

pub mod enforcer;
pub mod memory_store;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod settings;

pub use enforcer::{ChannelEnforcer, LogOnlyEnforcer};
pub use memory_store::{InMemoryAdmissionStore, InMemoryConnector};
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisAdmissionStore, RedisConnector};
pub use settings::{load_limiter_config, JsonSettings, MapSettings};
