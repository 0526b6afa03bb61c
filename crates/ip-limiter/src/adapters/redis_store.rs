//! Redis Admission Store Adapter
//!
//! Backs the limiter with a Redis instance shared by every cooperating
//! process. Compound operations are submitted atomically:
//!
//! - `record`: MULTI/EXEC pipeline of SADD, INCR, EXPIRE, EXPIRE
//! - `release`: Lua script (decrement, then SREM + DEL at zero)
//! - `try_reserve`: Lua script (check both limits, then record)
//!
//! Every round trip is bounded by the configured store timeout.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::domain::{LimiterConfig, SlotKeys};
use crate::error::StoreError;
use crate::ports::{
    AdmissionStore, ReleaseOutcome, ReserveLimits, ReserveOutcome, StoreConnector,
};

/// Keys scanned per SCAN round trip during a namespace flush
const SCAN_BATCH: usize = 500;

// KEYS[1] = counter key, KEYS[2] = address set, ARGV[1] = address
// Returns {status, value}: 0 = missing, 1 = decremented, 2 = removed
static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return {0, 0}
        end
        local remaining = redis.call('DECR', KEYS[1])
        if remaining <= 0 then
            redis.call('SREM', KEYS[2], ARGV[1])
            redis.call('DEL', KEYS[1])
            return {2, remaining}
        end
        return {1, remaining}
        ",
    )
});

// KEYS[1] = address set, KEYS[2] = counter key
// ARGV[1] = address, ARGV[2] = max addresses, ARGV[3] = max connections, ARGV[4] = ttl secs
// Returns {status, value}: 0 = reserved, 1 = address limit, 2 = connection limit
static RESERVE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local size = redis.call('SCARD', KEYS[1])
        if size >= tonumber(ARGV[2]) and redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 0 then
            return {1, size}
        end
        local count = tonumber(redis.call('GET', KEYS[2]) or '0')
        if count >= tonumber(ARGV[3]) then
            return {2, count}
        end
        redis.call('SADD', KEYS[1], ARGV[1])
        local updated = redis.call('INCR', KEYS[2])
        redis.call('EXPIRE', KEYS[1], ARGV[4])
        redis.call('EXPIRE', KEYS[2], ARGV[4])
        return {0, updated}
        ",
    )
});

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

/// Redis-backed [`AdmissionStore`]
#[derive(Clone)]
pub struct RedisAdmissionStore {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisAdmissionStore {
    /// Connect using the store fields of `config`
    pub async fn connect(config: &LimiterConfig) -> Result<Self, StoreError> {
        let addr = config.store_endpoint();
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.store_addr.clone(), config.store_port),
            redis: RedisConnectionInfo {
                db: i64::from(config.store_index),
                password: (!config.store_auth.is_empty()).then(|| config.store_auth.clone()),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info).map_err(|e| StoreError::Connect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

        let conn = match timeout(config.store_timeout, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(StoreError::Connect {
                    addr,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(StoreError::Connect {
                    addr,
                    message: format!("timed out after {:?}", config.store_timeout),
                })
            }
        };

        debug!(addr = %addr, db = config.store_index, "Redis connection manager ready");
        Ok(Self {
            conn,
            op_timeout: config.store_timeout,
        })
    }

    /// Run one store operation under the configured timeout
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Backend {
                op,
                message: e.to_string(),
            }),
            Err(_) => Err(StoreError::Timeout {
                op,
                after: self.op_timeout,
            }),
        }
    }
}

#[async_trait]
impl AdmissionStore for RedisAdmissionStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = self
            .bounded("ping", async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(StoreError::UnexpectedReply {
                op: "ping",
                message: reply,
            })
        }
    }

    async fn set_size(&self, set_key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded("scard", async move { conn.scard(set_key).await })
            .await
    }

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded("sismember", async move { conn.sismember(set_key, member).await })
            .await
    }

    async fn counter(&self, counter_key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self
            .bounded("get", async move { conn.get(counter_key).await })
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn record(&self, slot: &SlotKeys, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl);
        let (count,): (i64,) = self
            .bounded("record", async move {
                redis::pipe()
                    .atomic()
                    .sadd(&slot.set_key, &slot.member)
                    .ignore()
                    .incr(&slot.counter_key, 1)
                    .expire(&slot.set_key, secs)
                    .ignore()
                    .expire(&slot.counter_key, secs)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count)
    }

    async fn release(&self, slot: &SlotKeys) -> Result<ReleaseOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (status, value): (i64, i64) = self
            .bounded("release", async move {
                RELEASE_SCRIPT
                    .key(&slot.counter_key)
                    .key(&slot.set_key)
                    .arg(&slot.member)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        match status {
            0 => Ok(ReleaseOutcome::Missing),
            1 => Ok(ReleaseOutcome::Decremented(value)),
            2 => Ok(ReleaseOutcome::Removed),
            other => Err(StoreError::UnexpectedReply {
                op: "release",
                message: format!("status {other}"),
            }),
        }
    }

    async fn try_reserve(
        &self,
        slot: &SlotKeys,
        limits: ReserveLimits,
        ttl: Duration,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl);
        let (status, value): (i64, i64) = self
            .bounded("try_reserve", async move {
                RESERVE_SCRIPT
                    .key(&slot.set_key)
                    .key(&slot.counter_key)
                    .arg(&slot.member)
                    .arg(limits.max_addresses)
                    .arg(limits.max_connections)
                    .arg(secs)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        match status {
            0 => Ok(ReserveOutcome::Reserved(value)),
            1 => Ok(ReserveOutcome::AddressLimit(value.max(0) as u64)),
            2 => Ok(ReserveOutcome::ConnectionLimit(value)),
            other => Err(StoreError::UnexpectedReply {
                op: "try_reserve",
                message: format!("status {other}"),
            }),
        }
    }

    async fn members(&self, set_key: &str) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.bounded("smembers", async move { conn.smembers(set_key).await })
            .await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        // SCAN instead of KEYS so a large namespace never blocks the server
        loop {
            let mut conn = self.conn.clone();
            let (next, keys): (u64, Vec<String>) = self
                .bounded("scan", async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let mut conn = self.conn.clone();
                let removed: u64 = self
                    .bounded("del", async move { conn.del(&keys).await })
                    .await?;
                deleted += removed;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }
}

/// Connector producing a [`RedisAdmissionStore`]
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self, config: &LimiterConfig) -> Result<Arc<dyn AdmissionStore>, StoreError> {
        let store = RedisAdmissionStore::connect(config).await?;
        info!(
            addr = %config.store_endpoint(),
            db = config.store_index,
            "Connected to Redis admission store"
        );
        Ok(Arc::new(store))
    }
}
