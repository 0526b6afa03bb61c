//! Rejection enforcement adapters
//!
//! - `LogOnlyEnforcer`: records the rejection and nothing else
//! - `ChannelEnforcer`: forwards rejections to a consumer that can act on
//!   them (kill the session through the proxy's API, feed a firewall, ...)

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ports::{ConnectionEnforcer, Rejection};

/// Logs every rejection at warn level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyEnforcer;

#[async_trait]
impl ConnectionEnforcer for LogOnlyEnforcer {
    async fn reject(&self, rejection: &Rejection) {
        warn!(
            identifier = %rejection.identifier,
            address = %rejection.address,
            port = rejection.port,
            protocol = %rejection.protocol,
            session = ?rejection.session,
            reason = %rejection.decision,
            "Connection over limit; proxy connection left open"
        );
    }
}

/// Sends every rejection down a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelEnforcer {
    tx: mpsc::Sender<Rejection>,
}

impl ChannelEnforcer {
    /// Create the enforcer and the receiving half for the consumer
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Rejection>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConnectionEnforcer for ChannelEnforcer {
    async fn reject(&self, rejection: &Rejection) {
        // Never block the log pipeline on a slow consumer
        if let Err(e) = self.tx.try_send(rejection.clone()) {
            warn!(
                identifier = %rejection.identifier,
                address = %rejection.address,
                error = %e,
                "Dropped rejection; enforcement consumer unavailable"
            );
        }
    }
}
