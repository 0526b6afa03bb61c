//! Inbound Ports (Driving Ports)
//!
//! The API the surrounding application drives: admission operations and
//! credential lookups.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::domain::{AdmissionDecision, ProtocolKind};

/// Admission control API (Driving Port)
///
/// Every operation fails open: when the limiter is disabled or the store
/// is unreachable, checks allow and writes are skipped.
#[async_trait]
pub trait AdmissionApi: Send + Sync {
    /// Read-only check of both limits for a prospective connection
    async fn check_connection(&self, identifier: &str, address: &str) -> bool;

    /// Record one connection
    async fn add_connection(&self, identifier: &str, address: &str);

    /// Release one connection
    async fn remove_connection(&self, identifier: &str, address: &str);

    /// Delete every tracked connection in the namespace
    async fn clear_all_connections(&self);

    /// Addresses currently tracked for a credential
    async fn get_active_ips(&self, identifier: &str) -> HashSet<String>;

    /// Check and record in one call, honoring the configured admission mode
    async fn try_admit(&self, identifier: &str, address: &str) -> AdmissionDecision;
}

/// Credential lookups (Driving Port)
pub trait CredentialLookup: Send + Sync {
    fn is_registered(&self, identifier: &str) -> bool;

    fn protocol_of(&self, identifier: &str) -> Option<ProtocolKind>;
}
