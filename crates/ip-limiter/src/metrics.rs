//! Metrics for admission operations
//!
//! Lock-free counters updated on every check, record, release and log line,
//! read through [`AdmissionMetrics::snapshot`].
//!
//! ## Usage
//!
//! ```ignore
//! let snapshot = controller.metrics();
//! println!("rejected: {}", snapshot.rejected());
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::AdmissionDecision;

/// Counters for one controller / correlator pair
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    /// Admission evaluations performed
    pub checks: AtomicU64,
    /// Evaluations within both limits
    pub allowed: AtomicU64,
    /// Evaluations allowed because the limiter was inactive or the store failed
    pub fail_open: AtomicU64,
    /// Rejections for exceeding distinct addresses per credential
    pub rejected_address_limit: AtomicU64,
    /// Rejections for exceeding connections per address
    pub rejected_connection_limit: AtomicU64,
    /// Connections recorded
    pub recorded: AtomicU64,
    /// Connections released
    pub released: AtomicU64,
    /// Releases against a counter that did not exist
    pub underflows: AtomicU64,
    /// Store operations that failed or timed out
    pub store_errors: AtomicU64,
    /// Log lines handed to the correlator
    pub lines_processed: AtomicU64,
    /// Lines that produced an accept + identify correlation
    pub correlations: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one admission evaluation
    pub fn record_decision(&self, decision: &AdmissionDecision) {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let counter = match decision {
            AdmissionDecision::Allowed => &self.allowed,
            AdmissionDecision::FailOpen => &self.fail_open,
            AdmissionDecision::AddressLimit { .. } => &self.rejected_address_limit,
            AdmissionDecision::ConnectionLimit { .. } => &self.rejected_connection_limit,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_added(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_underflow(&self) {
        self.underflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_line(&self) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_correlation(&self) {
        self.correlations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            rejected_address_limit: self.rejected_address_limit.load(Ordering::Relaxed),
            rejected_connection_limit: self.rejected_connection_limit.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            lines_processed: self.lines_processed.load(Ordering::Relaxed),
            correlations: self.correlations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AdmissionMetrics`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub checks: u64,
    pub allowed: u64,
    pub fail_open: u64,
    pub rejected_address_limit: u64,
    pub rejected_connection_limit: u64,
    pub recorded: u64,
    pub released: u64,
    pub underflows: u64,
    pub store_errors: u64,
    pub lines_processed: u64,
    pub correlations: u64,
}

impl MetricsSnapshot {
    /// Total rejections for either limit
    pub fn rejected(&self) -> u64 {
        self.rejected_address_limit + self.rejected_connection_limit
    }
}
