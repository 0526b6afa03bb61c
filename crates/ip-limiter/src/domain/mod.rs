//! Domain Layer - Pure admission logic
//!
//! This layer contains:
//! - Limiter configuration and its shared, runtime-replaceable holder
//! - Credential extraction from proxy configuration documents
//! - Log line classification
//! - Store key layout
//! - Admission decisions
//!
//! RULES:
//! - No network I/O
//! - No async code

pub mod config;
pub mod credentials;
pub mod decision;
pub mod keys;
pub mod log_event;

pub use config::{AdmissionMode, LimiterConfig, SharedConfig};
pub use credentials::{extract_credentials, ExtractedCredentials, ProtocolKind};
pub use decision::{AdmissionDecision, AdmissionOutcome};
pub use keys::{KeyNamespace, SlotKeys};
pub use log_event::{parse_line, AcceptEvent, ParsedLine};
