//! Service Layer
//!
//! Application services that orchestrate domain logic and coordinate with
//! the store, settings and enforcement ports.

pub mod admission;
pub mod correlator;
pub mod registry;

pub use admission::AdmissionController;
pub use correlator::{cleanup_task, CorrelatorConfig, EventCorrelator, LineOutcome};
pub use registry::{CredentialRegistry, RebuildSummary};
