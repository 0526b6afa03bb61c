//! Ports Layer
//!
//! Defines the interfaces (traits) for:
//! - Driving Ports (inbound) - API for the surrounding application
//! - Driven Ports (outbound) - Store, settings, and enforcement dependencies

pub mod inbound;
pub mod outbound;

pub use inbound::{AdmissionApi, CredentialLookup};
pub use outbound::{
    AdmissionStore, ConnectionEnforcer, Rejection, ReleaseOutcome, ReserveLimits, ReserveOutcome,
    SettingsSource, StoreConnector,
};
