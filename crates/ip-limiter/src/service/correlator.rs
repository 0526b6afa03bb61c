//! Event Correlator - proxy log lines to admission decisions.
//!
//! Flow for one connection:
//! 1. `accept a <proto> connection from <addr>:<port>` - the client address
//! 2. `identifier: <id>` - the credential, on the same line or on a later
//!    line carrying the same `[<session>]` handle
//! 3. `try_admit(id, addr)`; a rejection goes to the [`ConnectionEnforcer`]
//! 4. `connection closed` with the same handle releases the connection
//!
//! Accepts waiting for their identifier are parked in a bounded table and
//! dropped after `pending_timeout`. Nothing here ever fails the caller.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::config::{DEFAULT_ENTRY_TTL, DEFAULT_PENDING_TIMEOUT};
use crate::domain::{parse_line, AcceptEvent, AdmissionDecision, LimiterConfig};
use crate::ports::{ConnectionEnforcer, CredentialLookup, Rejection};
use crate::service::admission::AdmissionController;

/// Default bound on parked accepts and on remembered sessions
pub const DEFAULT_MAX_PENDING: usize = 65_536;

/// Correlator tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Skip identifiers absent from the credential registry
    pub ignore_unregistered: bool,
    /// Capacity of the pending table and of the session table
    pub max_pending: usize,
    /// Lifetime of a parked accept
    pub pending_timeout: Duration,
    /// Lifetime of a remembered admitted session
    pub session_ttl: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            ignore_unregistered: false,
            max_pending: DEFAULT_MAX_PENDING,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            session_ttl: DEFAULT_ENTRY_TTL,
        }
    }
}

impl CorrelatorConfig {
    /// Timeouts taken from the limiter configuration
    pub fn from_limiter(config: &LimiterConfig) -> Self {
        Self {
            pending_timeout: config.pending_timeout,
            session_ttl: config.entry_ttl,
            ..Self::default()
        }
    }

    pub fn with_ignore_unregistered(mut self, ignore: bool) -> Self {
        self.ignore_unregistered = ignore;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }
}

/// What one log line amounted to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// Nothing actionable
    Ignored,
    /// Accept parked until its identifier arrives
    AcceptPending { session: u64 },
    /// Connection allowed (and recorded unless the limiter failed open)
    Admitted {
        identifier: String,
        address: String,
        decision: AdmissionDecision,
    },
    /// Connection over a limit; handed to the enforcer
    Rejected {
        identifier: String,
        address: String,
        decision: AdmissionDecision,
    },
    /// Teardown of an admitted session; connection released
    Released { identifier: String, address: String },
    /// Teardown that matched no admitted session
    Closed,
}

struct PendingAccept {
    event: AcceptEvent,
    created_at: Instant,
}

struct ActiveSession {
    identifier: String,
    address: String,
    admitted_at: Instant,
}

/// Turns log lines into admission operations
pub struct EventCorrelator {
    controller: Arc<AdmissionController>,
    registry: Option<Arc<dyn CredentialLookup>>,
    enforcer: Arc<dyn ConnectionEnforcer>,
    config: CorrelatorConfig,
    /// Session handle -> accept waiting for its identifier
    pending: DashMap<u64, PendingAccept>,
    /// Session handle -> admitted connection awaiting teardown
    active: DashMap<u64, ActiveSession>,
}

impl EventCorrelator {
    pub fn new(
        controller: Arc<AdmissionController>,
        enforcer: Arc<dyn ConnectionEnforcer>,
        config: CorrelatorConfig,
    ) -> Self {
        Self {
            controller,
            registry: None,
            enforcer,
            config,
            pending: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Attach a credential registry for protocol lookups and filtering
    pub fn with_registry(mut self, registry: Arc<dyn CredentialLookup>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Accepts waiting for an identifier
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Admitted sessions waiting for teardown
    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }

    /// Process one log line. Inert while the controller is inactive.
    pub async fn process_line(&self, line: &str) -> LineOutcome {
        self.controller.counters().record_line();
        if !self.controller.is_active() {
            return LineOutcome::Ignored;
        }

        let parsed = parse_line(line);
        if parsed.is_empty() {
            return LineOutcome::Ignored;
        }

        if let Some(identifier) = parsed.identifier {
            let accept = match (parsed.accept, parsed.session) {
                (Some(accept), _) => Some(accept),
                (None, Some(session)) => self.take_pending(session),
                (None, None) => None,
            };
            return match accept {
                Some(accept) => self.admit(identifier, accept, parsed.session).await,
                None => LineOutcome::Ignored,
            };
        }

        if let Some(accept) = parsed.accept {
            return match parsed.session {
                Some(session) => self.park(session, accept),
                None => LineOutcome::Ignored,
            };
        }

        match parsed.session.and_then(|s| self.active.remove(&s)) {
            Some((_, session)) => {
                self.controller
                    .remove_connection(&session.identifier, &session.address)
                    .await;
                LineOutcome::Released {
                    identifier: session.identifier,
                    address: session.address,
                }
            }
            None => LineOutcome::Closed,
        }
    }

    fn take_pending(&self, session: u64) -> Option<AcceptEvent> {
        let (_, pending) = self.pending.remove(&session)?;
        if pending.created_at.elapsed() > self.config.pending_timeout {
            debug!(session = session, "Identifier arrived after its accept expired");
            return None;
        }
        Some(pending.event)
    }

    fn park(&self, session: u64, event: AcceptEvent) -> LineOutcome {
        if self.pending.len() >= self.config.max_pending
            && !self.pending.contains_key(&session)
            && self.sweep_pending() == 0
        {
            warn!(
                session = session,
                address = %event.address,
                capacity = self.config.max_pending,
                "Pending accept table full; dropping accept"
            );
            return LineOutcome::Ignored;
        }

        self.pending.insert(
            session,
            PendingAccept {
                event,
                created_at: Instant::now(),
            },
        );
        LineOutcome::AcceptPending { session }
    }

    async fn admit(
        &self,
        identifier: String,
        accept: AcceptEvent,
        session: Option<u64>,
    ) -> LineOutcome {
        let protocol = self
            .registry
            .as_ref()
            .and_then(|r| r.protocol_of(&identifier));
        if self.config.ignore_unregistered && protocol.is_none() {
            debug!(identifier = %identifier, "Ignoring unregistered identifier");
            return LineOutcome::Ignored;
        }

        self.controller.counters().record_correlation();
        let outcome = self.controller.admit(&identifier, &accept.address).await;
        let decision = outcome.decision;

        if decision.is_rejected() {
            warn!(
                identifier = %identifier,
                address = %accept.address,
                port = accept.port,
                protocol = %accept.protocol,
                registered_as = ?protocol,
                reason = %decision,
                "Connection rejected"
            );
            let rejection = Rejection {
                identifier: identifier.clone(),
                address: accept.address.clone(),
                port: accept.port,
                protocol: accept.protocol,
                session,
                decision,
            };
            self.enforcer.reject(&rejection).await;
            return LineOutcome::Rejected {
                identifier,
                address: accept.address,
                decision,
            };
        }

        // Whatever was counted must be released on teardown, fail-open included
        if let Some(session) = session.filter(|_| outcome.recorded) {
            self.remember(session, &identifier, &accept.address).await;
        }
        debug!(
            identifier = %identifier,
            address = %accept.address,
            protocol = %accept.protocol,
            decision = %decision,
            "Connection admitted"
        );
        LineOutcome::Admitted {
            identifier,
            address: accept.address,
            decision,
        }
    }

    async fn remember(&self, session: u64, identifier: &str, address: &str) {
        if self.active.len() >= self.config.max_pending && !self.active.contains_key(&session) {
            warn!(
                session = session,
                identifier = %identifier,
                capacity = self.config.max_pending,
                "Session table full; teardown of this connection will not be tracked"
            );
            return;
        }

        let replaced = self.active.insert(
            session,
            ActiveSession {
                identifier: identifier.to_string(),
                address: address.to_string(),
                admitted_at: Instant::now(),
            },
        );

        // A reused handle means the earlier connection's close was never seen
        if let Some(previous) = replaced {
            warn!(
                session = session,
                identifier = %previous.identifier,
                address = %previous.address,
                "Session handle reused before teardown; releasing earlier connection"
            );
            self.controller
                .remove_connection(&previous.identifier, &previous.address)
                .await;
        }
    }

    fn sweep_pending(&self) -> usize {
        let timeout = self.config.pending_timeout;
        let mut removed = 0;
        self.pending.retain(|_, pending| {
            if pending.created_at.elapsed() > timeout {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop expired pending accepts and forgotten sessions.
    ///
    /// Sessions older than `session_ttl` are dropped without a release; their
    /// store entries expire on the same schedule.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.session_ttl;
        let mut removed = self.sweep_pending();
        self.active.retain(|_, session| {
            if session.admitted_at.elapsed() > ttl {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }
}

/// Background task sweeping the correlator tables
pub async fn cleanup_task(correlator: Arc<EventCorrelator>, interval: Duration) {
    let mut cleanup_interval = tokio::time::interval(interval);
    cleanup_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        cleanup_interval.tick().await;
        let removed = correlator.sweep_expired();
        if removed > 0 {
            debug!(removed = removed, "Swept expired correlator entries");
        }
    }
}
