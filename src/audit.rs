use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::Principal;
use crate::engine::EngineError;
use crate::observability;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Admit,
    Reassign,
    Release,
    AdminRelease,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Admit => "admit",
            AuditAction::Reassign => "reassign",
            AuditAction::Release => "release",
            AuditAction::AdminRelease => "admin_release",
        }
    }
}

/// One reservation protocol outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub action: AuditAction,
    /// `"ok"` or the error kind.
    pub outcome: &'static str,
    pub requester_id: Ulid,
    pub pool_id: Option<Ulid>,
    pub reservation_id: Option<Ulid>,
}

impl AuditEvent {
    pub fn new<T>(
        action: AuditAction,
        principal: &Principal,
        pool_id: Option<Ulid>,
        reservation_id: Option<Ulid>,
        result: &Result<T, EngineError>,
    ) -> Self {
        Self {
            action,
            outcome: match result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            },
            requester_id: principal.requester_id,
            pool_id,
            reservation_id,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == "ok"
    }
}

/// Logs, counts and broadcasts audit events.
pub struct AuditHub {
    sender: broadcast::Sender<AuditEvent>,
}

impl Default for AuditHub {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }

    /// Record an outcome. Sending is a no-op if nobody is listening.
    pub fn record(&self, event: AuditEvent) {
        metrics::counter!(
            observability::RESERVATION_OUTCOMES_TOTAL,
            "action" => event.action.as_str(),
            "outcome" => event.outcome
        )
        .increment(1);
        if event.succeeded() {
            info!(
                action = event.action.as_str(),
                requester_id = %event.requester_id,
                pool_id = ?event.pool_id,
                reservation_id = ?event.reservation_id,
                "reservation audit"
            );
        } else {
            warn!(
                action = event.action.as_str(),
                outcome = event.outcome,
                requester_id = %event.requester_id,
                pool_id = ?event.pool_id,
                reservation_id = ?event.reservation_id,
                "reservation audit"
            );
        }
        let _ = self.sender.send(event);
    }
}
