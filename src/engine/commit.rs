use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::limits::MAX_COMPENSATION_ATTEMPTS;
use crate::model::Event;
use crate::observability;

use super::{EngineError, WalRequest};

type PendingWrite = oneshot::Receiver<io::Result<()>>;

/// What the log holds for an event once a commit attempt is over, and so
/// which way memory has to go.
#[derive(Debug)]
pub(super) enum Committed {
    /// Durable.
    Landed,
    /// The log nets to no change, or will once queued writes drain.
    /// Memory drops the staged change.
    Reverted(EngineError),
    /// The event may be durable and nothing undoes it. Memory keeps it.
    Kept(EngineError),
}

/// Makes events durable through the WAL writer under a bounded wait.
///
/// A write that times out may still land later. The writer handles requests
/// strictly in order, so a compensating event queued after a timed-out one
/// is always written after it, and replaying both leaves nothing behind.
/// A compensation is queued at most once unless the writer rejects it.
#[derive(Clone)]
pub(super) struct Committer {
    wal_tx: mpsc::Sender<WalRequest>,
    timeout: Duration,
}

impl Committer {
    pub(super) fn new(wal_tx: mpsc::Sender<WalRequest>, timeout: Duration) -> Self {
        Self { wal_tx, timeout }
    }

    /// Run `commit` and then `settle` in their own task. Dropping the
    /// returned future does not stop either, so whatever guards `settle`
    /// owns are released only after the in-memory state matches the log.
    pub(super) async fn commit_detached<T, F>(&self, event: Event, settle: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Event, Committed) -> Result<T, EngineError> + Send + 'static,
    {
        let committer = self.clone();
        let label = event.label();
        tokio::spawn(async move {
            let outcome = committer.commit(&event).await;
            settle(&event, outcome)
        })
        .await
        .map_err(|e| {
            error!(event = label, error = %e, "commit task failed");
            metrics::counter!(observability::PARTIAL_FAILURES_TOTAL).increment(1);
            EngineError::PartialFailure(format!("{label} commit task failed: {e}"))
        })?
    }

    pub(super) async fn commit(&self, event: &Event) -> Committed {
        let mut pending = match self.submit(event).await {
            Ok(rx) => rx,
            Err(e) => return Committed::Reverted(e),
        };
        match tokio::time::timeout(self.timeout, &mut pending).await {
            Ok(answer) => match settle_write(answer) {
                Ok(()) => Committed::Landed,
                Err(e) => Committed::Reverted(e),
            },
            Err(_) => {
                metrics::counter!(observability::WAL_TIMEOUTS_TOTAL).increment(1);
                warn!(
                    event = event.label(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "WAL write timed out, compensating"
                );
                self.compensate(event).await
            }
        }
    }

    /// Queue the inverse of a timed-out event. A rejected inverse is queued
    /// again; one still waiting in the queue is waited on, never duplicated.
    async fn compensate(&self, event: &Event) -> Committed {
        let label = event.label();
        let Some(undo) = event.compensation() else {
            metrics::counter!(observability::PARTIAL_FAILURES_TOTAL).increment(1);
            return Committed::Kept(EngineError::PartialFailure(format!(
                "{label} timed out and has no inverse"
            )));
        };

        let mut queued: Option<PendingWrite> = None;
        for attempt in 1..=MAX_COMPENSATION_ATTEMPTS {
            let mut pending = match queued.take() {
                Some(rx) => rx,
                None => match self.submit(&undo).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        metrics::counter!(observability::COMPENSATIONS_TOTAL, "result" => "failed")
                            .increment(1);
                        warn!(event = label, attempt, error = %e, "compensation not queued");
                        continue;
                    }
                },
            };
            match tokio::time::timeout(self.timeout, &mut pending).await {
                Ok(answer) => match settle_write(answer) {
                    Ok(()) => {
                        metrics::counter!(observability::COMPENSATIONS_TOTAL, "result" => "ok")
                            .increment(1);
                        return Committed::Reverted(EngineError::StorageError(format!(
                            "{label} timed out"
                        )));
                    }
                    Err(e) => {
                        metrics::counter!(observability::COMPENSATIONS_TOTAL, "result" => "failed")
                            .increment(1);
                        warn!(event = label, attempt, error = %e, "compensation failed");
                    }
                },
                Err(_) => {
                    warn!(event = label, attempt, "compensation still queued");
                    queued = Some(pending);
                }
            }
        }

        metrics::counter!(observability::PARTIAL_FAILURES_TOTAL).increment(1);
        if queued.is_some() {
            // Queued behind the forward event, so it lands after it if it lands at all.
            error!(event = label, "compensation unconfirmed, log needs reconciliation");
            return Committed::Reverted(EngineError::PartialFailure(format!(
                "{label} timed out and its compensation is still unconfirmed"
            )));
        }
        error!(event = label, "compensation exhausted, log needs reconciliation");
        Committed::Kept(EngineError::PartialFailure(format!(
            "{label} timed out and {MAX_COMPENSATION_ATTEMPTS} compensation attempts failed"
        )))
    }

    async fn submit(&self, event: &Event) -> Result<PendingWrite, EngineError> {
        let (tx, rx) = oneshot::channel();
        let request = WalRequest {
            event: event.clone(),
            response: tx,
        };
        match tokio::time::timeout(self.timeout, self.wal_tx.send(request)).await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(_)) => Err(EngineError::StorageError("WAL writer shut down".into())),
            Err(_) => Err(EngineError::StorageError("WAL queue full".into())),
        }
    }
}

/// A write the writer answered. An I/O error means the batch was rolled back.
fn settle_write(result: Result<io::Result<()>, oneshot::error::RecvError>) -> Result<(), EngineError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EngineError::StorageError(e.to_string())),
        Err(_) => Err(EngineError::StorageError("WAL writer dropped response".into())),
    }
}
