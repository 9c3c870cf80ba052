mod commit;
mod error;
mod ledger;
mod mutations;
mod occupancy;
mod queries;
mod registry;
#[cfg(test)]
mod tests;

pub use error::{EngineError, ErrorClass};
pub use ledger::Ledger;
pub use registry::{PoolRegistry, SharedPoolState};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::audit::AuditHub;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use commit::Committer;
use occupancy::{occupy_for, validate_slot};

// ── Group-commit WAL channel ─────────────────────────────

struct WalRequest {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first request arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available requests (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to every sender with the batch result.
///
/// A failed batch is cut back off the log before anyone hears about it. If
/// that cut fails the log holds bytes nobody will own, so the writer stops
/// and every later write is refused.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalRequest>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let outcome = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());

        match outcome {
            BatchOutcome::Durable => answer_all(batch, &Ok(())),
            BatchOutcome::RolledBack(e) => {
                warn!(path = %wal.path().display(), batch = batch.len(), error = %e, "WAL flush failed, batch rolled back");
                answer_all(batch, &Err(e));
            }
            BatchOutcome::Poisoned(e) => {
                error!(path = %wal.path().display(), batch = batch.len(), error = %e, "WAL rollback failed, refusing further writes");
                let result = Err(e);
                answer_all(batch, &result);
                rx.close();
                while let Some(request) = rx.recv().await {
                    answer(request, &result);
                }
                return;
            }
        }
    }
}

enum BatchOutcome {
    Durable,
    /// Nothing from the batch is left in the log.
    RolledBack(io::Error),
    /// The batch may be partly in the log and could not be removed.
    Poisoned(io::Error),
}

fn flush_batch(wal: &mut Wal, batch: &[WalRequest]) -> BatchOutcome {
    let start = match wal.end_offset() {
        Ok(offset) => offset,
        Err(e) => return BatchOutcome::RolledBack(e),
    };
    let written = batch
        .iter()
        .try_for_each(|request| wal.append_buffered(&request.event))
        .and_then(|()| wal.flush_sync());
    match written {
        Ok(()) => BatchOutcome::Durable,
        Err(e) => match wal.truncate_to(start) {
            Ok(()) => BatchOutcome::RolledBack(e),
            Err(cut) => BatchOutcome::Poisoned(io::Error::new(
                e.kind(),
                format!("{e}; truncating back to {start} failed: {cut}"),
            )),
        },
    }
}

fn answer_all(batch: Vec<WalRequest>, result: &io::Result<()>) {
    for request in batch {
        answer(request, result);
    }
}

fn answer(request: WalRequest, result: &io::Result<()>) {
    let r = match result {
        Ok(()) => Ok(()),
        Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
    };
    let _ = request.response.send(r);
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bound on every WAL write, including queueing.
    pub storage_timeout: Duration,
    /// Rewrite the log on open when replay sees more events than this.
    pub compact_threshold: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MS),
            compact_threshold: 1000,
        }
    }
}

pub struct Engine {
    registry: Arc<PoolRegistry>,
    ledger: Arc<Ledger>,
    /// Per-claimant lock for the weekly check. Always taken before a pool lock.
    claimant_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    committer: Committer,
    pub audit: Arc<AuditHub>,
    replayed: usize,
}

impl Engine {
    pub fn new(wal_path: PathBuf, options: EngineOptions, audit: Arc<AuditHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_DEPTH);
        let mut engine = Self::with_writer(wal_tx, options.storage_timeout, audit);

        // Sole owner of every pool lock here, so try_write never contends.
        let mut skipped = 0usize;
        for event in &events {
            if let Err(e) = engine.replay_event(event) {
                skipped += 1;
                warn!(event = event.label(), pool_id = %event.pool_id(), error = %e, "skipping WAL event");
            }
        }
        engine.replayed = events.len();

        if events.len() > options.compact_threshold {
            let snapshot = engine.snapshot();
            wal.rewrite(&snapshot)?;
            info!(before = events.len(), after = snapshot.len(), "compacted WAL");
        }
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        info!(
            path = %wal_path.display(),
            events = events.len(),
            skipped,
            pools = engine.registry.len(),
            reservations = engine.ledger.len(),
            "engine ready"
        );
        Ok(engine)
    }

    /// Engine with no state whose WAL writes go to `wal_tx`.
    fn with_writer(wal_tx: mpsc::Sender<WalRequest>, storage_timeout: Duration, audit: Arc<AuditHub>) -> Self {
        Self {
            registry: Arc::new(PoolRegistry::new()),
            ledger: Arc::new(Ledger::new()),
            claimant_locks: DashMap::new(),
            committer: Committer::new(wal_tx, storage_timeout),
            audit,
            replayed: 0,
        }
    }

    /// Number of events read from the log at open.
    pub fn replayed_events(&self) -> usize {
        self.replayed
    }

    fn claimant_lock(&self, claimant_id: Ulid) -> Arc<Mutex<()>> {
        self.claimant_locks.entry(claimant_id).or_default().value().clone()
    }

    /// Drop the claimant's lock once nobody holds or waits on it. The map's
    /// shard lock keeps a concurrent `claimant_lock` from cloning it meanwhile.
    fn release_claimant_lock(&self, claimant_id: Ulid) {
        self.claimant_locks
            .remove_if(&claimant_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Rebuild state from one logged event, through the same occupancy path
    /// the live protocol uses. An event that no longer fits is rejected whole.
    fn replay_event(&self, event: &Event) -> Result<(), EngineError> {
        match event {
            Event::PoolCreated {
                id,
                day,
                capacity,
                slot_numbers,
            } => {
                let pool = PoolState::with_slots(*id, *day, *capacity, slot_numbers.clone());
                if !self.registry.insert(pool) {
                    return Err(EngineError::PoolAlreadyExists(day.to_string()));
                }
                Ok(())
            }
            Event::PoolWithdrawn { id } => {
                if !self.registry.withdraw(id) {
                    return Err(EngineError::PoolNotFound(*id));
                }
                Ok(())
            }
            _ => {
                let pool_id = event.pool_id();
                let shared = self
                    .registry
                    .get(&pool_id)
                    .ok_or(EngineError::PoolNotFound(pool_id))?;
                let mut pool = shared
                    .try_write()
                    .map_err(|_| EngineError::StorageError("pool locked during replay".into()))?;
                match event {
                    Event::ReservationAdmitted { reservation } => {
                        validate_slot(&pool, reservation.slot_number)?
                    }
                    Event::ReservationUpdated { to, .. } => validate_slot(&pool, to.slot_number)?,
                    _ => {}
                }
                self.ledger.check(event)?;
                occupy_for(&mut pool, event)?;
                self.ledger.apply(event)
            }
        }
    }

    /// Smallest event list that rebuilds the current state.
    fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for shared in self.registry.all() {
            if let Ok(pool) = shared.try_read() {
                events.push(Event::PoolCreated {
                    id: pool.id,
                    day: pool.day,
                    capacity: pool.capacity,
                    slot_numbers: pool.slot_numbers.clone(),
                });
            }
        }
        events.extend(
            self.ledger
                .find_all()
                .into_iter()
                .map(|reservation| Event::ReservationAdmitted { reservation }),
        );
        events
    }
}
