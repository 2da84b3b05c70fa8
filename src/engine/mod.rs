mod clock;
mod error;
mod mutations;
mod queries;
mod validate;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, ErrorKind};
pub use validate::{normalize_booking_code, normalize_seat_codes, normalize_user_id};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};

use crate::config::EngineConfig;
use crate::model::*;
use crate::observability::{
    CONFLICTS_TOTAL, HOLDS_EXPIRED_TOTAL, LOCK_TIMEOUTS_TOTAL, WAL_FLUSH_BATCH_SIZE,
    WAL_FLUSH_DURATION_SECONDS,
};
use crate::wal::Wal;

pub type SharedKeyState = Arc<RwLock<TripDateState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while one is being written are batched
/// behind a single fsync; every sender in the batch gets the batch's result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride along
    // with the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} records: {e}", batch.len());
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { snapshot, response } => {
            let _ = response.send(wal.rewrite(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// Apply one committed change. Callers hold the key's write lock (or own the
/// state outright during replay).
pub(super) fn apply_change(state: &mut TripDateState, change: &Change) {
    match change {
        Change::HoldsExpired { hold_ids } => {
            let n = state.transition_holds(hold_ids, HoldTransition::Expire);
            unlock_seats(state, n);
        }
        Change::HoldsReleased { hold_ids } => {
            let n = state.transition_holds(hold_ids, HoldTransition::Release);
            unlock_seats(state, n);
        }
        Change::HoldsPlaced { holds } => {
            state.holds.extend(holds.iter().cloned());
            state.counter_mut().locked_seats += holds.len() as u32;
        }
        Change::SeatsBooked { hold_ids, seats } => {
            state.transition_holds(hold_ids, HoldTransition::Book);
            for seat in seats {
                state.booked.insert(seat.seat_code.clone(), seat.clone());
            }
            let n = seats.len() as u32;
            let counter = state.counter_mut();
            counter.locked_seats = counter.locked_seats.saturating_sub(n);
            counter.reserved_seats += n;
        }
        Change::Restored { holds, booked, counter } => {
            state.holds = holds.clone();
            state.booked = booked
                .iter()
                .map(|b| (b.seat_code.clone(), b.clone()))
                .collect();
            state.counter = *counter;
        }
    }
}

fn unlock_seats(state: &mut TripDateState, n: u32) {
    if let Some(counter) = state.counter.as_mut() {
        counter.locked_seats = counter.locked_seats.saturating_sub(n);
    }
}

/// An open transaction on one `(trip, date)`: the key's write lock plus a
/// shared hold on the commit gate, so compaction never interleaves with it.
pub(super) struct KeyTxn<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    pub state: OwnedRwLockWriteGuard<TripDateState>,
}

/// One tenant's seat state: the template plus a lock per `(trip, date)`.
pub struct Engine {
    pub(super) keys: DashMap<TripDateKey, SharedKeyState>,
    pub(super) template: RwLock<SeatTemplateRegistry>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared; compaction takes it exclusively.
    pub(super) commit_gate: RwLock<()>,
    pub(super) config: EngineConfig,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        Self::with_clock(wal_path, config, Arc::new(SystemClock))
    }

    /// Replay the WAL at `wal_path` and start its writer task.
    pub fn with_clock(
        wal_path: PathBuf,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let mut template = SeatTemplateRegistry::default();
        let mut states: HashMap<TripDateKey, TripDateState> = HashMap::new();
        for event in &events {
            match event {
                Event::TemplateProvisioned { seats } => {
                    for seat in seats {
                        template.insert(seat.clone());
                    }
                }
                Event::KeyCommitted { key, changes } => {
                    let state = states
                        .entry(*key)
                        .or_insert_with(|| TripDateState::new(*key));
                    for change in changes {
                        apply_change(state, change);
                    }
                }
            }
        }
        tracing::debug!(
            "replayed {} records from {}: {} template seats, {} keys",
            events.len(),
            wal_path.display(),
            template.len(),
            states.len()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            keys: states
                .into_iter()
                .map(|(key, state)| (key, Arc::new(RwLock::new(state))))
                .collect(),
            template: RwLock::new(template),
            wal_tx,
            commit_gate: RwLock::new(()),
            config,
            clock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    async fn send_wal(&self, cmd: WalCommand) -> Result<(), EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))
    }

    /// Durably append one record through the group-commit writer.
    pub(super) async fn wal_append(&self, event: Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_wal(WalCommand::Append { event, response: tx }).await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_rewrite(&self, snapshot: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_wal(WalCommand::Rewrite { snapshot, response: tx }).await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .send_wal(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(super) fn existing_key(&self, key: &TripDateKey) -> Option<SharedKeyState> {
        self.keys.get(key).map(|e| e.value().clone())
    }

    /// State for `key`, creating an empty one on first use.
    pub(super) fn key_or_create(&self, key: TripDateKey) -> Result<SharedKeyState, EngineError> {
        if let Some(state) = self.existing_key(&key) {
            return Ok(state);
        }
        if self.keys.len() >= crate::limits::MAX_KEYS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many trip dates"));
        }
        Ok(self
            .keys
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(TripDateState::new(key))))
            .value()
            .clone())
    }

    /// Wait (bounded by `lock_wait`) for the commit gate and the key's write lock.
    pub(super) async fn begin(
        &self,
        key: TripDateKey,
        shared: SharedKeyState,
    ) -> Result<KeyTxn<'_>, EngineError> {
        let acquire = async {
            let gate = self.commit_gate.read().await;
            let state = shared.write_owned().await;
            KeyTxn { _gate: gate, state }
        };
        tokio::time::timeout(self.config.lock_wait, acquire)
            .await
            .map_err(|_| {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!("lock wait expired on {key}");
                EngineError::LockTimeout(key)
            })
    }

    /// Persist `changes` as one record, then apply them. Nothing is applied if
    /// the WAL write fails. An empty change list commits nothing.
    pub(super) async fn commit(
        &self,
        state: &mut TripDateState,
        changes: Vec<Change>,
    ) -> Result<(), EngineError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.wal_append(Event::KeyCommitted {
            key: state.key,
            changes: changes.clone(),
        })
        .await?;
        for change in &changes {
            apply_change(state, change);
        }
        Ok(())
    }

    /// Commit the key's reconciliation (every HELD hold past its expiry goes
    /// to RELEASED) together with `change` as one record. Returns how many
    /// holds expired.
    pub(super) async fn commit_with_expiry(
        &self,
        state: &mut TripDateState,
        now: Ms,
        change: Option<Change>,
    ) -> Result<usize, EngineError> {
        let expired = state.expired_hold_ids(now);
        let n_expired = expired.len();
        let mut changes = Vec::with_capacity(2);
        if n_expired > 0 {
            changes.push(Change::HoldsExpired { hold_ids: expired });
        }
        changes.extend(change);
        self.commit(state, changes).await?;
        if n_expired > 0 {
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(n_expired as u64);
            tracing::debug!("{}: {n_expired} expired holds released", state.key);
        }
        Ok(n_expired)
    }

    pub(super) fn reject(&self, key: TripDateKey, reason: &'static str, err: EngineError) -> EngineError {
        metrics::counter!(CONFLICTS_TOTAL, "reason" => reason).increment(1);
        tracing::debug!("{key}: batch rejected: {err}");
        err
    }
}
