use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::EngineError;

pub type SharedDay = Arc<RwLock<DayState>>;

/// Transactional persistence of free intervals and appointments, keyed by (owner, date).
#[async_trait]
pub trait IntervalStore: Send + Sync {
    /// Open a unit of work holding the day's exclusive lock until commit or drop.
    async fn begin(&self, day: DayKey) -> Result<Txn, EngineError>;

    /// Journal and apply the staged writes. `None` when there was nothing to write.
    async fn commit(&self, txn: Txn, kind: TxnKind) -> Result<Option<Event>, EngineError>;

    fn locate_appointment(&self, id: &Ulid) -> Option<DayKey>;

    async fn read_day(&self, day: DayKey) -> DayState;

    /// Non-empty days of `owner_id` in `[from, from + count)`, in date order.
    async fn read_days(&self, owner_id: OwnerId, from: NaiveDate, count: u64) -> Vec<DayState>;

    /// All of an owner's appointments, ordered by (date, start).
    async fn appointments_for(&self, owner_id: OwnerId) -> Vec<Appointment>;
}

/// Resolves which owner offers a service.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    fn owner_of(&self, service_id: ServiceId) -> Option<OwnerId>;

    async fn register(&self, service: ServiceInfo) -> Result<(), EngineError>;

    fn services_for(&self, owner_id: OwnerId) -> Vec<ServiceInfo>;
}

// ── Unit of work ─────────────────────────────────────────

/// Exclusive access to one day bucket. Reads see this transaction's own writes.
/// Dropping it without `IntervalStore::commit` discards every staged write.
pub struct Txn {
    _gate: OwnedRwLockReadGuard<()>,
    guard: OwnedRwLockWriteGuard<DayState>,
    working: DayState,
    ops: Vec<Op>,
}

impl Txn {
    fn new(gate: OwnedRwLockReadGuard<()>, guard: OwnedRwLockWriteGuard<DayState>) -> Self {
        let working = guard.clone();
        Self {
            _gate: gate,
            guard,
            working,
            ops: Vec::new(),
        }
    }

    pub fn day(&self) -> DayKey {
        self.working.day
    }

    pub fn free_intervals(&self) -> &[FreeInterval] {
        &self.working.free
    }

    pub fn appointments(&self) -> &[Appointment] {
        &self.working.appointments
    }

    /// Containment query, earliest start first.
    pub fn containing(&self, span: &Span) -> Vec<FreeInterval> {
        self.working.containing(span).cloned().collect()
    }

    /// Exact boundary adjacency query.
    pub fn adjacent(&self, span: &Span) -> Vec<FreeInterval> {
        self.working.adjacent(span).cloned().collect()
    }

    pub fn overlapping(&self, span: &Span) -> Vec<FreeInterval> {
        self.working.overlapping(span).cloned().collect()
    }

    pub fn insert_free(&mut self, span: Span) -> Result<FreeInterval, EngineError> {
        if span.start >= span.end {
            return Err(EngineError::InvalidRange(
                format_time(span.start),
                format_time(span.end),
            ));
        }
        if self.working.free.len() >= MAX_INTERVALS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many free intervals on day"));
        }
        if let Some(clash) = self.working.overlapping(&span).next() {
            return Err(EngineError::Corrupt(format!(
                "{span} overlaps free interval {} of {}",
                clash.span, self.working.day
            )));
        }
        let interval = FreeInterval {
            id: Ulid::new(),
            owner_id: self.working.day.owner_id,
            date: self.working.day.date,
            span,
        };
        self.working.insert_free(interval.clone());
        self.ops.push(Op::InsertFree(interval.clone()));
        Ok(interval)
    }

    pub fn delete_free(&mut self, id: Ulid) -> Result<FreeInterval, EngineError> {
        let removed = self.working.remove_free(id).ok_or_else(|| {
            EngineError::Corrupt(format!("free interval {id} vanished from {}", self.working.day))
        })?;
        self.ops.push(Op::DeleteFree(id));
        Ok(removed)
    }

    pub fn insert_appointment(&mut self, appointment: Appointment) -> Result<(), EngineError> {
        if appointment.day() != self.working.day {
            return Err(EngineError::Corrupt(format!(
                "appointment {} belongs to {}, not {}",
                appointment.id,
                appointment.day(),
                self.working.day
            )));
        }
        if self.working.appointments.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on day"));
        }
        self.working.insert_appointment(appointment.clone());
        self.ops.push(Op::InsertAppointment(appointment));
        Ok(())
    }

    pub fn delete_appointment(&mut self, id: Ulid) -> Result<Appointment, EngineError> {
        let removed = self
            .working
            .remove_appointment(id)
            .ok_or(EngineError::AppointmentNotFound(id))?;
        self.ops.push(Op::DeleteAppointment(id));
        Ok(removed)
    }

    pub fn is_dirty(&self) -> bool {
        !self.ops.is_empty()
    }

    fn into_parts(
        self,
    ) -> (
        OwnedRwLockReadGuard<()>,
        OwnedRwLockWriteGuard<DayState>,
        Vec<Op>,
    ) {
        (self._gate, self.guard, self.ops)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Everything already queued behind the first append joins its
/// batch and shares one fsync. A control command ends the batch so it sees
/// every append queued before it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut control = match first {
            WalCommand::Append { event, response } => {
                batch.push((event, response));
                None
            }
            other => Some(other),
        };
        while control.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => control = Some(other),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(cmd) = control {
            run_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no buffered bytes leak into the next batch.
    let flushed = wal.flush_sync();
    let outcome = written.and(flushed);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &outcome {
        tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Day store ────────────────────────────────────────────

/// In-memory day buckets behind per-day `RwLock`s, made durable by a WAL.
pub struct DayStore {
    days: DashMap<DayKey, SharedDay>,
    /// Appointment id → the bucket holding it.
    appointment_index: DashMap<Ulid, DayKey>,
    /// Owner → dates that have ever held rows.
    owner_days: DashMap<OwnerId, BTreeSet<NaiveDate>>,
    services: DashMap<ServiceId, ServiceInfo>,
    journal: Option<mpsc::Sender<WalCommand>>,
    /// Transactions hold this shared for their whole life; compaction takes it exclusively.
    commit_gate: Arc<RwLock<()>>,
    lock_timeout: Duration,
}

impl DayStore {
    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must be called from within a Tokio runtime.
    pub fn open(wal_path: &Path, lock_timeout: Duration) -> io::Result<Self> {
        let replay = Wal::replay(wal_path)?;
        if replay.discarded_tail {
            warn!(
                path = %wal_path.display(),
                valid_len = replay.valid_len,
                "discarding torn WAL tail"
            );
        }
        let wal = Wal::open(wal_path, replay.valid_len)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));

        let store = Self::build(Some(tx), lock_timeout);
        for event in &replay.events {
            store.replay_event(event)?;
        }
        info!(
            path = %wal_path.display(),
            events = replay.events.len(),
            days = store.days.len(),
            services = store.services.len(),
            "schedule store opened"
        );
        Ok(store)
    }

    /// Same semantics without a journal. Nothing survives the process.
    pub fn in_memory(lock_timeout: Duration) -> Self {
        Self::build(None, lock_timeout)
    }

    fn build(journal: Option<mpsc::Sender<WalCommand>>, lock_timeout: Duration) -> Self {
        Self {
            days: DashMap::new(),
            appointment_index: DashMap::new(),
            owner_days: DashMap::new(),
            services: DashMap::new(),
            journal,
            commit_gate: Arc::new(RwLock::new(())),
            lock_timeout,
        }
    }

    fn bucket(&self, day: DayKey) -> SharedDay {
        self.days
            .entry(day)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(day))))
            .value()
            .clone()
    }

    fn existing_bucket(&self, day: &DayKey) -> Option<SharedDay> {
        self.days.get(day).map(|e| e.value().clone())
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::ServiceRegistered { id, owner_id, name } => {
                self.services.insert(
                    *id,
                    ServiceInfo {
                        id: *id,
                        owner_id: *owner_id,
                        name: name.clone(),
                    },
                );
            }
            Event::Committed { day, .. } | Event::DaySnapshot { day, .. } => {
                // Sole owner of the bucket during replay, so try_write never contends.
                let bucket = self.bucket(*day);
                let Ok(mut guard) = bucket.try_write() else {
                    return Err(io::Error::other(format!("replay: bucket {day} is locked")));
                };
                self.apply_event(&mut guard, event);
            }
        }
        Ok(())
    }

    /// Apply a journaled record to its locked bucket and keep the indexes in step.
    /// Commit and replay share this path.
    fn apply_event(&self, state: &mut DayState, event: &Event) {
        match event {
            Event::Committed { ops, .. } => {
                for op in ops {
                    self.apply_op(state, op);
                }
            }
            Event::DaySnapshot {
                free, appointments, ..
            } => {
                for old in &state.appointments {
                    self.appointment_index.remove(&old.id);
                }
                state.free.clear();
                state.appointments.clear();
                for interval in free {
                    state.insert_free(interval.clone());
                }
                for appointment in appointments {
                    self.appointment_index.insert(appointment.id, state.day);
                    state.insert_appointment(appointment.clone());
                }
            }
            Event::ServiceRegistered { .. } => {}
        }
        if !state.is_empty() {
            self.owner_days
                .entry(state.day.owner_id)
                .or_default()
                .insert(state.day.date);
        }
    }

    fn apply_op(&self, state: &mut DayState, op: &Op) {
        match op {
            Op::InsertFree(interval) => state.insert_free(interval.clone()),
            Op::DeleteFree(id) => {
                state.remove_free(*id);
            }
            Op::InsertAppointment(appointment) => {
                self.appointment_index.insert(appointment.id, state.day);
                state.insert_appointment(appointment.clone());
            }
            Op::DeleteAppointment(id) => {
                state.remove_appointment(*id);
                self.appointment_index.remove(id);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn journal_append(&self, event: &Event) -> Result<(), EngineError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        journal
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL as one record per service and one snapshot per non-empty day.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        // No transaction is open while this is held, so day reads never wait.
        let _gate = self.commit_gate.write().await;

        let mut services: Vec<ServiceInfo> =
            self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        let mut events: Vec<Event> = services
            .into_iter()
            .map(|s| Event::ServiceRegistered {
                id: s.id,
                owner_id: s.owner_id,
                name: s.name,
            })
            .collect();

        let mut keys: Vec<DayKey> = self.days.iter().map(|e| *e.key()).collect();
        keys.sort();
        for key in keys {
            let Some(bucket) = self.existing_bucket(&key) else {
                continue;
            };
            let state = bucket.read().await;
            if !state.is_empty() {
                events.push(Event::DaySnapshot {
                    day: key,
                    free: state.free.clone(),
                    appointments: state.appointments.clone(),
                });
            }
        }

        let records = events.len();
        let (tx, rx) = oneshot::channel();
        journal
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(records, "WAL compacted");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(journal) = &self.journal else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if journal
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl IntervalStore for DayStore {
    async fn begin(&self, day: DayKey) -> Result<Txn, EngineError> {
        let bucket = self.bucket(day);
        let gate = self.commit_gate.clone();
        let acquire = async move {
            let gate = gate.read_owned().await;
            let guard = bucket.write_owned().await;
            (gate, guard)
        };
        match tokio::time::timeout(self.lock_timeout, acquire).await {
            Ok((gate, guard)) => Ok(Txn::new(gate, guard)),
            Err(_) => {
                metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                warn!(%day, timeout = ?self.lock_timeout, "day lock wait timed out");
                Err(EngineError::LockTimeout(self.lock_timeout))
            }
        }
    }

    async fn commit(&self, txn: Txn, kind: TxnKind) -> Result<Option<Event>, EngineError> {
        let (_gate, mut guard, ops) = txn.into_parts();
        if ops.is_empty() {
            return Ok(None);
        }
        let event = Event::Committed {
            day: guard.day,
            kind,
            ops,
        };
        self.journal_append(&event).await?;
        self.apply_event(&mut guard, &event);
        Ok(Some(event))
    }

    fn locate_appointment(&self, id: &Ulid) -> Option<DayKey> {
        self.appointment_index.get(id).map(|e| *e.value())
    }

    async fn read_day(&self, day: DayKey) -> DayState {
        match self.existing_bucket(&day) {
            Some(bucket) => bucket.read().await.clone(),
            None => DayState::new(day),
        }
    }

    async fn read_days(&self, owner_id: OwnerId, from: NaiveDate, count: u64) -> Vec<DayState> {
        let mut out = Vec::new();
        for offset in 0..count {
            let Some(date) = from.checked_add_days(Days::new(offset)) else {
                break;
            };
            if let Some(bucket) = self.existing_bucket(&DayKey::new(owner_id, date)) {
                let state = bucket.read().await;
                if !state.is_empty() {
                    out.push(state.clone());
                }
            }
        }
        out
    }

    async fn appointments_for(&self, owner_id: OwnerId) -> Vec<Appointment> {
        let dates: Vec<NaiveDate> = self
            .owner_days
            .get(&owner_id)
            .map(|e| e.value().iter().copied().collect())
            .unwrap_or_default();
        let mut out = Vec::new();
        for date in dates {
            if let Some(bucket) = self.existing_bucket(&DayKey::new(owner_id, date)) {
                out.extend(bucket.read().await.appointments.iter().cloned());
            }
        }
        out
    }
}

#[async_trait]
impl ServiceCatalog for DayStore {
    fn owner_of(&self, service_id: ServiceId) -> Option<OwnerId> {
        self.services.get(&service_id).map(|e| e.value().owner_id)
    }

    async fn register(&self, service: ServiceInfo) -> Result<(), EngineError> {
        if service.name.len() > MAX_SERVICE_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let _gate = self.commit_gate.read().await;
        let event = Event::ServiceRegistered {
            id: service.id,
            owner_id: service.owner_id,
            name: service.name.clone(),
        };
        self.journal_append(&event).await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    fn services_for(&self, owner_id: OwnerId) -> Vec<ServiceInfo> {
        let mut out: Vec<ServiceInfo> = self
            .services
            .iter()
            .filter(|e| e.value().owner_id == owner_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}
