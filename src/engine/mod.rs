mod availability;
mod clock;
mod conflict;
mod error;
mod fleet;
mod lifecycle;
mod queries;

pub use availability::{merge_overlapping, subtract_intervals};
pub use clock::{now_ms, Clock, ManualClock, SystemClock};
pub use conflict::checked_span;
pub use error::EngineError;

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::pricing::AddOnPolicy;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Commit what we have before touching the file layout.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Engine knobs that differ between storefronts and tests.
#[derive(Clone)]
pub struct EngineOptions {
    pub add_on_policy: AddOnPolicy,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            add_on_policy: AddOnPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Engine {
    pub(super) vehicles: DashMap<Ulid, SharedVehicleState>,
    pub(super) add_ons: DashMap<Ulid, AddOn>,
    /// Reverse lookup: reservation id → vehicle id
    pub(super) reservation_to_vehicle: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared from validation to apply; compaction holds
    /// it exclusively so its snapshot and the WAL agree. Always taken
    /// before any vehicle lock.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) add_on_policy: AddOnPolicy,
    pub(super) clock: Arc<dyn Clock>,
}

/// Apply an event directly to a VehicleState (caller holds the lock).
fn apply_to_vehicle(vs: &mut VehicleState, event: &Event, reservation_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::VehicleRegistered { vehicle } => {
            vs.vehicle = vehicle.clone();
        }
        Event::ReservationCreated { reservation, record } => {
            if reservation.status.holds_vehicle()
                && let Err(existing) = vs.index.reserve(reservation.id, reservation.span)
            {
                tracing::warn!(
                    "reservation {} overlaps {} on vehicle {}",
                    reservation.id, existing.reservation_id, reservation.vehicle_id
                );
            }
            vs.reservations.insert(reservation.id, reservation.clone());
            vs.history.push(record.clone());
            reservation_map.insert(reservation.id, reservation.vehicle_id);
        }
        Event::ReservationTransitioned { id, status, record, .. } => {
            if let Some(r) = vs.reservations.get_mut(id) {
                if r.status.holds_vehicle() && !status.holds_vehicle() {
                    vs.index.release(&r.span);
                }
                r.status = *status;
            }
            vs.history.push(record.clone());
        }
        // Removal and the add-on catalog live at the map level, not here
        Event::VehicleRemoved { .. } | Event::AddOnRegistered { .. } | Event::AddOnRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_options(wal_path, notify, EngineOptions::default())
    }

    pub fn with_options(wal_path: PathBuf, notify: Arc<NotifyHub>, options: EngineOptions) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            vehicles: DashMap::new(),
            add_ons: DashMap::new(),
            reservation_to_vehicle: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            add_on_policy: options.add_on_policy,
            clock: options.clock,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this may run inside an async context
        // (lazy storefront creation).
        for event in &events {
            match event {
                Event::VehicleRegistered { vehicle } if !engine.vehicles.contains_key(&vehicle.id) => {
                    let vs = VehicleState::new(vehicle.clone());
                    engine.vehicles.insert(vehicle.id, Arc::new(RwLock::new(vs)));
                }
                Event::VehicleRemoved { id } => {
                    engine.vehicles.remove(id);
                }
                Event::AddOnRegistered { add_on } => {
                    engine.add_ons.insert(add_on.id, add_on.clone());
                }
                Event::AddOnRemoved { id } => {
                    engine.add_ons.remove(id);
                }
                other => {
                    let Some(vehicle_id) = other.vehicle_id() else { continue };
                    let Some(vs) = engine.get_vehicle_state(&vehicle_id) else { continue };
                    if let Ok(mut guard) = vs.try_write() {
                        apply_to_vehicle(&mut guard, other, &engine.reservation_to_vehicle);
                    }
                }
            }
        }

        // The index is derived data: rebuild it from the replayed records.
        for entry in engine.vehicles.iter() {
            if let Ok(mut guard) = entry.value().try_write() {
                guard.index = AvailabilityIndex::rebuild(guard.reservations.values());
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
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

    pub(super) fn get_vehicle_state(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    /// Whether `vs` is still the state registered under `id`. A handle
    /// taken before a concurrent removal no longer is.
    pub(super) fn is_current(&self, id: &Ulid, vs: &SharedVehicleState) -> bool {
        self.vehicles
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), vs))
    }

    /// Write-lock a vehicle that is still in the fleet once the lock is held.
    pub(super) async fn lock_vehicle(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<VehicleState>, EngineError> {
        let vs = self.get_vehicle_state(&id).ok_or(EngineError::VehicleNotFound(id))?;
        let guard = vs.clone().write_owned().await;
        if !self.is_current(&id, &vs) {
            return Err(EngineError::VehicleNotFound(id));
        }
        Ok(guard)
    }

    pub fn vehicle_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_vehicle.get(reservation_id).map(|e| *e.value())
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Subscribe to committed events for one vehicle.
    pub fn subscribe(&self, vehicle_id: Ulid) -> tokio::sync::broadcast::Receiver<Event> {
        self.notify.subscribe(vehicle_id)
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(&self, vs: &mut VehicleState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_vehicle(vs, event, &self.reservation_to_vehicle);
        if let Some(vehicle_id) = event.vehicle_id() {
            self.notify.send(vehicle_id, event);
        }
        Ok(())
    }

    /// Lookup reservation → vehicle, acquire the vehicle's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<VehicleState>), EngineError> {
        let vehicle_id = self
            .vehicle_for_reservation(reservation_id)
            .ok_or(EngineError::ReservationNotFound(*reservation_id))?;
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.write_owned().await;
        Ok((vehicle_id, guard))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Every history record is kept.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _commit = self.commit_gate.write().await;

        let mut add_ons: Vec<AddOn> = self.add_ons.iter().map(|e| e.value().clone()).collect();
        add_ons.sort_by_key(|a| a.id);
        let mut events: Vec<Event> = add_ons
            .into_iter()
            .map(|add_on| Event::AddOnRegistered { add_on })
            .collect();

        let states: Vec<SharedVehicleState> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        for vs in states {
            let guard = vs.read().await;
            events.push(Event::VehicleRegistered {
                vehicle: guard.vehicle.clone(),
            });
            let mut created = HashSet::new();
            for record in &guard.history {
                let Some(reservation) = guard.reservations.get(&record.reservation_id) else {
                    continue;
                };
                if record.action == HistoryAction::Created && created.insert(reservation.id) {
                    let mut initial = reservation.clone();
                    initial.status = ReservationStatus::Pending;
                    events.push(Event::ReservationCreated {
                        reservation: initial,
                        record: record.clone(),
                    });
                } else {
                    events.push(Event::ReservationTransitioned {
                        id: reservation.id,
                        vehicle_id: reservation.vehicle_id,
                        status: record.action.resulting_status(),
                        record: record.clone(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
