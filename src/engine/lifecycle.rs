use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::pricing::{self, resolve_add_ons};

use super::conflict::validate_request;
use super::{Engine, EngineError};

impl Engine {
    /// Price and book a vehicle. The new reservation starts `Pending`.
    ///
    /// Availability check and interval insert happen under the vehicle's
    /// write lock, so two overlapping requests can never both succeed.
    /// Resubmitting the same request with the same id returns the original.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        validate_request(&req)?;
        let _commit = self.commit_gate.read().await;
        let mut guard = self.lock_vehicle(req.vehicle_id).await?;

        let mut requested = req.add_on_ids.clone();
        requested.sort();
        requested.dedup();
        if let Some(existing) = guard.reservations.get(&req.id) {
            let same_request = existing.vehicle_id == req.vehicle_id
                && existing.customer_id == req.customer_id
                && existing.span == req.span
                && existing.requested_add_on_ids == requested;
            if same_request {
                return Ok(existing.clone());
            }
            return Err(EngineError::AlreadyExists(req.id));
        }
        if !guard.vehicle.available {
            return Err(EngineError::VehicleUnavailable(req.vehicle_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
        }
        if let Some(existing) = guard.index.conflicting(&req.span) {
            metrics::counter!(observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            debug!(
                "reservation {} conflicts with {} on vehicle {}",
                req.id, existing.reservation_id, req.vehicle_id
            );
            return Err(EngineError::DateRangeConflict {
                vehicle_id: req.vehicle_id,
                reservation_id: existing.reservation_id,
            });
        }

        let add_ons = resolve_add_ons(&req.add_on_ids, self.add_on_policy, |id| {
            self.add_ons.get(id).map(|a| a.value().clone())
        })?;
        let quote = pricing::quote(&guard.vehicle, &req.span, &add_ons)?;
        let now = self.clock.now_ms();

        let reservation = Reservation {
            id: req.id,
            vehicle_id: req.vehicle_id,
            customer_id: req.customer_id,
            span: req.span,
            status: ReservationStatus::Pending,
            days: quote.days,
            base_cost: quote.base_cost,
            add_ons_total: quote.add_ons_total,
            deposit_amount: quote.deposit,
            total: quote.total,
            add_on_ids: quote.add_on_ids,
            requested_add_on_ids: requested,
            created_at: now,
        };
        let record = HistoryRecord {
            id: Ulid::new(),
            reservation_id: reservation.id,
            action: HistoryAction::Created,
            timestamp: now,
            note: None,
        };

        // Claim the id across vehicles before it hits the log.
        match self.reservation_to_vehicle.entry(reservation.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(reservation.id)),
            Entry::Vacant(slot) => {
                slot.insert(reservation.vehicle_id);
            }
        }

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
            record,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.reservation_to_vehicle.remove(&reservation.id);
            return Err(e);
        }

        metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            "reservation {} created on vehicle {} total {}",
            reservation.id, reservation.vehicle_id, reservation.total
        );
        Ok(reservation)
    }

    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.apply_transition(id, HistoryAction::Confirmed, None).await
    }

    /// Vehicle handed over to the customer.
    pub async fn activate_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.apply_transition(id, HistoryAction::Activated, None).await
    }

    /// Cancel a pending or confirmed reservation and free its dates.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.apply_transition(id, HistoryAction::Cancelled, None).await
    }

    /// Close a rental. Only allowed once its end date has passed.
    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.apply_transition(id, HistoryAction::Completed, None).await
    }

    /// Move a reservation along its lifecycle and append one history record.
    /// Asking for the status it already has is a no-op that returns it unchanged.
    pub async fn apply_transition(
        &self,
        id: Ulid,
        action: HistoryAction,
        note: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if let Some(n) = &note
            && n.len() > MAX_NOTE_LEN
        {
            return Err(EngineError::LimitExceeded("note too long"));
        }
        let to = action.resulting_status();
        let _commit = self.commit_gate.read().await;
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservations
            .get(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;

        if current.status == to {
            return Ok(current.clone());
        }
        let from = current.status;
        if action == HistoryAction::Created || !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        let now = self.clock.now_ms();
        if to == ReservationStatus::Completed && now < current.span.end {
            return Err(EngineError::InvalidTransition { id, from, to });
        }

        let event = Event::ReservationTransitioned {
            id,
            vehicle_id,
            status: to,
            record: HistoryRecord {
                id: Ulid::new(),
                reservation_id: id,
                action,
                timestamp: now,
                note,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::RESERVATION_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        info!("reservation {id} {from} -> {to}");
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Pending reservations created at or before `cutoff`.
    pub fn collect_stale_pending(&self, cutoff: Ms) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for entry in self.vehicles.iter() {
            let vs = entry.value().clone();
            if let Ok(guard) = vs.try_read() {
                stale.extend(
                    guard
                        .reservations
                        .values()
                        .filter(|r| r.status == ReservationStatus::Pending && r.created_at <= cutoff)
                        .map(|r| r.id),
                );
            }
        }
        stale
    }

    /// Cancel a reservation that is still pending and was created at or
    /// before `cutoff`. Returns false when it no longer qualifies.
    pub async fn expire_reservation(&self, id: Ulid, cutoff: Ms) -> Result<bool, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (vehicle_id, mut guard) = self.resolve_reservation_write(&id).await?;
        let still_stale = guard
            .reservations
            .get(&id)
            .is_some_and(|r| r.status == ReservationStatus::Pending && r.created_at <= cutoff);
        if !still_stale {
            return Ok(false);
        }

        let event = Event::ReservationTransitioned {
            id,
            vehicle_id,
            status: ReservationStatus::Cancelled,
            record: HistoryRecord {
                id: Ulid::new(),
                reservation_id: id,
                action: HistoryAction::Expired,
                timestamp: self.clock.now_ms(),
                note: None,
            },
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::RESERVATIONS_EXPIRED_TOTAL).increment(1);
        Ok(true)
    }
}
