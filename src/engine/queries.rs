use ulid::Ulid;

use crate::model::*;
use crate::pricing::{self, resolve_add_ons};

use super::availability::merge_overlapping;
use super::conflict::{validate_query_window, validate_span};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_vehicle(&self, id: &Ulid) -> Option<Vehicle> {
        let vs = self.get_vehicle_state(id)?;
        let guard = vs.read().await;
        Some(guard.vehicle.clone())
    }

    /// Whole fleet, ordered by id.
    pub async fn list_vehicles(&self) -> Vec<Vehicle> {
        self.search_vehicles(&VehicleFilter::default())
            .await
            .unwrap_or_default()
    }

    /// Fleet search. With a window, only vehicles that could take a
    /// booking for exactly that window are returned.
    pub async fn search_vehicles(&self, filter: &VehicleFilter) -> Result<Vec<Vehicle>, EngineError> {
        if let Some(window) = &filter.window {
            validate_query_window(window)?;
        }
        let states: Vec<_> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::new();
        for vs in states {
            let guard = vs.read().await;
            let v = &guard.vehicle;
            if let Some(category) = &filter.category
                && !v.category.eq_ignore_ascii_case(category)
            {
                continue;
            }
            if let Some(max) = filter.max_price_per_day
                && v.price_per_day > max
            {
                continue;
            }
            if let Some(window) = &filter.window
                && (!v.available || !guard.index.is_available(window))
            {
                continue;
            }
            result.push(v.clone());
        }
        result.sort_by_key(|v| v.id);
        Ok(result)
    }

    /// Catalog, ordered by name then id.
    pub fn list_add_ons(&self) -> Vec<AddOn> {
        let mut add_ons: Vec<AddOn> = self.add_ons.iter().map(|e| e.value().clone()).collect();
        add_ons.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        add_ons
    }

    pub fn get_add_on(&self, id: &Ulid) -> Option<AddOn> {
        self.add_ons.get(id).map(|e| e.value().clone())
    }

    /// Price a rental without booking it.
    pub async fn quote(&self, vehicle_id: Ulid, span: Span, add_on_ids: &[Ulid]) -> Result<Quote, EngineError> {
        validate_span(&span)?;
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let vehicle = vs.read().await.vehicle.clone();
        let add_ons = resolve_add_ons(add_on_ids, self.add_on_policy, |id| self.get_add_on(id))?;
        pricing::quote(&vehicle, &span, &add_ons)
    }

    /// True when a new booking for `span` would be accepted right now.
    pub async fn is_available(&self, vehicle_id: Ulid, span: Span) -> Result<bool, EngineError> {
        validate_query_window(&span)?;
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(guard.vehicle.available && guard.index.is_available(&span))
    }

    /// Bookable sub-spans of `window` for one vehicle. Empty when the
    /// vehicle is switched off at fleet level.
    pub async fn free_windows(&self, vehicle_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError> {
        validate_query_window(&window)?;
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        if !guard.vehicle.available {
            return Ok(Vec::new());
        }
        Ok(guard.index.free_windows(&window))
    }

    /// Spans of `window` during which at least one vehicle of `category`
    /// is free.
    pub async fn category_free_windows(&self, category: &str, window: Span) -> Result<Vec<Span>, EngineError> {
        validate_query_window(&window)?;
        let states: Vec<_> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        let mut all_free = Vec::new();
        for vs in states {
            let guard = vs.read().await;
            if guard.vehicle.available && guard.vehicle.category.eq_ignore_ascii_case(category) {
                all_free.extend(guard.index.free_windows(&window));
            }
        }
        all_free.sort_by_key(|s| s.start);
        Ok(merge_overlapping(&all_free))
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let vehicle_id = self
            .vehicle_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = vs.read().await;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// All reservations on a vehicle, ordered by start date.
    pub async fn list_reservations(&self, vehicle_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = vs.read().await;
        let mut reservations: Vec<Reservation> = guard.reservations.values().cloned().collect();
        reservations.sort_by_key(|r| (r.span.start, r.id));
        Ok(reservations)
    }

    /// Lifecycle ledger for one reservation, in commit order.
    pub async fn history(&self, reservation_id: Ulid) -> Result<Vec<HistoryRecord>, EngineError> {
        let vehicle_id = self
            .vehicle_for_reservation(&reservation_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;
        let vs = self
            .get_vehicle_state(&vehicle_id)
            .ok_or(EngineError::ReservationNotFound(reservation_id))?;
        let guard = vs.read().await;
        Ok(guard.history_for(reservation_id).cloned().collect())
    }
}
