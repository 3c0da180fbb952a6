use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_vehicle;
use super::{Engine, EngineError};

impl Engine {
    /// Add a vehicle to the fleet, or update the directory fields of an
    /// existing one. Reservations on an existing vehicle are untouched.
    pub async fn register_vehicle(&self, vehicle: Vehicle) -> Result<(), EngineError> {
        validate_vehicle(&vehicle)?;
        let _commit = self.commit_gate.read().await;
        let id = vehicle.id;
        let event = Event::VehicleRegistered {
            vehicle: vehicle.clone(),
        };

        if let Some(vs) = self.get_vehicle_state(&id) {
            let mut guard = vs.write().await;
            if self.is_current(&id, &vs) {
                return self.persist_and_apply(&mut guard, &event).await;
            }
            // Removed while we waited: register from scratch.
        }

        if self.vehicles.len() >= MAX_VEHICLES_PER_STOREFRONT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        self.wal_append(&event).await?;
        let vs = self
            .vehicles
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(VehicleState::new(vehicle.clone()))))
            .value()
            .clone();
        // Another registration may have won the insert.
        vs.write().await.vehicle = vehicle;
        self.notify.send(id, &event);
        info!("vehicle {id} registered");
        Ok(())
    }

    /// Remove a vehicle that has never been booked.
    pub async fn remove_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut guard = self.lock_vehicle(id).await?;
        if !guard.reservations.is_empty() {
            return Err(EngineError::VehicleHasReservations(id));
        }

        let event = Event::VehicleRemoved { id };
        self.wal_append(&event).await?;
        self.vehicles.remove(&id);
        guard.vehicle.available = false;
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!("vehicle {id} removed");
        Ok(())
    }

    /// Add an extra to the catalog, replacing any entry with the same id.
    /// Existing reservations keep the prices they were quoted.
    pub async fn register_add_on(&self, add_on: AddOn) -> Result<(), EngineError> {
        if add_on.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("add-on name too long"));
        }
        if add_on.price.is_negative() {
            return Err(EngineError::LimitExceeded("negative price"));
        }
        if !self.add_ons.contains_key(&add_on.id) && self.add_ons.len() >= MAX_ADD_ONS {
            return Err(EngineError::LimitExceeded("too many add-ons"));
        }
        let _commit = self.commit_gate.read().await;
        let event = Event::AddOnRegistered { add_on: add_on.clone() };
        self.wal_append(&event).await?;
        self.add_ons.insert(add_on.id, add_on);
        Ok(())
    }

    pub async fn remove_add_on(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        if !self.add_ons.contains_key(&id) {
            return Err(EngineError::AddOnNotFound(id));
        }
        let event = Event::AddOnRemoved { id };
        self.wal_append(&event).await?;
        self.add_ons.remove(&id);
        Ok(())
    }
}
