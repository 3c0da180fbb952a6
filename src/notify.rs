use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// In-process change feed. Every committed event is published on its
/// vehicle's channel and on the storefront-wide channel.
pub struct NotifyHub {
    vehicles: DashMap<Ulid, broadcast::Sender<Event>>,
    fleet: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            vehicles: DashMap::new(),
            fleet: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Events for one vehicle. Creates the channel if needed.
    pub fn subscribe(&self, vehicle_id: Ulid) -> broadcast::Receiver<Event> {
        self.vehicles
            .entry(vehicle_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Events for every vehicle in the storefront.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.fleet.subscribe()
    }

    /// Publish. No-op for channels nobody listens on.
    pub fn send(&self, vehicle_id: Ulid, event: &Event) {
        if let Some(sender) = self.vehicles.get(&vehicle_id) {
            let _ = sender.send(event.clone());
        }
        if self.fleet.receiver_count() > 0 {
            let _ = self.fleet.send(event.clone());
        }
    }

    /// Drop a vehicle's channel once the vehicle is gone.
    pub fn remove(&self, vehicle_id: &Ulid) {
        self.vehicles.remove(vehicle_id);
    }

    pub fn listener_count(&self, vehicle_id: &Ulid) -> usize {
        self.vehicles
            .get(vehicle_id)
            .map_or(0, |s| s.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vehicle_and_fleet_subscribers_both_receive() {
        let hub = NotifyHub::new();
        let vid = Ulid::new();
        let mut one = hub.subscribe(vid);
        let mut all = hub.subscribe_all();

        let event = Event::VehicleRemoved { id: vid };
        hub.send(vid, &event);

        assert_eq!(one.recv().await.unwrap(), event);
        assert_eq!(all.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_vehicles_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(Ulid::new(), &Event::AddOnRemoved { id: Ulid::new() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_drops_channel() {
        let hub = NotifyHub::new();
        let vid = Ulid::new();
        let _rx = hub.subscribe(vid);
        assert_eq!(hub.listener_count(&vid), 1);
        hub.remove(&vid);
        assert_eq!(hub.listener_count(&vid), 0);
        // No subscribers left: must not panic.
        hub.send(vid, &Event::VehicleRemoved { id: vid });
    }
}
