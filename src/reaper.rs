use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

const REAP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Cancel pending reservations nobody confirmed within `ttl_ms`, once.
/// Returns how many were expired.
pub async fn reap_once(engine: &Engine, ttl_ms: Ms) -> usize {
    let cutoff = engine.now_ms() - ttl_ms;
    let mut expired = 0;
    for id in engine.collect_stale_pending(cutoff) {
        match engine.expire_reservation(id, cutoff).await {
            Ok(true) => {
                info!("expired pending reservation {id}");
                expired += 1;
            }
            Ok(false) => {}
            Err(e) => tracing::debug!("reaper skip {id}: {e}"),
        }
    }
    expired
}

/// Background task that expires stale pending reservations.
pub async fn run_reaper(engine: Arc<Engine>, ttl_ms: Ms) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_once(&engine, ttl_ms).await;
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOptions, ManualClock};
    use crate::limits::DAY_MS;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    const JAN_1: Ms = 1_735_689_600_000;
    const TTL: Ms = 30 * 60 * 1000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("velocita_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_at(name: &str, now: Ms) -> (Arc<Engine>, Arc<ManualClock>, Ulid) {
        let clock = Arc::new(ManualClock::new(now));
        let options = EngineOptions {
            clock: clock.clone(),
            ..Default::default()
        };
        let engine = Engine::with_options(test_wal_path(name), Arc::new(NotifyHub::new()), options).unwrap();
        let vehicle_id = Ulid::new();
        engine
            .register_vehicle(Vehicle {
                id: vehicle_id,
                name: "Fiesta".into(),
                category: "compact".into(),
                price_per_day: Money::from_units(40),
                deposit: Money::from_units(100),
                available: true,
            })
            .await
            .unwrap();
        (Arc::new(engine), clock, vehicle_id)
    }

    fn request(vehicle_id: Ulid, day: i64) -> NewReservation {
        NewReservation {
            id: Ulid::new(),
            vehicle_id,
            customer_id: "walk-in".into(),
            span: Span::new(JAN_1 + day * DAY_MS, JAN_1 + (day + 2) * DAY_MS),
            add_on_ids: vec![],
        }
    }

    #[tokio::test]
    async fn stale_pending_is_expired_and_frees_dates() {
        let (engine, clock, vid) = engine_at("reaper_expire.wal", JAN_1 - 10 * DAY_MS).await;
        let stale = engine.create_reservation(request(vid, 3)).await.unwrap();

        clock.advance(TTL - 1);
        assert_eq!(reap_once(&engine, TTL).await, 0);

        clock.advance(1);
        assert_eq!(reap_once(&engine, TTL).await, 1);

        let r = engine.get_reservation(stale.id).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);
        let history = engine.history(stale.id).await.unwrap();
        assert_eq!(history.last().map(|h| h.action), Some(HistoryAction::Expired));

        // Same dates bookable again
        engine.create_reservation(request(vid, 3)).await.unwrap();
    }

    #[tokio::test]
    async fn confirmed_reservations_are_left_alone() {
        let (engine, clock, vid) = engine_at("reaper_confirmed.wal", JAN_1 - 10 * DAY_MS).await;
        let r = engine.create_reservation(request(vid, 1)).await.unwrap();
        engine.confirm_reservation(r.id).await.unwrap();

        clock.advance(2 * TTL);
        assert_eq!(reap_once(&engine, TTL).await, 0);
        assert_eq!(
            engine.get_reservation(r.id).await.unwrap().status,
            ReservationStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn confirmed_between_collect_and_expire_survives() {
        let (engine, clock, vid) = engine_at("reaper_race.wal", JAN_1 - 10 * DAY_MS).await;
        let r = engine.create_reservation(request(vid, 1)).await.unwrap();
        clock.advance(2 * TTL);

        let cutoff = engine.now_ms() - TTL;
        assert_eq!(engine.collect_stale_pending(cutoff), vec![r.id]);
        engine.confirm_reservation(r.id).await.unwrap();
        assert!(!engine.expire_reservation(r.id, cutoff).await.unwrap());
    }
}
