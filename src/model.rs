use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` for empty or inverted ranges.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Saturates instead of overflowing on wire-supplied extremes.
    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Fixed-point money in minor units (cents).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn from_units(units: i64) -> Self {
        Self(units * 100)
    }

    pub const fn cents(&self) -> i64 {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Money> {
        self.0.checked_mul(factor).map(Money)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Fleet directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub name: String,
    pub category: String,
    pub price_per_day: Money,
    pub deposit: Money,
    /// Fleet-level toggle. When false no new reservation is accepted,
    /// whatever the requested dates.
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOn {
    pub id: Ulid,
    pub name: String,
    pub price: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// The lifecycle table. Everything not listed here is rejected.
    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Active)
                | (Confirmed, Cancelled)
                | (Confirmed, Completed)
                | (Active, Completed)
        )
    }

    /// Statuses whose interval occupies the vehicle.
    pub fn holds_vehicle(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Confirmed | ReservationStatus::Active
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Active => "active",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    Created,
    Confirmed,
    Activated,
    Cancelled,
    Completed,
    /// Pending reservation cancelled by the reaper after its TTL.
    Expired,
}

impl HistoryAction {
    pub fn resulting_status(self) -> ReservationStatus {
        match self {
            HistoryAction::Created => ReservationStatus::Pending,
            HistoryAction::Confirmed => ReservationStatus::Confirmed,
            HistoryAction::Activated => ReservationStatus::Active,
            HistoryAction::Completed => ReservationStatus::Completed,
            HistoryAction::Cancelled | HistoryAction::Expired => ReservationStatus::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HistoryAction::Created => "created",
            HistoryAction::Confirmed => "confirmed",
            HistoryAction::Activated => "activated",
            HistoryAction::Cancelled => "cancelled",
            HistoryAction::Completed => "completed",
            HistoryAction::Expired => "expired",
        }
    }
}

/// Immutable ledger entry, one per lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Ulid,
    pub reservation_id: Ulid,
    pub action: HistoryAction,
    pub timestamp: Ms,
    pub note: Option<String>,
}

/// Priced booking for one vehicle. Money fields are frozen at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub customer_id: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub days: u32,
    pub base_cost: Money,
    pub add_ons_total: Money,
    pub deposit_amount: Money,
    pub total: Money,
    /// Resolved add-ons only; ids dropped at quote time are not kept.
    pub add_on_ids: Vec<Ulid>,
    /// Add-on ids as the caller sent them, sorted and deduplicated.
    /// A resubmission must match these to count as the same request.
    pub requested_add_on_ids: Vec<Ulid>,
    pub created_at: Ms,
}

/// Typed booking request, built at the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub customer_id: String,
    pub span: Span,
    pub add_on_ids: Vec<Ulid>,
}

/// Output of the pricing calculator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub days: u32,
    pub base_cost: Money,
    pub add_ons_total: Money,
    pub deposit: Money,
    pub total: Money,
    pub add_on_ids: Vec<Ulid>,
}

/// Fleet search filter. `window` restricts results to vehicles bookable for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleFilter {
    pub category: Option<String>,
    pub max_price_per_day: Option<Money>,
    pub window: Option<Span>,
}

/// One occupied interval in a vehicle's availability index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookedInterval {
    pub reservation_id: Ulid,
    pub span: Span,
}

/// Per-vehicle booked intervals, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityIndex {
    pub intervals: Vec<BookedInterval>,
}

impl AvailabilityIndex {
    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: BookedInterval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookedInterval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

/// Everything the engine knows about one vehicle. Guarded by a single lock.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    pub reservations: HashMap<Ulid, Reservation>,
    /// Derived from `reservations`; see `AvailabilityIndex::rebuild`.
    pub index: AvailabilityIndex,
    /// Append-only, in commit order.
    pub history: Vec<HistoryRecord>,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            reservations: HashMap::new(),
            index: AvailabilityIndex::default(),
            history: Vec::new(),
        }
    }

    pub fn history_for(&self, reservation_id: Ulid) -> impl Iterator<Item = &HistoryRecord> {
        self.history
            .iter()
            .filter(move |r| r.reservation_id == reservation_id)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        vehicle: Vehicle,
    },
    VehicleRemoved {
        id: Ulid,
    },
    AddOnRegistered {
        add_on: AddOn,
    },
    AddOnRemoved {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
        record: HistoryRecord,
    },
    ReservationTransitioned {
        id: Ulid,
        vehicle_id: Ulid,
        status: ReservationStatus,
        record: HistoryRecord,
    },
}

impl Event {
    /// Vehicle whose state the event touches, if any.
    pub fn vehicle_id(&self) -> Option<Ulid> {
        match self {
            Event::VehicleRegistered { vehicle } => Some(vehicle.id),
            Event::VehicleRemoved { id } => Some(*id),
            Event::ReservationCreated { reservation, .. } => Some(reservation.vehicle_id),
            Event::ReservationTransitioned { vehicle_id, .. } => Some(*vehicle_id),
            Event::AddOnRegistered { .. } | Event::AddOnRemoved { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booked(start: Ms, end: Ms) -> BookedInterval {
        BookedInterval {
            reservation_id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_checked_rejects_empty_and_inverted() {
        assert_eq!(Span::checked(100, 200), Some(Span::new(100, 200)));
        assert_eq!(Span::checked(100, 100), None);
        assert_eq!(Span::checked(200, 100), None);
    }

    #[test]
    fn duration_saturates_on_extreme_bounds() {
        let wide = Span { start: -i64::MAX, end: i64::MAX };
        assert_eq!(wide.duration_ms(), i64::MAX);
        assert_eq!(Span::new(100, 250).duration_ms(), 150);
    }

    #[test]
    fn money_display_and_checked_math() {
        assert_eq!(Money::from_cents(42_550).to_string(), "425.50");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
        assert_eq!(Money::from_units(100).cents(), 10_000);
        assert_eq!(Money::from_cents(i64::MAX).checked_add(Money::from_cents(1)), None);
        assert_eq!(Money::from_cents(i64::MAX).checked_mul(2), None);
    }

    #[test]
    fn status_transition_table() {
        use ReservationStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Active));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Active.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Cancelled));
        for terminal in [Completed, Cancelled] {
            for next in [Pending, Confirmed, Active, Completed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn holding_statuses() {
        use ReservationStatus::*;
        assert!(Pending.holds_vehicle());
        assert!(Confirmed.holds_vehicle());
        assert!(Active.holds_vehicle());
        assert!(!Completed.holds_vehicle());
        assert!(!Cancelled.holds_vehicle());
    }

    #[test]
    fn expired_records_cancel() {
        assert_eq!(HistoryAction::Expired.resulting_status(), ReservationStatus::Cancelled);
        assert_eq!(HistoryAction::Activated.resulting_status(), ReservationStatus::Active);
    }

    #[test]
    fn index_keeps_start_order() {
        let mut index = AvailabilityIndex::default();
        index.insert_interval(booked(300, 400));
        index.insert_interval(booked(100, 200));
        index.insert_interval(booked(200, 300));
        let starts: Vec<Ms> = index.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut index = AvailabilityIndex::default();
        index.insert_interval(booked(100, 200));
        index.insert_interval(booked(450, 600));
        index.insert_interval(booked(1000, 1100));

        let hits: Vec<_> = index.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut index = AvailabilityIndex::default();
        index.insert_interval(booked(100, 200));
        assert_eq!(index.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(index.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(index.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::VehicleRegistered {
            vehicle: Vehicle {
                id: Ulid::new(),
                name: "Huracán EVO".into(),
                category: "exotic".into(),
                price_per_day: Money::from_units(1_200),
                deposit: Money::from_units(5_000),
                available: true,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
