use ulid::Ulid;

use crate::model::*;

// ── Availability Index ────────────────────────────────────────────

impl AvailabilityIndex {
    /// First live booking overlapping `span`, if any.
    pub fn conflicting(&self, span: &Span) -> Option<&BookedInterval> {
        self.overlapping(span).next()
    }

    pub fn is_available(&self, span: &Span) -> bool {
        self.conflicting(span).is_none()
    }

    /// Check-and-insert. The caller holds the vehicle's write lock, which
    /// makes this a single step for every other request on the vehicle.
    pub fn reserve(&mut self, reservation_id: Ulid, span: Span) -> Result<(), BookedInterval> {
        if let Some(existing) = self.conflicting(&span) {
            return Err(*existing);
        }
        self.insert_interval(BookedInterval { reservation_id, span });
        Ok(())
    }

    /// Drop the booking occupying exactly `span`. Live bookings never
    /// overlap, so at most one entry matches.
    pub fn release(&mut self, span: &Span) -> Option<BookedInterval> {
        let pos = self.intervals.iter().position(|i| i.span == *span)?;
        Some(self.intervals.remove(pos))
    }

    /// Recompute the index from reservation records. Only statuses that
    /// occupy the vehicle contribute.
    pub fn rebuild<'a>(reservations: impl IntoIterator<Item = &'a Reservation>) -> Self {
        let mut intervals: Vec<BookedInterval> = reservations
            .into_iter()
            .filter(|r| r.status.holds_vehicle())
            .map(|r| BookedInterval {
                reservation_id: r.id,
                span: r.span,
            })
            .collect();
        intervals.sort_by_key(|i| (i.span.start, i.reservation_id));
        Self { intervals }
    }

    /// Bookable sub-spans of `window`.
    pub fn free_windows(&self, window: &Span) -> Vec<Span> {
        let booked: Vec<Span> = self.overlapping(window).map(|i| i.span).collect();
        subtract_intervals(&[*window], &booked)
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `base` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DAY_MS;

    const JAN_1: Ms = 1_735_689_600_000;

    fn jan(day: i64) -> Ms {
        JAN_1 + (day - 1) * DAY_MS
    }

    fn reservation(span: Span, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            vehicle_id: Ulid::new(),
            customer_id: "c-1".into(),
            span,
            status,
            days: 1,
            base_cost: Money::ZERO,
            add_ons_total: Money::ZERO,
            deposit_amount: Money::ZERO,
            total: Money::ZERO,
            add_on_ids: Vec::new(),
            requested_add_on_ids: Vec::new(),
            created_at: JAN_1,
        }
    }

    #[test]
    fn reserve_rejects_overlap_but_allows_back_to_back() {
        let mut index = AvailabilityIndex::default();
        let first = Ulid::new();
        index.reserve(first, Span::new(jan(1), jan(3))).unwrap();

        let err = index.reserve(Ulid::new(), Span::new(jan(2), jan(4))).unwrap_err();
        assert_eq!(err.reservation_id, first);

        index.reserve(Ulid::new(), Span::new(jan(3), jan(5))).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn enclosing_and_enclosed_ranges_conflict() {
        let mut index = AvailabilityIndex::default();
        index.reserve(Ulid::new(), Span::new(jan(5), jan(10))).unwrap();
        assert!(!index.is_available(&Span::new(jan(1), jan(20))));
        assert!(!index.is_available(&Span::new(jan(6), jan(7))));
        assert!(index.is_available(&Span::new(jan(1), jan(5))));
        assert!(index.is_available(&Span::new(jan(10), jan(11))));
    }

    #[test]
    fn release_frees_exact_interval() {
        let mut index = AvailabilityIndex::default();
        let span = Span::new(jan(1), jan(3));
        index.reserve(Ulid::new(), span).unwrap();
        assert!(index.release(&Span::new(jan(1), jan(2))).is_none());
        assert!(index.release(&span).is_some());
        assert!(index.is_empty());
        index.reserve(Ulid::new(), span).unwrap();
    }

    #[test]
    fn rebuild_skips_terminal_reservations() {
        let live = reservation(Span::new(jan(5), jan(6)), ReservationStatus::Confirmed);
        let pending = reservation(Span::new(jan(1), jan(2)), ReservationStatus::Pending);
        let cancelled = reservation(Span::new(jan(3), jan(4)), ReservationStatus::Cancelled);
        let completed = reservation(Span::new(jan(3), jan(4)), ReservationStatus::Completed);

        let index = AvailabilityIndex::rebuild([&live, &cancelled, &pending, &completed]);
        let ids: Vec<Ulid> = index.intervals.iter().map(|i| i.reservation_id).collect();
        assert_eq!(ids, vec![pending.id, live.id]);
    }

    #[test]
    fn free_windows_fragment_around_bookings() {
        let mut index = AvailabilityIndex::default();
        index.reserve(Ulid::new(), Span::new(jan(3), jan(5))).unwrap();
        index.reserve(Ulid::new(), Span::new(jan(8), jan(9))).unwrap();

        let free = index.free_windows(&Span::new(jan(1), jan(10)));
        assert_eq!(
            free,
            vec![
                Span::new(jan(1), jan(3)),
                Span::new(jan(5), jan(8)),
                Span::new(jan(9), jan(10)),
            ]
        );
    }

    #[test]
    fn free_windows_fully_booked() {
        let mut index = AvailabilityIndex::default();
        index.reserve(Ulid::new(), Span::new(jan(1), jan(10))).unwrap();
        assert!(index.free_windows(&Span::new(jan(2), jan(3))).is_empty());
    }

    #[test]
    fn merge_adjacent_and_overlapping() {
        let merged = merge_overlapping(&[
            Span::new(0, 10),
            Span::new(10, 20),
            Span::new(15, 30),
            Span::new(40, 50),
        ]);
        assert_eq!(merged, vec![Span::new(0, 30), Span::new(40, 50)]);
        assert!(merge_overlapping(&[]).is_empty());
    }

    #[test]
    fn subtract_edge_cases() {
        assert!(subtract_intervals(&[], &[Span::new(0, 10)]).is_empty());
        assert_eq!(
            subtract_intervals(&[Span::new(0, 10)], &[]),
            vec![Span::new(0, 10)]
        );
    }
}
