use std::collections::HashSet;
use std::str::FromStr;

use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::DAY_MS;
use crate::model::*;

/// What to do with add-on ids that are not in the catalog at quote time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddOnPolicy {
    /// Ignore them; the reservation is priced without them.
    #[default]
    Drop,
    /// Fail the request with `NotFound`.
    Reject,
}

impl FromStr for AddOnPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(AddOnPolicy::Drop),
            "reject" => Ok(AddOnPolicy::Reject),
            other => Err(format!("unknown add-on policy: {other} (expected drop or reject)")),
        }
    }
}

/// Billable days: started days count in full, never fewer than one.
pub fn rental_days(span: &Span) -> Result<u32, EngineError> {
    let raw = span.duration_ms();
    let days = (raw + DAY_MS - 1) / DAY_MS;
    u32::try_from(days.max(1)).map_err(|_| EngineError::LimitExceeded("rental too long"))
}

/// Look up requested add-ons in the catalog, in request order.
/// Duplicate ids are charged once.
pub fn resolve_add_ons<F>(ids: &[Ulid], policy: AddOnPolicy, lookup: F) -> Result<Vec<AddOn>, EngineError>
where
    F: Fn(&Ulid) -> Option<AddOn>,
{
    let mut seen = HashSet::with_capacity(ids.len());
    let mut resolved = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(*id) {
            continue;
        }
        match lookup(id) {
            Some(add_on) => resolved.push(add_on),
            None if policy == AddOnPolicy::Reject => return Err(EngineError::AddOnNotFound(*id)),
            None => {}
        }
    }
    Ok(resolved)
}

/// Price a rental. Pure: same inputs, same quote.
pub fn quote(vehicle: &Vehicle, span: &Span, add_ons: &[AddOn]) -> Result<Quote, EngineError> {
    const OVERFLOW: EngineError = EngineError::LimitExceeded("price overflow");

    let days = rental_days(span)?;
    let base_cost = vehicle
        .price_per_day
        .checked_mul(i64::from(days))
        .ok_or(OVERFLOW)?;
    let add_ons_total = add_ons
        .iter()
        .try_fold(Money::ZERO, |acc, a| acc.checked_add(a.price))
        .ok_or(OVERFLOW)?;
    let deposit = vehicle.deposit;
    let total = base_cost
        .checked_add(add_ons_total)
        .and_then(|t| t.checked_add(deposit))
        .ok_or(OVERFLOW)?;

    Ok(Quote {
        days,
        base_cost,
        add_ons_total,
        deposit,
        total,
        add_on_ids: add_ons.iter().map(|a| a.id).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    // 2025-01-01T00:00:00Z
    const JAN_1: Ms = 1_735_689_600_000;

    fn vehicle_a() -> Vehicle {
        Vehicle {
            id: Ulid::new(),
            name: "Model A".into(),
            category: "sedan".into(),
            price_per_day: Money::from_units(100),
            deposit: Money::from_units(200),
            available: true,
        }
    }

    fn add_on(price: i64) -> AddOn {
        AddOn {
            id: Ulid::new(),
            name: "extra".into(),
            price: Money::from_units(price),
        }
    }

    #[test]
    fn two_day_rental_with_one_add_on() {
        let gps = add_on(25);
        let q = quote(&vehicle_a(), &Span::new(JAN_1, JAN_1 + 2 * DAY_MS), &[gps.clone()]).unwrap();
        assert_eq!(q.days, 2);
        assert_eq!(q.base_cost, Money::from_units(200));
        assert_eq!(q.add_ons_total, Money::from_units(25));
        assert_eq!(q.deposit, Money::from_units(200));
        assert_eq!(q.total, Money::from_units(425));
        assert_eq!(q.add_on_ids, vec![gps.id]);
    }

    #[test]
    fn same_day_return_bills_one_day() {
        let span = Span::new(JAN_1 + 9 * H, JAN_1 + 17 * H);
        assert_eq!(rental_days(&span).unwrap(), 1);
        assert_eq!(rental_days(&Span::new(JAN_1, JAN_1 + 1)).unwrap(), 1);
    }

    #[test]
    fn partial_day_rounds_up() {
        let span = Span::new(JAN_1, JAN_1 + 2 * DAY_MS + H);
        assert_eq!(rental_days(&span).unwrap(), 3);
        assert_eq!(rental_days(&Span::new(JAN_1, JAN_1 + DAY_MS)).unwrap(), 1);
    }

    #[test]
    fn deposit_is_flat() {
        let v = vehicle_a();
        let short = quote(&v, &Span::new(JAN_1, JAN_1 + DAY_MS), &[]).unwrap();
        let long = quote(&v, &Span::new(JAN_1, JAN_1 + 10 * DAY_MS), &[]).unwrap();
        assert_eq!(short.deposit, long.deposit);
        assert_eq!(long.base_cost, Money::from_units(1_000));
    }

    #[test]
    fn quote_is_deterministic() {
        let v = vehicle_a();
        let extras = vec![add_on(25), add_on(10)];
        let span = Span::new(JAN_1, JAN_1 + 3 * DAY_MS);
        let first = quote(&v, &span, &extras).unwrap();
        for _ in 0..10 {
            assert_eq!(quote(&v, &span, &extras).unwrap(), first);
        }
    }

    #[test]
    fn cents_do_not_drift() {
        let mut v = vehicle_a();
        v.price_per_day = Money::from_cents(1_999);
        v.deposit = Money::from_cents(1);
        let extras: Vec<AddOn> = (0..10)
            .map(|_| AddOn { id: Ulid::new(), name: "x".into(), price: Money::from_cents(10) })
            .collect();
        let q = quote(&v, &Span::new(JAN_1, JAN_1 + 3 * DAY_MS), &extras).unwrap();
        assert_eq!(q.total, Money::from_cents(1_999 * 3 + 100 + 1));
    }

    #[test]
    fn overflow_is_an_error() {
        let mut v = vehicle_a();
        v.price_per_day = Money::from_cents(i64::MAX / 2);
        let result = quote(&v, &Span::new(JAN_1, JAN_1 + 3 * DAY_MS), &[]);
        assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn resolve_drops_unknown_ids() {
        let gps = add_on(25);
        let catalog = vec![gps.clone()];
        let lookup = |id: &Ulid| catalog.iter().find(|a| a.id == *id).cloned();
        let resolved = resolve_add_ons(&[Ulid::new(), gps.id], AddOnPolicy::Drop, lookup).unwrap();
        assert_eq!(resolved, vec![gps]);
    }

    #[test]
    fn resolve_rejects_unknown_ids() {
        let missing = Ulid::new();
        let result = resolve_add_ons(&[missing], AddOnPolicy::Reject, |_| None);
        assert!(matches!(result, Err(EngineError::AddOnNotFound(id)) if id == missing));
    }

    #[test]
    fn resolve_charges_duplicates_once() {
        let seat = add_on(15);
        let catalog = vec![seat.clone()];
        let lookup = |id: &Ulid| catalog.iter().find(|a| a.id == *id).cloned();
        let resolved = resolve_add_ons(&[seat.id, seat.id], AddOnPolicy::Drop, lookup).unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("drop".parse::<AddOnPolicy>(), Ok(AddOnPolicy::Drop));
        assert_eq!(" REJECT ".parse::<AddOnPolicy>(), Ok(AddOnPolicy::Reject));
        assert!("ignore".parse::<AddOnPolicy>().is_err());
    }
}
