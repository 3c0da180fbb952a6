use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Build a span from caller input, rejecting empty and inverted ranges.
pub fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    Span::checked(start, end).ok_or(EngineError::InvalidDateRange { start, end })
}

/// Validate a rental range before anything is mutated.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidDateRange {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_RENTAL_DURATION_MS {
        return Err(EngineError::LimitExceeded("rental too long"));
    }
    Ok(())
}

pub(crate) fn validate_query_window(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidDateRange {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_vehicle(vehicle: &Vehicle) -> Result<(), EngineError> {
    if vehicle.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("vehicle name too long"));
    }
    if vehicle.category.len() > MAX_CATEGORY_LEN {
        return Err(EngineError::LimitExceeded("category too long"));
    }
    if vehicle.price_per_day.is_negative() || vehicle.deposit.is_negative() {
        return Err(EngineError::LimitExceeded("negative price"));
    }
    Ok(())
}

pub(crate) fn validate_request(req: &NewReservation) -> Result<(), EngineError> {
    validate_span(&req.span)?;
    if req.customer_id.is_empty() || req.customer_id.len() > MAX_CUSTOMER_ID_LEN {
        return Err(EngineError::LimitExceeded("customer id must be 1-128 bytes"));
    }
    if req.add_on_ids.len() > MAX_ADD_ONS_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("too many add-ons"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAN_1: Ms = 1_735_689_600_000;

    #[test]
    fn inverted_and_empty_ranges_are_invalid() {
        assert!(matches!(
            checked_span(JAN_1, JAN_1),
            Err(EngineError::InvalidDateRange { .. })
        ));
        assert!(matches!(
            validate_span(&Span { start: JAN_1 + DAY_MS, end: JAN_1 }),
            Err(EngineError::InvalidDateRange { .. })
        ));
        assert!(validate_span(&Span::new(JAN_1, JAN_1 + DAY_MS)).is_ok());
    }

    #[test]
    fn out_of_range_timestamps() {
        assert!(matches!(
            validate_span(&Span::new(0, 1000)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(&Span::new(JAN_1, JAN_1 + 400 * DAY_MS)),
            Err(EngineError::LimitExceeded("rental too long"))
        ));
    }

    #[test]
    fn query_window_bounds_timestamps_before_measuring() {
        let extreme = Span { start: -i64::MAX, end: i64::MAX };
        assert!(matches!(
            validate_query_window(&extreme),
            Err(EngineError::LimitExceeded("timestamp out of range"))
        ));
        assert!(matches!(
            validate_query_window(&Span::new(JAN_1, JAN_1 + 4 * 366 * DAY_MS)),
            Err(EngineError::LimitExceeded("query window too wide"))
        ));
        assert!(validate_query_window(&Span::new(JAN_1, JAN_1 + 30 * DAY_MS)).is_ok());
    }
}
