use ulid::Ulid;

use crate::model::{Ms, ReservationStatus};

#[derive(Debug)]
pub enum EngineError {
    /// The requested dates overlap a live reservation on the same vehicle.
    DateRangeConflict {
        vehicle_id: Ulid,
        reservation_id: Ulid,
    },
    InvalidDateRange {
        start: Ms,
        end: Ms,
    },
    /// Fleet-level flag is off.
    VehicleUnavailable(Ulid),
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    VehicleNotFound(Ulid),
    ReservationNotFound(Ulid),
    AddOnNotFound(Ulid),
    AlreadyExists(Ulid),
    VehicleHasReservations(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::VehicleNotFound(_)
                | EngineError::ReservationNotFound(_)
                | EngineError::AddOnNotFound(_)
        )
    }

    /// HTTP-equivalent status for gateways fronting the engine.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::DateRangeConflict { .. }
            | EngineError::VehicleUnavailable(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::VehicleHasReservations(_) => 409,
            EngineError::VehicleNotFound(_)
            | EngineError::ReservationNotFound(_)
            | EngineError::AddOnNotFound(_) => 404,
            EngineError::InvalidDateRange { .. } | EngineError::LimitExceeded(_) => 422,
            EngineError::WalError(_) => 500,
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::DateRangeConflict { .. } => "23P01",
            EngineError::InvalidDateRange { .. } => "22023",
            EngineError::VehicleUnavailable(_) | EngineError::InvalidTransition { .. } => "55000",
            EngineError::VehicleNotFound(_)
            | EngineError::ReservationNotFound(_)
            | EngineError::AddOnNotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::VehicleHasReservations(_) => "23503",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::DateRangeConflict { vehicle_id, reservation_id } => write!(
                f,
                "those dates are already booked for vehicle {vehicle_id} (reservation {reservation_id})"
            ),
            EngineError::InvalidDateRange { start, end } => {
                write!(f, "invalid date range: start {start} must be before end {end}")
            }
            EngineError::VehicleUnavailable(id) => {
                write!(f, "vehicle {id} is not available for booking")
            }
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id} cannot move from {from} to {to}")
            }
            EngineError::VehicleNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AddOnNotFound(id) => write!(f, "add-on not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::VehicleHasReservations(id) => {
                write!(f, "cannot remove vehicle {id}: it has reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
