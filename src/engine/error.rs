use crate::model::TripDateKey;

/// Broad class of a failure, used to pick the client-facing error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is malformed; retrying it unchanged cannot help.
    Validation,
    /// The request lost against current seat state.
    Conflict,
    /// Try again: the key was busy.
    Transient,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    /// Seat codes not present in the template.
    UnknownSeats(Vec<String>),
    AlreadyBooked(Vec<String>),
    /// Held by a live hold (of anyone) at hold time.
    AlreadyHeld(Vec<String>),
    /// Confirm found fewer live holds than requested seats.
    HoldMissing {
        held: Vec<String>,
        requested: Vec<String>,
    },
    AlreadyExists(String),
    LockTimeout(TripDateKey),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::UnknownSeats(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::AlreadyBooked(_)
            | EngineError::AlreadyHeld(_)
            | EngineError::HoldMissing { .. }
            | EngineError::AlreadyExists(_) => ErrorKind::Conflict,
            EngineError::LockTimeout(_) => ErrorKind::Transient,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Seats the error is about, for clients that render per-seat feedback.
    pub fn seats(&self) -> &[String] {
        match self {
            EngineError::UnknownSeats(s)
            | EngineError::AlreadyBooked(s)
            | EngineError::AlreadyHeld(s) => s,
            EngineError::HoldMissing { requested, .. } => requested,
            _ => &[],
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::UnknownSeats(seats) => {
                write!(f, "invalid seat code: {}", seats.join(","))
            }
            EngineError::AlreadyBooked(seats) => {
                write!(f, "some seats are already booked: {}", seats.join(","))
            }
            EngineError::AlreadyHeld(seats) => {
                write!(f, "some seats are being held: {}", seats.join(","))
            }
            EngineError::HoldMissing { held, requested } => write!(
                f,
                "hold missing or expired for some seats: held=[{}] requested=[{}]",
                held.join(","),
                requested.join(",")
            ),
            EngineError::AlreadyExists(code) => write!(f, "already exists: {code}"),
            EngineError::LockTimeout(key) => {
                write!(f, "timed out waiting for {key}, try again")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
