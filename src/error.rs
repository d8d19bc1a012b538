//! Driver-wide error kinds and the host status-code mapping.
//!
//! Everything below the host ABI fails with a [`DriverError`]; the shim layer
//! converts each kind to the host's integer status just before the call
//! returns. No partial state changes escape a failed mutator, so a non-zero
//! status always describes a no-op.

use thiserror::Error;

/// Status code returned across the host ABI.
pub type OsStatus = i32;

const fn fourcc(code: &[u8; 4]) -> OsStatus {
    u32::from_be_bytes(*code) as i32
}

/// The call succeeded.
pub const STATUS_OK: OsStatus = 0;
/// The referenced audio object id is unknown (`!obj`).
pub const STATUS_BAD_OBJECT: OsStatus = fourcc(b"!obj");
/// The property selector is unknown to the addressed object (`who?`).
pub const STATUS_BAD_PROPERTY: OsStatus = fourcc(b"who?");
/// The caller's property buffer is too small (`!siz`).
pub const STATUS_BAD_PROPERTY_SIZE: OsStatus = fourcc(b"!siz");
/// A precondition was violated (`nope`).
pub const STATUS_ILLEGAL_OPERATION: OsStatus = fourcc(b"nope");
/// The requested stream format or sample rate is out of range (`!dat`).
pub const STATUS_UNSUPPORTED_FORMAT: OsStatus = fourcc(b"!dat");
/// The operation is not implemented by this driver (`unop`).
pub const STATUS_UNSUPPORTED: OsStatus = fourcc(b"unop");
/// Catch-all for everything else (`what`).
pub const STATUS_UNSPECIFIED: OsStatus = fourcc(b"what");

/// Error enumeration surfaced across the driver surface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Referenced audio object id is unknown.
    #[error("unknown audio object id: {0}")]
    BadObject(u32),
    /// Property selector is not implemented by the addressed object.
    #[error("unknown property selector")]
    BadProperty,
    /// Caller-provided property buffer cannot hold the value.
    #[error("property buffer too small")]
    BadPropertySize,
    /// Sample rate or stream format outside the supported range.
    #[error("unsupported sample rate: {0}")]
    UnsupportedFormat(f64),
    /// Operation precondition violated.
    #[error("illegal operation: {0}")]
    IllegalOperation(&'static str),
    /// Client id unknown, or already registered when adding.
    #[error("invalid client id: {0}")]
    InvalidClient(u32),
    /// The driver's fixed object graph cannot grow or shrink.
    #[error("operation not supported")]
    Unsupported,
    /// Anything else.
    #[error("unspecified driver error")]
    Unspecified,
}

impl DriverError {
    /// Map this error to the host's integer status code.
    pub fn status(&self) -> OsStatus {
        match self {
            DriverError::BadObject(_) => STATUS_BAD_OBJECT,
            DriverError::BadProperty => STATUS_BAD_PROPERTY,
            DriverError::BadPropertySize => STATUS_BAD_PROPERTY_SIZE,
            DriverError::UnsupportedFormat(_) => STATUS_UNSUPPORTED_FORMAT,
            // InvalidClient escaping to the host means a sync client task
            // failed its precondition.
            DriverError::IllegalOperation(_) | DriverError::InvalidClient(_) => {
                STATUS_ILLEGAL_OPERATION
            }
            DriverError::Unsupported => STATUS_UNSUPPORTED,
            DriverError::Unspecified => STATUS_UNSPECIFIED,
        }
    }
}

/// Convert a fallible core call into the host's status convention.
pub fn status_from<T>(result: Result<T, DriverError>) -> OsStatus {
    match result {
        Ok(_) => STATUS_OK,
        Err(err) => err.status(),
    }
}
