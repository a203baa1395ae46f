//! Domain-specific error types following the panic-free policy.

use thiserror::Error;

/// Errors raised when a client-supplied value cannot be mapped onto the
/// node's VM representation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// The value's type has no VM mapping at all (strings, maps).
    #[error("value of type {0} cannot be mapped to a VM type")]
    Unsupported(&'static str),

    /// An integer (or a float with an integral value) outside the VM
    /// word range.
    #[error("value {0} is out of the VM word range")]
    OutOfRange(i64),

    /// A float with a fractional part; VM variables are integer words.
    #[error("value {0} is not an integral number")]
    NotIntegral(f64),

    /// A malformed event description (empty name, duplicate, oversized).
    #[error("invalid event description: {0}")]
    InvalidEvent(String),

    /// An emitted event does not match the registered description.
    #[error("event {name}: expected {expected} words, got {got}")]
    EventSizeMismatch {
        name: String,
        expected: u32,
        got: u32,
    },

    /// An emitted event was never registered.
    #[error("event {0} is not registered")]
    UnknownEvent(String),
}
