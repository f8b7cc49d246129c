//! Domain-specific error types for the virtual circuit.
//!
//! All fallible operations return `Result<T, CircuitError>`.
//! Staging-level errors surface to the caller; syscall-level errors are
//! translated near the syscall site; protocol-level errors cause a state
//! transition rather than propagating past the engine boundary.

use thiserror::Error;

/// The canonical error type for the circuit core.
#[derive(Debug, Error)]
pub enum CircuitError {
    // ── Staging errors ───────────────────────────────────────────
    /// A request was staged against a channel that is not connected.
    #[error("channel is not connected")]
    NotConnected,

    /// The negotiated protocol revision is too old for this operation.
    #[error("operation unsupported by the connected service")]
    UnsupportedByService,

    /// The requested data type is not a known value class.
    #[error("invalid data type")]
    BadType,

    /// The requested element count exceeds the channel's native count.
    #[error("element count out of bounds")]
    OutOfBounds,

    /// The reply would not fit the configured message body cache.
    #[error("request too large for the message body cache")]
    MsgBodyCacheTooSmall,

    // ── Protocol errors ──────────────────────────────────────────
    /// The peer violated the framing rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u32 },

    // ── Connection errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}
