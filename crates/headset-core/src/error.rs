//! Error types for headset-core.
//!
//! This module defines every error the protocol engine reports, whether on
//! the control channel as an AT `ERROR`, to a control-surface caller, or to
//! the waiters of a pending connection attempt.
//!
//! # Error Handling Policy
//!
//! | Error Type | Raised by | Outcome |
//! |------------|-----------|---------|
//! | [`Error::ProtocolOverflow`] | line framer | Session forced to Disconnected |
//! | [`Error::UnrecognizedCommand`] | interpreter | `ERROR` sent, session stays up |
//! | [`Error::MalformedArgument`] | interpreter | `ERROR` sent, no state change |
//! | [`Error::InvalidArgument`] | interpreter, control surface | `ERROR` sent / returned, no state change |
//! | [`Error::TransportFailure`] | coordinator | Every waiter and caller notified, session regresses |
//! | [`Error::NotSupported`] | coordinator | Discovery found no usable record, session Disconnected |
//! | [`Error::NotConnected`], [`Error::AlreadyInProgress`], [`Error::AlreadyConnected`], [`Error::NotAvailable`], [`Error::NotReady`] | control surface | Returned synchronously, no state change |
//! | [`Error::ResourceExhausted`] | event buffer | Logged, the event is dropped |
//!
//! Transport and framer failures always force a state transition and are
//! reported to every interested party exactly once.

use std::time::Duration;

use thiserror::Error;

use headset_types::{DeviceAddress, ParseError};

/// Asynchronous connection stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Service record lookup.
    Discovery,
    /// RFCOMM control channel connect.
    Control,
    /// SCO audio channel connect.
    Audio,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Discovery => write!(f, "service discovery"),
            Stage::Control => write!(f, "control channel connect"),
            Stage::Audio => write!(f, "audio channel connect"),
        }
    }
}

/// Failure reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("connection refused")]
    Refused,
    #[error("host is down")]
    HostDown,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

/// Failure reported by the telephony collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TelephonyError {
    #[error("no call to act on")]
    NoCall,
    #[error("request rejected by the network")]
    Rejected,
    #[error("operation not supported by the telephony backend")]
    NotSupported,
    #[error("{0}")]
    Other(String),
}

/// Errors that can occur in the audio gateway.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A command line exceeded the input buffer.
    #[error("Input buffer overflow: line exceeds {capacity} bytes")]
    ProtocolOverflow { capacity: usize },

    /// No command table entry matches the line.
    #[error("Unrecognized command: {0}")]
    UnrecognizedCommand(String),

    /// The command's arguments could not be parsed.
    #[error("Malformed argument to {command}: {reason}")]
    MalformedArgument {
        command: &'static str,
        reason: String,
    },

    /// An asynchronous connection stage failed.
    #[error("Connection attempt failed during {stage}: {source}")]
    TransportFailure {
        stage: Stage,
        #[source]
        source: TransportError,
    },

    /// The remote device offers no usable headset service.
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("Connection already in progress")]
    AlreadyInProgress,

    #[error("Device already connected")]
    AlreadyConnected,

    #[error("Operation not available")]
    NotAvailable,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The telephony backend has not signalled readiness yet.
    #[error("Telephony subsystem not ready")]
    NotReady,

    #[error("Event buffer full ({capacity} events)")]
    ResourceExhausted { capacity: usize },

    /// A call notification is already active.
    #[error("Device busy")]
    Busy,

    /// The pending operation was abandoned before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unknown device: {0}")]
    DeviceNotFound(DeviceAddress),

    /// Telephony indication with no active device to deliver it to.
    #[error("No active headset")]
    NoActiveDevice,

    #[error("Telephony request failed: {0}")]
    Telephony(#[from] TelephonyError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a malformed-argument error.
    pub fn malformed(command: &'static str, reason: impl Into<String>) -> Self {
        Error::MalformedArgument {
            command,
            reason: reason.into(),
        }
    }

    /// Create a transport failure for `stage`.
    pub fn transport(stage: Stage, source: TransportError) -> Self {
        Error::TransportFailure { stage, source }
    }

    /// Whether this error is answered with `ERROR` on the control channel
    /// rather than being treated as a session failure.
    #[must_use]
    pub fn is_wire_error(&self) -> bool {
        matches!(
            self,
            Error::UnrecognizedCommand(_)
                | Error::MalformedArgument { .. }
                | Error::InvalidArgument(_)
                | Error::Telephony(_)
                | Error::Parse(_)
        )
    }
}

/// Result type alias using headset-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type returned by [`Telephony`](crate::Telephony) backends.
pub type TelephonyResult<T> = std::result::Result<T, TelephonyError>;
