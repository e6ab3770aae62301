//! Custom error types for the correlator driver.
//!
//! This module defines the primary error type, `CorrelatorError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! failures from the instrument link, the device itself, and local validation.
//!
//! ## Error Hierarchy
//!
//! Errors fall into two layers that callers must be able to tell apart:
//!
//! 1. **Transport layer** - `Connect`, `Timeout`, `Transport`, `Protocol`
//!    - The session with the correlator can no longer be trusted
//!    - The state machine moves to `Error` and records the failure
//!    - Recovery: explicit `reset()` followed by `connect()`
//!
//! 2. **Operation layer** - `ConfigRejected`, `DeviceBusy`, `NoDataYet`, `InvalidState`,
//!    `StartCancelled`, `Validation`
//!    - The request was refused, the session is intact
//!    - State is left as it was before the request
//!    - Recovery: try different parameters or wait for the right state
//!
//! Startup failures (`Config`, `Io`) are outside the acquisition flow.
//!
//! [`CorrelatorError::kind`] reduces any error to a copyable [`ErrorKind`] which is what
//! gets stored in the error record and shown to process-variable clients.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::AcquisitionState;

/// Convenience alias for results using the crate error type.
pub type CorrelatorResult<T> = std::result::Result<T, CorrelatorError>;

/// Stable classification of a [`CorrelatorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Endpoint unreachable or handshake failed
    Connect,
    /// No reply within the command timeout
    Timeout,
    /// Channel broken or reply malformed
    Transport,
    /// Device refused the configuration
    ConfigRejected,
    /// Device or state machine is busy with an acquisition
    DeviceBusy,
    /// Device has not finished its first accumulation window
    NoDataYet,
    /// Operation not allowed in the current state
    StateConflict,
    /// A pending start was cancelled by `stop()`
    Cancelled,
    /// Parameter rejected before reaching the device
    Validation,
    /// Startup configuration problem
    Configuration,
    /// Local I/O failure (data files)
    Io,
}

impl ErrorKind {
    /// Whether this failure invalidates the device session.
    pub fn is_transport_fault(self) -> bool {
        matches!(
            self,
            ErrorKind::Connect | ErrorKind::Timeout | ErrorKind::Transport
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Connect => "connect",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transport => "transport",
            ErrorKind::ConfigRejected => "config_rejected",
            ErrorKind::DeviceBusy => "device_busy",
            ErrorKind::NoDataYet => "no_data_yet",
            ErrorKind::StateConflict => "state_conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Io => "io",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the correlator driver.
#[derive(Error, Debug)]
pub enum CorrelatorError {
    /// Could not open the instrument link.
    #[error("Failed to connect to {address}: {reason}")]
    Connect {
        /// Endpoint that was dialled
        address: String,
        /// What went wrong
        reason: String,
    },

    /// The device did not answer in time.
    #[error("Timeout after {timeout:?} waiting for reply to '{request}'")]
    Timeout {
        /// Request that went unanswered
        request: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The channel is broken; the handle is no longer usable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered with something that is not part of the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device refused the configuration. Carries the device text verbatim.
    #[error("Configuration rejected by device: {0}")]
    ConfigRejected(String),

    /// The device reported it is busy.
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// The first accumulation window has not completed.
    #[error("No correlation data available yet")]
    NoDataYet,

    /// The operation is not permitted in the current acquisition state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was refused
        operation: &'static str,
        /// State at the time of the request
        state: AcquisitionState,
    },

    /// A stop request cancelled the start that was in flight.
    #[error("Start cancelled by stop request")]
    StartCancelled,

    /// Parameter failed local validation.
    #[error("Invalid parameter: {0}")]
    Validation(String),

    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for CorrelatorError {
    fn from(value: figment::Error) -> Self {
        CorrelatorError::Config(Box::new(value))
    }
}

impl CorrelatorError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CorrelatorError::Connect { .. } => ErrorKind::Connect,
            CorrelatorError::Timeout { .. } => ErrorKind::Timeout,
            CorrelatorError::Transport(_) | CorrelatorError::Protocol(_) => ErrorKind::Transport,
            CorrelatorError::ConfigRejected(_) => ErrorKind::ConfigRejected,
            CorrelatorError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            CorrelatorError::NoDataYet => ErrorKind::NoDataYet,
            CorrelatorError::InvalidState { state, .. } if state.is_active() => {
                ErrorKind::DeviceBusy
            }
            CorrelatorError::InvalidState { .. } => ErrorKind::StateConflict,
            CorrelatorError::StartCancelled => ErrorKind::Cancelled,
            CorrelatorError::Validation(_) => ErrorKind::Validation,
            CorrelatorError::Config(_) | CorrelatorError::Configuration(_) => {
                ErrorKind::Configuration
            }
            CorrelatorError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether this error must move the state machine to `Error`.
    pub fn is_transport_fault(&self) -> bool {
        self.kind().is_transport_fault()
    }

    /// Whether the request was refused because of the acquisition state.
    ///
    /// Covers both plain conflicts (e.g. `start` while `Disconnected`) and the busy
    /// variant raised while an acquisition is active.
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, CorrelatorError::InvalidState { .. })
    }

    pub(crate) fn invalid_state(operation: &'static str, state: AcquisitionState) -> Self {
        CorrelatorError::InvalidState { operation, state }
    }
}
