//! Instrument transport.
//!
//! The only place in the crate that performs raw I/O towards the correlator. A transport
//! owns at most one live link at a time and hands out a [`TransportHandle`] naming it.
//! Other components hold the handle by reference and pass it back on every call; once the
//! link breaks, closes or is replaced, the old handle is rejected.
//!
//! # Contract
//!
//! - `connect` opens the link and performs the identity handshake within the timeout,
//!   failing with [`CorrelatorError::Connect`]
//! - `send` writes one request line and waits for one reply line, failing with
//!   [`CorrelatorError::Timeout`] or [`CorrelatorError::Transport`]; both invalidate the
//!   handle because a late reply would desynchronise the line framing
//! - `close` is idempotent and never fails
//!
//! Two implementations ship with the crate: [`TcpTransport`] for the real instrument and
//! [`SimulatedCorrelator`](crate::simulation::SimulatedCorrelator) for simulation mode and
//! tests.

pub mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::CorrelatorResult;

/// Token naming one open link.
///
/// Deliberately not `Clone`: the state machine owns the single handle and gives it back to
/// the transport on close.
#[derive(Debug, PartialEq, Eq)]
pub struct TransportHandle {
    session: Uuid,
    address: String,
    identity: String,
}

impl TransportHandle {
    /// Create a handle for a freshly opened link.
    pub fn new(address: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            session: Uuid::new_v4(),
            address: address.into(),
            identity: identity.into(),
        }
    }

    /// Unique id of the link.
    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Identity string reported by the device during the handshake.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.session)
    }
}

/// Request/response channel to the correlator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link and perform the handshake.
    ///
    /// Any previously open link is closed first.
    async fn connect(&mut self, address: &str, timeout: Duration)
        -> CorrelatorResult<TransportHandle>;

    /// Send one request line and return the reply line without terminator.
    async fn send(
        &mut self,
        handle: &TransportHandle,
        request: &str,
        timeout: Duration,
    ) -> CorrelatorResult<String>;

    /// Release the link named by `handle`. Closing a stale handle is a no-op.
    async fn close(&mut self, handle: TransportHandle);

    /// Whether `handle` names the currently open link.
    fn is_open(&self, handle: &TransportHandle) -> bool;
}
