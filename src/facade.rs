//! Instrument command facade.
//!
//! Turns the correlator operations into protocol exchanges over a [`Transport`] and maps
//! every device reply onto the crate error taxonomy:
//!
//! | Reply     | Result                                   |
//! |-----------|------------------------------------------|
//! | `OK`      | `Ok(())`                                 |
//! | `ERR t`   | `ConfigRejected(t)` for `CONF`, else `Transport` |
//! | `BUSY t`  | `DeviceBusy(t)`                          |
//! | `NODATA`  | `NoDataYet` (only for `DATA?`)           |
//! | other     | `Protocol`                               |
//!
//! The facade holds no state besides the command timeout and never retries; whether a
//! failure is worth another attempt is decided by the acquisition state machine.

use std::time::Duration;

use crate::error::{CorrelatorError, CorrelatorResult};
use crate::protocol::{DeviceSettings, Reply, Request};
use crate::transport::{Transport, TransportHandle};
use crate::types::{AcquisitionConfig, DeviceStatus, RawCorrelation};

/// Command set of the correlator.
#[derive(Debug, Clone, Copy)]
pub struct CommandFacade {
    command_timeout: Duration,
}

impl CommandFacade {
    /// Create a facade bounding every exchange by `command_timeout`.
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    /// Timeout applied to each exchange.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    async fn exchange(
        &self,
        transport: &mut dyn Transport,
        handle: &TransportHandle,
        request: &Request,
    ) -> CorrelatorResult<Reply> {
        let line = transport
            .send(handle, &request.encode(), self.command_timeout)
            .await?;
        Reply::parse(request, &line)
    }

    /// Push a full parameter set to the device.
    pub async fn apply_config(
        &self,
        transport: &mut dyn Transport,
        handle: &TransportHandle,
        config: &AcquisitionConfig,
    ) -> CorrelatorResult<()> {
        let request = Request::Configure(DeviceSettings::from(config));
        match self.exchange(transport, handle, &request).await? {
            Reply::Ok => Ok(()),
            Reply::Err(text) => Err(CorrelatorError::ConfigRejected(text)),
            Reply::Busy(text) => Err(CorrelatorError::DeviceBusy(text)),
            other => Err(unexpected(&request, other)),
        }
    }

    /// Begin a measurement window.
    pub async fn start_acquisition(
        &self,
        transport: &mut dyn Transport,
        handle: &TransportHandle,
    ) -> CorrelatorResult<()> {
        self.command(transport, handle, Request::Start).await
    }

    /// Abort the running measurement window.
    pub async fn stop_acquisition(
        &self,
        transport: &mut dyn Transport,
        handle: &TransportHandle,
    ) -> CorrelatorResult<()> {
        self.command(transport, handle, Request::Stop).await
    }

    /// Fetch the latest correlation arrays.
    ///
    /// Returns [`CorrelatorError::NoDataYet`] until the first accumulation window has
    /// completed.
    pub async fn query_result(
        &self,
        transport: &mut dyn Transport,
        handle: &TransportHandle,
    ) -> CorrelatorResult<RawCorrelation> {
        match self.exchange(transport, handle, &Request::Data).await? {
            Reply::Data(raw) => Ok(raw),
            Reply::NoData => Err(CorrelatorError::NoDataYet),
            Reply::Busy(text) => Err(CorrelatorError::DeviceBusy(text)),
            other => Err(unexpected(&Request::Data, other)),
        }
    }

    /// Fetch device activity, elapsed time and count rates.
    pub async fn query_status(
        &self,
        transport: &mut dyn Transport,
        handle: &TransportHandle,
    ) -> CorrelatorResult<DeviceStatus> {
        match self.exchange(transport, handle, &Request::Status).await? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(&Request::Status, other)),
        }
    }

    async fn command(
        &self,
        transport: &mut dyn Transport,
        handle: &TransportHandle,
        request: Request,
    ) -> CorrelatorResult<()> {
        match self.exchange(transport, handle, &request).await? {
            Reply::Ok => Ok(()),
            Reply::Busy(text) => Err(CorrelatorError::DeviceBusy(text)),
            Reply::Err(text) => Err(CorrelatorError::Transport(format!(
                "device refused '{}': {}",
                request.encode(),
                text
            ))),
            other => Err(unexpected(&request, other)),
        }
    }
}

fn unexpected(request: &Request, reply: Reply) -> CorrelatorError {
    CorrelatorError::Protocol(format!(
        "unexpected reply '{}' to '{}'",
        reply.encode(),
        request.encode()
    ))
}
