//! # LSI Correlator Driver
//!
//! Device-integration layer for an LSI photon-correlation spectrometer. The crate owns the
//! connection to the correlator, sequences configure/start/poll/stop against it, turns the
//! device's correlation and count-rate data into process-variable values, and recovers from
//! communication failures without leaving the control system in a torn state.
//!
//! ## Crate Structure
//!
//! - **`transport`**: The `Transport` trait and `TransportHandle`, plus the TCP
//!   implementation. All network I/O lives here.
//! - **`simulation`**: `SimulatedCorrelator`, an in-process transport speaking the same
//!   protocol, with fault injection for tests.
//! - **`protocol`**: Encoding and decoding of the correlator's line protocol.
//! - **`facade`**: `CommandFacade`, one method per device operation, mapping replies onto
//!   the error taxonomy. Stateless, no retries.
//! - **`acquisition`**: `AcquisitionMachine`, the state machine that owns configuration,
//!   state and results and serializes every device exchange.
//! - **`polling`**: Background task refreshing the machine while an acquisition runs.
//! - **`pv`**: Process-variable adapter with non-blocking reads and writes.
//! - **`storage`**: Data files in the correlator's native text layout.
//! - **`types`**: Acquisition parameters, states and results.
//! - **`config`**: Figment-based settings (`config/correlator.toml` + `LSICORR_*`).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: `CorrelatorError` and its stable `ErrorKind` classification.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lsi_correlator::acquisition::{AcquisitionMachine, MachineOptions};
//! use lsi_correlator::polling::PollingLoop;
//! use lsi_correlator::simulation::SimulatedCorrelator;
//!
//! # async fn demo() -> lsi_correlator::error::CorrelatorResult<()> {
//! let machine = Arc::new(AcquisitionMachine::new(
//!     Box::new(SimulatedCorrelator::new().with_time_scale(0.01)),
//!     MachineOptions::default(),
//! ));
//! machine.connect().await?;
//! let polling = PollingLoop::new(Arc::clone(&machine), Duration::from_millis(500)).spawn();
//! machine.start().await?;
//! // ... read machine.snapshot() ...
//! polling.shutdown().await;
//! machine.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod facade;
pub mod logging;
pub mod polling;
pub mod protocol;
pub mod pv;
pub mod simulation;
pub mod storage;
pub mod transport;
pub mod types;

pub use acquisition::{AcquisitionMachine, MachineOptions, RefreshOutcome, Snapshot};
pub use error::{CorrelatorError, CorrelatorResult, ErrorKind};
pub use types::{AcquisitionConfig, AcquisitionState, CorrelationResult};
