//! Acquisition state machine.
//!
//! [`AcquisitionMachine`] owns the transport, the current configuration and the acquisition
//! state, and is the only component that issues device commands. Two paths meet here:
//!
//! - **Mutations** (`connect`, `configure`, `start`, `stop`, `refresh`, `reset`,
//!   `disconnect`) are serialized through one async mutex, so a device exchange is never
//!   interleaved with another one. A caller may wait up to one command timeout for the lock.
//! - **Reads** go through a [`tokio::sync::watch`] channel holding the last published
//!   [`Snapshot`]. They never touch the mutex and never wait on the device.
//!
//! ## State transitions
//!
//! ```text
//! Disconnected --connect()--> Idle
//! Idle --configure(cfg)--> Idle
//! Idle --start()--> Starting --ack--> Running
//! Starting --busy/rejected--> Idle
//! Starting --device error/timeout--> Error
//! Running --refresh()--> Running
//! Running --last repetition complete--> Idle
//! Running --stop()--> Stopping --ack--> Idle
//! any --transport fault--> Error --reset()--> Disconnected
//! any --disconnect()--> Disconnected
//! ```
//!
//! Transport-layer failures close the handle and move to `Error`; nothing is retried until
//! `reset()` and `connect()` are called. The device keeps measuring when the link drops, so
//! `connect()` stops any window it finds open before reporting `Idle`. Operation-layer
//! failures (rejected configuration, busy device, no data yet) are returned to the caller
//! and leave the state as it was.
//!
//! Device and validation failures are kept in the snapshot's [`ErrorRecord`] until the next
//! successful operation. Calls refused for the current state and `NODATA` replies are
//! returned without touching the record.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::config::Settings;
use crate::error::{CorrelatorError, CorrelatorResult};
use crate::facade::CommandFacade;
use crate::simulation::SimulatedCorrelator;
use crate::storage::{DataFileWriter, ExperimentMetadata};
use crate::transport::{TcpTransport, Transport, TransportHandle};
use crate::types::{
    AcquisitionConfig, AcquisitionState, CorrelationResult, DeviceActivity, DeviceStatus,
    ErrorRecord, RawCorrelation,
};

/// Last published view of the machine.
///
/// Cloning is cheap: the configuration, metadata and result are shared behind `Arc`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Acquisition state
    pub state: AcquisitionState,
    /// Configuration last accepted by the device
    pub config: Arc<AcquisitionConfig>,
    /// Experiment description used for data files
    pub metadata: Arc<ExperimentMetadata>,
    /// Latest correlation result of the current run
    pub result: Option<Arc<CorrelationResult>>,
    /// Latest device status
    pub status: Option<DeviceStatus>,
    /// Last failure, cleared by the next successful operation
    pub last_error: Option<ErrorRecord>,
    /// Repetition (1-based) in progress, 0 before the first start
    pub current_repetition: u32,
    /// True while a device measurement window is open
    pub taking_data: bool,
    /// User data file written last
    pub output_file: Option<PathBuf>,
    /// Identity reported by the device on connect
    pub identity: Option<String>,
}

impl Snapshot {
    fn new(config: AcquisitionConfig, metadata: ExperimentMetadata) -> Self {
        Self {
            state: AcquisitionState::Disconnected,
            config: Arc::new(config),
            metadata: Arc::new(metadata),
            result: None,
            status: None,
            last_error: None,
            current_repetition: 0,
            taking_data: false,
            output_file: None,
            identity: None,
        }
    }
}

/// What a call to [`AcquisitionMachine::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Not running; nothing was sent to the device
    NotRunning,
    /// A new intermediate result was published
    Updated,
    /// Between repetitions; the next window has not been started yet
    Waiting,
    /// The pause is over and the given repetition was started
    RepetitionStarted(u32),
    /// A repetition finished, its final result was published and more remain
    RepetitionComplete(u32),
    /// The last repetition finished; the machine is back to `Idle`
    AcquisitionComplete,
}

/// Construction parameters for [`AcquisitionMachine`].
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Device endpoint passed to [`Transport::connect`]
    pub address: String,
    /// Bound on connect plus handshake
    pub connect_timeout: Duration,
    /// Bound on each device exchange
    pub command_timeout: Duration,
    /// Initial acquisition configuration
    pub config: AcquisitionConfig,
    /// Initial experiment metadata
    pub metadata: ExperimentMetadata,
    /// Where completed repetitions are saved, if anywhere
    pub storage: Option<DataFileWriter>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{}", crate::transport::tcp::DEFAULT_PORT),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            config: AcquisitionConfig::default(),
            metadata: ExperimentMetadata::default(),
            storage: None,
        }
    }
}

struct Inner {
    transport: Box<dyn Transport>,
    handle: Option<TransportHandle>,
    facade: CommandFacade,
    address: String,
    connect_timeout: Duration,
    state: AcquisitionState,
    config: AcquisitionConfig,
    repetition: u32,
    next_start_at: Option<Instant>,
    storage: Option<DataFileWriter>,
}

fn live(handle: &Option<TransportHandle>) -> CorrelatorResult<&TransportHandle> {
    handle
        .as_ref()
        .ok_or_else(|| CorrelatorError::Transport("no open transport handle".into()))
}

impl Inner {
    async fn apply_config(&mut self, config: &AcquisitionConfig) -> CorrelatorResult<()> {
        let handle = live(&self.handle)?;
        self.facade
            .apply_config(self.transport.as_mut(), handle, config)
            .await
    }

    async fn start_window(&mut self) -> CorrelatorResult<()> {
        let handle = live(&self.handle)?;
        self.facade
            .start_acquisition(self.transport.as_mut(), handle)
            .await
    }

    async fn stop_window(&mut self) -> CorrelatorResult<()> {
        let handle = live(&self.handle)?;
        self.facade
            .stop_acquisition(self.transport.as_mut(), handle)
            .await
    }

    async fn status(&mut self) -> CorrelatorResult<DeviceStatus> {
        let handle = live(&self.handle)?;
        self.facade.query_status(self.transport.as_mut(), handle).await
    }

    async fn data(&mut self) -> CorrelatorResult<RawCorrelation> {
        let handle = live(&self.handle)?;
        self.facade.query_result(self.transport.as_mut(), handle).await
    }

    /// Stop a measurement window left open by an earlier session.
    async fn halt_stale_window(&mut self) -> CorrelatorResult<()> {
        let status = self.status().await?;
        if status.activity == DeviceActivity::Measuring {
            tracing::info!(
                elapsed_s = status.elapsed_s,
                "Device still measuring from a previous session, stopping it"
            );
            self.stop_window().await?;
        }
        Ok(())
    }

    async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.transport.close(handle).await;
        }
    }
}

/// Single-instrument acquisition state machine.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct AcquisitionMachine {
    inner: Mutex<Inner>,
    snapshot: watch::Sender<Snapshot>,
    cancel_start: AtomicBool,
}

impl AcquisitionMachine {
    /// Create a machine in `Disconnected` around `transport`.
    pub fn new(transport: Box<dyn Transport>, options: MachineOptions) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::new(
            options.config.clone(),
            options.metadata,
        ));
        Self {
            inner: Mutex::new(Inner {
                transport,
                handle: None,
                facade: CommandFacade::new(options.command_timeout),
                address: options.address,
                connect_timeout: options.connect_timeout,
                state: AcquisitionState::Disconnected,
                config: options.config,
                repetition: 0,
                next_start_at: None,
                storage: options.storage,
            }),
            snapshot,
            cancel_start: AtomicBool::new(false),
        }
    }

    /// Build a machine from loaded settings, choosing the TCP or simulated transport.
    pub fn from_settings(settings: &Settings) -> Self {
        let instrument = &settings.instrument;
        let transport: Box<dyn Transport> = if instrument.simulate {
            tracing::info!(
                time_scale = instrument.simulation_time_scale,
                "Using simulated correlator"
            );
            Box::new(
                SimulatedCorrelator::new()
                    .with_firmware(instrument.firmware_revision.clone())
                    .with_time_scale(instrument.simulation_time_scale),
            )
        } else {
            Box::new(TcpTransport::new())
        };
        let storage = settings.storage.enabled.then(|| {
            DataFileWriter::new(
                &settings.storage.user_dir,
                &settings.storage.archive_dir,
                settings.storage.instrument_name.clone(),
            )
        });
        Self::new(
            transport,
            MachineOptions {
                address: instrument.endpoint(),
                connect_timeout: Duration::from_millis(instrument.connect_timeout_ms),
                command_timeout: Duration::from_millis(instrument.command_timeout_ms),
                config: settings.acquisition.clone(),
                metadata: settings.experiment.clone(),
                storage,
            },
        )
    }

    /// Current snapshot. Never blocks on the device.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Current state. Never blocks on the device.
    pub fn state(&self) -> AcquisitionState {
        self.snapshot.borrow().state
    }

    /// Receiver notified on every published change.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    // -------------------------------------------------------------------------
    // Publication helpers
    // -------------------------------------------------------------------------

    fn transition(&self, inner: &mut Inner, to: AcquisitionState) {
        let from = inner.state;
        if from != to {
            tracing::info!(%from, %to, "Acquisition state transition");
        }
        inner.state = to;
        self.snapshot.send_modify(|s| s.state = to);
    }

    fn record(&self, err: &CorrelatorError) {
        let record = ErrorRecord::from_error(err);
        self.snapshot.send_modify(|s| s.last_error = Some(record));
    }

    fn clear_error(&self) {
        self.snapshot.send_if_modified(|s| s.last_error.take().is_some());
    }

    /// Refuse a request without touching the state.
    ///
    /// Calls made in the wrong state leave the record alone, so a fault recorded in `Error`
    /// stays visible until `reset()` and `connect()` succeed.
    fn reject(&self, err: CorrelatorError) -> CorrelatorError {
        tracing::warn!(error = %err, kind = %err.kind(), "Request rejected");
        if !err.is_state_conflict() {
            self.record(&err);
        }
        err
    }

    /// Record a device failure; transport faults close the handle and move to `Error`.
    async fn fail(&self, inner: &mut Inner, err: CorrelatorError) -> CorrelatorError {
        self.record(&err);
        if err.is_transport_fault() {
            tracing::error!(error = %err, state = %inner.state, "Transport fault");
            inner.release().await;
            inner.next_start_at = None;
            self.snapshot.send_modify(|s| s.taking_data = false);
            self.transition(inner, AcquisitionState::Error);
        } else {
            tracing::warn!(error = %err, kind = %err.kind(), "Device refused request");
        }
        err
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Open the transport and handshake. Only from `Disconnected`.
    pub async fn connect(&self) -> CorrelatorResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state != AcquisitionState::Disconnected {
            return Err(self.reject(CorrelatorError::invalid_state("connect", inner.state)));
        }

        match inner
            .transport
            .connect(&inner.address, inner.connect_timeout)
            .await
        {
            Ok(handle) => {
                let identity = handle.identity().to_string();
                inner.handle = Some(handle);
                if let Err(err) = inner.halt_stale_window().await {
                    let err = self.fail(inner, err).await;
                    inner.release().await;
                    return Err(err);
                }
                self.snapshot.send_modify(|s| s.identity = Some(identity));
                self.transition(inner, AcquisitionState::Idle);
                self.clear_error();
                Ok(())
            }
            Err(err) => Err(self.fail(inner, err).await),
        }
    }

    /// Replace the configuration. Only from `Idle`; last write wins.
    pub async fn configure(&self, config: AcquisitionConfig) -> CorrelatorResult<()> {
        self.configure_with(move |current| *current = config).await
    }

    /// Edit a copy of the current configuration and push it to the device.
    ///
    /// The edit and the push happen under the same lock, so concurrent field writes never
    /// lose each other's changes. On any failure the stored configuration is unchanged.
    pub async fn configure_with<F>(&self, edit: F) -> CorrelatorResult<()>
    where
        F: FnOnce(&mut AcquisitionConfig) + Send,
    {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state != AcquisitionState::Idle {
            return Err(self.reject(CorrelatorError::invalid_state(
                "configure",
                inner.state,
            )));
        }

        let mut candidate = inner.config.clone();
        edit(&mut candidate);
        if let Err(err) = candidate.validate() {
            return Err(self.reject(err));
        }

        if let Err(err) = inner.apply_config(&candidate).await {
            return Err(self.fail(inner, err).await);
        }

        tracing::info!(config = ?candidate, "Configuration applied");
        let published = Arc::new(candidate.clone());
        inner.config = candidate;
        self.snapshot.send_modify(|s| s.config = published);
        self.clear_error();
        Ok(())
    }

    /// Begin an acquisition of `config.repetitions` windows. Only from `Idle`.
    pub async fn start(&self) -> CorrelatorResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state != AcquisitionState::Idle {
            return Err(self.reject(CorrelatorError::invalid_state("start", inner.state)));
        }

        self.cancel_start.store(false, Ordering::SeqCst);
        self.transition(inner, AcquisitionState::Starting);
        inner.repetition = 1;
        inner.next_start_at = None;
        self.snapshot.send_modify(|s| {
            s.result = None;
            s.current_repetition = 1;
            s.output_file = None;
        });

        let config = inner.config.clone();
        let acked = match inner.apply_config(&config).await {
            Ok(()) => inner.start_window().await,
            Err(err) => Err(err),
        };
        if let Err(err) = acked {
            if matches!(
                err,
                CorrelatorError::DeviceBusy(_) | CorrelatorError::ConfigRejected(_)
            ) {
                self.transition(inner, AcquisitionState::Idle);
            }
            // START answered with ERR surfaces as a transport fault and lands in Error.
            return Err(self.fail(inner, err).await);
        }

        if self.cancel_start.swap(false, Ordering::SeqCst) {
            tracing::info!("Start cancelled by pending stop");
            if let Err(err) = inner.stop_window().await {
                return Err(self.fail(inner, err).await);
            }
            self.transition(inner, AcquisitionState::Idle);
            return Err(CorrelatorError::StartCancelled);
        }

        self.snapshot.send_modify(|s| s.taking_data = true);
        self.transition(inner, AcquisitionState::Running);
        self.clear_error();
        Ok(())
    }

    /// Stop the acquisition. Accepted from `Starting` (cancels the start) or `Running`.
    pub async fn stop(&self) -> CorrelatorResult<()> {
        let cancelling = self.state() == AcquisitionState::Starting;
        if cancelling {
            self.cancel_start.store(true, Ordering::SeqCst);
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        self.cancel_start.store(false, Ordering::SeqCst);

        match inner.state {
            AcquisitionState::Running => {
                self.transition(inner, AcquisitionState::Stopping);
                if let Err(err) = inner.stop_window().await {
                    return Err(self.fail(inner, err).await);
                }
                inner.next_start_at = None;
                self.snapshot.send_modify(|s| s.taking_data = false);
                self.transition(inner, AcquisitionState::Idle);
                self.clear_error();
                Ok(())
            }
            // The start we cancelled has already wound down.
            AcquisitionState::Idle if cancelling => Ok(()),
            state => Err(self.reject(CorrelatorError::invalid_state("stop", state))),
        }
    }

    /// Pull status and data from the device while `Running`.
    ///
    /// A no-op in every other state except `Error`, where it fails until `reset()`.
    pub async fn refresh(&self) -> CorrelatorResult<RefreshOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        match inner.state {
            AcquisitionState::Running => {}
            AcquisitionState::Error => {
                return Err(self.reject(CorrelatorError::invalid_state("refresh", inner.state)))
            }
            _ => return Ok(RefreshOutcome::NotRunning),
        }

        if let Some(at) = inner.next_start_at {
            if Instant::now() < at {
                return Ok(RefreshOutcome::Waiting);
            }
            return self.start_next_repetition(inner).await;
        }

        let status = match inner.status().await {
            Ok(status) => status,
            Err(err) => return Err(self.fail(inner, err).await),
        };
        let measuring = status.activity == DeviceActivity::Measuring;
        self.snapshot.send_modify(|s| {
            s.status = Some(status);
            s.taking_data = measuring;
        });

        let raw = match inner.data().await {
            Ok(raw) => raw,
            Err(CorrelatorError::NoDataYet) => {
                tracing::debug!(elapsed_s = status.elapsed_s, "No correlation data yet");
                return Err(CorrelatorError::NoDataYet);
            }
            Err(err) => return Err(self.fail(inner, err).await),
        };
        let result = Arc::new(CorrelationResult::from_raw(
            raw,
            &status,
            inner.config.min_time_lag_s(),
            inner.repetition,
            !measuring,
        ));
        tracing::debug!(
            points = result.len(),
            elapsed_s = status.elapsed_s,
            repetition = inner.repetition,
            "Correlation refreshed"
        );
        self.snapshot
            .send_modify(|s| s.result = Some(Arc::clone(&result)));
        self.clear_error();

        if measuring {
            return Ok(RefreshOutcome::Updated);
        }
        self.finish_repetition(inner, &result).await
    }

    async fn finish_repetition(
        &self,
        inner: &mut Inner,
        result: &CorrelationResult,
    ) -> CorrelatorResult<RefreshOutcome> {
        let finished = inner.repetition;
        tracing::info!(
            repetition = finished,
            of = inner.config.repetitions,
            "Measurement window complete"
        );
        self.save(inner, result);

        if finished >= inner.config.repetitions {
            self.transition(inner, AcquisitionState::Idle);
            return Ok(RefreshOutcome::AcquisitionComplete);
        }

        let wait = Duration::from_secs_f64(inner.config.wait_between_s);
        inner.next_start_at = Some(Instant::now() + wait);
        if wait.is_zero() {
            match self.start_next_repetition(inner).await {
                Err(err) if err.is_transport_fault() => return Err(err),
                // Retried by the next refresh.
                _ => {}
            }
        }
        Ok(RefreshOutcome::RepetitionComplete(finished))
    }

    /// Open the next window. A refused start keeps `next_start_at` set so the next
    /// refresh retries it instead of re-reading the finished window.
    async fn start_next_repetition(&self, inner: &mut Inner) -> CorrelatorResult<RefreshOutcome> {
        let due = inner.next_start_at.take();
        if let Err(err) = inner.start_window().await {
            if !err.is_transport_fault() {
                inner.next_start_at = due;
            }
            return Err(self.fail(inner, err).await);
        }
        inner.repetition += 1;
        let repetition = inner.repetition;
        self.snapshot.send_modify(|s| {
            s.current_repetition = repetition;
            s.taking_data = true;
        });
        self.clear_error();
        tracing::info!(repetition, "Next repetition started");
        Ok(RefreshOutcome::RepetitionStarted(repetition))
    }

    fn save(&self, inner: &Inner, result: &CorrelationResult) {
        let Some(writer) = &inner.storage else {
            return;
        };
        let metadata = Arc::clone(&self.snapshot.borrow().metadata);
        match writer.write(result, &metadata, inner.config.measurement_duration_s) {
            Ok(saved) => {
                tracing::info!(
                    user = %saved.user.display(),
                    archive = %saved.archive.display(),
                    repetition = result.repetition,
                    "Saved correlation data"
                );
                self.snapshot
                    .send_modify(|s| s.output_file = Some(saved.user));
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to save correlation data");
                self.record(&err);
            }
        }
    }

    /// Leave `Error` for `Disconnected`. The error record is kept for inspection.
    pub async fn reset(&self) -> CorrelatorResult<()> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state != AcquisitionState::Error {
            return Err(self.reject(CorrelatorError::invalid_state("reset", inner.state)));
        }
        inner.release().await;
        self.transition(inner, AcquisitionState::Disconnected);
        Ok(())
    }

    /// Release the transport from any state, stopping a running window first.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if inner.state == AcquisitionState::Running && inner.handle.is_some() {
            if let Err(err) = inner.stop_window().await {
                tracing::warn!(error = %err, "Stop before disconnect failed");
            }
        }
        inner.release().await;
        inner.next_start_at = None;
        self.snapshot.send_modify(|s| {
            s.taking_data = false;
            s.identity = None;
        });
        self.transition(inner, AcquisitionState::Disconnected);
    }

    /// Edit the experiment metadata. Allowed in every state; never touches the device.
    pub fn update_metadata<F>(&self, edit: F)
    where
        F: FnOnce(&mut ExperimentMetadata),
    {
        self.snapshot.send_modify(|s| edit(Arc::make_mut(&mut s.metadata)));
    }
}
