//! Simulated correlator.
//!
//! An in-process [`Transport`] that answers the correlator line protocol the way the
//! instrument does, so the full driver stack can run without hardware:
//!
//! - Measurements run for the configured duration multiplied by a time scale, then the
//!   device reports itself idle with a final data set
//! - `DATA?` returns `NODATA` until the first transfer interval has passed, then a
//!   synthetic multi-tau correlation function; lags longer than the elapsed time are NaN
//! - Configuration is refused while measuring, and out-of-range values get device text
//! - `START` while measuring answers `BUSY`
//!
//! Faults are injected through a [`SimulatorControl`] handle that stays with the test after
//! the transport itself has been handed to the state machine.
//!
//! # Example
//!
//! ```rust,ignore
//! let sim = SimulatedCorrelator::new().with_time_scale(0.001);
//! let control = sim.control();
//! let machine = AcquisitionMachine::new(Box::new(sim), settings);
//!
//! control.inject(SimulatedFault::Timeout { request: "STAT?" });
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{CorrelatorError, CorrelatorResult};
use crate::protocol::{DeviceSettings, Reply, Request};
use crate::transport::{Transport, TransportHandle};
use crate::types::{
    AcquisitionConfig, DeviceActivity, DeviceStatus, RawCorrelation, WireToken,
    TRACE_TIME_STEP_S,
};

/// Longest measurement window the device accepts, in seconds.
pub const MAX_DURATION_S: u32 = 86_400;
/// Highest overload limit the device accepts, in Mcps.
pub const MAX_OVERLOAD_LIMIT_MCPS: u32 = 100;

const CORRELATION_CHANNELS: usize = 128;
const MAX_TRACE_POINTS: usize = 2_000;
const DECAY_RATE_PER_S: f64 = 1_000.0;
const INTERCEPT: f64 = 0.8;
const MEAN_COUNT_RATE_KHZ: f64 = 100.0;
/// Request lines kept by [`SimulatorControl`]; older lines are dropped first.
pub const HISTORY_CAPACITY: usize = 4_096;

/// A fault the simulator applies to the next matching request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedFault {
    /// Swallow the request so the caller's timeout elapses.
    Timeout {
        /// Request head to match (`"STAT?"`, `"START"`, ...); `"*"` matches anything
        request: &'static str,
    },
    /// Drop the link while handling the request.
    Disconnect {
        /// Request head to match; `"*"` matches anything
        request: &'static str,
    },
    /// Answer with a line that is not part of the protocol.
    Garbage {
        /// Request head to match; `"*"` matches anything
        request: &'static str,
    },
    /// Refuse the next `CONF` with this device text.
    RejectConfig(String),
    /// Answer the next `START` with `BUSY`.
    Busy,
}

impl SimulatedFault {
    fn matches(&self, head: &str) -> bool {
        match self {
            SimulatedFault::Timeout { request }
            | SimulatedFault::Disconnect { request }
            | SimulatedFault::Garbage { request } => *request == "*" || *request == head,
            SimulatedFault::RejectConfig(_) => head == "CONF",
            SimulatedFault::Busy => head == "START",
        }
    }
}

#[derive(Debug, Default)]
struct ControlState {
    pending: VecDeque<SimulatedFault>,
    unreachable: bool,
    history: VecDeque<String>,
    data_queries_while_idle: u32,
}

/// Test-side handle onto a [`SimulatedCorrelator`].
#[derive(Debug, Clone, Default)]
pub struct SimulatorControl {
    state: Arc<Mutex<ControlState>>,
}

impl SimulatorControl {
    /// Queue a one-shot fault.
    pub fn inject(&self, fault: SimulatedFault) {
        self.state.lock().pending.push_back(fault);
    }

    /// Make `connect` fail until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// The last [`HISTORY_CAPACITY`] request lines received, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Number of requests whose line starts with `head`.
    pub fn count(&self, head: &str) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|line| line.starts_with(head))
            .count()
    }

    /// `DATA?` queries received while no measurement was running.
    pub fn data_queries_while_idle(&self) -> u32 {
        self.state.lock().data_queries_while_idle
    }

    fn take_fault(&self, head: &str) -> Option<SimulatedFault> {
        let mut state = self.state.lock();
        let pos = state.pending.iter().position(|f| f.matches(head))?;
        state.pending.remove(pos)
    }

    fn record(&self, line: &str) {
        let mut state = self.state.lock();
        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(line.to_string());
    }
}

#[derive(Debug)]
struct Measurement {
    started: Instant,
    window: Duration,
    first_data_after: Duration,
}

#[derive(Debug)]
struct DeviceModel {
    settings: DeviceSettings,
    measurement: Option<Measurement>,
    last_window: Option<(Duration, f64)>,
}

impl DeviceModel {
    fn new() -> Self {
        Self {
            settings: DeviceSettings::from(&AcquisitionConfig::default()),
            measurement: None,
            last_window: None,
        }
    }

    /// First-data delay, elapsed simulated seconds and whether the window is still open.
    fn progress(&mut self, time_scale: f64) -> Option<(Duration, f64, bool)> {
        let (first_data_after, started, window) = match &self.measurement {
            Some(m) => (m.first_data_after, m.started, m.window),
            None => {
                return self
                    .last_window
                    .map(|(first, simulated)| (first, simulated, false))
            }
        };
        let real = started.elapsed();
        if real >= window {
            let simulated = self.settings.duration_s as f64;
            self.last_window = Some((first_data_after, simulated));
            self.measurement = None;
            return Some((first_data_after, simulated, false));
        }
        Some((first_data_after, real.as_secs_f64() / time_scale, true))
    }
}

/// In-process correlator speaking the line protocol.
pub struct SimulatedCorrelator {
    model: DeviceModel,
    control: SimulatorControl,
    firmware: String,
    time_scale: f64,
    latency: Duration,
    link: Option<Uuid>,
}

impl Default for SimulatedCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCorrelator {
    /// Create a simulator running in real time with firmware "4.0.0.3".
    pub fn new() -> Self {
        Self {
            model: DeviceModel::new(),
            control: SimulatorControl::default(),
            firmware: "4.0.0.3".to_string(),
            time_scale: 1.0,
            latency: Duration::ZERO,
            link: None,
        }
    }

    /// Real seconds per simulated second (0.001 runs a 300 s window in 0.3 s).
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        if time_scale.is_finite() && time_scale > 0.0 {
            self.time_scale = time_scale;
        }
        self
    }

    /// Delay added to every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Firmware revision reported by `*IDN?`.
    pub fn with_firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware = firmware.into();
        self
    }

    /// Handle for fault injection and inspection.
    pub fn control(&self) -> SimulatorControl {
        self.control.clone()
    }

    fn scaled(&self, seconds: f64) -> Duration {
        Duration::from_secs_f64((seconds * self.time_scale).max(0.0))
    }

    fn handle_request(&mut self, request: Request) -> Reply {
        match request {
            Request::Identify => Reply::Identity(format!("LSI,CORRELATOR,{}", self.firmware)),
            Request::Configure(settings) => self.configure(settings),
            Request::Start => self.start(),
            Request::Stop => {
                self.model.progress(self.time_scale);
                if self.model.measurement.take().is_some() {
                    tracing::debug!("Simulated correlator stopped");
                }
                Reply::Ok
            }
            Request::Status => Reply::Status(self.status()),
            Request::Data => self.data(),
        }
    }

    fn configure(&mut self, settings: DeviceSettings) -> Reply {
        if self.model.progress(self.time_scale).is_some_and(|(_, _, open)| open) {
            return Reply::Err("Cannot configure: Measurement active".into());
        }
        if settings.duration_s == 0 || settings.duration_s > MAX_DURATION_S {
            return Reply::Err(format!(
                "MEASUREMENT DURATION {} OUT OF RANGE 1-{}",
                settings.duration_s, MAX_DURATION_S
            ));
        }
        if settings.overload_limit_mcps > MAX_OVERLOAD_LIMIT_MCPS {
            return Reply::Err(format!(
                "OVERLOAD LIMIT {} OUT OF RANGE 0-{}",
                settings.overload_limit_mcps, MAX_OVERLOAD_LIMIT_MCPS
            ));
        }
        self.model.settings = settings;
        Reply::Ok
    }

    fn start(&mut self) -> Reply {
        if self.model.progress(self.time_scale).is_some_and(|(_, _, open)| open) {
            return Reply::Busy("Data connection is currently active".into());
        }
        let settings = self.model.settings;
        let transfer_s = settings.transfer_rate.token().parse::<f64>().unwrap_or(100.0) / 1e3;
        self.model.measurement = Some(Measurement {
            started: Instant::now(),
            window: self.scaled(settings.duration_s as f64),
            first_data_after: self.scaled(transfer_s.min(settings.duration_s as f64)),
        });
        self.model.last_window = None;
        tracing::debug!(duration_s = settings.duration_s, "Simulated correlator started");
        Reply::Ok
    }

    fn status(&mut self) -> DeviceStatus {
        let progress = self.model.progress(self.time_scale);
        let (activity, elapsed_s) = match progress {
            Some((_, elapsed, true)) => (DeviceActivity::Measuring, elapsed),
            Some((_, elapsed, false)) => (DeviceActivity::Idle, elapsed),
            None => (DeviceActivity::Idle, 0.0),
        };
        let mut rng = rand::thread_rng();
        let (cra, crb) = if activity == DeviceActivity::Measuring {
            (
                MEAN_COUNT_RATE_KHZ * (1.0 + rng.gen_range(-0.05..0.05)),
                MEAN_COUNT_RATE_KHZ * (1.0 + rng.gen_range(-0.05..0.05)),
            )
        } else {
            (0.0, 0.0)
        };
        DeviceStatus {
            activity,
            elapsed_s,
            count_rate_a_khz: cra,
            count_rate_b_khz: crb,
            monitor_diode_v: 0.25 * (1.0 + rng.gen_range(-0.01..0.01)),
        }
    }

    fn data(&mut self) -> Reply {
        match self.model.progress(self.time_scale) {
            None => {
                self.control.state.lock().data_queries_while_idle += 1;
                Reply::NoData
            }
            Some((first_data_after, elapsed_s, open)) => {
                let real_elapsed = self.scaled(elapsed_s);
                if open && real_elapsed < first_data_after {
                    return Reply::NoData;
                }
                Reply::Data(synthesize(&self.model.settings, elapsed_s))
            }
        }
    }
}

/// Multi-tau lag grid: 16 channels at the base time, then groups of 8 doubling in spacing.
fn lag_grid(base_s: f64) -> Vec<f64> {
    let mut lags = Vec::with_capacity(CORRELATION_CHANNELS);
    let mut spacing = base_s;
    let mut lag = 0.0;
    for i in 0..CORRELATION_CHANNELS {
        if i >= 16 && (i - 16) % 8 == 0 {
            spacing *= 2.0;
        }
        lag += spacing;
        lags.push(lag);
    }
    lags
}

fn synthesize(settings: &DeviceSettings, elapsed_s: f64) -> RawCorrelation {
    let mut rng = rand::thread_rng();
    let lags = lag_grid(settings.sampling_time.as_seconds());
    let noise = 0.01 / (1.0 + elapsed_s).sqrt();
    let correlation = lags
        .iter()
        .map(|&tau| {
            if tau > elapsed_s {
                f64::NAN
            } else {
                INTERCEPT * (-2.0 * DECAY_RATE_PER_S * tau).exp() + rng.gen_range(-noise..=noise)
            }
        })
        .collect();

    let points = ((elapsed_s / TRACE_TIME_STEP_S) as usize).clamp(1, MAX_TRACE_POINTS);
    let mut trace = || -> Vec<f64> {
        (0..points)
            .map(|_| MEAN_COUNT_RATE_KHZ * (1.0 + rng.gen_range(-0.05..0.05)))
            .collect()
    };
    let trace_a = trace();
    let trace_b = trace();

    RawCorrelation {
        lags,
        correlation,
        trace_a,
        trace_b,
    }
}

fn head(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

#[async_trait]
impl Transport for SimulatedCorrelator {
    async fn connect(
        &mut self,
        address: &str,
        _timeout: Duration,
    ) -> CorrelatorResult<TransportHandle> {
        self.link = None;
        if self.control.state.lock().unreachable {
            return Err(CorrelatorError::Connect {
                address: address.to_string(),
                reason: "simulated correlator unreachable".into(),
            });
        }
        let handle = TransportHandle::new(address, format!("LSI,CORRELATOR,{}", self.firmware));
        self.link = Some(handle.session());
        tracing::info!(%handle, "Connected to simulated correlator");
        Ok(handle)
    }

    async fn send(
        &mut self,
        handle: &TransportHandle,
        request: &str,
        timeout: Duration,
    ) -> CorrelatorResult<String> {
        if self.link != Some(handle.session()) {
            return Err(CorrelatorError::Transport(format!(
                "handle {} is no longer valid",
                handle
            )));
        }
        self.control.record(request);

        match self.control.take_fault(head(request)) {
            Some(SimulatedFault::Timeout { .. }) => {
                tokio::time::sleep(timeout).await;
                self.link = None;
                return Err(CorrelatorError::Timeout {
                    request: request.to_string(),
                    timeout,
                });
            }
            Some(SimulatedFault::Disconnect { .. }) => {
                self.link = None;
                return Err(CorrelatorError::Transport(
                    "connection reset by device".into(),
                ));
            }
            Some(SimulatedFault::Garbage { .. }) => return Ok("#?!".to_string()),
            Some(SimulatedFault::RejectConfig(text)) => return Ok(Reply::Err(text).encode()),
            Some(SimulatedFault::Busy) => return Ok(Reply::Busy(String::new()).encode()),
            None => {}
        }

        if !self.latency.is_zero() {
            if self.latency >= timeout {
                tokio::time::sleep(timeout).await;
                self.link = None;
                return Err(CorrelatorError::Timeout {
                    request: request.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.latency).await;
        }

        let reply = match Request::parse(request) {
            Ok(parsed) => self.handle_request(parsed),
            Err(err) => Reply::Err(err.to_string()),
        };
        Ok(reply.encode())
    }

    async fn close(&mut self, handle: TransportHandle) {
        if self.link == Some(handle.session()) {
            self.link = None;
            tracing::info!(%handle, "Closed simulated correlator link");
        }
    }

    fn is_open(&self, handle: &TransportHandle) -> bool {
        self.link == Some(handle.session())
    }
}
