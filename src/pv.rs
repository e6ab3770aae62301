//! Process-variable adapter.
//!
//! Maps named, typed process variables onto the acquisition state machine for a
//! control-system framework:
//!
//! - **Reads** come from the machine's last published snapshot and never wait on the device.
//! - **Writes** are checked against the snapshot and either rejected on the spot (unknown
//!   name, read-only variable, bad value, wrong state) or accepted and forwarded to the
//!   machine on a background task. The framework gets its answer without waiting for the
//!   device; the outcome of the forwarded operation shows up in `STATE` and `ERRORMSG`.
//!
//! Writable settings also answer to a `:SP` setpoint alias (`REPETITIONS:SP`). Enum
//! variables are read and written as the variant index.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::acquisition::{AcquisitionMachine, Snapshot};
use crate::error::ErrorKind;
use crate::storage::ExperimentMetadata;
use crate::types::{
    AcquisitionConfig, AcquisitionState, CorrelationType, IndexedEnum, Normalization,
    SamplingTimeMultiT, SwapChannels, TransferRate,
};

/// Suffix of setpoint aliases.
pub const SETPOINT_SUFFIX: &str = ":SP";

/// Value carried by a process variable.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text
    Str(String),
    /// Enum variant index
    Enum(u16),
    /// Waveform
    FloatArray(Arc<[f64]>),
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{}", v),
            PvValue::Float(v) => write!(f, "{}", v),
            PvValue::Str(v) => f.write_str(v),
            PvValue::Enum(v) => write!(f, "{}", v),
            PvValue::FloatArray(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// How a process variable may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvAccess {
    /// Value only published
    ReadOnly,
    /// Setting that can be read and written
    ReadWrite,
    /// Writing triggers an operation
    Action,
}

/// Why a read or write was refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PvRejection {
    /// No such process variable
    #[error("Unknown process variable '{0}'")]
    UnknownPv(String),
    /// Written to a read-only variable
    #[error("Process variable {0} is read-only")]
    ReadOnly(PvName),
    /// Value has the wrong type or is out of range
    #[error("Bad value for {pv}: {reason}")]
    BadValue {
        /// Target variable
        pv: PvName,
        /// What is wrong with it
        reason: String,
    },
    /// Operation not possible in the current acquisition state
    #[error("{pv} rejected ({kind}): {message}")]
    State {
        /// Target variable
        pv: PvName,
        /// Classification matching the state machine's error
        kind: ErrorKind,
        /// Explanation
        message: String,
    },
}

/// Answer to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAck {
    /// Forwarded to the state machine
    Accepted,
    /// Refused without touching the state machine
    Rejected(PvRejection),
}

impl WriteAck {
    /// Whether the write was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, WriteAck::Accepted)
    }
}

macro_rules! pv_table {
    ($( $variant:ident => $name:literal, $access:ident; )+) => {
        /// Process variables exposed by the adapter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(missing_docs)]
        pub enum PvName {
            $( $variant ),+
        }

        impl PvName {
            /// Every process variable.
            pub const ALL: &'static [PvName] = &[$( PvName::$variant ),+];

            /// Canonical name.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( PvName::$variant => $name ),+
                }
            }

            /// Read/write/action classification.
            pub fn access(self) -> PvAccess {
                match self {
                    $( PvName::$variant => PvAccess::$access ),+
                }
            }

            fn from_canonical(name: &str) -> Option<Self> {
                match name {
                    $( $name => Some(PvName::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

pv_table! {
    CorrelationType => "CORRELATIONTYPE", ReadWrite;
    Normalization => "NORMALIZATION", ReadWrite;
    MeasurementDuration => "MEASUREMENTDURATION", ReadWrite;
    SwapChannels => "SWAPCHANNELS", ReadWrite;
    SamplingTimeMultiT => "SAMPLINGTIMEMULTIT", ReadWrite;
    TransferRate => "TRANSFERRATE", ReadWrite;
    OverloadLimit => "OVERLOADLIMIT", ReadWrite;
    OverloadInterval => "OVERLOADINTERVAL", ReadWrite;
    Repetitions => "REPETITIONS", ReadWrite;
    Wait => "WAIT", ReadWrite;
    MinTimeLag => "MIN_TIME_LAG", ReadWrite;
    ScatteringAngle => "SCATTERING_ANGLE", ReadWrite;
    LaserWavelength => "LASER_WAVELENGTH", ReadWrite;
    SolventRefractiveIndex => "SOLVENT_REFRACTIVE_INDEX", ReadWrite;
    SolventViscosity => "SOLVENT_VISCOSITY", ReadWrite;
    SampleTemp => "SAMPLE_TEMP", ReadWrite;
    ExperimentName => "EXPERIMENTNAME", ReadWrite;
    Start => "START", Action;
    Stop => "STOP", Action;
    Reset => "RESET", Action;
    Connect => "CONNECT", Action;
    State => "STATE", ReadOnly;
    Connected => "CONNECTED", ReadOnly;
    Running => "RUNNING", ReadOnly;
    TakingData => "TAKING_DATA", ReadOnly;
    CurrentRepetition => "CURRENT_REPETITION", ReadOnly;
    CorrelationFunction => "CORRELATION_FUNCTION", ReadOnly;
    Lags => "LAGS", ReadOnly;
    TraceA => "TRACE_A", ReadOnly;
    TraceB => "TRACE_B", ReadOnly;
    CountRateA => "COUNT_RATE_A", ReadOnly;
    CountRateB => "COUNT_RATE_B", ReadOnly;
    MonitorDiode => "MONITOR_DIODE", ReadOnly;
    ElapsedTime => "ELAPSED_TIME", ReadOnly;
    ErrorMsg => "ERRORMSG", ReadOnly;
    OutputFile => "OUTPUTFILE", ReadOnly;
}

impl PvName {
    /// Resolve a name, accepting the `:SP` alias of writable settings.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        match name.strip_suffix(SETPOINT_SUFFIX) {
            Some(base) => Self::from_canonical(base).filter(|pv| pv.access() == PvAccess::ReadWrite),
            None => Self::from_canonical(name),
        }
    }

    fn is_metadata(self) -> bool {
        matches!(
            self,
            PvName::ScatteringAngle
                | PvName::LaserWavelength
                | PvName::SolventRefractiveIndex
                | PvName::SolventViscosity
                | PvName::SampleTemp
                | PvName::ExperimentName
        )
    }
}

impl fmt::Display for PvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of a state in the `STATE` enum variable.
pub fn state_index(state: AcquisitionState) -> u16 {
    match state {
        AcquisitionState::Disconnected => 0,
        AcquisitionState::Idle => 1,
        AcquisitionState::Starting => 2,
        AcquisitionState::Running => 3,
        AcquisitionState::Stopping => 4,
        AcquisitionState::Error => 5,
    }
}

/// A decoded write to an acquisition setting.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Setting {
    CorrelationType(CorrelationType),
    Normalization(Normalization),
    MeasurementDuration(u32),
    SwapChannels(SwapChannels),
    SamplingTime(SamplingTimeMultiT),
    TransferRate(TransferRate),
    OverloadLimit(u32),
    OverloadInterval(u32),
    Repetitions(u32),
    Wait(f64),
    MinTimeLag(f64),
}

impl Setting {
    fn apply(self, config: &mut AcquisitionConfig) {
        match self {
            Setting::CorrelationType(v) => config.correlation_type = v,
            Setting::Normalization(v) => config.normalization = v,
            Setting::MeasurementDuration(v) => config.measurement_duration_s = v,
            Setting::SwapChannels(v) => config.swap_channels = v,
            Setting::SamplingTime(v) => config.sampling_time = v,
            Setting::TransferRate(v) => config.transfer_rate = v,
            Setting::OverloadLimit(v) => config.overload_limit_mcps = v,
            Setting::OverloadInterval(v) => config.overload_interval_ms = v,
            Setting::Repetitions(v) => config.repetitions = v,
            Setting::Wait(v) => config.wait_between_s = v,
            Setting::MinTimeLag(v) => config.min_time_lag_ns = v,
        }
    }
}

/// Process-variable front end of an [`AcquisitionMachine`].
pub struct PvAdapter {
    machine: Arc<AcquisitionMachine>,
    runtime: Handle,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl PvAdapter {
    /// Adapter forwarding writes onto `runtime`.
    pub fn new(machine: Arc<AcquisitionMachine>, runtime: Handle) -> Self {
        Self {
            machine,
            runtime,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Adapter forwarding writes onto the current runtime.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn current(machine: Arc<AcquisitionMachine>) -> Self {
        Self::new(machine, Handle::current())
    }

    /// The machine behind this adapter.
    pub fn machine(&self) -> &Arc<AcquisitionMachine> {
        &self.machine
    }

    /// Read a process variable from the last published snapshot.
    pub fn read(&self, name: &str) -> Result<PvValue, PvRejection> {
        let pv = PvName::parse(name).ok_or_else(|| PvRejection::UnknownPv(name.to_string()))?;
        Ok(read_value(pv, &self.machine.snapshot()))
    }

    /// Handle a write. Returns immediately; accepted operations complete in the background.
    pub fn write(&self, name: &str, value: PvValue) -> WriteAck {
        match self.dispatch(name, value) {
            Ok(()) => WriteAck::Accepted,
            Err(rejection) => {
                tracing::debug!(pv = name, reason = %rejection, "PV write rejected");
                WriteAck::Rejected(rejection)
            }
        }
    }

    /// Wait for every accepted write forwarded so far to finish.
    pub async fn settle(&self) {
        let pending: Vec<_> = std::mem::take(&mut *self.in_flight.lock());
        for task in pending {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "PV write task ended abnormally");
            }
        }
    }

    fn dispatch(&self, name: &str, value: PvValue) -> Result<(), PvRejection> {
        let pv = PvName::parse(name).ok_or_else(|| PvRejection::UnknownPv(name.to_string()))?;
        let snapshot = self.machine.snapshot();

        match pv.access() {
            PvAccess::ReadOnly => Err(PvRejection::ReadOnly(pv)),
            PvAccess::Action => self.dispatch_action(pv, snapshot.state),
            PvAccess::ReadWrite if pv.is_metadata() => {
                let edit = metadata_edit(pv, &value)?;
                self.machine.update_metadata(edit);
                Ok(())
            }
            PvAccess::ReadWrite => {
                let setting = decode_setting(pv, &value)?;
                if snapshot.state != AcquisitionState::Idle {
                    return Err(state_rejection(pv, "configure", snapshot.state));
                }
                let mut candidate = (*snapshot.config).clone();
                setting.apply(&mut candidate);
                candidate.validate().map_err(|e| PvRejection::BadValue {
                    pv,
                    reason: e.to_string(),
                })?;

                self.forward(pv, move |machine| async move {
                    machine.configure_with(|c| setting.apply(c)).await
                });
                Ok(())
            }
        }
    }

    fn dispatch_action(&self, pv: PvName, state: AcquisitionState) -> Result<(), PvRejection> {
        match pv {
            PvName::Start if state == AcquisitionState::Idle => {
                self.forward(pv, |machine| async move { machine.start().await });
            }
            PvName::Stop if matches!(state, AcquisitionState::Starting | AcquisitionState::Running) => {
                self.forward(pv, |machine| async move { machine.stop().await });
            }
            PvName::Reset if state == AcquisitionState::Error => {
                self.forward(pv, |machine| async move { machine.reset().await });
            }
            PvName::Connect if state == AcquisitionState::Disconnected => {
                self.forward(pv, |machine| async move { machine.connect().await });
            }
            PvName::Start => return Err(state_rejection(pv, "start", state)),
            PvName::Stop => return Err(state_rejection(pv, "stop", state)),
            PvName::Reset => return Err(state_rejection(pv, "reset", state)),
            PvName::Connect => return Err(state_rejection(pv, "connect", state)),
            _ => return Err(PvRejection::ReadOnly(pv)),
        }
        Ok(())
    }

    fn forward<F, Fut>(&self, pv: PvName, operation: F)
    where
        F: FnOnce(Arc<AcquisitionMachine>) -> Fut,
        Fut: std::future::Future<Output = crate::error::CorrelatorResult<()>> + Send + 'static,
    {
        let fut = operation(Arc::clone(&self.machine));
        let task = self.runtime.spawn(async move {
            match fut.await {
                Ok(()) => tracing::debug!(%pv, "PV write completed"),
                Err(err) => tracing::warn!(%pv, error = %err, "PV write failed"),
            }
        });
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|t| !t.is_finished());
        in_flight.push(task);
    }
}

fn state_rejection(pv: PvName, operation: &'static str, state: AcquisitionState) -> PvRejection {
    let err = crate::error::CorrelatorError::invalid_state(operation, state);
    PvRejection::State {
        pv,
        kind: err.kind(),
        message: err.to_string(),
    }
}

fn bad(pv: PvName, reason: impl Into<String>) -> PvRejection {
    PvRejection::BadValue {
        pv,
        reason: reason.into(),
    }
}

fn as_f64(pv: PvName, value: &PvValue) -> Result<f64, PvRejection> {
    let v = match value {
        PvValue::Int(v) => *v as f64,
        PvValue::Float(v) => *v,
        PvValue::Enum(v) => f64::from(*v),
        PvValue::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| bad(pv, format!("'{}' is not a number", s)))?,
        PvValue::FloatArray(_) => return Err(bad(pv, "expected a scalar")),
    };
    if v.is_finite() {
        Ok(v)
    } else {
        Err(bad(pv, "value must be finite"))
    }
}

fn as_u32(pv: PvName, value: &PvValue) -> Result<u32, PvRejection> {
    let v = as_f64(pv, value)?;
    if v < 0.0 || v.fract() != 0.0 || v > f64::from(u32::MAX) {
        return Err(bad(pv, format!("{} is not a non-negative integer", v)));
    }
    Ok(v as u32)
}

fn as_variant<T: IndexedEnum>(pv: PvName, value: &PvValue) -> Result<T, PvRejection> {
    let index = as_u32(pv, value)? as usize;
    T::from_index(index).ok_or_else(|| {
        bad(
            pv,
            format!("index {} out of range 0..{}", index, T::VARIANTS.len()),
        )
    })
}

fn decode_setting(pv: PvName, value: &PvValue) -> Result<Setting, PvRejection> {
    Ok(match pv {
        PvName::CorrelationType => Setting::CorrelationType(as_variant(pv, value)?),
        PvName::Normalization => Setting::Normalization(as_variant(pv, value)?),
        PvName::MeasurementDuration => Setting::MeasurementDuration(as_u32(pv, value)?),
        PvName::SwapChannels => Setting::SwapChannels(as_variant(pv, value)?),
        PvName::SamplingTimeMultiT => Setting::SamplingTime(as_variant(pv, value)?),
        PvName::TransferRate => Setting::TransferRate(as_variant(pv, value)?),
        PvName::OverloadLimit => Setting::OverloadLimit(as_u32(pv, value)?),
        PvName::OverloadInterval => Setting::OverloadInterval(as_u32(pv, value)?),
        PvName::Repetitions => Setting::Repetitions(as_u32(pv, value)?),
        PvName::Wait => Setting::Wait(as_f64(pv, value)?),
        PvName::MinTimeLag => Setting::MinTimeLag(as_f64(pv, value)?),
        _ => return Err(PvRejection::ReadOnly(pv)),
    })
}

type MetadataEdit = Box<dyn FnOnce(&mut ExperimentMetadata) + Send>;

fn metadata_edit(pv: PvName, value: &PvValue) -> Result<MetadataEdit, PvRejection> {
    if pv == PvName::ExperimentName {
        let name = match value {
            PvValue::Str(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(Box::new(move |m| m.experiment_name = name));
    }
    let v = as_f64(pv, value)?;
    Ok(match pv {
        PvName::ScatteringAngle => Box::new(move |m| m.scattering_angle_deg = v),
        PvName::LaserWavelength => Box::new(move |m| m.laser_wavelength_nm = v),
        PvName::SolventRefractiveIndex => Box::new(move |m| m.solvent_refractive_index = v),
        PvName::SolventViscosity => Box::new(move |m| m.solvent_viscosity_mpas = v),
        PvName::SampleTemp => Box::new(move |m| m.sample_temp_k = v),
        _ => return Err(PvRejection::ReadOnly(pv)),
    })
}

fn flag(value: bool) -> PvValue {
    PvValue::Int(i64::from(value))
}

fn enum_value<T: IndexedEnum>(variant: T) -> PvValue {
    PvValue::Enum(variant.index() as u16)
}

fn read_value(pv: PvName, snap: &Snapshot) -> PvValue {
    let cfg = &snap.config;
    let meta = &snap.metadata;
    let status = snap.status.as_ref();
    let empty: Arc<[f64]> = Arc::from(Vec::new());
    let array = |pick: fn(&crate::types::CorrelationResult) -> &Arc<[f64]>| {
        PvValue::FloatArray(
            snap.result
                .as_deref()
                .map(|r| Arc::clone(pick(r)))
                .unwrap_or_else(|| Arc::clone(&empty)),
        )
    };

    match pv {
        PvName::CorrelationType => enum_value(cfg.correlation_type),
        PvName::Normalization => enum_value(cfg.normalization),
        PvName::MeasurementDuration => PvValue::Int(i64::from(cfg.measurement_duration_s)),
        PvName::SwapChannels => enum_value(cfg.swap_channels),
        PvName::SamplingTimeMultiT => enum_value(cfg.sampling_time),
        PvName::TransferRate => enum_value(cfg.transfer_rate),
        PvName::OverloadLimit => PvValue::Int(i64::from(cfg.overload_limit_mcps)),
        PvName::OverloadInterval => PvValue::Int(i64::from(cfg.overload_interval_ms)),
        PvName::Repetitions => PvValue::Int(i64::from(cfg.repetitions)),
        PvName::Wait => PvValue::Float(cfg.wait_between_s),
        PvName::MinTimeLag => PvValue::Float(cfg.min_time_lag_ns),
        PvName::ScatteringAngle => PvValue::Float(meta.scattering_angle_deg),
        PvName::LaserWavelength => PvValue::Float(meta.laser_wavelength_nm),
        PvName::SolventRefractiveIndex => PvValue::Float(meta.solvent_refractive_index),
        PvName::SolventViscosity => PvValue::Float(meta.solvent_viscosity_mpas),
        PvName::SampleTemp => PvValue::Float(meta.sample_temp_k),
        PvName::ExperimentName => PvValue::Str(meta.experiment_name.clone()),
        PvName::Start | PvName::Stop | PvName::Reset | PvName::Connect => PvValue::Int(0),
        PvName::State => PvValue::Enum(state_index(snap.state)),
        PvName::Connected => flag(snap.state.is_connected()),
        PvName::Running => flag(snap.state == AcquisitionState::Running),
        PvName::TakingData => flag(snap.taking_data),
        PvName::CurrentRepetition => PvValue::Int(i64::from(snap.current_repetition)),
        PvName::CorrelationFunction => array(|r| &r.correlation),
        PvName::Lags => array(|r| &r.lags),
        PvName::TraceA => array(|r| &r.trace_a),
        PvName::TraceB => array(|r| &r.trace_b),
        PvName::CountRateA => PvValue::Float(status.map_or(0.0, |s| s.count_rate_a_khz)),
        PvName::CountRateB => PvValue::Float(status.map_or(0.0, |s| s.count_rate_b_khz)),
        PvName::MonitorDiode => PvValue::Float(status.map_or(0.0, |s| s.monitor_diode_v)),
        PvName::ElapsedTime => PvValue::Float(status.map_or(0.0, |s| s.elapsed_s)),
        PvName::ErrorMsg => PvValue::Str(
            snap.last_error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
        ),
        PvName::OutputFile => PvValue::Str(
            snap.output_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
    }
}
