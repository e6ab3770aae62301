//! Correlator data model.
//!
//! Holds the acquisition parameters the operator can change, the acquisition state the
//! state machine reports, and the immutable correlation results produced by each refresh.
//!
//! The parameter enums mirror the correlator's own option lists. Their declaration order is
//! significant: process-variable enum fields are read and written as the variant index, so
//! reordering a variant is a breaking change for every client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{CorrelatorError, CorrelatorResult, ErrorKind};

/// Seconds between consecutive points of the count-rate trace.
pub const TRACE_TIME_STEP_S: f64 = 0.0524288;

/// Parameter enum addressable by position, as used by enum process variables.
pub trait IndexedEnum: Copy + Sized + 'static {
    /// All variants in process-variable order.
    const VARIANTS: &'static [Self];

    /// Position of this variant in [`IndexedEnum::VARIANTS`].
    fn index(self) -> usize;

    /// Variant at `index`, if any.
    fn from_index(index: usize) -> Option<Self> {
        Self::VARIANTS.get(index).copied()
    }
}

/// Token used for a parameter on the instrument wire.
pub trait WireToken: Sized {
    /// Encoded form sent to the correlator.
    fn token(&self) -> &'static str;

    /// Parse the encoded form.
    fn from_token(token: &str) -> Option<Self>;
}

macro_rules! parameter_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $token:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl IndexedEnum for $name {
            const VARIANTS: &'static [Self] = &[$( $name::$variant ),+];

            fn index(self) -> usize {
                Self::VARIANTS
                    .iter()
                    .position(|v| *v == self)
                    .unwrap_or_default()
            }
        }

        impl WireToken for $name {
            fn token(&self) -> &'static str {
                match self {
                    $( $name::$variant => $token ),+
                }
            }

            fn from_token(token: &str) -> Option<Self> {
                match token {
                    $( $token => Some($name::$variant), )+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        }
    };
}

parameter_enum! {
    /// Which channels are correlated.
    CorrelationType {
        /// Auto-correlation of a single channel
        Auto => "AUTO",
        /// Cross-correlation between channel A and B
        Cross => "CROSS",
    }
}

parameter_enum! {
    /// Normalisation applied by the correlator.
    Normalization {
        /// Compensated normalisation
        Compensated => "COMP",
        /// Uncompensated normalisation
        Uncompensated => "UNCOMP",
    }
}

parameter_enum! {
    /// Input channel ordering.
    #[allow(non_camel_case_types)]
    SwapChannels {
        /// Channel A first
        ChA_ChB => "AB",
        /// Channel B first
        ChB_ChA => "BA",
    }
}

parameter_enum! {
    /// Base sampling time of the multi-tau correlator.
    SamplingTimeMultiT {
        /// 12.5 ns
        Ns12_5 => "12.5",
        /// 200 ns
        Ns200 => "200",
        /// 400 ns
        Ns400 => "400",
        /// 800 ns
        Ns800 => "800",
        /// 1.6 us
        Ns1600 => "1600",
        /// 3.2 us
        Ns3200 => "3200",
        /// 6.4 us
        Ns6400 => "6400",
        /// 12.8 us
        Ns12800 => "12800",
        /// 25.6 us
        Ns25600 => "25600",
        /// 51.2 us
        Ns51200 => "51200",
        /// 102.4 us
        Ns102400 => "102400",
        /// 204.8 us
        Ns204800 => "204800",
        /// 409.6 us
        Ns409600 => "409600",
        /// 819.2 us
        Ns819200 => "819200",
        /// 1.6384 ms
        Ns1638400 => "1638400",
        /// 3.2768 ms
        Ns3276800 => "3276800",
        /// 6.5536 ms
        Ns6553600 => "6553600",
        /// 13.1072 ms
        Ns13107200 => "13107200",
        /// 26.2144 ms
        Ns26214400 => "26214400",
    }
}

impl SamplingTimeMultiT {
    /// Base sampling time in seconds.
    pub fn as_seconds(self) -> f64 {
        // Tokens are nanosecond counts, so the parse cannot fail for a declared variant.
        self.token().parse::<f64>().unwrap_or_default() * 1e-9
    }
}

parameter_enum! {
    /// Interval at which the correlator pushes intermediate data.
    TransferRate {
        /// 100 ms
        Ms100 => "100",
        /// 150 ms
        Ms150 => "150",
        /// 200 ms
        Ms200 => "200",
        /// 250 ms
        Ms250 => "250",
        /// 300 ms
        Ms300 => "300",
        /// 375 ms
        Ms375 => "375",
        /// 500 ms
        Ms500 => "500",
        /// 750 ms
        Ms750 => "750",
        /// 1000 ms
        Ms1000 => "1000",
        /// 1500 ms
        Ms1500 => "1500",
        /// 2000 ms
        Ms2000 => "2000",
    }
}

// =============================================================================
// AcquisitionConfig
// =============================================================================

/// Acquisition parameters.
///
/// Only mutable while the state machine is `Idle`; see
/// [`AcquisitionMachine::configure`](crate::acquisition::AcquisitionMachine::configure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Auto or cross correlation
    pub correlation_type: CorrelationType,
    /// Normalisation mode
    pub normalization: Normalization,
    /// Length of one measurement window in seconds
    pub measurement_duration_s: u32,
    /// Input channel ordering
    pub swap_channels: SwapChannels,
    /// Multi-tau base sampling time
    pub sampling_time: SamplingTimeMultiT,
    /// Data transfer interval
    pub transfer_rate: TransferRate,
    /// Count rate (Mcps) above which the detector is considered overloaded
    pub overload_limit_mcps: u32,
    /// Interval (ms) over which the overload limit is evaluated
    pub overload_interval_ms: u32,
    /// Number of measurement windows per run (averaging count)
    pub repetitions: u32,
    /// Pause between repetitions in seconds
    pub wait_between_s: f64,
    /// Lags shorter than this (ns) are dropped from published results
    pub min_time_lag_ns: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            correlation_type: CorrelationType::Auto,
            normalization: Normalization::Compensated,
            measurement_duration_s: 300,
            swap_channels: SwapChannels::ChA_ChB,
            sampling_time: SamplingTimeMultiT::Ns200,
            transfer_rate: TransferRate::Ms100,
            overload_limit_mcps: 20,
            overload_interval_ms: 400,
            repetitions: 1,
            wait_between_s: 0.0,
            min_time_lag_ns: 0.0,
        }
    }
}

impl AcquisitionConfig {
    /// Check values that can be rejected without asking the device.
    pub fn validate(&self) -> CorrelatorResult<()> {
        if self.measurement_duration_s == 0 {
            return Err(CorrelatorError::Validation(
                "measurement_duration_s must be at least 1".into(),
            ));
        }
        if self.repetitions == 0 {
            return Err(CorrelatorError::Validation(
                "repetitions must be at least 1".into(),
            ));
        }
        if !self.wait_between_s.is_finite() || self.wait_between_s < 0.0 {
            return Err(CorrelatorError::Validation(format!(
                "wait_between_s must be a non-negative number, got {}",
                self.wait_between_s
            )));
        }
        if !self.min_time_lag_ns.is_finite() || self.min_time_lag_ns < 0.0 {
            return Err(CorrelatorError::Validation(format!(
                "min_time_lag_ns must be a non-negative number, got {}",
                self.min_time_lag_ns
            )));
        }
        Ok(())
    }

    /// Minimum lag in seconds.
    pub fn min_time_lag_s(&self) -> f64 {
        self.min_time_lag_ns * 1e-9
    }
}

// =============================================================================
// AcquisitionState
// =============================================================================

/// Acquisition state owned by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// No transport handle is open
    Disconnected,
    /// Connected and ready to configure or start
    Idle,
    /// Start command in flight
    Starting,
    /// Device is acquiring; refreshes update the cached result
    Running,
    /// Stop command in flight
    Stopping,
    /// A transport fault occurred; `reset()` is required
    Error,
}

impl AcquisitionState {
    /// Whether a transport handle is expected to be live in this state.
    pub fn is_connected(self) -> bool {
        !matches!(self, AcquisitionState::Disconnected | AcquisitionState::Error)
    }

    /// Whether an acquisition is in progress.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AcquisitionState::Starting | AcquisitionState::Running | AcquisitionState::Stopping
        )
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AcquisitionState::Disconnected => "Disconnected",
            AcquisitionState::Idle => "Idle",
            AcquisitionState::Starting => "Starting",
            AcquisitionState::Running => "Running",
            AcquisitionState::Stopping => "Stopping",
            AcquisitionState::Error => "Error",
        };
        f.write_str(label)
    }
}

// =============================================================================
// Device readings
// =============================================================================

/// Whether the correlator reports a measurement window in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceActivity {
    /// Measurement window running
    Measuring,
    /// No measurement in progress
    Idle,
}

/// Live status reported by `STAT?`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device-side activity
    pub activity: DeviceActivity,
    /// Seconds since the current window started
    pub elapsed_s: f64,
    /// Channel A count rate in kHz
    pub count_rate_a_khz: f64,
    /// Channel B count rate in kHz
    pub count_rate_b_khz: f64,
    /// Monitor diode reading in volts
    pub monitor_diode_v: f64,
}

/// Raw arrays returned by `DATA?` before filtering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawCorrelation {
    /// Lag times in seconds
    pub lags: Vec<f64>,
    /// Correlation values (g2 - 1), may contain non-finite entries
    pub correlation: Vec<f64>,
    /// Channel A count-rate trace in kHz
    pub trace_a: Vec<f64>,
    /// Channel B count-rate trace in kHz
    pub trace_b: Vec<f64>,
}

// =============================================================================
// CorrelationResult
// =============================================================================

/// One immutable correlation function with its acquisition metadata.
///
/// Each refresh replaces the cached result as a whole; readers hold an `Arc` to a
/// complete value and never see a partial update.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    /// Lag times in seconds, ascending
    pub lags: Arc<[f64]>,
    /// Correlation values, one per lag
    pub correlation: Arc<[f64]>,
    /// Channel A count-rate trace (kHz)
    pub trace_a: Arc<[f64]>,
    /// Channel B count-rate trace (kHz)
    pub trace_b: Arc<[f64]>,
    /// Time axis of the traces in seconds
    pub trace_time: Arc<[f64]>,
    /// When this result was captured
    pub timestamp: DateTime<Utc>,
    /// Seconds into the measurement window
    pub elapsed_s: f64,
    /// Channel A count rate at capture (kHz)
    pub count_rate_a_khz: f64,
    /// Channel B count rate at capture (kHz)
    pub count_rate_b_khz: f64,
    /// Repetition (1-based) this result belongs to
    pub repetition: u32,
    /// True once the measurement window finished and the values are final
    pub complete: bool,
}

impl CorrelationResult {
    /// Build a result from raw device arrays.
    ///
    /// Points with a non-finite correlation value are dropped along with their lag, as are
    /// lags shorter than `min_time_lag_s`.
    pub fn from_raw(
        raw: RawCorrelation,
        status: &DeviceStatus,
        min_time_lag_s: f64,
        repetition: u32,
        complete: bool,
    ) -> Self {
        let (lags, correlation): (Vec<f64>, Vec<f64>) = raw
            .lags
            .iter()
            .zip(raw.correlation.iter())
            .filter(|(lag, value)| value.is_finite() && **lag >= min_time_lag_s)
            .map(|(lag, value)| (*lag, *value))
            .unzip();

        let trace_time: Vec<f64> = (0..raw.trace_a.len())
            .map(|i| i as f64 * TRACE_TIME_STEP_S)
            .collect();

        Self {
            lags: lags.into(),
            correlation: correlation.into(),
            trace_a: raw.trace_a.into(),
            trace_b: raw.trace_b.into(),
            trace_time: trace_time.into(),
            timestamp: Utc::now(),
            elapsed_s: status.elapsed_s,
            count_rate_a_khz: status.count_rate_a_khz,
            count_rate_b_khz: status.count_rate_b_khz,
            repetition,
            complete,
        }
    }

    /// Number of (lag, value) pairs.
    pub fn len(&self) -> usize {
        self.lags.len()
    }

    /// True when filtering left no points.
    pub fn is_empty(&self) -> bool {
        self.lags.is_empty()
    }

    /// Iterate over (lag, value) pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.lags.iter().copied().zip(self.correlation.iter().copied())
    }

    /// Mean of the channel A trace, or 0 for an empty trace.
    pub fn mean_trace_a(&self) -> f64 {
        mean(&self.trace_a)
    }

    /// Mean of the channel B trace, or 0 for an empty trace.
    pub fn mean_trace_b(&self) -> f64 {
        mean(&self.trace_b)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// =============================================================================
// ErrorRecord
// =============================================================================

/// Last failure seen by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Capture an error now.
    pub fn from_error(err: &CorrelatorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            timestamp: Utc::now(),
        }
    }
}
