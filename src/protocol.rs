//! Correlator line protocol.
//!
//! Protocol Overview:
//! - Format: ASCII request/reply, one reply line per request
//! - Terminator: CRLF (`\r\n`)
//! - Commands: `CONF key=value ...`, `START`, `STOP`
//! - Queries: `*IDN?`, `STAT?`, `DATA?`
//!
//! Replies are `OK`, `BUSY [text]`, `ERR <text>`, `NODATA`, an identity string, a `STAT`
//! line or a `DATA` line. Anything else is a protocol violation.
//!
//! Both the command facade (encoding requests, decoding replies) and the simulated
//! correlator (the reverse) use this module, so the two can never drift apart.

use std::fmt::Write as _;

use crate::error::{CorrelatorError, CorrelatorResult};
use crate::types::{
    AcquisitionConfig, CorrelationType, DeviceActivity, DeviceStatus, Normalization,
    RawCorrelation, SamplingTimeMultiT, SwapChannels, TransferRate, WireToken,
};

/// Line terminator appended to every request and reply.
pub const TERMINATOR: &str = "\r\n";

/// Device-side subset of [`AcquisitionConfig`] sent with `CONF`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSettings {
    /// Auto or cross correlation
    pub correlation_type: CorrelationType,
    /// Normalisation mode
    pub normalization: Normalization,
    /// Window length in seconds
    pub duration_s: u32,
    /// Channel ordering
    pub swap_channels: SwapChannels,
    /// Base sampling time
    pub sampling_time: SamplingTimeMultiT,
    /// Transfer interval
    pub transfer_rate: TransferRate,
    /// Overload limit (Mcps)
    pub overload_limit_mcps: u32,
    /// Overload evaluation interval (ms)
    pub overload_interval_ms: u32,
}

impl From<&AcquisitionConfig> for DeviceSettings {
    fn from(cfg: &AcquisitionConfig) -> Self {
        Self {
            correlation_type: cfg.correlation_type,
            normalization: cfg.normalization,
            duration_s: cfg.measurement_duration_s,
            swap_channels: cfg.swap_channels,
            sampling_time: cfg.sampling_time,
            transfer_rate: cfg.transfer_rate,
            overload_limit_mcps: cfg.overload_limit_mcps,
            overload_interval_ms: cfg.overload_interval_ms,
        }
    }
}

/// A request sent to the correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `*IDN?`
    Identify,
    /// `CONF ...`
    Configure(DeviceSettings),
    /// `START`
    Start,
    /// `STOP`
    Stop,
    /// `STAT?`
    Status,
    /// `DATA?`
    Data,
}

impl Request {
    /// Encode without terminator.
    pub fn encode(&self) -> String {
        match self {
            Request::Identify => "*IDN?".to_string(),
            Request::Configure(s) => format!(
                "CONF type={} norm={} dur={} swap={} tau={} rate={} ovl={} ovlint={}",
                s.correlation_type.token(),
                s.normalization.token(),
                s.duration_s,
                s.swap_channels.token(),
                s.sampling_time.token(),
                s.transfer_rate.token(),
                s.overload_limit_mcps,
                s.overload_interval_ms,
            ),
            Request::Start => "START".to_string(),
            Request::Stop => "STOP".to_string(),
            Request::Status => "STAT?".to_string(),
            Request::Data => "DATA?".to_string(),
        }
    }

    /// Parse a request line (device side).
    pub fn parse(line: &str) -> CorrelatorResult<Self> {
        let line = line.trim();
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        match head.to_uppercase().as_str() {
            "*IDN?" => Ok(Request::Identify),
            "START" => Ok(Request::Start),
            "STOP" => Ok(Request::Stop),
            "STAT?" => Ok(Request::Status),
            "DATA?" => Ok(Request::Data),
            "CONF" => parse_settings(rest).map(Request::Configure),
            _ => Err(CorrelatorError::Protocol(format!(
                "unknown request '{}'",
                line
            ))),
        }
    }
}

fn parse_settings(body: &str) -> CorrelatorResult<DeviceSettings> {
    let mut correlation_type = None;
    let mut normalization = None;
    let mut duration_s = None;
    let mut swap_channels = None;
    let mut sampling_time = None;
    let mut transfer_rate = None;
    let mut overload_limit_mcps = None;
    let mut overload_interval_ms = None;

    for pair in body.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CorrelatorError::Protocol(format!("malformed setting '{}'", pair)))?;
        match key {
            "type" => correlation_type = Some(token(value)?),
            "norm" => normalization = Some(token(value)?),
            "dur" => duration_s = Some(integer(key, value)?),
            "swap" => swap_channels = Some(token(value)?),
            "tau" => sampling_time = Some(token(value)?),
            "rate" => transfer_rate = Some(token(value)?),
            "ovl" => overload_limit_mcps = Some(integer(key, value)?),
            "ovlint" => overload_interval_ms = Some(integer(key, value)?),
            other => {
                return Err(CorrelatorError::Protocol(format!(
                    "unknown setting '{}'",
                    other
                )))
            }
        }
    }

    let missing = |name: &str| CorrelatorError::Protocol(format!("missing setting '{}'", name));
    Ok(DeviceSettings {
        correlation_type: correlation_type.ok_or_else(|| missing("type"))?,
        normalization: normalization.ok_or_else(|| missing("norm"))?,
        duration_s: duration_s.ok_or_else(|| missing("dur"))?,
        swap_channels: swap_channels.ok_or_else(|| missing("swap"))?,
        sampling_time: sampling_time.ok_or_else(|| missing("tau"))?,
        transfer_rate: transfer_rate.ok_or_else(|| missing("rate"))?,
        overload_limit_mcps: overload_limit_mcps.ok_or_else(|| missing("ovl"))?,
        overload_interval_ms: overload_interval_ms.ok_or_else(|| missing("ovlint"))?,
    })
}

fn token<T: WireToken>(value: &str) -> CorrelatorResult<T> {
    T::from_token(value)
        .ok_or_else(|| CorrelatorError::Protocol(format!("unknown value '{}'", value)))
}

fn integer(key: &str, value: &str) -> CorrelatorResult<u32> {
    value
        .parse()
        .map_err(|_| CorrelatorError::Protocol(format!("'{}' expects an integer, got '{}'", key, value)))
}

/// A reply from the correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Command accepted
    Ok,
    /// Device busy, optional detail
    Busy(String),
    /// Command refused with device text
    Err(String),
    /// Identity string from `*IDN?`
    Identity(String),
    /// Status from `STAT?`
    Status(DeviceStatus),
    /// First accumulation window not finished
    NoData,
    /// Correlation arrays from `DATA?`
    Data(RawCorrelation),
}

impl Reply {
    /// Encode without terminator (device side).
    pub fn encode(&self) -> String {
        match self {
            Reply::Ok => "OK".to_string(),
            Reply::Busy(detail) if detail.is_empty() => "BUSY".to_string(),
            Reply::Busy(detail) => format!("BUSY {}", detail),
            Reply::Err(text) => format!("ERR {}", text),
            Reply::Identity(id) => id.clone(),
            Reply::Status(s) => format!(
                "STAT {} elapsed={} cra={} crb={} mon={}",
                match s.activity {
                    DeviceActivity::Measuring => "RUNNING",
                    DeviceActivity::Idle => "IDLE",
                },
                s.elapsed_s,
                s.count_rate_a_khz,
                s.count_rate_b_khz,
                s.monitor_diode_v,
            ),
            Reply::NoData => "NODATA".to_string(),
            Reply::Data(raw) => format!(
                "DATA lags={};corr={};tra={};trb={}",
                join(&raw.lags),
                join(&raw.correlation),
                join(&raw.trace_a),
                join(&raw.trace_b),
            ),
        }
    }

    /// Parse a reply line to `request`.
    ///
    /// The request decides how free-form replies (the identity string) are read.
    pub fn parse(request: &Request, line: &str) -> CorrelatorResult<Self> {
        let line = line.trim();
        if line == "OK" {
            return Ok(Reply::Ok);
        }
        if line == "NODATA" {
            return Ok(Reply::NoData);
        }
        if line == "BUSY" {
            return Ok(Reply::Busy(String::new()));
        }
        if let Some(detail) = line.strip_prefix("BUSY ") {
            return Ok(Reply::Busy(detail.trim().to_string()));
        }
        if line == "ERR" {
            return Ok(Reply::Err(String::new()));
        }
        if let Some(text) = line.strip_prefix("ERR ") {
            return Ok(Reply::Err(text.trim().to_string()));
        }
        if let Some(body) = line.strip_prefix("STAT ") {
            return parse_status(body).map(Reply::Status);
        }
        if let Some(body) = line.strip_prefix("DATA ") {
            return parse_data(body).map(Reply::Data);
        }
        if *request == Request::Identify && !line.is_empty() {
            return Ok(Reply::Identity(line.to_string()));
        }
        Err(CorrelatorError::Protocol(format!(
            "unexpected reply '{}' to '{}'",
            line,
            request.encode()
        )))
    }
}

fn join(values: &[f64]) -> String {
    let mut out = String::with_capacity(values.len() * 12);
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}", v);
    }
    out
}

fn parse_status(body: &str) -> CorrelatorResult<DeviceStatus> {
    let mut parts = body.split_whitespace();
    let activity = match parts.next() {
        Some("RUNNING") => DeviceActivity::Measuring,
        Some("IDLE") => DeviceActivity::Idle,
        other => {
            return Err(CorrelatorError::Protocol(format!(
                "bad status activity {:?}",
                other
            )))
        }
    };

    let mut status = DeviceStatus {
        activity,
        elapsed_s: 0.0,
        count_rate_a_khz: 0.0,
        count_rate_b_khz: 0.0,
        monitor_diode_v: 0.0,
    };
    for pair in parts {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CorrelatorError::Protocol(format!("malformed status field '{}'", pair)))?;
        let value: f64 = value
            .parse()
            .map_err(|_| CorrelatorError::Protocol(format!("bad number in '{}'", pair)))?;
        match key {
            "elapsed" => status.elapsed_s = value,
            "cra" => status.count_rate_a_khz = value,
            "crb" => status.count_rate_b_khz = value,
            "mon" => status.monitor_diode_v = value,
            // Newer firmware may add fields; ignore what we do not know.
            _ => {}
        }
    }
    Ok(status)
}

fn parse_data(body: &str) -> CorrelatorResult<RawCorrelation> {
    let mut raw = RawCorrelation::default();
    for section in body.split(';') {
        let (key, values) = section
            .split_once('=')
            .ok_or_else(|| CorrelatorError::Protocol(format!("malformed data section '{}'", section)))?;
        let parsed = parse_csv(values)?;
        match key.trim() {
            "lags" => raw.lags = parsed,
            "corr" => raw.correlation = parsed,
            "tra" => raw.trace_a = parsed,
            "trb" => raw.trace_b = parsed,
            other => {
                return Err(CorrelatorError::Protocol(format!(
                    "unknown data section '{}'",
                    other
                )))
            }
        }
    }
    if raw.lags.len() != raw.correlation.len() {
        return Err(CorrelatorError::Protocol(format!(
            "lag/correlation length mismatch ({} vs {})",
            raw.lags.len(),
            raw.correlation.len()
        )));
    }
    Ok(raw)
}

fn parse_csv(values: &str) -> CorrelatorResult<Vec<f64>> {
    if values.trim().is_empty() {
        return Ok(Vec::new());
    }
    values
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| CorrelatorError::Protocol(format!("bad number '{}'", v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_request_encodes_all_device_fields() {
        let cfg = AcquisitionConfig::default();
        let line = Request::Configure(DeviceSettings::from(&cfg)).encode();
        assert_eq!(
            line,
            "CONF type=AUTO norm=COMP dur=300 swap=AB tau=200 rate=100 ovl=20 ovlint=400"
        );
        assert_eq!(
            Request::parse(&line).unwrap(),
            Request::Configure(DeviceSettings::from(&cfg))
        );
    }

    #[test]
    fn configure_request_missing_field_is_protocol_error() {
        let err = Request::parse("CONF type=AUTO").unwrap_err();
        assert!(err.to_string().contains("missing setting"));
    }

    #[test]
    fn reply_error_text_is_preserved() {
        let reply = Reply::parse(&Request::Start, "ERR LASER INTERLOCK OPEN\r\n").unwrap();
        assert_eq!(reply, Reply::Err("LASER INTERLOCK OPEN".into()));
    }

    #[test]
    fn reply_starting_with_err_is_not_an_error() {
        let reply = Reply::parse(&Request::Identify, "ERRATIC,CORRELATOR,1.0").unwrap();
        assert_eq!(reply, Reply::Identity("ERRATIC,CORRELATOR,1.0".into()));
        assert_eq!(
            Reply::parse(&Request::Start, "ERR").unwrap(),
            Reply::Err(String::new())
        );
        assert!(Reply::parse(&Request::Start, "ERRNO 5").is_err());
    }

    #[test]
    fn status_reply_parses_rates() {
        let reply = Reply::parse(
            &Request::Status,
            "STAT RUNNING elapsed=2.5 cra=101.5 crb=99 mon=0.25",
        )
        .unwrap();
        match reply {
            Reply::Status(s) => {
                assert_eq!(s.activity, DeviceActivity::Measuring);
                assert!((s.elapsed_s - 2.5).abs() < 1e-12);
                assert!((s.count_rate_b_khz - 99.0).abs() < 1e-12);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn data_reply_keeps_nan_entries() {
        let reply = Reply::parse(&Request::Data, "DATA lags=1e-7,2e-7;corr=0.5,NaN;tra=;trb=").unwrap();
        match reply {
            Reply::Data(raw) => {
                assert_eq!(raw.lags.len(), 2);
                assert!(raw.correlation[1].is_nan());
                assert!(raw.trace_a.is_empty());
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn data_length_mismatch_rejected() {
        assert!(Reply::parse(&Request::Data, "DATA lags=1,2;corr=0.5").is_err());
    }

    #[test]
    fn garbage_reply_is_protocol_error() {
        let err = Reply::parse(&Request::Stop, "WHAT").unwrap_err();
        assert!(err.is_transport_fault());
    }
}
