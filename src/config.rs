//! Configuration using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/correlator.toml` (or the file passed to [`Settings::load_from`])
//! 3. Environment variables prefixed with `LSICORR_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use lsi_correlator::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Correlator at {}", settings.instrument.endpoint());
//! # Ok::<(), lsi_correlator::error::CorrelatorError>(())
//! ```
//!
//! `LSICORR_INSTRUMENT__ADDRESS=10.0.0.12` overrides `[instrument] address`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CorrelatorError, CorrelatorResult};
use crate::storage::ExperimentMetadata;
use crate::transport::tcp::DEFAULT_PORT;
use crate::types::AcquisitionConfig;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/correlator.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "LSICORR_";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument connection
    pub instrument: InstrumentConfig,
    /// Polling loop
    pub polling: PollingConfig,
    /// Acquisition parameters pushed at startup
    pub acquisition: AcquisitionConfig,
    /// Data file output
    pub storage: StorageConfig,
    /// Default experiment description
    pub experiment: ExperimentMetadata,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "LSI Correlator".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Instrument connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Host name or IP, optionally with `:port`
    pub address: String,
    /// TCP port used when `address` has none
    pub port: u16,
    /// Firmware revision expected on the device (reported by the simulator)
    pub firmware_revision: String,
    /// Connect plus handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-command timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Use the in-process simulator instead of TCP
    pub simulate: bool,
    /// Real seconds per simulated second
    pub simulation_time_scale: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            firmware_revision: "4.0.0.3".to_string(),
            connect_timeout_ms: 5000,
            command_timeout_ms: 2000,
            simulate: false,
            simulation_time_scale: 0.01,
        }
    }
}

impl InstrumentConfig {
    /// `host:port` to dial.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            self.address.clone()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Polling loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Period between refreshes in milliseconds
    pub interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

/// Data file configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Write a data file after each completed repetition
    pub enabled: bool,
    /// Directory for user data files
    pub user_dir: PathBuf,
    /// Directory for archive copies
    pub archive_dir: PathBuf,
    /// Instrument name used in archive file names
    pub instrument_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_dir: PathBuf::from("data/user"),
            archive_dir: PathBuf::from("data/archive"),
            instrument_name: "LSICORR".to_string(),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> CorrelatorResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CorrelatorResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(CorrelatorError::from)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate settings after loading
    pub fn validate(&self) -> CorrelatorResult<()> {
        let invalid = |msg: String| Err(CorrelatorError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.instrument.address.trim().is_empty() {
            return invalid("instrument.address must not be empty".to_string());
        }
        if self.instrument.connect_timeout_ms == 0 || self.instrument.command_timeout_ms == 0 {
            return invalid("instrument timeouts must be greater than zero".to_string());
        }
        if !(self.instrument.simulation_time_scale > 0.0
            && self.instrument.simulation_time_scale.is_finite())
        {
            return invalid(format!(
                "instrument.simulation_time_scale must be positive, got {}",
                self.instrument.simulation_time_scale
            ));
        }
        if self.polling.interval_ms == 0 {
            return invalid("polling.interval_ms must be greater than zero".to_string());
        }
        if self.storage.enabled && self.storage.instrument_name.trim().is_empty() {
            return invalid("storage.instrument_name must not be empty".to_string());
        }

        self.acquisition
            .validate()
            .map_err(|e| CorrelatorError::Configuration(format!("[acquisition] {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CorrelationType, SamplingTimeMultiT};
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.instrument.endpoint(), "127.0.0.1:50000");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.polling.interval_ms, 500);
    }

    #[test]
    fn toml_overrides_nested_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[instrument]
address = "10.1.2.3:6000"
simulate = true

[acquisition]
correlation_type = "Cross"
sampling_time = "Ns400"
repetitions = 3

[experiment]
sample_temp_k = 300.5
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.instrument.endpoint(), "10.1.2.3:6000");
        assert!(settings.instrument.simulate);
        assert_eq!(settings.acquisition.correlation_type, CorrelationType::Cross);
        assert_eq!(settings.acquisition.sampling_time, SamplingTimeMultiT::Ns400);
        assert_eq!(settings.acquisition.repetitions, 3);
        assert_eq!(settings.acquisition.measurement_duration_s, 300);
        assert_eq!(settings.experiment.sample_temp_k, 300.5);
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn invalid_acquisition_defaults_rejected() {
        let mut settings = Settings::default();
        settings.acquisition.measurement_duration_s = 0;
        assert!(settings.validate().is_err());
    }
}
