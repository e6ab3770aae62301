//! Correlation data files.
//!
//! Each completed repetition is written twice in the correlator's native text layout: once
//! to the user directory under the experiment name, once to the archive directory under the
//! instrument name. The layout is a fixed header (date, sample and optics metadata, average
//! count rates), the `Lag time (s) / g2-1` table and the count-rate history table.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CorrelatorError, CorrelatorResult};
use crate::types::CorrelationResult;

/// Sample and optics description written into every data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentMetadata {
    /// Scattering angle in degrees
    pub scattering_angle_deg: f64,
    /// Laser wavelength in nm
    pub laser_wavelength_nm: f64,
    /// Refractive index of the solvent
    pub solvent_refractive_index: f64,
    /// Solvent viscosity in mPa·s
    pub solvent_viscosity_mpas: f64,
    /// Sample temperature in K
    pub sample_temp_k: f64,
    /// Free-text experiment name, used for the user file name
    pub experiment_name: String,
}

impl Default for ExperimentMetadata {
    fn default() -> Self {
        Self {
            scattering_angle_deg: 110.0,
            laser_wavelength_nm: 642.0,
            solvent_refractive_index: 1.33,
            solvent_viscosity_mpas: 1.0,
            sample_temp_k: 298.0,
            experiment_name: String::new(),
        }
    }
}

/// Paths produced by one [`DataFileWriter::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFiles {
    /// File in the user directory
    pub user: PathBuf,
    /// File in the archive directory
    pub archive: PathBuf,
}

/// Writes completed correlation results to disk.
#[derive(Debug, Clone)]
pub struct DataFileWriter {
    user_dir: PathBuf,
    archive_dir: PathBuf,
    instrument_name: String,
}

impl DataFileWriter {
    /// Create a writer; directories are created on first write.
    pub fn new(
        user_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        instrument_name: impl Into<String>,
    ) -> Self {
        Self {
            user_dir: user_dir.into(),
            archive_dir: archive_dir.into(),
            instrument_name: instrument_name.into(),
        }
    }

    /// Write `result` to the user and archive directories.
    pub fn write(
        &self,
        result: &CorrelationResult,
        metadata: &ExperimentMetadata,
        duration_s: u32,
    ) -> CorrelatorResult<SavedFiles> {
        let now = Local::now();
        let body = render(result, metadata, duration_s, now);
        let stamp = now.format("%Y-%m-%dT%H_%M_%S");

        let experiment = match sanitize(&metadata.experiment_name) {
            name if name.is_empty() => "correlator".to_string(),
            name => name,
        };
        let user = self
            .user_dir
            .join(format!("{}_{}_{}.dat", experiment, stamp, result.repetition));
        let archive = self.archive_dir.join(format!(
            "{}_DLS_{}_{}.txt",
            sanitize(&self.instrument_name),
            stamp,
            result.repetition
        ));

        write_file(&user, &body)?;
        write_file(&archive, &body)?;
        Ok(SavedFiles { user, archive })
    }
}

fn write_file(path: &Path, body: &str) -> CorrelatorResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, body).map_err(|e| {
        CorrelatorError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to write {}: {}", path.display(), e),
        ))
    })
}

/// Keep ASCII alphanumerics, `-` and `_`; everything else becomes `_`.
pub fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Render a result in the correlator's text layout.
pub fn render(
    result: &CorrelationResult,
    metadata: &ExperimentMetadata,
    duration_s: u32,
    when: DateTime<Local>,
) -> String {
    let mut out = String::with_capacity(64 * (result.len() + result.trace_a.len() + 24));

    let _ = writeln!(out, "{}", when.format("%m/%d/%Y\t%H:%M %p"));
    out.push_str("Pseudo Cross Correlation\n");
    let _ = writeln!(out, "Scattering angle:\t{:.1}", metadata.scattering_angle_deg);
    let _ = writeln!(out, "Duration (s):\t{}", duration_s);
    let _ = writeln!(out, "Wavelength (nm):\t{:.1}", metadata.laser_wavelength_nm);
    let _ = writeln!(
        out,
        "Refractive index:\t{:.3}",
        metadata.solvent_refractive_index
    );
    let _ = writeln!(out, "Viscosity (mPas):\t{:.3}", metadata.solvent_viscosity_mpas);
    let _ = writeln!(out, "Temperature (K):\t{:.1}", metadata.sample_temp_k);
    out.push_str("Laser intensity (mW):\t0.0\n");
    let _ = writeln!(out, "Average Count rate A (kHz):\t{:.1}", result.mean_trace_a());
    let _ = writeln!(out, "Average Count rate B (kHz):\t{:.1}", result.mean_trace_b());
    out.push_str("Intercept:\t1.0000\n");
    out.push_str("Cumulant 1st\t-Inf\n");
    out.push_str("Cumulant 2nd\t-Inf\tNaN\n");
    out.push_str("Cumulant 3rd\t-Inf\tNaN\n");

    out.push_str("\nLag time (s)         g2-1\n");
    for (lag, value) in result.pairs() {
        let _ = writeln!(out, "{}\t{}", scientific(lag), scientific(value));
    }

    out.push_str("\nCount Rate History (KHz)  CR CHA / CR CHB\n");
    for ((t, a), b) in result
        .trace_time
        .iter()
        .zip(result.trace_a.iter())
        .zip(result.trace_b.iter())
    {
        let _ = writeln!(out, "{:.6}\t{:.6}\t{:.6}", t, a, b);
    }
    out
}

/// `%1.6e` formatting: six fraction digits, signed two-digit exponent.
fn scientific(value: f64) -> String {
    let formatted = format!("{:.6e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceActivity, DeviceStatus, RawCorrelation, TRACE_TIME_STEP_S};
    use chrono::TimeZone;

    fn result() -> CorrelationResult {
        let status = DeviceStatus {
            activity: DeviceActivity::Idle,
            elapsed_s: 10.0,
            count_rate_a_khz: 100.0,
            count_rate_b_khz: 90.0,
            monitor_diode_v: 0.2,
        };
        let raw = RawCorrelation {
            lags: vec![2e-7, 4e-7],
            correlation: vec![0.81234567, 0.5],
            trace_a: vec![100.0, 102.0],
            trace_b: vec![90.0, 94.0],
        };
        CorrelationResult::from_raw(raw, &status, 0.0, 2, true)
    }

    #[test]
    fn scientific_matches_printf() {
        assert_eq!(scientific(2e-7), "2.000000e-07");
        assert_eq!(scientific(0.81234567), "8.123457e-01");
        assert_eq!(scientific(12345.0), "1.234500e+04");
    }

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize("my run #3/a"), "my_run__3_a");
        assert_eq!(sanitize("  ok-name_1 "), "ok-name_1");
    }

    #[test]
    fn render_has_native_layout() {
        let when = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap();
        let text = render(&result(), &ExperimentMetadata::default(), 10, when);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "03/05/2024\t14:07 PM");
        assert_eq!(lines[1], "Pseudo Cross Correlation");
        assert_eq!(lines[2], "Scattering angle:\t110.0");
        assert_eq!(lines[3], "Duration (s):\t10");
        assert_eq!(lines[5], "Refractive index:\t1.330");
        assert_eq!(lines[9], "Average Count rate A (kHz):\t101.0");
        assert_eq!(lines[10], "Average Count rate B (kHz):\t92.0");
        assert_eq!(lines[16], "Lag time (s)         g2-1");
        assert_eq!(lines[17], "2.000000e-07\t8.123457e-01");
        assert_eq!(lines[20], "Count Rate History (KHz)  CR CHA / CR CHB");
        assert_eq!(
            lines[22],
            format!("{:.6}\t102.000000\t94.000000", TRACE_TIME_STEP_S)
        );
    }

    #[test]
    fn write_creates_user_and_archive_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DataFileWriter::new(dir.path().join("user"), dir.path().join("archive"), "LSICORR");
        let metadata = ExperimentMetadata {
            experiment_name: "silica spheres".into(),
            ..Default::default()
        };

        let saved = writer.write(&result(), &metadata, 10).unwrap();
        let user_name = saved.user.file_name().unwrap().to_string_lossy().to_string();
        let archive_name = saved.archive.file_name().unwrap().to_string_lossy().to_string();

        assert!(user_name.starts_with("silica_spheres_"));
        assert!(user_name.ends_with("_2.dat"));
        assert!(archive_name.starts_with("LSICORR_DLS_"));
        assert!(archive_name.ends_with("_2.txt"));
        assert_eq!(
            fs::read_to_string(&saved.user).unwrap(),
            fs::read_to_string(&saved.archive).unwrap()
        );
    }
}
