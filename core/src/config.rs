//! Run configuration.
//!
//! An [`OdometryConfig`] is built once (from defaults or a file) and passed by reference to the
//! measurement adapters and the fusion loop. Files are JSON, YAML or TOML, chosen by extension.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::NOISE_SIZE;
use crate::error::{OdometryError, Result};
use crate::fusion::FusionOptions;
use crate::sensors::{OrientationSensorConfig, PositionFixConfig, VelocitySensorConfig};
use crate::stream::SensorKind;

/// Process-noise shaping for the constant-velocity model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Unmodeled acceleration stdevs for surge, sway, heave (m/s²) and yaw (rad/s²)
    pub acceleration_stdevs: [f64; NOISE_SIZE],
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            acceleration_stdevs: [0.1, 0.05, 0.1, 0.25],
        }
    }
}

/// Where the raw sensor logs live and how they are delimited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogPaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_fix: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<PathBuf>,
    /// Field separator; repeated separators count as one
    pub delimiter: char,
    /// Read at most this many rows from each log
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

impl Default for LogPaths {
    fn default() -> Self {
        LogPaths {
            velocity: None,
            orientation: None,
            position_fix: None,
            scan: None,
            delimiter: ' ',
            max_rows: None,
        }
    }
}

impl LogPaths {
    pub fn path(&self, kind: SensorKind) -> Option<&Path> {
        match kind {
            SensorKind::Velocity => self.velocity.as_deref(),
            SensorKind::Orientation => self.orientation.as_deref(),
            SensorKind::PositionFix => self.position_fix.as_deref(),
            SensorKind::Scan => self.scan.as_deref(),
        }
    }

    pub fn set_path(&mut self, kind: SensorKind, path: PathBuf) {
        let slot = match kind {
            SensorKind::Velocity => &mut self.velocity,
            SensorKind::Orientation => &mut self.orientation,
            SensorKind::PositionFix => &mut self.position_fix,
            SensorKind::Scan => &mut self.scan,
        };
        *slot = Some(path);
    }

    /// Relative log paths are resolved against `base`, typically the config file's directory.
    pub fn resolve_against(&mut self, base: &Path) {
        for slot in [
            &mut self.velocity,
            &mut self.orientation,
            &mut self.position_fix,
            &mut self.scan,
        ] {
            if let Some(p) = slot.as_mut().filter(|p| p.is_relative()) {
                *p = base.join(&*p);
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryConfig {
    pub velocity: VelocitySensorConfig,
    pub orientation: OrientationSensorConfig,
    pub position: PositionFixConfig,
    pub filter: FilterConfig,
    pub fusion: FusionOptions,
    pub logs: LogPaths,
}

fn check_stdevs(name: &str, values: &[f64]) -> Result<()> {
    if values.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(OdometryError::Config(format!(
            "{name} must be positive and finite, got {values:?}"
        )));
    }
    Ok(())
}

impl OdometryConfig {
    /// Reject settings that would make the filter ill-posed.
    pub fn validate(&self) -> Result<()> {
        check_stdevs("filter.acceleration_stdevs", &self.filter.acceleration_stdevs)?;
        check_stdevs("velocity.bottom_lock_stdev", &self.velocity.bottom_lock_stdev)?;
        check_stdevs("velocity.water_track_stdev", &self.velocity.water_track_stdev)?;
        check_stdevs("velocity.depth_stdev", &[self.velocity.depth_stdev])?;
        check_stdevs(
            "orientation",
            &[self.orientation.yaw_stdev, self.orientation.yaw_rate_stdev],
        )?;
        check_stdevs("position.horizontal_stdev", &[self.position.horizontal_stdev])?;
        if !self.velocity.velocity_scale.is_finite() || !self.velocity.depth_scale.is_finite() {
            return Err(OdometryError::Config(
                "velocity calibration must be finite".to_string(),
            ));
        }
        if let Some(v) = self.fusion.bootstrap_unobserved_variance {
            if !v.is_finite() || v < 0.0 {
                return Err(OdometryError::Config(format!(
                    "bootstrap_unobserved_variance must be non-negative, got {v}"
                )));
            }
        }
        if self.logs.delimiter == '\n' || !self.logs.delimiter.is_ascii() {
            return Err(OdometryError::Config(format!(
                "unusable log delimiter {:?}",
                self.logs.delimiter
            )));
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }

    /// Read, resolve relative log paths against the file's directory, and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let mut config = Self::from_file(p)?;
        if let Some(dir) = p.parent() {
            config.logs.resolve_against(dir);
        }
        config.validate()?;
        Ok(config)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported file extension: {}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ExhaustionPolicy;
    use std::f64::consts::PI;
    use tempfile::tempdir;

    fn customized() -> OdometryConfig {
        let mut config = OdometryConfig::default();
        config.fusion.correct_with_water_track = true;
        config.fusion.exhaustion_policy = ExhaustionPolicy::StopAtFirst;
        config.fusion.bootstrap_unobserved_variance = Some(4.0);
        config.position.origin = Some([41.7, 3.0]);
        config.logs.delimiter = ',';
        config.logs.velocity = Some(PathBuf::from("dvl.log"));
        config.filter.acceleration_stdevs = [0.2, 0.1, 0.2, 0.5];
        config
    }

    #[test]
    fn defaults_match_the_deployment() {
        let config = OdometryConfig::default();
        assert_eq!(config.filter.acceleration_stdevs, [0.1, 0.05, 0.1, 0.25]);
        assert_eq!(config.velocity.mounting.roll, PI);
        assert_eq!(config.velocity.mounting.yaw, PI / 3.0);
        assert_eq!(config.orientation.mounting.yaw, -PI / 2.0);
        assert!(!config.fusion.correct_with_water_track);
        assert!(!config.fusion.correct_with_position_fix);
        assert!(!config.fusion.observe_yaw_rate);
        assert_eq!(config.fusion.exhaustion_policy, ExhaustionPolicy::DrainRemaining);
        assert_eq!(config.logs.delimiter, ' ');
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_round_trip_by_extension() {
        let dir = tempdir().unwrap();
        let config = customized();
        for name in ["config.json", "config.yaml", "config.yml", "config.toml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let read = OdometryConfig::from_file(&path).unwrap();
            assert_eq!(read, config, "{name}");
        }
    }

    #[test]
    fn unsupported_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.ini");
        let err = OdometryConfig::default().to_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = OdometryConfig::from_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[fusion]\nobserve_yaw_rate = true\n").unwrap();
        let config = OdometryConfig::from_file(&path).unwrap();
        assert!(config.fusion.observe_yaw_rate);
        assert_eq!(config.filter, FilterConfig::default());
        assert_eq!(config.velocity, VelocitySensorConfig::default());
    }

    #[test]
    fn load_resolves_relative_log_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        customized().to_file(&path).unwrap();
        let config = OdometryConfig::load(&path).unwrap();
        assert_eq!(config.logs.velocity, Some(dir.path().join("dvl.log")));
        assert_eq!(config.logs.path(SensorKind::Orientation), None);
    }

    #[test]
    fn validation_rejects_bad_noise() {
        let mut config = OdometryConfig::default();
        config.filter.acceleration_stdevs[2] = 0.0;
        assert!(matches!(config.validate(), Err(OdometryError::Config(_))));

        let mut config = OdometryConfig::default();
        config.velocity.depth_stdev = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = OdometryConfig::default();
        config.fusion.bootstrap_unobserved_variance = Some(-1.0);
        assert!(config.validate().is_err());
    }
}
