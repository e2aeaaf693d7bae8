#![forbid(unsafe_code)]

//! Simulation settings loaded from YAML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RelaxationSettings {
    /// Convergence tolerance on the max-abs junction-voltage delta [mV].
    pub tolerance_mv: f64,
    pub max_iterations: u32,
}

impl Default for RelaxationSettings {
    fn default() -> Self {
        Self {
            tolerance_mv: 1e-7,
            max_iterations: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimSettings {
    /// Upper bound on the integration timestep [ms].
    pub dt_max_ms: f64,
    /// Abort when `|V|` exceeds this bound [mV]; 0 disables the check.
    #[serde(default)]
    pub check_voltage_mv: f64,
    #[serde(default)]
    pub relaxation: RelaxationSettings,
    /// Epoch length override [ms]; clamped to half the minimum delay.
    #[serde(default)]
    pub epoch_length_ms: Option<f64>,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            dt_max_ms: 0.025,
            check_voltage_mv: 0.0,
            relaxation: RelaxationSettings::default(),
            epoch_length_ms: None,
        }
    }
}

impl SimSettings {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let reader = std::fs::File::open(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: SimSettings =
            serde_yaml::from_reader(reader).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(self.dt_max_ms > 0.0) {
            return Err(SettingsError::Invalid(format!(
                "dt_max_ms must be positive, got {}",
                self.dt_max_ms
            )));
        }
        if self.check_voltage_mv < 0.0 {
            return Err(SettingsError::Invalid(
                "check_voltage_mv must be non-negative".to_string(),
            ));
        }
        if self.relaxation.max_iterations == 0 {
            return Err(SettingsError::Invalid(
                "relaxation.max_iterations must be at least 1".to_string(),
            ));
        }
        if let Some(len) = self.epoch_length_ms {
            if !(len > 0.0) {
                return Err(SettingsError::Invalid(
                    "epoch_length_ms must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn voltage_bound(&self) -> Option<f64> {
        (self.check_voltage_mv > 0.0).then_some(self.check_voltage_mv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SimSettings::default().validate().unwrap();
    }

    #[test]
    fn yaml_roundtrip_with_partial_fields() {
        let yaml = "dt_max_ms: 0.05\ncheck_voltage_mv: 500.0\n";
        let s: SimSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(s.dt_max_ms, 0.05);
        assert_eq!(s.voltage_bound(), Some(500.0));
        assert_eq!(s.relaxation.max_iterations, 8);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "dt_max_ms: 0.05\nmystery_knob: 3\n";
        assert!(serde_yaml::from_str::<SimSettings>(yaml).is_err());
    }

    #[test]
    fn non_positive_dt_is_invalid() {
        let s = SimSettings {
            dt_max_ms: 0.0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }
}
