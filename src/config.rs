//! # Run Configuration
//!
//! TOML-backed configuration for a full fit-and-aggregate run. Every
//! field has a default, so a config file only states what differs:
//!
//! ```toml
//! store_path = "survey_run"
//! nchunks = 8
//! lnz_threshold = 11.0
//! ncomp_max = 2
//! std_pix = 1.5
//!
//! [sampler]
//! n_live = 120
//! seed = 5
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sampler::SamplerConfig;

/// Errors raised while loading or validating a run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for this schema
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Parameters of one fit-and-aggregate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Store path; the `.store` extension is appended if absent
    pub store_path: PathBuf,
    /// Number of chunk files, and thus worker threads
    pub nchunks: usize,
    /// Evidence-improvement threshold of the stopping rule
    pub lnz_threshold: f64,
    /// Maximum model order attempted per pixel
    pub ncomp_max: usize,
    /// Gaussian smoothing bandwidth of the aggregation passes, in pixels
    pub std_pix: f64,
    /// Sampler parameters forwarded to every pixel fit
    pub sampler: SamplerConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("run"),
            nchunks: 1,
            lnz_threshold: 11.0,
            ncomp_max: 2,
            std_pix: 1.0,
            sampler: SamplerConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nchunks == 0 {
            return Err(ConfigError::Invalid("nchunks must be at least 1".into()));
        }
        if !self.lnz_threshold.is_finite() {
            return Err(ConfigError::Invalid("lnz_threshold must be finite".into()));
        }
        if self.ncomp_max == 0 {
            return Err(ConfigError::Invalid("ncomp_max must be at least 1".into()));
        }
        if !(self.std_pix.is_finite() && self.std_pix > 0.0) {
            return Err(ConfigError::Invalid(
                "std_pix must be positive and finite".into(),
            ));
        }
        if self.sampler.n_live == 0 {
            return Err(ConfigError::Invalid(
                "sampler.n_live must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        RunConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "nchunks = 8\nlnz_threshold = 5.0\n\n[sampler]\nn_live = 120\n"
        )
        .unwrap();
        let config = RunConfig::from_file(file.path()).unwrap();
        assert_eq!(config.nchunks, 8);
        assert_eq!(config.lnz_threshold, 5.0);
        assert_eq!(config.sampler.n_live, 120);
        // Untouched fields keep their defaults.
        assert_eq!(config.ncomp_max, 2);
        assert_eq!(config.sampler.tol, 1.0);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "nchunk = 8\n").unwrap();
        assert!(matches!(
            RunConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "nchunks = 0\n").unwrap();
        assert!(matches!(
            RunConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "std_pix = -1.0\n").unwrap();
        assert!(matches!(
            RunConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
