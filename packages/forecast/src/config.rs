//! Forecasting configuration.
//!
//! Loaded from TOML (an embedded default lives in `config/default.toml`)
//! with a handful of `VCOM_*` environment overrides layered on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_TOML: &str = include_str!("../config/default.toml");

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config file could not be read.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// An environment override was not a valid value.
    #[error("Invalid value for {var}: '{value}'")]
    Env {
        /// Variable name.
        var: &'static str,
        /// The unparseable value.
        value: String,
    },

    /// A value is outside its allowed range.
    #[error("Invalid config value {field}: {message}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Top-level configuration for the forecasting engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Minimum series length before any model is attempted.
    pub min_history_points: usize,
    /// Seasonal model settings.
    pub primary: PrimaryConfig,
    /// External process settings.
    pub bridge: BridgeConfig,
    /// In-process ARIMA settings.
    pub arima: ArimaConfig,
    /// Terminal fallback settings.
    pub statistical: StatisticalConfig,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            min_history_points: 10,
            primary: PrimaryConfig::default(),
            bridge: BridgeConfig::default(),
            arima: ArimaConfig::default(),
            statistical: StatisticalConfig::default(),
        }
    }
}

/// Settings for the additive trend + yearly seasonality model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PrimaryConfig {
    /// Trend flexibility. Smaller values penalize slope changes harder.
    pub changepoint_prior_scale: f64,
    /// Number of candidate trend changepoints.
    pub n_changepoints: usize,
    /// Fraction of the history in which changepoints may be placed.
    pub changepoint_range: f64,
    /// Fourier order of the yearly seasonal component.
    pub yearly_fourier_order: usize,
    /// Prior scale on the seasonal coefficients.
    pub seasonality_prior_scale: f64,
    /// Normal quantile for the interval half-width.
    pub interval_z: f64,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            changepoint_prior_scale: 0.05,
            n_changepoints: 25,
            changepoint_range: 0.8,
            yearly_fourier_order: 10,
            seasonality_prior_scale: 10.0,
            interval_z: 1.2816,
        }
    }
}

/// Settings for the out-of-process statistical model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Executable to launch.
    pub program: String,
    /// Directory holding the model script. Defaults to the `r_scripts`
    /// directory shipped with this crate, resolved at compile time.
    pub script_dir: PathBuf,
    /// Script file name, passed as the first argument to `program`.
    pub script_name: String,
    /// Hard wall-clock limit for one invocation.
    pub timeout_secs: u64,
    /// Maximum characters of stderr kept in error messages.
    pub error_preview_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: "Rscript".to_string(),
            script_dir: Path::new(env!("CARGO_MANIFEST_DIR")).join("r_scripts"),
            script_name: "arima_forecast.R".to_string(),
            timeout_secs: 300,
            error_preview_len: 500,
        }
    }
}

impl BridgeConfig {
    /// Full path to the model script.
    #[must_use]
    pub fn script_path(&self) -> PathBuf {
        self.script_dir.join(&self.script_name)
    }

    /// The invocation timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for the in-process ARIMA fallback.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ArimaConfig {
    /// Preferred `(p, d, q)` order.
    pub order: [usize; 3],
    /// Simpler order tried when the preferred one fails to converge.
    pub fallback_order: [usize; 3],
    /// Normal quantile for the interval half-width.
    pub interval_z: f64,
}

impl Default for ArimaConfig {
    fn default() -> Self {
        Self {
            order: [2, 1, 2],
            fallback_order: [1, 1, 1],
            interval_z: 1.96,
        }
    }
}

/// Settings for the exponential-decay fallback.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatisticalConfig {
    /// Per-step decay factor toward the historical mean.
    pub alpha: f64,
    /// Multiplier on the historical standard deviation for the interval.
    pub interval_z: f64,
}

impl Default for StatisticalConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            interval_z: 1.96,
        }
    }
}

impl ForecastConfig {
    /// Parses the embedded default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the embedded TOML is malformed.
    pub fn default_embedded() -> Result<Self, ConfigError> {
        Self::from_toml_str(DEFAULT_TOML)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is malformed.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::de::from_str(s)?)
    }

    /// Reads and parses a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Applies `VCOM_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if a numeric override does not parse.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    fn apply_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("VCOM_MIN_HISTORY_POINTS") {
            self.min_history_points = parse_env("VCOM_MIN_HISTORY_POINTS", value)?;
        }
        if let Some(value) = lookup("VCOM_R_TIMEOUT") {
            self.bridge.timeout_secs = parse_env("VCOM_R_TIMEOUT", value)?;
        }
        if let Some(value) = lookup("VCOM_R_SCRIPT_PATH") {
            self.bridge.script_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("VCOM_R_PROGRAM") {
            self.bridge.program = value;
        }
        Ok(self)
    }

    /// Checks that every value is in range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_history_points < 2 {
            return Err(invalid("min_history_points", "must be at least 2"));
        }
        if !is_positive(self.primary.changepoint_prior_scale) {
            return Err(invalid("primary.changepoint_prior_scale", "must be positive"));
        }
        if !is_positive(self.primary.seasonality_prior_scale) {
            return Err(invalid("primary.seasonality_prior_scale", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.primary.changepoint_range) {
            return Err(invalid("primary.changepoint_range", "must be within 0-1"));
        }
        if self.bridge.timeout_secs == 0 {
            return Err(invalid("bridge.timeout_secs", "must be positive"));
        }
        if self.bridge.program.trim().is_empty() {
            return Err(invalid("bridge.program", "must not be empty"));
        }
        for (field, order) in [
            ("arima.order", self.arima.order),
            ("arima.fallback_order", self.arima.fallback_order),
        ] {
            if order[1] > 2 {
                return Err(invalid(field, "differencing order must be <= 2"));
            }
            if order[0] > 10 || order[2] > 10 {
                return Err(invalid(field, "AR and MA orders must be <= 10"));
            }
        }
        if !is_positive(self.statistical.alpha) || self.statistical.alpha >= 1.0 {
            return Err(invalid("statistical.alpha", "must be within (0, 1)"));
        }
        Ok(())
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}
