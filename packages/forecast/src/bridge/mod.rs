//! Secondary model family.
//!
//! [`SecondaryModelBridge`] first asks a [`ForecastBackend`] (by default
//! an external ARIMA process, [`ExternalProcessBackend`]) for a forecast.
//! Any backend failure is absorbed by refitting the same series with the
//! in-process [`InProcessArima`]. Only when both paths fail does the
//! caller see [`SecondaryError::ModelFamilyExhausted`].

pub mod process;
pub mod protocol;

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use vcom_forecast_models::{ForecastPoint, HistoricalSeries};

use crate::ModelError;
use crate::arima::InProcessArima;
use crate::config::{BridgeConfig, ForecastConfig};

pub use process::{BridgeProcess, CommandLauncher, ProcessLauncher, ProcessOutput};

/// Failures of a single backend invocation.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The process did not finish in time and was killed.
    #[error("External model timed out after {timeout:?}")]
    Timeout {
        /// The limit that was exceeded.
        timeout: Duration,
    },

    /// The process failed to run to a successful exit.
    #[error("External model failed (exit code {code:?}): {message}")]
    Execution {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Truncated stderr, or the I/O error.
        message: String,
    },

    /// The process output was not a valid response.
    #[error("External model protocol error: {message}")]
    Protocol {
        /// What was wrong with the output.
        message: String,
    },

    /// The program or its script is not installed.
    #[error("External model unavailable ({program}): {message}")]
    Unavailable {
        /// The program that could not be started.
        program: String,
        /// Why it could not be started.
        message: String,
    },
}

/// Terminal failure of the secondary model family.
#[derive(Debug, Error)]
pub enum SecondaryError {
    /// The backend and the in-process fallback both failed.
    #[error("Secondary model family exhausted: {bridge}; in-process fallback: {fallback}")]
    ModelFamilyExhausted {
        /// Why the backend failed.
        bridge: BridgeError,
        /// Why the in-process fallback failed.
        fallback: ModelError,
    },
}

/// A source of secondary-family forecasts that may live outside this
/// process.
#[async_trait::async_trait]
pub trait ForecastBackend: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &str;

    /// Forecasts `horizon` days past the end of `series`.
    ///
    /// Returned points must already be rounded and clamped.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] on any failure. Implementations must not
    /// leave processes running after returning.
    async fn forecast(
        &self,
        series: &HistoricalSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, BridgeError>;
}

/// Runs an external program that speaks the [`protocol`] over
/// stdin/stdout.
pub struct ExternalProcessBackend {
    program: String,
    args: Vec<OsString>,
    /// Script that must exist before the program is launched.
    script: Option<PathBuf>,
    timeout: Duration,
    error_preview_len: usize,
    launcher: Arc<dyn ProcessLauncher>,
}

impl ExternalProcessBackend {
    /// Runs `program` with `args` and the default limits.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<OsString>) -> Self {
        let defaults = BridgeConfig::default();
        Self {
            program: program.into(),
            args,
            script: None,
            timeout: defaults.timeout(),
            error_preview_len: defaults.error_preview_len,
            launcher: Arc::new(CommandLauncher),
        }
    }

    /// Runs `config.program` on `config.script_path()`.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        let script = config.script_path();
        Self {
            program: config.program.clone(),
            args: vec![script.clone().into_os_string()],
            script: Some(script),
            timeout: config.timeout(),
            error_preview_len: config.error_preview_len,
            launcher: Arc::new(CommandLauncher),
        }
    }

    /// Replaces the wall-clock limit.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces how processes are started.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    fn launch(&self) -> Result<Box<dyn BridgeProcess>, BridgeError> {
        if let Some(script) = &self.script
            && !script.is_file()
        {
            return Err(BridgeError::Unavailable {
                program: self.program.clone(),
                message: format!("script {} not found", script.display()),
            });
        }

        self.launcher
            .launch(&self.program, &self.args)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => BridgeError::Unavailable {
                    program: self.program.clone(),
                    message: e.to_string(),
                },
                _ => BridgeError::Execution {
                    code: None,
                    message: format!("failed to spawn {}: {e}", self.program),
                },
            })
    }
}

#[async_trait::async_trait]
impl ForecastBackend for ExternalProcessBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn forecast(
        &self,
        series: &HistoricalSeries,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, BridgeError> {
        let input = protocol::encode_request(series, horizon)?;
        let mut process = self.launch()?;

        let outcome = tokio::time::timeout(self.timeout, process.communicate(input)).await;
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                if let Err(kill_err) = process.terminate().await {
                    log::debug!("Failed to terminate {}: {kill_err}", self.program);
                }
                return Err(BridgeError::Execution {
                    code: None,
                    message: format!("I/O error talking to {}: {e}", self.program),
                });
            }
            Err(_) => {
                log::warn!(
                    "{} exceeded {:?}, terminating it",
                    self.program,
                    self.timeout
                );
                if let Err(e) = process.terminate().await {
                    log::error!("Failed to terminate {}: {e}", self.program);
                }
                return Err(BridgeError::Timeout {
                    timeout: self.timeout,
                });
            }
        };

        if !output.success {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::error!(
                "{} exited with code {:?}: {}",
                self.program,
                output.code,
                stderr.trim()
            );
            return Err(BridgeError::Execution {
                code: output.code,
                message: preview(&stderr, self.error_preview_len),
            });
        }

        protocol::decode_response(&output.stdout, series, horizon)
    }
}

/// The first `max_chars` characters of `text`, trimmed.
fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

/// The secondary model family: a [`ForecastBackend`] backed by an
/// in-process ARIMA refit.
#[derive(Clone)]
pub struct SecondaryModelBridge {
    backend: Arc<dyn ForecastBackend>,
    fallback: InProcessArima,
}

impl SecondaryModelBridge {
    /// Pairs `backend` with the in-process fit used when it fails.
    #[must_use]
    pub fn new(backend: Arc<dyn ForecastBackend>, fallback: InProcessArima) -> Self {
        Self { backend, fallback }
    }

    /// An external process backend and ARIMA fallback built from `config`.
    #[must_use]
    pub fn from_config(config: &ForecastConfig) -> Self {
        Self::new(
            Arc::new(ExternalProcessBackend::from_config(&config.bridge)),
            InProcessArima::new(config.arima.clone()),
        )
    }

    /// Forecasts `horizon` days, falling back to the in-process fit on any
    /// backend failure.
    ///
    /// # Errors
    ///
    /// Returns [`SecondaryError::ModelFamilyExhausted`] if the backend and
    /// the in-process fallback both fail.
    pub async fn forecast(
        &self,
        series: Arc<HistoricalSeries>,
        horizon: usize,
    ) -> Result<Vec<ForecastPoint>, SecondaryError> {
        let bridge = match self.backend.forecast(&series, horizon).await {
            Ok(points) => return Ok(points),
            Err(e) => e,
        };

        log::warn!(
            "{} backend failed ({bridge}), falling back to in-process ARIMA",
            self.backend.name()
        );

        self.fallback
            .forecast(series, horizon)
            .await
            .map_err(move |fallback| SecondaryError::ModelFamilyExhausted { bridge, fallback })
    }
}
