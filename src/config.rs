//! Server configuration
//!
//! Defaults are overridden by an optional JSON config file, which in turn is
//! overridden by command-line flags and environment variables (see `main.rs`).

use crate::audio_buffer::DEFAULT_CAPACITY_BYTES;
use crate::detector::{
    DetectorError, DetectorTemplate, EnergyConfig, EnergyTemplate, SilentDetector,
};
use crate::protocol::{DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_HEADER_BYTES};
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_URI: &str = "tcp://0.0.0.0:10400";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error("Invalid URI '{0}': expected tcp://host:port or stdio://")]
    InvalidUri(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// Detection engine backing every session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// RMS-energy keyword spotter
    Energy,

    /// Never reports a keyword
    Silent,
}

/// Where the server accepts connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenUri {
    Tcp(String),
    Stdio,
}

impl ListenUri {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        if uri == "stdio://" {
            return Ok(ListenUri::Stdio);
        }

        let addr = uri
            .strip_prefix("tcp://")
            .ok_or_else(|| ConfigError::InvalidUri(uri.to_string()))?;

        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(ListenUri::Tcp(addr.to_string()))
            }
            _ => Err(ConfigError::InvalidUri(uri.to_string())),
        }
    }
}

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `tcp://host:port` or `stdio://`
    pub uri: String,

    /// Keyword name reported in detection events
    pub keyword_name: String,

    /// Minimum detection score (0.0 - 1.0)
    pub threshold: f32,

    /// JSON model file with detector parameters; replaces `detector` when set
    pub model_path: Option<PathBuf>,

    pub engine: Engine,

    /// Concurrent sessions accepted before new clients are turned away
    pub max_sessions: usize,

    pub max_header_bytes: usize,

    pub max_chunk_bytes: usize,

    /// Per-session ceiling on buffered, unconsumed audio
    pub buffer_capacity_bytes: usize,

    /// Time allowed for sessions to drain on shutdown
    pub shutdown_grace_secs: u64,

    pub detector: EnergyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            keyword_name: "wake_word".to_string(),
            threshold: 0.5,
            model_path: None,
            engine: Engine::Energy,
            max_sessions: 64,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            buffer_capacity_bytes: DEFAULT_CAPACITY_BYTES,
            shutdown_grace_secs: 5,
            detector: EnergyConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Detector parameters in effect, read from the model file when one is set
    pub fn detector_config(&self) -> Result<EnergyConfig, ConfigError> {
        match &self.model_path {
            Some(path) => Ok(EnergyConfig::from_model_file(path)?),
            None => Ok(self.detector.clone()),
        }
    }

    pub fn listen_uri(&self) -> Result<ListenUri, ConfigError> {
        ListenUri::parse(&self.uri)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            threshold: self.threshold,
            buffer_capacity_bytes: self.buffer_capacity_bytes,
            max_header_bytes: self.max_header_bytes,
            max_chunk_bytes: self.max_chunk_bytes,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_uri()?;

        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(
                "threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.keyword_name.is_empty() {
            return Err(ConfigError::Invalid("keyword_name must not be empty".to_string()));
        }

        if self.max_sessions == 0 || self.max_header_bytes == 0 || self.max_chunk_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions, max_header_bytes and max_chunk_bytes must be greater than 0"
                    .to_string(),
            ));
        }

        let detector = self.detector_config()?;
        detector.validate()?;

        let window_bytes = detector.window_spec().window_bytes;
        if self.buffer_capacity_bytes < window_bytes {
            return Err(ConfigError::Invalid(format!(
                "buffer_capacity_bytes ({}) must hold at least one detector window ({} bytes)",
                self.buffer_capacity_bytes, window_bytes
            )));
        }

        // A larger chunk could never fit even into an empty buffer
        if self.max_chunk_bytes > self.buffer_capacity_bytes {
            return Err(ConfigError::Invalid(format!(
                "max_chunk_bytes ({}) must not exceed buffer_capacity_bytes ({})",
                self.max_chunk_bytes, self.buffer_capacity_bytes
            )));
        }

        Ok(())
    }

    /// Build the detector template shared by the supervisor
    pub fn build_template(&self) -> Result<Arc<dyn DetectorTemplate>, ConfigError> {
        let detector = self.detector_config()?;

        if let Some(path) = &self.model_path {
            info!("Model: {}", path.display());
        }

        let template: Arc<dyn DetectorTemplate> = match self.engine {
            Engine::Energy => Arc::new(EnergyTemplate::new(
                detector,
                self.keyword_name.clone(),
                self.threshold,
            )?),
            Engine::Silent => Arc::new(SilentDetector::new(detector)),
        };

        Ok(template)
    }
}
