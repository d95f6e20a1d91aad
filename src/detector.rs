//! Keyword detector adapter
//!
//! Wraps a keyword-spotting engine behind a narrow, sequential interface.
//! A `DetectorTemplate` is built once at start-up and hands every session its
//! own `KeywordDetector`; instances are never shared between sessions because
//! detectors carry rolling acoustic state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Audio sample format handled by the built-in engines (16-bit PCM)
pub type AudioSample = i16;

/// Sample rate the built-in engines are initialized for
pub const SAMPLE_RATE: u32 = 16000;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid detector configuration: {0}")]
    InvalidConfig(String),

    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Detector fault: {0}")]
    Fault(String),
}

/// PCM sample encoding as named on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    S16le,
    S32le,
    F32le,
}

impl SampleFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleFormat::S16le => "s16le",
            SampleFormat::S32le => "s32le",
            SampleFormat::F32le => "f32le",
        }
    }

    /// Bytes per sample for one channel
    pub fn width(&self) -> usize {
        match self {
            SampleFormat::S16le => 2,
            SampleFormat::S32le | SampleFormat::F32le => 4,
        }
    }
}

impl FromStr for SampleFormat {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s16le" => Ok(SampleFormat::S16le),
            "s32le" => Ok(SampleFormat::S32le),
            "f32le" => Ok(SampleFormat::F32le),
            other => Err(DetectorError::UnsupportedFormat(format!(
                "unknown sample format '{}'",
                other
            ))),
        }
    }
}

/// Declared or required shape of a PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, format: SampleFormat, channels: u16) -> Self {
        Self {
            sample_rate,
            format,
            channels,
        }
    }

    /// 16-bit little-endian mono
    pub fn pcm16_mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, SampleFormat::S16le, 1)
    }

    /// Parse the fields carried by an `audio-start` frame
    pub fn from_wire(sample_rate: u32, format: &str, channels: u16) -> Result<Self, DetectorError> {
        Ok(Self::new(sample_rate, format.parse()?, channels))
    }

    /// Bytes for one sample across all channels
    pub fn bytes_per_frame(&self) -> usize {
        self.format.width() * self.channels as usize
    }

    /// Byte length of `ms` milliseconds of audio, rounded down to whole frames
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        let frames = self.sample_rate as u64 * ms as u64 / 1000;
        frames as usize * self.bytes_per_frame()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz {} {}ch",
            self.sample_rate,
            self.format.as_str(),
            self.channels
        )
    }
}

/// One keyword hit
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub keyword: String,

    /// Confidence score (0.0 - 1.0)
    pub score: f32,

    /// Milliseconds from stream start to the end of the triggering window
    pub timestamp_ms: u64,
}

/// Capability metadata reported in `describe-response`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorInfo {
    pub name: String,
    pub version: String,
    pub keywords: Vec<String>,
}

/// How the session should slice buffered audio for this detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    /// Bytes evaluated per `process` call
    pub window_bytes: usize,

    /// Bytes the cursor advances after each window (== window for non-overlapping)
    pub stride_bytes: usize,

    /// Smallest trailing partial window still evaluated on `audio-stop`
    pub min_flush_bytes: usize,
}

impl WindowSpec {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.window_bytes == 0 {
            return Err(DetectorError::InvalidConfig(
                "window must be greater than 0".to_string(),
            ));
        }

        if self.stride_bytes == 0 || self.stride_bytes > self.window_bytes {
            return Err(DetectorError::InvalidConfig(format!(
                "stride must be between 1 and {} bytes, got {}",
                self.window_bytes, self.stride_bytes
            )));
        }

        Ok(())
    }
}

/// Per-session keyword spotting engine
///
/// Not safe for concurrent use: the owning session calls it strictly in
/// sequence.
#[cfg_attr(test, mockall::automock)]
pub trait KeywordDetector: Send {
    fn info(&self) -> DetectorInfo;

    /// Audio format the engine was initialized for
    fn format(&self) -> AudioFormat;

    fn window(&self) -> WindowSpec;

    /// Reject a declared stream format the engine cannot consume
    fn check_format(&self, declared: &AudioFormat) -> Result<(), DetectorError> {
        let required = self.format();
        if *declared != required {
            return Err(DetectorError::UnsupportedFormat(format!(
                "declared {}, detector requires {}",
                declared, required
            )));
        }
        Ok(())
    }

    /// Clear rolling state before a new audio stream
    fn reset(&mut self);

    /// Evaluate one window starting `stream_position` samples into the stream
    fn process(
        &mut self,
        window: &[u8],
        stream_position: u64,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Already-initialized model that produces one detector per session
pub trait DetectorTemplate: Send + Sync {
    fn info(&self) -> DetectorInfo;

    fn instantiate(&self) -> Result<Box<dyn KeywordDetector>, DetectorError>;
}

/// Parameters of the built-in energy spotter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub detector_name: String,

    pub sample_rate: u32,

    /// Window length in milliseconds
    pub window_ms: u32,

    /// Hop between windows in milliseconds (equal to window for non-overlapping)
    pub stride_ms: u32,

    /// Shortest trailing window evaluated when the stream stops
    pub min_flush_ms: u32,

    /// Consecutive windows at or above threshold needed to trigger
    pub trigger_windows: usize,

    /// Windows ignored after a trigger
    pub refractory_windows: usize,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            detector_name: "energy".to_string(),
            sample_rate: SAMPLE_RATE,
            window_ms: 500,
            stride_ms: 500,
            min_flush_ms: 250,
            trigger_windows: 1,
            refractory_windows: 2,
        }
    }
}

impl EnergyConfig {
    /// Load parameters from a JSON model file
    pub fn from_model_file(path: &Path) -> Result<Self, DetectorError> {
        if !path.exists() {
            return Err(DetectorError::ModelNotFound(path.to_path_buf()));
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| DetectorError::ModelLoad(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| DetectorError::ModelLoad(format!("{}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::pcm16_mono(self.sample_rate)
    }

    pub fn window_spec(&self) -> WindowSpec {
        let format = self.format();
        WindowSpec {
            window_bytes: format.bytes_for_ms(self.window_ms),
            stride_bytes: format.bytes_for_ms(self.stride_ms),
            min_flush_bytes: format.bytes_for_ms(self.min_flush_ms),
        }
    }

    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.sample_rate == 0 {
            return Err(DetectorError::InvalidConfig(
                "sample_rate must be greater than 0".to_string(),
            ));
        }

        if self.trigger_windows == 0 {
            return Err(DetectorError::InvalidConfig(
                "trigger_windows must be greater than 0".to_string(),
            ));
        }

        self.window_spec().validate()
    }
}

/// Normalized RMS energy of a 16-bit little-endian window (0.0 - 1.0)
pub fn rms_level(window: &[u8]) -> f32 {
    let mut energy = 0.0f64;
    let mut count = 0usize;

    for pair in window.chunks_exact(2) {
        let sample = AudioSample::from_le_bytes([pair[0], pair[1]]);
        let normalized = sample as f64 / AudioSample::MAX as f64;
        energy += normalized * normalized;
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }

    ((energy / count as f64).sqrt() as f32).min(1.0)
}

/// Deterministic energy-based spotter
///
/// Reports the configured keyword when the window RMS stays at or above the
/// threshold for `trigger_windows` consecutive windows, then stays quiet for
/// `refractory_windows`.
pub struct EnergyDetector {
    config: EnergyConfig,
    keyword: String,
    threshold: f32,
    consecutive: usize,
    refractory_left: usize,
    windows_processed: u64,
}

impl EnergyDetector {
    pub fn new(
        config: EnergyConfig,
        keyword: impl Into<String>,
        threshold: f32,
    ) -> Result<Self, DetectorError> {
        config.validate()?;

        if !(0.0..=1.0).contains(&threshold) {
            return Err(DetectorError::InvalidConfig(
                "threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(Self {
            config,
            keyword: keyword.into(),
            threshold,
            consecutive: 0,
            refractory_left: 0,
            windows_processed: 0,
        })
    }

    pub fn windows_processed(&self) -> u64 {
        self.windows_processed
    }
}

impl KeywordDetector for EnergyDetector {
    fn info(&self) -> DetectorInfo {
        DetectorInfo {
            name: self.config.detector_name.clone(),
            version: crate::VERSION.to_string(),
            keywords: vec![self.keyword.clone()],
        }
    }

    fn format(&self) -> AudioFormat {
        self.config.format()
    }

    fn window(&self) -> WindowSpec {
        self.config.window_spec()
    }

    fn reset(&mut self) {
        self.consecutive = 0;
        self.refractory_left = 0;
        self.windows_processed = 0;
        debug!("Energy detector reset");
    }

    fn process(
        &mut self,
        window: &[u8],
        stream_position: u64,
    ) -> Result<Vec<Detection>, DetectorError> {
        let format = self.config.format();
        let samples = (window.len() / format.bytes_per_frame()) as u64;
        if samples == 0 {
            return Ok(Vec::new());
        }

        self.windows_processed += 1;
        let score = rms_level(window);
        trace!("Window at sample {}: rms={:.3}", stream_position, score);

        if self.refractory_left > 0 {
            self.refractory_left -= 1;
            self.consecutive = 0;
            return Ok(Vec::new());
        }

        if score >= self.threshold {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }

        if self.consecutive < self.config.trigger_windows {
            return Ok(Vec::new());
        }

        self.consecutive = 0;
        self.refractory_left = self.config.refractory_windows;

        let end = stream_position + samples;
        let detection = Detection {
            keyword: self.keyword.clone(),
            score,
            timestamp_ms: end * 1000 / format.sample_rate as u64,
        };
        debug!(
            "Keyword '{}' detected: score={:.2}, timestamp={}ms",
            detection.keyword, detection.score, detection.timestamp_ms
        );

        Ok(vec![detection])
    }
}

/// Template for `EnergyDetector`
#[derive(Debug, Clone)]
pub struct EnergyTemplate {
    config: EnergyConfig,
    keyword: String,
    threshold: f32,
}

impl EnergyTemplate {
    pub fn new(
        config: EnergyConfig,
        keyword: impl Into<String>,
        threshold: f32,
    ) -> Result<Self, DetectorError> {
        let keyword = keyword.into();

        // Building one instance validates every parameter up front
        EnergyDetector::new(config.clone(), keyword.clone(), threshold)?;

        info!(
            "Energy detector ready: keyword='{}', window={}ms, stride={}ms, threshold={}",
            keyword, config.window_ms, config.stride_ms, threshold
        );

        Ok(Self {
            config,
            keyword,
            threshold,
        })
    }
}

impl DetectorTemplate for EnergyTemplate {
    fn info(&self) -> DetectorInfo {
        DetectorInfo {
            name: self.config.detector_name.clone(),
            version: crate::VERSION.to_string(),
            keywords: vec![self.keyword.clone()],
        }
    }

    fn instantiate(&self) -> Result<Box<dyn KeywordDetector>, DetectorError> {
        let detector = EnergyDetector::new(self.config.clone(), self.keyword.clone(), self.threshold)?;
        Ok(Box::new(detector))
    }
}

/// Detector that never reports a keyword
#[derive(Debug, Clone)]
pub struct SilentDetector {
    config: EnergyConfig,
}

impl SilentDetector {
    pub fn new(config: EnergyConfig) -> Self {
        Self { config }
    }
}

impl KeywordDetector for SilentDetector {
    fn info(&self) -> DetectorInfo {
        DetectorInfo {
            name: "silent".to_string(),
            version: crate::VERSION.to_string(),
            keywords: Vec::new(),
        }
    }

    fn format(&self) -> AudioFormat {
        self.config.format()
    }

    fn window(&self) -> WindowSpec {
        self.config.window_spec()
    }

    fn reset(&mut self) {}

    fn process(&mut self, _window: &[u8], _stream_position: u64) -> Result<Vec<Detection>, DetectorError> {
        Ok(Vec::new())
    }
}

impl DetectorTemplate for SilentDetector {
    fn info(&self) -> DetectorInfo {
        KeywordDetector::info(self)
    }

    fn instantiate(&self) -> Result<Box<dyn KeywordDetector>, DetectorError> {
        Ok(Box::new(self.clone()))
    }
}

/// Encode samples as the little-endian bytes carried by `audio-chunk`
pub fn samples_to_bytes(samples: &[AudioSample]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
