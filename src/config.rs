//! Layered configuration using Figment.
//!
//! Settings are assembled from three layers, each overriding the previous one:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/capture.toml` unless a path is given)
//! 3. Environment variables prefixed with `RUST_CAPTURE_`, nested with `__`
//!
//! Durations use humantime strings (`"500ms"`, `"1s"`).
//!
//! # Example
//! ```no_run
//! use rust_capture::config::Settings;
//!
//! // RUST_CAPTURE_ENGINE__FRAME_LIMIT=100 overrides engine.frame_limit
//! let settings = Settings::load()?;
//! println!("Application: {}", settings.application.name);
//! # Ok::<(), rust_capture::CaptureError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, CaptureError};
use crate::frame::PixelEncoding;
use crate::limits::{
    DEFAULT_QUEUE_CAPACITY, FPS_WINDOW, MAX_CONSECUTIVE_SOURCE_ERRORS, MAX_FRAME_DIMENSION, MIN_ACQUIRE_TIMEOUT,
    MONITOR_INTERVAL,
};
use crate::logging::{parse_log_level, OutputFormat};
use crate::queue::BackpressurePolicy;
use crate::source::MockCameraConfig;
use crate::validation::{is_in_range, is_not_empty, is_positive_duration, is_valid_path};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/capture.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RUST_CAPTURE_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Run configuration handed to the engine
    pub engine: EngineSettings,
    /// Queue and timing tuning
    pub pipeline: PipelineSettings,
    /// Mock camera used by the CLI
    pub camera: CameraSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: OutputFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "rust-capture".into(),
            log_level: "info".into(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Frames to acquire; -1 acquires until stopped
    pub frame_limit: i64,
    /// Output capture file
    pub output_path: PathBuf,
    /// Promote per-interval status lines to INFO
    pub verbose: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            frame_limit: -1,
            output_path: PathBuf::from("output.bin"),
            verbose: false,
        }
    }
}

/// Queue capacities, backpressure and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Capacity of the acquire→process queue
    pub process_queue_capacity: usize,
    /// Capacity of the process→write queue
    pub write_queue_capacity: usize,
    /// Behaviour of a full queue
    pub backpressure: BackpressurePolicy,
    /// Telemetry sampling period
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Sliding window for rate estimates
    #[serde(with = "humantime_serde")]
    pub fps_window: Duration,
    /// Floor for a single camera wait
    #[serde(with = "humantime_serde")]
    pub min_acquire_timeout: Duration,
    /// Consecutive recoverable camera errors tolerated
    pub max_consecutive_source_errors: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            process_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backpressure: BackpressurePolicy::Block,
            monitor_interval: MONITOR_INTERVAL,
            fps_window: FPS_WINDOW,
            min_acquire_timeout: MIN_ACQUIRE_TIMEOUT,
            max_consecutive_source_errors: MAX_CONSECUTIVE_SOURCE_ERRORS,
        }
    }
}

impl PipelineSettings {
    /// Check ranges.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |field: &str, reason: &str| CaptureError::Configuration(format!("pipeline.{field}: {reason}"));
        is_in_range(self.process_queue_capacity, 1..=1_000_000).map_err(|e| invalid("process_queue_capacity", e))?;
        is_in_range(self.write_queue_capacity, 1..=1_000_000).map_err(|e| invalid("write_queue_capacity", e))?;
        is_positive_duration(self.monitor_interval).map_err(|e| invalid("monitor_interval", e))?;
        is_positive_duration(self.fps_window).map_err(|e| invalid("fps_window", e))?;
        is_positive_duration(self.min_acquire_timeout).map_err(|e| invalid("min_acquire_timeout", e))?;
        Ok(())
    }
}

/// Mock camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Sensor width in pixels
    pub width: u32,
    /// Sensor height in pixels
    pub height: u32,
    /// Pixel encoding name (Mono8, Mono12, Mono12Packed, Mono16, Mono32)
    pub pixel_encoding: String,
    /// Padding bytes at the end of each row
    pub row_padding: usize,
    /// Frame rate; 0 is free-running
    pub frame_rate_hz: f64,
    /// Reported sensor temperature in degrees Celsius; omit for an uncooled sensor
    pub sensor_temperature_c: Option<f64>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            pixel_encoding: "Mono12Packed".into(),
            row_padding: 0,
            frame_rate_hz: 100.0,
            sensor_temperature_c: Some(-25.0),
        }
    }
}

impl CameraSettings {
    /// Build the mock camera configuration.
    pub fn mock_config(&self) -> AppResult<MockCameraConfig> {
        let encoding = PixelEncoding::parse(&self.pixel_encoding).ok_or_else(|| {
            CaptureError::Configuration(format!("camera.pixel_encoding: unknown encoding '{}'", self.pixel_encoding))
        })?;
        Ok(MockCameraConfig::new(self.width, self.height, encoding)
            .with_row_padding(self.row_padding)
            .with_frame_rate(self.frame_rate_hz)
            .with_sensor_temperature(self.sensor_temperature_c))
    }
}

impl Settings {
    /// Load from `config/capture.toml` (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        let figment = if path.exists() {
            Self::figment().merge(Toml::file(path))
        } else {
            Self::figment()
        };
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load from a specific file, which must exist, then the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CaptureError::Configuration(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Self::extract(
            Self::figment()
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Parse settings from TOML text over the defaults, without the environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Self::extract(Self::figment().merge(Toml::string(toml)))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        is_not_empty(&self.application.name)
            .map_err(|e| CaptureError::Configuration(format!("application.name: {e}")))?;
        parse_log_level(&self.application.log_level)?;

        if self.engine.frame_limit < -1 {
            return Err(CaptureError::InvalidFrameLimit(self.engine.frame_limit));
        }
        is_valid_path(&self.engine.output_path).map_err(|e| CaptureError::InvalidOutputPath {
            path: self.engine.output_path.clone(),
            reason: e.to_string(),
        })?;

        self.pipeline.validate()?;

        let camera = &self.camera;
        let dims = 1..=MAX_FRAME_DIMENSION;
        if !dims.contains(&camera.width) || !dims.contains(&camera.height) {
            return Err(CaptureError::Configuration(format!(
                "camera dimensions {}x{} must be within 1..={MAX_FRAME_DIMENSION}",
                camera.width, camera.height
            )));
        }
        if !camera.frame_rate_hz.is_finite() || camera.frame_rate_hz < 0.0 {
            return Err(CaptureError::Configuration(format!(
                "camera.frame_rate_hz must be >= 0, got {}",
                camera.frame_rate_hz
            )));
        }
        if let Some(celsius) = camera.sensor_temperature_c.filter(|c| !c.is_finite()) {
            return Err(CaptureError::Configuration(format!(
                "camera.sensor_temperature_c must be finite, got {celsius}"
            )));
        }
                camera.mock_config()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.engine.frame_limit, -1);
        assert_eq!(settings.pipeline.monitor_interval, Duration::from_millis(500));
    }

    #[test]
    fn toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [engine]
            frame_limit = 25
            output_path = "run.bin"

            [pipeline]
            process_queue_capacity = 8
            backpressure = "fail"
            monitor_interval = "250ms"

            [camera]
            pixel_encoding = "mono8"
            "#,
        )
        .unwrap();

        assert_eq!(settings.engine.frame_limit, 25);
        assert_eq!(settings.engine.output_path, PathBuf::from("run.bin"));
        assert_eq!(settings.pipeline.process_queue_capacity, 8);
        assert_eq!(settings.pipeline.write_queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(settings.pipeline.backpressure, BackpressurePolicy::Fail);
        assert_eq!(settings.pipeline.monitor_interval, Duration::from_millis(250));
        assert_eq!(settings.camera.mock_config().unwrap().encoding, PixelEncoding::Mono8);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = Settings::from_toml_str("[engine]\nframe_limit = -5").unwrap_err();
        assert!(matches!(err, CaptureError::InvalidFrameLimit(-5)));

        let err = Settings::from_toml_str("[pipeline]\nwrite_queue_capacity = 0").unwrap_err();
        assert!(err.to_string().contains("write_queue_capacity"));

        let err = Settings::from_toml_str("[application]\nlog_level = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("loud"));

        let err = Settings::from_toml_str("[camera]\npixel_encoding = \"RGB8\"").unwrap_err();
        assert!(err.to_string().contains("RGB8"));

        let err = Settings::from_toml_str("[camera]\nsensor_temperature_c = nan").unwrap_err();
        assert!(err.to_string().contains("sensor_temperature_c"));
    }

    #[test]
    fn type_errors_surface_as_config_errors() {
        let err = Settings::from_toml_str("[pipeline]\nmonitor_interval = \"soon\"").unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
    }

    #[test]
    #[serial_test::serial]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.toml");
        std::fs::write(&path, "[engine]\nframe_limit = 5\nverbose = false\n").unwrap();

        std::env::set_var("RUST_CAPTURE_ENGINE__FRAME_LIMIT", "7");
        std::env::set_var("RUST_CAPTURE_ENGINE__VERBOSE", "true");
        let result = Settings::load_from(&path);
        std::env::remove_var("RUST_CAPTURE_ENGINE__FRAME_LIMIT");
        std::env::remove_var("RUST_CAPTURE_ENGINE__VERBOSE");

        let settings = result.unwrap();
        assert_eq!(settings.engine.frame_limit, 7);
        assert!(settings.engine.verbose);
    }

    #[test]
    #[serial_test::serial]
    fn file_values_apply_without_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.toml");
        std::fs::write(&path, "[engine]\nframe_limit = 5\n").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.engine.frame_limit, 5);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Settings::load_from("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
