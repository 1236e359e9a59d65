//! Custom error types for the capture engine.
//!
//! This module defines the primary error type, `CaptureError`, used by every synchronous
//! entry point of the crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to report the failures a caller can act on.
//!
//! ## Error Hierarchy
//!
//! `CaptureError` consolidates:
//!
//! - **`Config`**: Wraps errors from `figment`, typically parsing or type errors in the
//!   configuration file or environment overrides.
//! - **`Configuration`**, **`InvalidFrameLimit`**, **`InvalidOutputPath`**: Semantic
//!   configuration errors. They are reported synchronously from setters and `start()`; the
//!   pipeline never launches.
//! - **`NotStopped`**, **`SourceUnavailable`**, **`ThreadSpawn`**: Lifecycle errors from the
//!   engine's control surface.
//! - **`Io`**, **`Format`**: Output file I/O and layout errors.
//! - **`WriteFailed`**, **`StageFailed`**: The fatal failure of a run (a write error, or a
//!   stage thread that panicked), surfaced through
//!   [`Engine::check`](crate::engine::Engine::check).
//!
//! Failures inside the stage threads never cross thread boundaries as errors. They are
//! recorded as [`PipelineFault`](crate::fault::PipelineFault)s and counters instead.

use crate::engine::ControlState;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// Primary error type for the capture engine.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid frame limit {0}: must be -1 (unbounded) or a non-negative count")]
    InvalidFrameLimit(i64),

    #[error("Output path '{}' is not usable: {reason}", path.display())]
    InvalidOutputPath { path: PathBuf, reason: String },

    #[error("Operation requires the engine to be stopped (currently {0})")]
    NotStopped(ControlState),

    #[error("Frame source is unavailable (lost by a previous run)")]
    SourceUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn {stage} thread: {source}")]
    ThreadSpawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Frame too large: {bytes} bytes exceeds limit of {max_bytes} bytes")]
    FrameTooLarge { bytes: usize, max_bytes: usize },

    #[error("Frame dimensions too large: {width}x{height} exceeds max dimension {max_dimension}")]
    FrameDimensionsTooLarge {
        width: u32,
        height: u32,
        max_dimension: u32,
    },

    #[error("Size overflow while computing {context}")]
    SizeOverflow { context: &'static str },

    #[error("Output format error: {0}")]
    Format(String),

    #[error("Writing stage failed: {0}")]
    WriteFailed(String),

    #[error("{stage} stage failed: {message}")]
    StageFailed { stage: &'static str, message: String },
}

impl From<figment::Error> for CaptureError {
    fn from(value: figment::Error) -> Self {
        CaptureError::Config(Box::new(value))
    }
}

impl CaptureError {
    /// Whether the error leaves the engine usable without changing configuration.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CaptureError::NotStopped(_) | CaptureError::WriteFailed(_) | CaptureError::ThreadSpawn { .. }
        )
    }
}
