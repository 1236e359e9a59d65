//! # Rust Capture Library
//!
//! A three-stage camera capture pipeline: frames are pulled from a camera, transformed, and
//! appended to a capture file, each stage on its own thread and decoupled from the next by
//! a bounded queue. A slow disk throttles acquisition instead of growing memory, and a stop
//! request never loses a frame that was already accepted.
//!
//! ## Crate Structure
//!
//! - **`engine`**: The [`Engine`] control surface: configuration, start/stop lifecycle,
//!   telemetry getters and the supervisor thread.
//! - **`pipeline`**: The acquisition, processing and writing stages and the traits at their
//!   seams ([`FrameTransform`](pipeline::FrameTransform), [`FrameSink`](pipeline::FrameSink)).
//! - **`source`**: The [`FrameSource`](source::FrameSource) camera abstraction and a
//!   simulated camera.
//! - **`queue`**: The bounded blocking queue between stages.
//! - **`frame`**: Pixel encodings and the frame types passed between stages.
//! - **`storage`**: The capture file format with its writer and reader.
//! - **`stats`**: Per-run counters and the rate/queue telemetry snapshot.
//! - **`fault`**: Stage faults recorded during a run.
//! - **`config`**: Layered configuration (defaults, TOML file, environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The crate-wide [`CaptureError`].
//! - **`limits`** and **`validation`**: Shared bounds and parameter checks.

pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod frame;
pub mod limits;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod stats;
pub mod storage;
pub mod validation;

pub use config::Settings;
pub use engine::{ControlState, Engine, EngineBuilder, FrameLimit};
pub use error::{AppResult, CaptureError};
pub use fault::{FaultSeverity, PipelineFault, Stage};
pub use frame::{Frame, PixelEncoding, RawFrame};
pub use stats::{FrameCounts, TelemetrySnapshot};
