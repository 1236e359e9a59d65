//! Camera abstraction consumed by the acquisition stage.
//!
//! A [`FrameSource`] wraps a camera SDK handle: it starts and stops the camera's own
//! acquisition, hands over one buffer at a time, and answers capability queries for the
//! operator front end. The engine never talks to an SDK directly.
//!
//! [`MockCamera`] is a deterministic implementation used by the CLI and the tests.

pub mod mock;

pub use mock::{MockCamera, MockCameraConfig, MockCameraProbe};

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::frame::RawFrame;

/// Failure reported by a [`FrameSource`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// No frame arrived within the requested wait.
    #[error("timed out after {0:?} waiting for a frame")]
    Timeout(Duration),

    /// The camera reported an error it can recover from after a restart.
    #[error("camera error: {0}")]
    Transient(String),

    /// The camera cannot deliver any more frames in this run.
    #[error("camera failed: {0}")]
    Terminal(String),
}

impl SourceError {
    /// Whether restarting acquisition may recover from this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SourceError::Terminal(_))
    }
}

/// Producer of raw camera buffers.
///
/// Implementations are moved into the acquisition thread for the duration of a run and
/// handed back to the engine afterwards, so they need `Send` but not `Sync`.
pub trait FrameSource: Send {
    /// Camera model or identifier for logs.
    fn name(&self) -> &str;

    /// Begin delivering frames.
    ///
    /// # Returns
    /// - Ok(()) once the camera is streaming
    /// - Err if the camera could not be armed
    fn start_acquisition(&mut self) -> Result<(), SourceError>;

    /// Wait up to `timeout` for the next buffer.
    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError>;

    /// Stop and start again after a timeout or a recoverable error.
    fn restart_acquisition(&mut self) -> Result<(), SourceError> {
        self.stop_acquisition();
        self.start_acquisition()
    }

    /// Stop delivering frames. Safe to call when not acquiring.
    fn stop_acquisition(&mut self);

    /// Nominal time between frames, if the camera has a fixed rate.
    fn frame_interval(&self) -> Option<Duration>;

    /// Sensor temperature in degrees Celsius, if the camera reports one.
    ///
    /// Polled from the acquisition thread between frames, so it must not block for long.
    fn sensor_temperature(&self) -> Option<f64> {
        None
    }

    /// Valid values of an enumerated camera feature, keyed by SDK index.
    ///
    /// Unknown features yield an empty map.
    fn enum_options(&self, feature: &str) -> BTreeMap<i64, String> {
        let _ = feature;
        BTreeMap::new()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn start_acquisition(&mut self) -> Result<(), SourceError> {
        (**self).start_acquisition()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        (**self).next_frame(timeout)
    }

    fn restart_acquisition(&mut self) -> Result<(), SourceError> {
        (**self).restart_acquisition()
    }

    fn stop_acquisition(&mut self) {
        (**self).stop_acquisition()
    }

    fn frame_interval(&self) -> Option<Duration> {
        (**self).frame_interval()
    }

    fn sensor_temperature(&self) -> Option<f64> {
        (**self).sensor_temperature()
    }

    fn enum_options(&self, feature: &str) -> BTreeMap<i64, String> {
        (**self).enum_options(feature)
    }
}
