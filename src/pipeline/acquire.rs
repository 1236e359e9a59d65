//! Acquisition stage: pulls buffers from the camera, numbers them, and feeds queue A.
//!
//! # Acceptance
//!
//! A buffer becomes a pipeline frame only under the accept gate, the same lock a stop
//! request raises its flag under. Once `stop()` has returned, any buffer still coming out
//! of the camera is released back unnumbered, so the acquired count is final.
//!
//! # Camera errors
//!
//! Timeouts and recoverable errors restart the camera's acquisition and the loop carries on
//! with the next sequence number. A run of more than `max_consecutive_errors` of them, or
//! a terminal error, ends acquisition. Either way the frames already queued drain normally.
//!
//! The camera's sensor temperature is read once per `SENSOR_POLL_INTERVAL` between frames
//! and stored in the run counters for the monitor to report.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CloseOnExit, FrameQueue, RunContext};
use crate::engine::control::FrameLimit;
use crate::fault::{FaultSeverity, Stage};
use crate::frame::Frame;
use crate::limits::{MAX_CONSECUTIVE_SOURCE_ERRORS, MIN_ACQUIRE_TIMEOUT, SENSOR_POLL_INTERVAL};
use crate::queue::PushError;
use crate::source::{FrameSource, SourceError};

/// Acquisition tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireSettings {
    /// Run bound
    pub frame_limit: FrameLimit,
    /// Lower bound for a single camera wait
    pub min_timeout: Duration,
    /// Consecutive recoverable errors tolerated before giving up
    pub max_consecutive_errors: u32,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            frame_limit: FrameLimit::Unbounded,
            min_timeout: MIN_ACQUIRE_TIMEOUT,
            max_consecutive_errors: MAX_CONSECUTIVE_SOURCE_ERRORS,
        }
    }
}

/// Why the acquisition loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionEnd {
    /// The frame limit was reached
    LimitReached,
    /// A stop was requested
    StopRequested,
    /// The camera failed
    SourceFailed(String),
    /// Queue A refused a frame because it was closed
    QueueClosed,
}

/// Acquisition stage for one run.
pub struct AcquisitionStage<S> {
    source: S,
    output: Arc<FrameQueue>,
    ctx: RunContext,
    settings: AcquireSettings,
}

impl<S: FrameSource> AcquisitionStage<S> {
    /// Prepare a stage feeding `output`.
    pub fn new(source: S, output: Arc<FrameQueue>, ctx: RunContext, settings: AcquireSettings) -> Self {
        Self {
            source,
            output,
            ctx,
            settings,
        }
    }

    /// Per-request camera wait: twice the frame interval, never below the configured floor.
    pub fn acquire_timeout(&self) -> Duration {
        self.source
            .frame_interval()
            .map(|interval| interval.saturating_mul(2))
            .unwrap_or_default()
            .max(self.settings.min_timeout)
    }

    /// Run until the limit, a stop request, or a camera failure. Returns the source.
    pub fn run(mut self) -> S {
        let close_output = CloseOnExit::new(Arc::clone(&self.output));
        let end = self.acquire_loop();

        self.source.stop_acquisition();
        drop(close_output);
        self.ctx.control.acquisition_finished();

        let acquired = self.ctx.counters.acquired();
        match &end {
            AcquisitionEnd::SourceFailed(reason) => {
                tracing::warn!(acquired, reason = %reason, "acquisition ended by camera failure")
            }
            other => tracing::debug!(acquired, end = ?other, "acquisition finished"),
        }
        self.source
    }

    fn acquire_loop(&mut self) -> AcquisitionEnd {
        if let Err(e) = self.source.start_acquisition() {
            let message = format!("failed to start acquisition: {e}");
            self.ctx.fault(Stage::Acquire, FaultSeverity::Error, None, message.clone());
            return AcquisitionEnd::SourceFailed(message);
        }

        let timeout = self.acquire_timeout();
        let mut next_sequence = 0u64;
        let mut consecutive_errors = 0u32;
        let mut last_sensor_poll = self.poll_sensor();
        tracing::debug!(
            source = self.source.name(),
            limit = %self.settings.frame_limit,
            timeout_ms = timeout.as_millis() as u64,
            "acquisition started"
        );

        loop {
            if self.settings.frame_limit.is_reached(next_sequence) {
                return AcquisitionEnd::LimitReached;
            }
            if self.ctx.control.stop_requested() {
                return AcquisitionEnd::StopRequested;
            }
            if last_sensor_poll.elapsed() >= SENSOR_POLL_INTERVAL {
                last_sensor_poll = self.poll_sensor();
            }

            let raw = match self.source.next_frame(timeout) {
                Ok(raw) => {
                    consecutive_errors = 0;
                    raw
                }
                Err(SourceError::Terminal(reason)) => {
                    self.ctx.counters.record_acquisition_error();
                    let message = format!("camera failed: {reason}");
                    self.ctx.fault(Stage::Acquire, FaultSeverity::Error, None, message.clone());
                    return AcquisitionEnd::SourceFailed(message);
                }
                Err(e) => {
                    self.ctx.counters.record_acquisition_error();
                    consecutive_errors += 1;
                    if let Some(end) = self.recover(e, consecutive_errors) {
                        return end;
                    }
                    continue;
                }
            };

            // Number the frame under the gate so a concurrent stop is never split
            let frame = {
                let _gate = self.ctx.control.accept_gate();
                if self.ctx.control.stop_requested() {
                    None
                } else {
                    let sequence = next_sequence;
                    next_sequence += 1;
                    self.ctx.counters.record_acquired();
                    Some(Frame::from_raw(raw, sequence, Utc::now()))
                }
            };
            let Some(frame) = frame else {
                self.ctx.counters.record_rejected_after_stop();
                tracing::trace!("frame delivered after stop request released");
                return AcquisitionEnd::StopRequested;
            };

            match self.output.push(frame) {
                Ok(()) => {}
                Err(PushError::Full(frame)) => {
                    self.ctx.counters.record_dropped_overflow();
                    self.ctx.fault(
                        Stage::Acquire,
                        FaultSeverity::Error,
                        Some(frame.sequence),
                        format!("processing queue full ({}), frame dropped", self.output.capacity()),
                    );
                }
                Err(PushError::Closed(frame)) => {
                    self.ctx.counters.record_dropped_overflow();
                    self.ctx.fault(
                        Stage::Acquire,
                        FaultSeverity::Error,
                        Some(frame.sequence),
                        "processing queue closed, frame dropped",
                    );
                    return AcquisitionEnd::QueueClosed;
                }
            }
        }
    }

    fn poll_sensor(&self) -> Instant {
        let celsius = self.source.sensor_temperature();
        self.ctx.counters.record_sensor_temperature(celsius);
        tracing::trace!(?celsius, "sensor temperature");
        Instant::now()
    }

    /// Handle a recoverable camera error. Returns an end reason if acquisition should stop.
    fn recover(&mut self, error: SourceError, consecutive: u32) -> Option<AcquisitionEnd> {
        if consecutive > self.settings.max_consecutive_errors {
            let message = format!("giving up after {consecutive} consecutive camera errors, last: {error}");
            self.ctx.fault(Stage::Acquire, FaultSeverity::Error, None, message.clone());
            return Some(AcquisitionEnd::SourceFailed(message));
        }
        self.ctx.fault(
            Stage::Acquire,
            FaultSeverity::Warning,
            None,
            format!("{error}, restarting acquisition"),
        );
        if self.ctx.control.stop_requested() {
            return Some(AcquisitionEnd::StopRequested);
        }
        match self.source.restart_acquisition() {
            Ok(()) => None,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "camera restart failed, retrying");
                None
            }
            Err(e) => {
                let message = format!("camera restart failed: {e}");
                self.ctx.fault(Stage::Acquire, FaultSeverity::Error, None, message.clone());
                Some(AcquisitionEnd::SourceFailed(message))
            }
        }
    }
}
