//! The three frame-path stages.
//!
//! ```text
//! FrameSource ─▶ acquire ─▶ queue A ─▶ process ─▶ queue B ─▶ write ─▶ FrameSink
//! ```
//!
//! Each stage runs on its own thread and owns its end of the queues. A stage only
//! suspends inside a queue `push`/`pop` (or inside the source's `next_frame`), so a slow
//! stage throttles its producer instead of dropping frames. End of stream propagates
//! downstream by closing queues: acquisition closes A when it exits, processing closes B
//! once A is drained, and the writer exits once B is drained.

pub mod acquire;
pub mod process;
pub mod write;

pub use acquire::{AcquireSettings, AcquisitionStage};
pub use process::{FrameTransform, Mono16Converter, PassThrough, ProcessingStage, TransformError};
pub use write::{FrameSink, RawFileSinkFactory, SinkFactory, WritingStage};

use std::sync::Arc;

use crate::engine::control::RunControl;
use crate::fault::{FaultLog, FaultSeverity, PipelineFault, Stage};
use crate::frame::Frame;
use crate::queue::BoundedFrameQueue;
use crate::stats::PipelineCounters;

/// Queue carrying frames between two stages.
pub type FrameQueue = BoundedFrameQueue<Frame>;

/// Handles every stage thread shares for one run.
#[derive(Clone)]
pub struct RunContext {
    /// Hot-path counters
    pub counters: Arc<PipelineCounters>,
    /// Fault history
    pub faults: Arc<FaultLog>,
    /// Lifecycle and stop flag
    pub control: Arc<RunControl>,
}

impl RunContext {
    /// Record a fault from `stage`.
    pub fn fault(&self, stage: Stage, severity: FaultSeverity, sequence: Option<u64>, message: impl Into<String>) {
        self.faults
            .record(PipelineFault::new(stage, severity, sequence, message));
    }
}

/// Closes a queue when the owning stage exits, including by unwinding.
pub(crate) struct CloseOnExit {
    queue: Arc<FrameQueue>,
}

impl CloseOnExit {
    pub(crate) fn new(queue: Arc<FrameQueue>) -> Self {
        Self { queue }
    }
}

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Requests a stop and closes the stage's input if the stage unwinds, so upstream stages
/// blocked on a full queue are released.
pub(crate) struct StopOnPanic {
    input: Arc<FrameQueue>,
    control: Arc<RunControl>,
}

impl StopOnPanic {
    pub(crate) fn new(input: Arc<FrameQueue>, control: Arc<RunControl>) -> Self {
        Self { input, control }
    }
}

impl Drop for StopOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.control.request_stop();
            self.input.close();
        }
    }
}
