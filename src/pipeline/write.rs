//! Writing stage: appends frames from queue B to the output sink in arrival order.
//!
//! A write error is fatal for the run. The stage records it, requests a pipeline stop as
//! if the operator had pressed stop, and keeps draining queue B so that the upstream stages
//! never block on a full queue. Drained frames are counted as discarded. The sink is still
//! finalised so everything written before the error reaches the disk.

use crossbeam_channel::Sender;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::{FrameQueue, RunContext, StopOnPanic};
use crate::fault::{FaultSeverity, Stage};
use crate::frame::Frame;
use crate::storage::RawFrameWriter;

/// Destination of the frame stream.
pub trait FrameSink: Send {
    /// Append one frame.
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()>;

    /// Flush and sync everything appended so far.
    fn finish(&mut self) -> io::Result<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        (**self).write_frame(frame)
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

/// Opens the sink for a run. Called synchronously from `start()`.
pub trait SinkFactory: Send + Sync {
    /// Open a sink writing to `path`.
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameSink>>;
}

impl<F> SinkFactory for F
where
    F: Fn(&Path) -> io::Result<Box<dyn FrameSink>> + Send + Sync,
{
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameSink>> {
        self(path)
    }
}

/// Factory producing [`RawFrameWriter`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFileSinkFactory;

impl SinkFactory for RawFileSinkFactory {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(RawFrameWriter::create(path)?))
    }
}

/// Writing stage for one run.
pub struct WritingStage {
    sink: Box<dyn FrameSink>,
    input: Arc<FrameQueue>,
    ctx: RunContext,
    done: Sender<()>,
}

impl WritingStage {
    /// Prepare a stage draining `input` into `sink`.
    ///
    /// `done` is dropped when the stage exits, which is how the supervisor learns that the
    /// drain is complete.
    pub fn new(sink: Box<dyn FrameSink>, input: Arc<FrameQueue>, ctx: RunContext, done: Sender<()>) -> Self {
        Self {
            sink,
            input,
            ctx,
            done,
        }
    }

    /// Run until `input` is closed and drained.
    pub fn run(mut self) {
        let _guard = StopOnPanic::new(Arc::clone(&self.input), Arc::clone(&self.ctx.control));
        let mut failed = false;

        while let Some(frame) = self.input.pop() {
            if failed {
                self.ctx.counters.record_discarded_after_fault();
                continue;
            }
            match self.sink.write_frame(&frame) {
                Ok(()) => self.ctx.counters.record_written(),
                Err(e) => {
                    failed = true;
                    self.ctx.counters.record_discarded_after_fault();
                    self.ctx.fault(
                        Stage::Write,
                        FaultSeverity::Fatal,
                        Some(frame.sequence),
                        format!("write failed: {e}"),
                    );
                    self.ctx.control.request_stop();
                }
            }
        }

        if let Err(e) = self.sink.finish() {
            let severity = if failed { FaultSeverity::Error } else { FaultSeverity::Fatal };
            self.ctx
                .fault(Stage::Write, severity, None, format!("failed to finalise output: {e}"));
        }
        tracing::debug!(failed, "writing finished");
        drop(self.done);
    }
}
