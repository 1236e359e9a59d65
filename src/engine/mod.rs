//! Capture engine: configuration, lifecycle and the supervisor thread.
//!
//! The [`Engine`] is the control surface a front end drives. It owns the camera, the
//! transform and the output location between runs, and hands them to the stage threads for
//! the duration of a run.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──▶ Running ──stop() / limit / camera failure / write error──▶ Stopping
//!    ▲                                                                              │
//!    └──────────────────────────── drain complete ─────────────────────────────────┘
//! ```
//!
//! `start()` spawns the writer, processor, acquirer and monitor threads, in that order, so
//! every consumer exists before its producer. `stop()` only raises the stop flag and
//! returns; frames already accepted keep flowing to disk. The monitor thread notices the
//! writer exiting, joins every stage, publishes the final telemetry and moves the engine
//! back to `Stopped`.
//!
//! # Telemetry
//!
//! Getters such as [`Engine::acquire_fps`] read the latest snapshot the monitor published.
//! They never touch the queues. [`Engine::acquire_count`] is the exception among the
//! counts: it loads the acquisition counter directly.

pub mod control;

pub use control::{ControlState, FrameLimit, RunControl};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{PipelineSettings, Settings};
use crate::error::{AppResult, CaptureError};
use crate::fault::{FaultLog, FaultSeverity, PipelineFault, Stage};
use crate::pipeline::{
    AcquireSettings, AcquisitionStage, FrameQueue, FrameSink, FrameTransform, Mono16Converter, ProcessingStage,
    RawFileSinkFactory, RunContext, SinkFactory, WritingStage,
};
use crate::source::FrameSource;
use crate::stats::{PipelineCounters, QueueDepths, SharedTelemetry, StatsMonitor, TelemetrySnapshot};
use crate::validation::is_writable_location;

/// Log at INFO when verbose, DEBUG otherwise.
macro_rules! status {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// Run configuration. Changes only while the engine is stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EngineConfig {
    frame_limit: FrameLimit,
    output_path: PathBuf,
}

/// Camera and transform parked between runs.
#[derive(Default)]
struct Parked {
    source: Option<Box<dyn FrameSource>>,
    transform: Option<Box<dyn FrameTransform>>,
    monitor: Option<JoinHandle<()>>,
}

/// Join handles of one run's stage threads.
#[derive(Default)]
struct StageThreads {
    writer: Option<JoinHandle<()>>,
    processor: Option<JoinHandle<Option<Box<dyn FrameTransform>>>>,
    acquirer: Option<JoinHandle<Option<Box<dyn FrameSource>>>>,
}

/// Hands a stage its camera or transform. If the thread never spawns, the engine takes
/// the value back out.
type Handoff<T> = Arc<Mutex<Option<T>>>;

/// Queues of one run.
#[derive(Clone)]
struct RunQueues {
    process: Arc<FrameQueue>,
    write: Arc<FrameQueue>,
}

impl RunQueues {
    fn depths(&self) -> QueueDepths {
        QueueDepths {
            process: self.process.len(),
            process_capacity: self.process.capacity(),
            write: self.write.len(),
            write_capacity: self.write.capacity(),
        }
    }
}

struct EngineShared {
    control: Arc<RunControl>,
    config: Mutex<EngineConfig>,
    pipeline: PipelineSettings,
    counters: Arc<PipelineCounters>,
    faults: Arc<FaultLog>,
    telemetry: SharedTelemetry,
    parked: Mutex<Parked>,
    stages: Mutex<Option<StageThreads>>,
    sink_factory: Box<dyn SinkFactory>,
}

impl EngineShared {
    fn run_context(&self) -> RunContext {
        RunContext {
            counters: Arc::clone(&self.counters),
            faults: Arc::clone(&self.faults),
            control: Arc::clone(&self.control),
        }
    }

    fn stage_fault(&self, stage: Stage, message: impl Into<String>) {
        self.faults
            .record(PipelineFault::new(stage, FaultSeverity::Fatal, None, message));
    }

    /// Join every stage thread and park the camera and transform again.
    fn join_stages(&self, threads: StageThreads) {
        if let Some(handle) = threads.acquirer {
            match handle.join() {
                Ok(source) => {
                    if let Some(source) = source {
                        self.parked.lock().source = Some(source);
                    }
                }
                Err(_) => self.stage_fault(Stage::Acquire, "acquisition thread panicked; camera lost"),
            }
        }
        self.control.acquisition_finished();
        if let Some(handle) = threads.processor {
            match handle.join() {
                Ok(transform) => {
                    if let Some(transform) = transform {
                        self.parked.lock().transform = Some(transform);
                    }
                }
                Err(_) => self.stage_fault(Stage::Process, "processing thread panicked"),
            }
        }
        if let Some(handle) = threads.writer {
            if handle.join().is_err() {
                self.stage_fault(Stage::Write, "writing thread panicked");
            }
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    source: Box<dyn FrameSource>,
    transform: Box<dyn FrameTransform>,
    sink_factory: Box<dyn SinkFactory>,
    pipeline: PipelineSettings,
    frame_limit: i64,
    output_path: PathBuf,
    verbose: bool,
}

impl EngineBuilder {
    /// Queue and timing tuning.
    pub fn pipeline(mut self, pipeline: PipelineSettings) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Replace the default [`Mono16Converter`].
    pub fn transform(mut self, transform: impl FrameTransform + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    /// Replace the default capture file sink.
    pub fn sink_factory(mut self, factory: impl SinkFactory + 'static) -> Self {
        self.sink_factory = Box::new(factory);
        self
    }

    /// Initial frame limit in raw form.
    pub fn frame_limit(mut self, limit: i64) -> Self {
        self.frame_limit = limit;
        self
    }

    /// Initial output path.
    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    /// Initial verbosity.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Validate and build.
    pub fn build(self) -> AppResult<Engine> {
        let frame_limit = FrameLimit::from_raw(self.frame_limit)?;
        self.pipeline.validate()?;
        Ok(Engine {
            shared: Arc::new(EngineShared {
                control: Arc::new(RunControl::new(self.verbose)),
                config: Mutex::new(EngineConfig {
                    frame_limit,
                    output_path: self.output_path,
                }),
                pipeline: self.pipeline,
                counters: Arc::new(PipelineCounters::default()),
                faults: Arc::new(FaultLog::default()),
                telemetry: Arc::new(RwLock::new(TelemetrySnapshot::default())),
                parked: Mutex::new(Parked {
                    source: Some(self.source),
                    transform: Some(self.transform),
                    monitor: None,
                }),
                stages: Mutex::new(None),
                sink_factory: self.sink_factory,
            }),
        })
    }
}

/// Acquisition → processing → writing pipeline with its control surface.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Start building an engine around `source`.
    pub fn builder(source: impl FrameSource + 'static) -> EngineBuilder {
        EngineBuilder {
            source: Box::new(source),
            transform: Box::new(Mono16Converter),
            sink_factory: Box::new(RawFileSinkFactory),
            pipeline: PipelineSettings::default(),
            frame_limit: FrameLimit::UNBOUNDED_RAW,
            output_path: PathBuf::from("output.bin"),
            verbose: false,
        }
    }

    /// Engine with default settings.
    pub fn new(source: impl FrameSource + 'static) -> AppResult<Self> {
        Self::builder(source).build()
    }

    /// Engine configured from loaded [`Settings`].
    pub fn from_settings(source: impl FrameSource + 'static, settings: &Settings) -> AppResult<Self> {
        Self::builder(source)
            .pipeline(settings.pipeline)
            .frame_limit(settings.engine.frame_limit)
            .output_path(settings.engine.output_path.clone())
            .verbose(settings.engine.verbose)
            .build()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Bound the next run. `-1` is unbounded; values below `-1` are rejected.
    pub fn set_frame_limit(&self, limit: i64) -> AppResult<()> {
        let state = self.shared.control.lock_state();
        if *state != ControlState::Stopped {
            return Err(CaptureError::NotStopped(*state));
        }
        let limit = FrameLimit::from_raw(limit)?;
        self.shared.config.lock().frame_limit = limit;
        Ok(())
    }

    /// Output file for the next run.
    pub fn set_output_path(&self, path: impl Into<PathBuf>) -> AppResult<()> {
        let state = self.shared.control.lock_state();
        if *state != ControlState::Stopped {
            return Err(CaptureError::NotStopped(*state));
        }
        self.shared.config.lock().output_path = path.into();
        Ok(())
    }

    /// Switch status and lifecycle logs between INFO and DEBUG. Allowed at any time.
    pub fn set_verbose(&self, verbose: bool) {
        self.shared.control.set_verbose(verbose);
    }

    /// Frame limit in raw form.
    pub fn frame_limit(&self) -> i64 {
        self.shared.config.lock().frame_limit.as_raw()
    }

    /// Output file path.
    pub fn output_path(&self) -> PathBuf {
        self.shared.config.lock().output_path.clone()
    }

    /// Whether status lines are logged at INFO.
    pub fn is_verbose(&self) -> bool {
        self.shared.control.is_verbose()
    }

    /// Queue and timing tuning.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        self.shared.pipeline
    }

    /// Enumerated values of a camera feature. Only available while stopped.
    pub fn source_options(&self, feature: &str) -> AppResult<BTreeMap<i64, String>> {
        let state = self.shared.control.lock_state();
        if *state != ControlState::Stopped {
            return Err(CaptureError::NotStopped(*state));
        }
        let parked = self.shared.parked.lock();
        let source = parked.source.as_ref().ok_or(CaptureError::SourceUnavailable)?;
        Ok(source.enum_options(feature))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Launch a run.
    ///
    /// Fails without side effects unless the engine is `Stopped`. The output file is
    /// created here, so an unusable path is reported synchronously and nothing is spawned.
    pub fn start(&self) -> AppResult<()> {
        let shared = &self.shared;
        let mut state = shared.control.lock_state();
        if *state != ControlState::Stopped {
            return Err(CaptureError::NotStopped(*state));
        }

        let config = shared.config.lock().clone();
        is_writable_location(&config.output_path).map_err(|reason| CaptureError::InvalidOutputPath {
            path: config.output_path.clone(),
            reason: reason.to_string(),
        })?;

        let (source, transform) = {
            let mut parked = shared.parked.lock();
            if let Some(previous) = parked.monitor.take() {
                // already past finish_run, so this returns promptly
                let _ = previous.join();
            }
            let source = parked.source.take().ok_or(CaptureError::SourceUnavailable)?;
            let transform = parked.transform.take().unwrap_or_else(|| {
                tracing::warn!("transform lost in a previous run; using Mono16 conversion");
                Box::new(Mono16Converter) as Box<dyn FrameTransform>
            });
            (source, transform)
        };

        let sink = match shared.sink_factory.open(&config.output_path) {
            Ok(sink) => sink,
            Err(e) => {
                let mut parked = shared.parked.lock();
                parked.source = Some(source);
                parked.transform = Some(transform);
                return Err(CaptureError::InvalidOutputPath {
                    path: config.output_path,
                    reason: e.to_string(),
                });
            }
        };

        let queues = RunQueues {
            process: Arc::new(FrameQueue::new(
                "process",
                shared.pipeline.process_queue_capacity,
                shared.pipeline.backpressure,
            )),
            write: Arc::new(FrameQueue::new(
                "write",
                shared.pipeline.write_queue_capacity,
                shared.pipeline.backpressure,
            )),
        };
        shared.counters.reset();
        shared.faults.reset();
        *shared.telemetry.write() = TelemetrySnapshot {
            queues: queues.depths(),
            ..TelemetrySnapshot::default()
        };

        shared.control.begin_run(&mut state);
        drop(state);

        status!(
            shared.control.is_verbose(),
            source = source.name(),
            limit = %config.frame_limit,
            output = %config.output_path.display(),
            "capture started"
        );
        self.spawn_run(source, transform, sink, config.frame_limit, queues)
    }

    fn spawn_run(
        &self,
        source: Box<dyn FrameSource>,
        transform: Box<dyn FrameTransform>,
        sink: Box<dyn FrameSink>,
        frame_limit: FrameLimit,
        queues: RunQueues,
    ) -> AppResult<()> {
        let shared = &self.shared;
        let ctx = shared.run_context();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let mut threads = StageThreads::default();

        let writer = WritingStage::new(sink, Arc::clone(&queues.write), ctx.clone(), done_tx);
        match spawn_stage(Stage::Write, move || writer.run()) {
            Ok(handle) => threads.writer = Some(handle),
            Err(e) => {
                let mut parked = shared.parked.lock();
                parked.source = Some(source);
                parked.transform = Some(transform);
                drop(parked);
                return Err(self.abort_start(threads, &queues, Stage::Write, e));
            }
        }

        let transform: Handoff<Box<dyn FrameTransform>> = Arc::new(Mutex::new(Some(transform)));
        let processor = {
            let transform = Arc::clone(&transform);
            let input = Arc::clone(&queues.process);
            let output = Arc::clone(&queues.write);
            let ctx = ctx.clone();
            move || {
                let transform = transform.lock().take()?;
                Some(ProcessingStage::new(transform, input, output, ctx).run())
            }
        };
        match spawn_stage(Stage::Process, processor) {
            Ok(handle) => threads.processor = Some(handle),
            Err(e) => {
                let mut parked = shared.parked.lock();
                parked.source = Some(source);
                parked.transform = transform.lock().take();
                drop(parked);
                return Err(self.abort_start(threads, &queues, Stage::Process, e));
            }
        }

        let acquire_settings = AcquireSettings {
            frame_limit,
            min_timeout: shared.pipeline.min_acquire_timeout,
            max_consecutive_errors: shared.pipeline.max_consecutive_source_errors,
        };
        let source: Handoff<Box<dyn FrameSource>> = Arc::new(Mutex::new(Some(source)));
        let acquirer = {
            let source = Arc::clone(&source);
            let output = Arc::clone(&queues.process);
            move || {
                let source = source.lock().take()?;
                Some(AcquisitionStage::new(source, output, ctx, acquire_settings).run())
            }
        };
        match spawn_stage(Stage::Acquire, acquirer) {
            Ok(handle) => threads.acquirer = Some(handle),
            Err(e) => {
                shared.parked.lock().source = source.lock().take();
                return Err(self.abort_start(threads, &queues, Stage::Acquire, e));
            }
        }

        *shared.stages.lock() = Some(threads);
        let monitor_shared = Arc::clone(shared);
        let monitor_queues = queues.clone();
        match spawn_stage(Stage::Monitor, move || supervise(&monitor_shared, &monitor_queues, &done_rx)) {
            Ok(handle) => {
                shared.parked.lock().monitor = Some(handle);
                Ok(())
            }
            Err(e) => {
                let threads = shared.stages.lock().take().unwrap_or_default();
                Err(self.abort_start(threads, &queues, Stage::Monitor, e))
            }
        }
    }

    /// Unwind a partially spawned run and report the spawn failure.
    fn abort_start(&self, threads: StageThreads, queues: &RunQueues, stage: Stage, error: io::Error) -> CaptureError {
        let shared = &self.shared;
        shared.control.request_stop();
        queues.process.close();
        if threads.processor.is_none() {
            queues.write.close();
        }
        shared.join_stages(threads);
        shared.stage_fault(stage, format!("failed to spawn thread: {error}"));
        shared.control.finish_run();
        CaptureError::ThreadSpawn {
            stage: stage.as_str(),
            source: error,
        }
    }

    /// Request a graceful stop. Idempotent; returns immediately.
    ///
    /// No frame is accepted after this returns. Frames already accepted are still
    /// processed and written; poll [`is_monitoring`](Self::is_monitoring) or call
    /// [`wait_stopped`](Self::wait_stopped) to wait for the drain.
    pub fn stop(&self) {
        if self.shared.control.request_stop() {
            status!(self.shared.control.is_verbose(), "stop requested, draining queues");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControlState {
        self.shared.control.state()
    }

    /// True only while `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == ControlState::Running
    }

    /// True while `Running` or `Stopping`, i.e. until the drain completes.
    pub fn is_monitoring(&self) -> bool {
        self.state() != ControlState::Stopped
    }

    /// Block until `Stopped` or `timeout` elapses. Returns whether the engine stopped.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.shared.control.wait_stopped(timeout)
    }

    // =========================================================================
    // Telemetry
    // =========================================================================

    /// Latest published telemetry.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.shared.telemetry.read().clone()
    }

    /// Acquisition rate in frames per second.
    pub fn acquire_fps(&self) -> f64 {
        self.shared.telemetry.read().acquire_fps
    }

    /// Processing rate in frames per second.
    pub fn process_fps(&self) -> f64 {
        self.shared.telemetry.read().process_fps
    }

    /// Writing rate in frames per second.
    pub fn write_fps(&self) -> f64 {
        self.shared.telemetry.read().write_fps
    }

    /// Frames waiting for processing.
    pub fn process_queue_size(&self) -> usize {
        self.shared.telemetry.read().queues.process
    }

    /// Frames waiting to be written.
    pub fn write_queue_size(&self) -> usize {
        self.shared.telemetry.read().queues.write
    }

    /// Frames acquired in the current or last run.
    ///
    /// Read from the live counter rather than the snapshot, so the value is final as soon
    /// as [`stop`](Self::stop) returns.
    pub fn acquire_count(&self) -> u64 {
        self.shared.counters.acquired()
    }

    /// Frames written in the current or last run.
    pub fn written_count(&self) -> u64 {
        self.shared.telemetry.read().counts.written
    }

    /// Acquired frames that did not reach the output file.
    pub fn lost_frame_count(&self) -> u64 {
        self.shared.telemetry.read().counts.lost()
    }

    // =========================================================================
    // Faults
    // =========================================================================

    /// Faults recorded in the current or last run, oldest first.
    pub fn faults(&self) -> Vec<PipelineFault> {
        self.shared.faults.snapshot()
    }

    /// Drain the fault history.
    pub fn take_faults(&self) -> Vec<PipelineFault> {
        self.shared.faults.take()
    }

    /// First fatal fault of the current or last run.
    pub fn fatal_error(&self) -> Option<PipelineFault> {
        self.shared.faults.first_fatal()
    }

    /// `Err` if the current or last run hit a fatal fault.
    pub fn check(&self) -> AppResult<()> {
        match self.fatal_error() {
            None => Ok(()),
            Some(fault) if fault.stage == Stage::Write => Err(CaptureError::WriteFailed(fault.message)),
            Some(fault) => Err(CaptureError::StageFailed {
                stage: fault.stage.as_str(),
                message: fault.message,
            }),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
        self.shared.control.wait_stopped(Duration::MAX);
        let monitor = self.shared.parked.lock().monitor.take();
        if let Some(handle) = monitor {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
thread_local! {
    /// Stage whose thread spawn fails, for exercising the start-abort path.
    static FAIL_SPAWN: std::cell::Cell<Option<Stage>> = const { std::cell::Cell::new(None) };
}

fn spawn_stage<T, F>(stage: Stage, f: F) -> io::Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    #[cfg(test)]
    if FAIL_SPAWN.with(|fail| fail.get()) == Some(stage) {
        return Err(io::Error::other("thread limit reached"));
    }
    thread::Builder::new()
        .name(format!("capture-{stage}"))
        .spawn(f)
}

/// Monitor thread body: publish telemetry until the writer exits, then finish the run.
fn supervise(shared: &EngineShared, queues: &RunQueues, writer_done: &Receiver<()>) {
    let mut stats = StatsMonitor::new(
        Arc::clone(&shared.counters),
        Arc::clone(&shared.telemetry),
        shared.pipeline.fps_window,
    );
    stats.sample(Instant::now(), queues.depths());

    loop {
        match writer_done.recv_timeout(shared.pipeline.monitor_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let snapshot = stats.sample(Instant::now(), queues.depths());
        let verbose = shared.control.is_verbose();
        if shared.control.state() == ControlState::Stopping {
            status!(
                verbose,
                left_to_process = snapshot.queues.process,
                left_to_write = snapshot.queues.write,
                "draining"
            );
        } else {
            status!(
                verbose,
                acquire_fps = snapshot.acquire_fps,
                process_fps = snapshot.process_fps,
                write_fps = snapshot.write_fps,
                process_queue = snapshot.queues.process,
                write_queue = snapshot.queues.write,
                sensor_temperature = ?snapshot.sensor_temperature,
                "pipeline status"
            );
        }
    }

    let threads = shared.stages.lock().take();
    if let Some(threads) = threads {
        shared.join_stages(threads);
    }

    let summary = stats.sample(Instant::now(), queues.depths());
    let counts = summary.counts;
    if counts.is_balanced() {
        status!(
            shared.control.is_verbose(),
            total_written = counts.written,
            acquired = counts.acquired,
            lost = counts.lost(),
            faults = shared.faults.total(),
            "capture stopped"
        );
    } else {
        tracing::warn!(?counts, "capture stopped with unaccounted frames");
    }
    shared.control.finish_run();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MockCamera, MockCameraConfig};
    use tempfile::tempdir;

    const DRAIN: Duration = Duration::from_secs(10);

    #[test]
    fn failed_acquirer_spawn_keeps_the_camera() {
        let dir = tempdir().unwrap();
        let camera = MockCamera::new(MockCameraConfig::default());
        let probe = camera.probe();
        let engine = Engine::builder(camera)
            .frame_limit(4)
            .output_path(dir.path().join("retry.bin"))
            .build()
            .unwrap();

        FAIL_SPAWN.with(|fail| fail.set(Some(Stage::Acquire)));
        let err = engine.start().unwrap_err();
        FAIL_SPAWN.with(|fail| fail.set(None));

        assert!(matches!(err, CaptureError::ThreadSpawn { stage: "acquire", .. }));
        assert_eq!(engine.state(), ControlState::Stopped);
        assert_eq!(probe.starts(), 0);

        engine.start().unwrap();
        assert!(engine.wait_stopped(DRAIN));
        assert_eq!(engine.acquire_count(), 4);
        assert_eq!(probe.starts(), 1);
    }

    #[test]
    fn failed_processor_spawn_keeps_the_transform() {
        let dir = tempdir().unwrap();
        let engine = Engine::builder(MockCamera::new(MockCameraConfig::default()))
            .transform(crate::pipeline::PassThrough)
            .frame_limit(2)
            .output_path(dir.path().join("retry.bin"))
            .build()
            .unwrap();

        FAIL_SPAWN.with(|fail| fail.set(Some(Stage::Process)));
        assert!(engine.start().is_err());
        FAIL_SPAWN.with(|fail| fail.set(None));

        let parked = engine.shared.parked.lock();
        assert_eq!(parked.transform.as_ref().map(|t| t.name()), Some("pass-through"));
        assert!(parked.source.is_some());
    }
}
