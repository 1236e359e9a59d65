//! Shared helpers for the engine integration tests.
#![allow(dead_code)]

use rust_capture::config::PipelineSettings;
use rust_capture::frame::{Frame, PixelEncoding};
use rust_capture::pipeline::{FrameSink, SinkFactory};
use rust_capture::source::{MockCamera, MockCameraConfig};
use rust_capture::storage::{RawFrameReader, RawFrameWriter};
use rust_capture::Engine;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for any run in these tests to drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Pipeline settings with short monitor ticks so telemetry updates quickly.
pub fn fast_pipeline() -> PipelineSettings {
    PipelineSettings {
        monitor_interval: Duration::from_millis(20),
        fps_window: Duration::from_millis(200),
        min_acquire_timeout: Duration::from_millis(100),
        ..PipelineSettings::default()
    }
}

/// Small free-running camera.
pub fn small_camera() -> MockCameraConfig {
    MockCameraConfig::new(32, 16, PixelEncoding::Mono16)
}

/// Engine over `camera` writing to `output`.
pub fn engine(camera: MockCameraConfig, output: &Path, limit: i64) -> Engine {
    Engine::builder(MockCamera::new(camera))
        .pipeline(fast_pipeline())
        .frame_limit(limit)
        .output_path(output)
        .build()
        .expect("engine builds")
}

/// Sequence numbers stored in a capture file.
pub fn sequences(path: &Path) -> Vec<u64> {
    RawFrameReader::open(path)
        .expect("capture file opens")
        .map(|frame| frame.expect("record decodes").sequence)
        .collect()
}

/// Capture file sink that fails on the `fail_on`-th write (0-based).
pub struct FailingSink {
    inner: RawFrameWriter,
    writes: usize,
    fail_on: usize,
}

impl FrameSink for FailingSink {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let attempt = self.writes;
        self.writes += 1;
        if attempt == self.fail_on {
            return Err(io::Error::other("simulated disk full"));
        }
        self.inner.write_frame(frame)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()
    }
}

/// Opens a [`FailingSink`] for every run.
pub struct FailingSinkFactory {
    pub fail_on: usize,
}

impl SinkFactory for FailingSinkFactory {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(FailingSink {
            inner: RawFrameWriter::create(path)?,
            writes: 0,
            fail_on: self.fail_on,
        }))
    }
}

/// Capture file sink that sleeps before every write.
pub struct SlowSink {
    inner: RawFrameWriter,
    delay: Duration,
}

impl FrameSink for SlowSink {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        std::thread::sleep(self.delay);
        self.inner.write_frame(frame)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.inner.finish()
    }
}

/// Opens a [`SlowSink`] for every run.
pub struct SlowSinkFactory {
    pub delay: Duration,
}

impl SinkFactory for SlowSinkFactory {
    fn open(&self, path: &Path) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(SlowSink {
            inner: RawFrameWriter::create(path)?,
            delay: self.delay,
        }))
    }
}

/// `dir/name` as an owned path.
pub fn output_in(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}
