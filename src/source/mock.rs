//! Deterministic mock camera.
//!
//! Produces a diagonal gradient with per-frame noise in any [`PixelEncoding`], paced at a
//! configurable frame rate, with optional row padding so the converter's stride handling
//! is exercised. Failures can be scripted by call index, which is how the tests drive the
//! acquisition stage's restart and shutdown paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{FrameSource, SourceError};
use crate::frame::{PixelEncoding, RawFrame};

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Mock camera geometry, pacing and scripted failures.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCameraConfig {
    /// Sensor width in pixels
    pub width: u32,
    /// Sensor height in pixels
    pub height: u32,
    /// Encoding of delivered buffers
    pub encoding: PixelEncoding,
    /// Extra bytes appended to every row
    pub row_padding: usize,
    /// Delivery rate; 0 delivers as fast as the pipeline asks
    pub frame_rate_hz: f64,
    /// `next_frame` call indices (from 0) that time out instead of delivering
    pub timeouts_at: BTreeSet<u64>,
    /// `next_frame` call indices that fail with a recoverable error
    pub transient_at: BTreeSet<u64>,
    /// `next_frame` call indices that deliver a buffer one row short
    pub truncated_at: BTreeSet<u64>,
    /// Fail terminally once this many frames have been delivered
    pub terminal_after: Option<u64>,
    /// Refuse to start
    pub fail_start: bool,
    /// Reported sensor temperature in degrees Celsius
    pub sensor_temperature_c: Option<f64>,
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            encoding: PixelEncoding::Mono16,
            row_padding: 0,
            frame_rate_hz: 0.0,
            timeouts_at: BTreeSet::new(),
            transient_at: BTreeSet::new(),
            truncated_at: BTreeSet::new(),
            terminal_after: None,
            fail_start: false,
            sensor_temperature_c: Some(-25.0),
        }
    }
}

impl MockCameraConfig {
    /// Default geometry with the given size and encoding.
    pub fn new(width: u32, height: u32, encoding: PixelEncoding) -> Self {
        Self {
            width,
            height,
            encoding,
            ..Self::default()
        }
    }

    /// Pace delivery at `hz` frames per second.
    pub fn with_frame_rate(mut self, hz: f64) -> Self {
        self.frame_rate_hz = hz;
        self
    }

    /// Append `bytes` of padding to every row.
    pub fn with_row_padding(mut self, bytes: usize) -> Self {
        self.row_padding = bytes;
        self
    }

    /// Report `celsius` as the sensor temperature, or nothing.
    pub fn with_sensor_temperature(mut self, celsius: Option<f64>) -> Self {
        self.sensor_temperature_c = celsius;
        self
    }

    /// Time out on the given call index.
    pub fn timeout_at(mut self, call: u64) -> Self {
        self.timeouts_at.insert(call);
        self
    }

    /// Fail recoverably on the given call index.
    pub fn transient_at(mut self, call: u64) -> Self {
        self.transient_at.insert(call);
        self
    }

    /// Deliver a short buffer on the given call index.
    pub fn truncated_at(mut self, call: u64) -> Self {
        self.truncated_at.insert(call);
        self
    }

    /// Fail terminally after `frames` deliveries.
    pub fn terminal_after(mut self, frames: u64) -> Self {
        self.terminal_after = Some(frames);
        self
    }

    /// Refuse `start_acquisition`.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    starts: AtomicU64,
    stops: AtomicU64,
    calls: AtomicU64,
    delivered: AtomicU64,
    acquiring: AtomicBool,
}

/// Read-only view of a [`MockCamera`]'s activity, usable after the camera has been moved
/// into an engine.
#[derive(Debug, Clone)]
pub struct MockCameraProbe {
    state: Arc<ProbeState>,
}

impl MockCameraProbe {
    /// Successful `start_acquisition` calls, restarts included.
    pub fn starts(&self) -> u64 {
        self.state.starts.load(Ordering::Acquire)
    }

    /// `stop_acquisition` calls.
    pub fn stops(&self) -> u64 {
        self.state.stops.load(Ordering::Acquire)
    }

    /// `next_frame` calls.
    pub fn calls(&self) -> u64 {
        self.state.calls.load(Ordering::Acquire)
    }

    /// Frames handed out.
    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Acquire)
    }

    /// Whether the camera is currently acquiring.
    pub fn is_acquiring(&self) -> bool {
        self.state.acquiring.load(Ordering::Acquire)
    }
}

/// Synthetic camera implementing [`FrameSource`].
pub struct MockCamera {
    config: MockCameraConfig,
    probe: Arc<ProbeState>,
    next_due: Option<Instant>,
}

impl MockCamera {
    /// Create a mock camera.
    pub fn new(config: MockCameraConfig) -> Self {
        Self {
            config,
            probe: Arc::new(ProbeState::default()),
            next_due: None,
        }
    }

    /// Handle for observing the camera from tests.
    pub fn probe(&self) -> MockCameraProbe {
        MockCameraProbe {
            state: Arc::clone(&self.probe),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &MockCameraConfig {
        &self.config
    }

    /// Bytes per delivered row, padding included.
    pub fn stride(&self) -> usize {
        self.config.encoding.row_bytes(self.config.width) + self.config.row_padding
    }

    fn max_value(&self) -> u32 {
        match self.config.encoding {
            PixelEncoding::Mono8 => 0xFF,
            PixelEncoding::Mono12 | PixelEncoding::Mono12Packed => 0x0FFF,
            PixelEncoding::Mono16 => 0xFFFF,
            PixelEncoding::Mono32 => 0xFFFF_FFFF,
        }
    }

    /// Intensity of pixel (x, y) in frame `frame_num`.
    fn pixel(&self, x: usize, y: usize, frame_num: u64) -> u32 {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let max = u64::from(self.max_value());
        let gradient = ((x + y) as u64 * max) / (w + h).max(1) as u64;
        let seed = prng(frame_num.wrapping_mul(2654435761) ^ (y * w + x) as u64);
        let noise = seed % (max / 64 + 1);
        gradient.saturating_add(noise).min(max) as u32
    }

    fn render(&self, frame_num: u64) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let stride = self.stride();
        let mut buffer = Vec::with_capacity(stride * height);

        for y in 0..height {
            let row_start = buffer.len();
            match self.config.encoding {
                PixelEncoding::Mono8 => {
                    buffer.extend((0..width).map(|x| self.pixel(x, y, frame_num) as u8));
                }
                PixelEncoding::Mono12 | PixelEncoding::Mono16 => {
                    for x in 0..width {
                        buffer.extend_from_slice(&(self.pixel(x, y, frame_num) as u16).to_le_bytes());
                    }
                }
                PixelEncoding::Mono12Packed => {
                    for x in (0..width).step_by(2) {
                        let a = self.pixel(x, y, frame_num) as u16;
                        buffer.push((a >> 4) as u8);
                        if x + 1 < width {
                            let b = self.pixel(x + 1, y, frame_num) as u16;
                            buffer.push(((a & 0x0F) | ((b & 0x0F) << 4)) as u8);
                            buffer.push((b >> 4) as u8);
                        } else {
                            buffer.push((a & 0x0F) as u8);
                        }
                    }
                }
                PixelEncoding::Mono32 => {
                    for x in 0..width {
                        buffer.extend_from_slice(&self.pixel(x, y, frame_num).to_le_bytes());
                    }
                }
            }
            buffer.resize(row_start + stride, 0);
        }
        buffer
    }

    /// Sleep until the next frame is due. Returns false if that exceeds `timeout`.
    fn pace(&mut self, timeout: Duration) -> bool {
        let Some(interval) = self.frame_interval() else {
            return true;
        };
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        let wait = due.saturating_duration_since(now);
        if wait > timeout {
            std::thread::sleep(timeout);
            return false;
        }
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        self.next_due = Some(due.max(now) + interval);
        true
    }
}

impl FrameSource for MockCamera {
    fn name(&self) -> &str {
        "mock"
    }

    fn start_acquisition(&mut self) -> Result<(), SourceError> {
        if self.config.fail_start {
            return Err(SourceError::Terminal("mock camera refused to start".into()));
        }
        self.next_due = None;
        self.probe.starts.fetch_add(1, Ordering::AcqRel);
        self.probe.acquiring.store(true, Ordering::Release);
        tracing::debug!(
            width = self.config.width,
            height = self.config.height,
            encoding = %self.config.encoding,
            "mock camera acquisition started"
        );
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame, SourceError> {
        if !self.probe.acquiring.load(Ordering::Acquire) {
            return Err(SourceError::Transient("acquisition not started".into()));
        }
        let call = self.probe.calls.fetch_add(1, Ordering::AcqRel);
        let delivered = self.probe.delivered.load(Ordering::Acquire);

        if self.config.terminal_after.is_some_and(|n| delivered >= n) {
            return Err(SourceError::Terminal(format!(
                "mock camera exhausted after {delivered} frames"
            )));
        }
        // scripted timeouts return at once
        if self.config.timeouts_at.contains(&call) {
            return Err(SourceError::Timeout(timeout));
        }
        if self.config.transient_at.contains(&call) {
            return Err(SourceError::Transient(format!("scripted failure on call {call}")));
        }
        if !self.pace(timeout) {
            return Err(SourceError::Timeout(timeout));
        }

        let mut data = self.render(delivered);
        if self.config.truncated_at.contains(&call) {
            data.truncate(data.len().saturating_sub(self.stride()));
        }
        self.probe.delivered.fetch_add(1, Ordering::AcqRel);

        Ok(RawFrame {
            width: self.config.width,
            height: self.config.height,
            stride: self.stride(),
            encoding: self.config.encoding,
            device_timestamp: Some(delivered),
            data: data.into(),
        })
    }

    fn stop_acquisition(&mut self) {
        if self.probe.acquiring.swap(false, Ordering::AcqRel) {
            self.probe.stops.fetch_add(1, Ordering::AcqRel);
            tracing::debug!("mock camera acquisition stopped");
        }
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.config.frame_rate_hz > 0.0).then(|| Duration::from_secs_f64(1.0 / self.config.frame_rate_hz))
    }

    fn sensor_temperature(&self) -> Option<f64> {
        self.config.sensor_temperature_c
    }

    fn enum_options(&self, feature: &str) -> BTreeMap<i64, String> {
        let options: &[&str] = match feature {
            "PixelEncoding" => &["Mono8", "Mono12", "Mono12Packed", "Mono16", "Mono32"],
            "CycleMode" => &["Fixed", "Continuous"],
            "TriggerMode" => &["Internal", "External", "Software"],
            _ => &[],
        };
        options
            .iter()
            .enumerate()
            .map(|(i, name)| (i as i64, (*name).to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn delivers_padded_rows() {
        let mut camera = MockCamera::new(MockCameraConfig::new(10, 4, PixelEncoding::Mono16).with_row_padding(6));
        camera.start_acquisition().unwrap();
        let frame = camera.next_frame(WAIT).unwrap();
        assert_eq!(frame.stride, 26);
        assert_eq!(frame.data.len(), 26 * 4);
        assert_eq!(frame.device_timestamp, Some(0));
    }

    #[test]
    fn packed_rows_have_expected_length() {
        let mut camera = MockCamera::new(MockCameraConfig::new(5, 2, PixelEncoding::Mono12Packed));
        camera.start_acquisition().unwrap();
        let frame = camera.next_frame(WAIT).unwrap();
        assert_eq!(frame.stride, 8);
        assert_eq!(frame.data.len(), 16);
    }

    #[test]
    fn scripted_failures_follow_call_index() {
        let config = MockCameraConfig::default()
            .timeout_at(1)
            .transient_at(2)
            .terminal_after(3);
        let mut camera = MockCamera::new(config);
        let probe = camera.probe();
        camera.start_acquisition().unwrap();

        assert!(camera.next_frame(WAIT).is_ok());
        assert_eq!(camera.next_frame(WAIT).unwrap_err(), SourceError::Timeout(WAIT));
        assert!(matches!(camera.next_frame(WAIT), Err(SourceError::Transient(_))));
        assert!(camera.next_frame(WAIT).is_ok());
        assert!(camera.next_frame(WAIT).is_ok());
        assert!(matches!(camera.next_frame(WAIT), Err(SourceError::Terminal(_))));
        assert_eq!(probe.delivered(), 3);
    }

    #[test]
    fn frames_are_deterministic_per_index() {
        let mut a = MockCamera::new(MockCameraConfig::default());
        let mut b = MockCamera::new(MockCameraConfig::default());
        a.start_acquisition().unwrap();
        b.start_acquisition().unwrap();
        assert_eq!(a.next_frame(WAIT).unwrap().data, b.next_frame(WAIT).unwrap().data);
    }

    #[test]
    fn slow_rate_times_out() {
        let mut camera = MockCamera::new(MockCameraConfig::default().with_frame_rate(1.0));
        camera.start_acquisition().unwrap();
        // first frame is due immediately, the second one second later
        assert!(camera.next_frame(Duration::from_millis(10)).is_ok());
        assert!(matches!(
            camera.next_frame(Duration::from_millis(10)),
            Err(SourceError::Timeout(_))
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut camera = MockCamera::new(MockCameraConfig::default());
        let probe = camera.probe();
        camera.start_acquisition().unwrap();
        camera.stop_acquisition();
        camera.stop_acquisition();
        assert_eq!(probe.stops(), 1);
        assert!(!probe.is_acquiring());
    }

    #[test]
    fn reports_configured_temperature() {
        assert_eq!(MockCamera::new(MockCameraConfig::default()).sensor_temperature(), Some(-25.0));
        let uncooled = MockCameraConfig::default().with_sensor_temperature(None);
        assert_eq!(MockCamera::new(uncooled).sensor_temperature(), None);
    }

    #[test]
    fn reports_enum_options() {
        let camera = MockCamera::new(MockCameraConfig::default());
        let encodings = camera.enum_options("PixelEncoding");
        assert_eq!(encodings.get(&2).map(String::as_str), Some("Mono12Packed"));
        assert!(camera.enum_options("Gain").is_empty());
    }
}
