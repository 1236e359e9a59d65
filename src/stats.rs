//! Pipeline counters and throughput telemetry.
//!
//! Stages bump [`PipelineCounters`] on the frame path; those are plain atomics, each
//! written by exactly one stage. The monitor thread periodically turns counter readings
//! into per-stage rates with [`RateWindow`] and publishes a complete
//! [`TelemetrySnapshot`]. Readers copy the snapshot under a read lock that no stage ever
//! takes, so polling telemetry cannot slow the frame path down.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::limits::MAX_RATE_SAMPLES;

/// Last reported sensor temperature, stored as `f64` bits with NaN meaning unknown.
#[derive(Debug)]
struct TemperatureGauge(AtomicU64);

impl Default for TemperatureGauge {
    fn default() -> Self {
        Self(AtomicU64::new(f64::NAN.to_bits()))
    }
}

impl TemperatureGauge {
    fn set(&self, celsius: Option<f64>) {
        let value = celsius.unwrap_or(f64::NAN);
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn get(&self) -> Option<f64> {
        let value = f64::from_bits(self.0.load(Ordering::Acquire));
        (!value.is_nan()).then_some(value)
    }
}

/// Hot-path frame counters, plus the sensor temperature gauge acquisition keeps current.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    acquired: AtomicU64,
    processed: AtomicU64,
    written: AtomicU64,
    lost_to_processing: AtomicU64,
    dropped_overflow: AtomicU64,
    discarded_after_fault: AtomicU64,
    rejected_after_stop: AtomicU64,
    acquisition_errors: AtomicU64,
    sensor_temperature: TemperatureGauge,
}

macro_rules! counter_incr {
    ($($(#[$doc:meta])* $fn_name:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $fn_name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineCounters {
    counter_incr! {
        /// A frame was accepted and numbered by acquisition.
        record_acquired => acquired;
        /// A frame passed the transform.
        record_processed => processed;
        /// A frame reached the output file.
        record_written => written;
        /// The transform rejected a frame.
        record_lost_to_processing => lost_to_processing;
        /// A full queue rejected a frame under the `Fail` policy.
        record_dropped_overflow => dropped_overflow;
        /// A frame was drained and discarded after a fatal write error.
        record_discarded_after_fault => discarded_after_fault;
        /// The source delivered a frame after a stop was requested.
        record_rejected_after_stop => rejected_after_stop;
        /// The source returned a timeout or an error.
        record_acquisition_error => acquisition_errors;
    }

    /// Frames accepted so far.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Acquire)
    }

    /// Store the latest sensor temperature reading.
    pub fn record_sensor_temperature(&self, celsius: Option<f64>) {
        self.sensor_temperature.set(celsius);
    }

    /// Latest sensor temperature in degrees Celsius, if the camera reports one.
    pub fn sensor_temperature(&self) -> Option<f64> {
        self.sensor_temperature.get()
    }

    /// Consistent-enough copy of every counter.
    pub fn counts(&self) -> FrameCounts {
        FrameCounts {
            acquired: self.acquired.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            written: self.written.load(Ordering::Acquire),
            lost_to_processing: self.lost_to_processing.load(Ordering::Acquire),
            dropped_overflow: self.dropped_overflow.load(Ordering::Acquire),
            discarded_after_fault: self.discarded_after_fault.load(Ordering::Acquire),
            rejected_after_stop: self.rejected_after_stop.load(Ordering::Acquire),
            acquisition_errors: self.acquisition_errors.load(Ordering::Acquire),
        }
    }

    /// Zero all counters. Only called while no stage is running.
    pub fn reset(&self) {
        for counter in [
            &self.acquired,
            &self.processed,
            &self.written,
            &self.lost_to_processing,
            &self.dropped_overflow,
            &self.discarded_after_fault,
            &self.rejected_after_stop,
            &self.acquisition_errors,
        ] {
            counter.store(0, Ordering::Release);
        }
        self.sensor_temperature.set(None);
    }
}

/// Cumulative frame counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    /// Frames accepted and numbered by acquisition
    pub acquired: u64,
    /// Frames that passed the transform
    pub processed: u64,
    /// Frames appended to the output file
    pub written: u64,
    /// Frames the transform rejected
    pub lost_to_processing: u64,
    /// Frames rejected by a full queue (`Fail` policy)
    pub dropped_overflow: u64,
    /// Frames discarded after a fatal write error
    pub discarded_after_fault: u64,
    /// Frames the source delivered after a stop was requested (never acquired)
    pub rejected_after_stop: u64,
    /// Source timeouts and errors
    pub acquisition_errors: u64,
}

impl FrameCounts {
    /// Acquired frames that did not reach the output file.
    pub fn lost(&self) -> u64 {
        self.lost_to_processing + self.dropped_overflow + self.discarded_after_fault
    }

    /// Whether every acquired frame is either written or counted as lost.
    ///
    /// Only meaningful once the pipeline has drained.
    pub fn is_balanced(&self) -> bool {
        self.acquired == self.written + self.lost()
    }
}

/// Sliding-window rate estimate over periodic counter samples.
#[derive(Debug, Clone)]
pub struct RateWindow {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    max_samples: usize,
}

impl RateWindow {
    /// Create a window covering `window` of history.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::with_capacity(MAX_RATE_SAMPLES),
            max_samples: MAX_RATE_SAMPLES,
        }
    }

    /// Record a cumulative counter reading and return the current rate per second.
    pub fn record(&mut self, now: Instant, count: u64) -> f64 {
        self.samples.push_back((now, count));

        // Keep one sample at or beyond the window edge as the baseline
        while self.samples.len() > 2 {
            let next = self.samples[1].0;
            if now.saturating_duration_since(next) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }

        self.rate()
    }

    /// Rate across the retained samples, 0.0 until two samples exist.
    pub fn rate(&self) -> f64 {
        let (Some(&(t0, c0)), Some(&(t1, c1))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = t1.saturating_duration_since(t0).as_secs_f64();
        if elapsed > 0.0 {
            c1.saturating_sub(c0) as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Instantaneous queue depths read by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    /// Frames waiting for the processing stage (queue A)
    pub process: usize,
    /// Capacity of queue A
    pub process_capacity: usize,
    /// Frames waiting for the writing stage (queue B)
    pub write: usize,
    /// Capacity of queue B
    pub write_capacity: usize,
}

/// Complete telemetry record published by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    /// Acquisition rate in frames per second
    pub acquire_fps: f64,
    /// Processing rate in frames per second
    pub process_fps: f64,
    /// Writing rate in frames per second
    pub write_fps: f64,
    /// Queue depths and capacities
    pub queues: QueueDepths,
    /// Cumulative counts
    pub counts: FrameCounts,
    /// Sensor temperature in degrees Celsius, if the camera reports one
    pub sensor_temperature: Option<f64>,
    /// Host time of the sample
    pub sampled_at: DateTime<Utc>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            acquire_fps: 0.0,
            process_fps: 0.0,
            write_fps: 0.0,
            queues: QueueDepths::default(),
            counts: FrameCounts::default(),
            sensor_temperature: None,
            sampled_at: Utc::now(),
        }
    }
}

impl TelemetrySnapshot {
    /// Stage rates as fractions of the fastest stage, for bar displays.
    ///
    /// The divisor is never below 1, so idle stages show 0 rather than NaN.
    pub fn rate_percentages(&self) -> [f64; 3] {
        let fastest = self.acquire_fps.max(self.process_fps).max(self.write_fps);
        let divisor = fastest.max(1.0);
        [
            self.acquire_fps / divisor,
            self.process_fps / divisor,
            self.write_fps / divisor,
        ]
    }

    /// Queue depths as fractions of their capacities.
    pub fn queue_fill(&self) -> [f64; 2] {
        let fill = |depth: usize, capacity: usize| {
            if capacity == 0 {
                0.0
            } else {
                depth as f64 / capacity as f64
            }
        };
        [
            fill(self.queues.process, self.queues.process_capacity),
            fill(self.queues.write, self.queues.write_capacity),
        ]
    }
}

/// Telemetry slot shared between the monitor and readers.
pub type SharedTelemetry = Arc<RwLock<TelemetrySnapshot>>;

/// Turns counter readings into published snapshots. Owned by the monitor thread.
pub struct StatsMonitor {
    counters: Arc<PipelineCounters>,
    published: SharedTelemetry,
    acquire: RateWindow,
    process: RateWindow,
    write: RateWindow,
}

impl StatsMonitor {
    /// Create a monitor publishing into `published`.
    pub fn new(counters: Arc<PipelineCounters>, published: SharedTelemetry, window: Duration) -> Self {
        Self {
            counters,
            published,
            acquire: RateWindow::new(window),
            process: RateWindow::new(window),
            write: RateWindow::new(window),
        }
    }

    /// Take a sample, publish it, and return a copy.
    pub fn sample(&mut self, now: Instant, queues: QueueDepths) -> TelemetrySnapshot {
        let counts = self.counters.counts();
        let snapshot = TelemetrySnapshot {
            acquire_fps: self.acquire.record(now, counts.acquired),
            process_fps: self.process.record(now, counts.processed),
            write_fps: self.write.record(now, counts.written),
            queues,
            counts,
            sensor_temperature: self.counters.sensor_temperature(),
            sampled_at: Utc::now(),
        };
        *self.published.write() = snapshot.clone();
        snapshot
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.published.read().clone()
    }
}
