//! End-to-end runs of the capture pipeline against the mock camera and real capture files.

mod common;

use common::*;
use rust_capture::fault::{FaultSeverity, Stage};
use rust_capture::pipeline::PassThrough;
use rust_capture::source::MockCamera;
use rust_capture::storage::summarize;
use rust_capture::{CaptureError, ControlState, Engine};
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn frame_limit_writes_exactly_that_many_frames() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "limit.bin");
    let engine = engine(small_camera(), &output, 10);

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT), "run did not finish");

    assert_eq!(engine.state(), ControlState::Stopped);
    assert_eq!(engine.acquire_count(), 10);
    assert_eq!(engine.written_count(), 10);
    assert_eq!(engine.lost_frame_count(), 0);
    assert_eq!(sequences(&output), (0..10).collect::<Vec<_>>());
    assert!(engine.check().is_ok());

    let summary = summarize(&output).unwrap();
    assert!(summary.contiguous);
    assert_eq!(summary.geometry.map(|(w, h, _)| (w, h)), Some((32, 16)));
}

#[test]
fn fifth_write_failure_stops_the_run() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "disk_full.bin");
    let engine = Engine::builder(MockCamera::new(small_camera()))
        .pipeline(fast_pipeline())
        .sink_factory(FailingSinkFactory { fail_on: 4 })
        .output_path(&output)
        .build()
        .unwrap();

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT), "write failure did not stop the run");

    assert!(!engine.is_monitoring());
    assert_eq!(sequences(&output), vec![0, 1, 2, 3]);
    assert_eq!(engine.written_count(), 4);

    let fatal = engine.fatal_error().expect("fatal fault recorded");
    assert_eq!(fatal.stage, Stage::Write);
    assert_eq!(fatal.severity, FaultSeverity::Fatal);
    assert_eq!(fatal.sequence, Some(4));
    assert!(matches!(engine.check(), Err(CaptureError::WriteFailed(_))));

    let counts = engine.snapshot().counts;
    assert!(counts.acquired >= 5);
    assert!(counts.is_balanced(), "unbalanced counts: {counts:?}");
}

#[test]
fn taking_faults_keeps_the_fatal_error() {
    let dir = tempdir().unwrap();
    let engine = Engine::builder(MockCamera::new(small_camera()))
        .pipeline(fast_pipeline())
        .sink_factory(FailingSinkFactory { fail_on: 4 })
        .output_path(output_in(dir.path(), "taken.bin"))
        .build()
        .unwrap();

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT));

    let taken = engine.take_faults();
    assert!(taken.iter().any(|f| f.stage == Stage::Write && f.sequence == Some(4)));
    assert!(engine.faults().is_empty());
    assert!(engine.take_faults().is_empty());

    assert_eq!(engine.fatal_error().and_then(|f| f.sequence), Some(4));
    assert!(matches!(engine.check(), Err(CaptureError::WriteFailed(_))));
}

#[test]
fn pass_through_keeps_the_camera_encoding() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "raw8.bin");
    let camera = rust_capture::source::MockCameraConfig::new(24, 10, rust_capture::PixelEncoding::Mono8);
    let engine = Engine::builder(MockCamera::new(camera))
        .pipeline(fast_pipeline())
        .transform(PassThrough)
        .frame_limit(5)
        .output_path(&output)
        .build()
        .unwrap();

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT));

    assert_eq!(sequences(&output), (0..5).collect::<Vec<_>>());
    let summary = summarize(&output).unwrap();
    assert_eq!(
        summary.geometry,
        Some((24, 10, rust_capture::PixelEncoding::Mono8))
    );
    assert_eq!(summary.payload_bytes, 5 * 24 * 10);
    assert!(engine.check().is_ok());
}

#[test]
fn stop_with_backlog_writes_every_accepted_frame() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "backlog.bin");
    let camera = MockCamera::new(small_camera());
    let probe = camera.probe();
    let engine = Engine::builder(camera)
        .pipeline(fast_pipeline())
        .sink_factory(SlowSinkFactory {
            delay: Duration::from_millis(2),
        })
        .output_path(&output)
        .build()
        .unwrap();

    engine.start().unwrap();
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while engine.process_queue_size() + engine.write_queue_size() < 50 {
        assert!(Instant::now() < deadline, "queues never filled");
        std::thread::sleep(Duration::from_millis(10));
    }

    engine.stop();
    let delivered_at_stop = probe.delivered();
    assert_eq!(engine.state(), ControlState::Stopping);
    assert!(engine.is_monitoring());
    assert!(!engine.is_running());

    assert!(engine.wait_stopped(DRAIN_TIMEOUT), "drain did not finish");
    let counts = engine.snapshot().counts;
    assert!(counts.acquired <= delivered_at_stop);
    assert_eq!(counts.written, counts.acquired);
    assert_eq!(engine.process_queue_size(), 0);
    assert_eq!(engine.write_queue_size(), 0);
    assert_eq!(sequences(&output), (0..counts.acquired).collect::<Vec<_>>());
}

#[test]
fn rejected_frame_is_counted_and_skipped() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "truncated.bin");
    let engine = engine(small_camera().truncated_at(3), &output, 10);

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT));

    let counts = engine.snapshot().counts;
    assert_eq!(counts.acquired, 10);
    assert_eq!(counts.lost_to_processing, 1);
    assert_eq!(counts.written, 9);
    assert!(counts.is_balanced());

    let expected: Vec<u64> = (0..10).filter(|&s| s != 3).collect();
    assert_eq!(sequences(&output), expected);

    let fault = engine
        .faults()
        .into_iter()
        .find(|f| f.stage == Stage::Process)
        .expect("processing fault recorded");
    assert_eq!(fault.sequence, Some(3));
    assert!(engine.check().is_ok(), "a dropped frame is not fatal");
}

#[test]
fn terminal_camera_error_drains_queued_frames() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "terminal.bin");
    let engine = Engine::builder(MockCamera::new(small_camera().terminal_after(20)))
        .pipeline(fast_pipeline())
        .sink_factory(SlowSinkFactory {
            delay: Duration::from_millis(1),
        })
        .output_path(&output)
        .build()
        .unwrap();

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT));

    assert_eq!(engine.acquire_count(), 20);
    assert_eq!(sequences(&output), (0..20).collect::<Vec<_>>());
    assert!(engine
        .faults()
        .iter()
        .any(|f| f.stage == Stage::Acquire && f.severity == FaultSeverity::Error));
    assert!(engine.check().is_ok());
}

#[test]
fn camera_hiccups_keep_sequences_contiguous() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "hiccups.bin");
    let camera = MockCamera::new(small_camera().transient_at(2).timeout_at(5));
    let probe = camera.probe();
    let engine = Engine::builder(camera)
        .pipeline(fast_pipeline())
        .frame_limit(10)
        .output_path(&output)
        .build()
        .unwrap();

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT));

    assert_eq!(sequences(&output), (0..10).collect::<Vec<_>>());
    assert_eq!(probe.starts(), 3);
    assert_eq!(engine.snapshot().counts.acquisition_errors, 2);
    let warnings = engine
        .faults()
        .iter()
        .filter(|f| f.severity == FaultSeverity::Warning)
        .count();
    assert_eq!(warnings, 2);
}

#[test]
fn reported_queue_depth_never_exceeds_capacity() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "depth.bin");
    let mut pipeline = fast_pipeline();
    pipeline.process_queue_capacity = 8;
    pipeline.write_queue_capacity = 4;
    let engine = Engine::builder(MockCamera::new(small_camera()))
        .pipeline(pipeline)
        .sink_factory(SlowSinkFactory {
            delay: Duration::from_millis(1),
        })
        .frame_limit(200)
        .output_path(&output)
        .build()
        .unwrap();

    engine.start().unwrap();
    while engine.is_monitoring() {
        let snap = engine.snapshot();
        assert!(snap.queues.process <= snap.queues.process_capacity);
        assert!(snap.queues.write <= snap.queues.write_capacity);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(engine.written_count(), 200);
}

#[test]
fn padded_packed_frames_are_written_as_mono16() {
    let dir = tempdir().unwrap();
    let output = output_in(dir.path(), "packed.bin");
    let camera = rust_capture::source::MockCameraConfig::new(
        33,
        8,
        rust_capture::PixelEncoding::Mono12Packed,
    )
    .with_row_padding(7);
    let engine = engine(camera, &output, 3);

    engine.start().unwrap();
    assert!(engine.wait_stopped(DRAIN_TIMEOUT));

    let summary = summarize(&output).unwrap();
    assert_eq!(summary.frames, 3);
    assert_eq!(
        summary.geometry,
        Some((33, 8, rust_capture::PixelEncoding::Mono16))
    );
    assert_eq!(summary.payload_bytes, 3 * 33 * 8 * 2);
}

#[test]
fn sensor_temperature_reaches_telemetry() {
    let dir = tempdir().unwrap();
    let cooled = engine(
        small_camera().with_sensor_temperature(Some(-30.0)),
        &output_in(dir.path(), "cooled.bin"),
        10,
    );
    cooled.start().unwrap();
    assert!(cooled.wait_stopped(DRAIN_TIMEOUT));
    assert_eq!(cooled.snapshot().sensor_temperature, Some(-30.0));

    let uncooled = engine(
        small_camera().with_sensor_temperature(None),
        &output_in(dir.path(), "uncooled.bin"),
        10,
    );
    uncooled.start().unwrap();
    assert!(uncooled.wait_stopped(DRAIN_TIMEOUT));
    assert_eq!(uncooled.snapshot().sensor_temperature, None);
}
