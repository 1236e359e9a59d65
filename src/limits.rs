//! Shared hard limits and pipeline defaults.
//!
//! This module centralizes:
//! - Frame payload size limits
//! - Default queue capacities and timing for the capture pipeline
//!
//! Using centralized constants keeps the engine, the configuration defaults and the
//! output reader in agreement.

use crate::error::CaptureError;
use std::time::Duration;

// =============================================================================
// Timing Defaults
// =============================================================================

/// Interval between telemetry samples taken by the monitor thread (500 ms).
///
/// Matches the cadence the operator front end polls at; the engine does not rely on it
/// for correctness.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Duration window for FPS calculation (1 second).
///
/// Counter samples older than this are discarded when computing the current
/// frames-per-second rate.
pub const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Lower bound for a single `next_frame` wait on the camera (500 ms).
///
/// The effective timeout is twice the source frame interval, never less than this.
pub const MIN_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between sensor temperature reads by the acquisition stage (1 second).
pub const SENSOR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive transient source errors tolerated before acquisition gives up.
pub const MAX_CONSECUTIVE_SOURCE_ERRORS: u32 = 8;

// =============================================================================
// Queue Defaults
// =============================================================================

/// Default capacity of the acquire→process and process→write queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Upper bound on rate-window samples kept per stage.
pub const MAX_RATE_SAMPLES: usize = 64;

/// Maximum number of stage faults kept in the history.
pub const MAX_FAULT_HISTORY: usize = 1000;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum allowed frame payload in bytes (default: 100MB).
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;
/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Number of pixels (`width * height`).
    pub pixels: usize,
    /// Number of bytes for a tightly packed buffer.
    pub bytes: usize,
}

/// Validate frame dimensions and calculate pixel/byte sizes safely.
///
/// `row_bytes` is the byte length of one row (stride, or packed row length).
pub fn validate_frame_size(width: u32, height: u32, row_bytes: usize) -> Result<FrameSize, CaptureError> {
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(CaptureError::FrameDimensionsTooLarge {
            width,
            height,
            max_dimension: MAX_FRAME_DIMENSION,
        });
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or(CaptureError::SizeOverflow {
            context: "frame pixel count",
        })?;

    let bytes = row_bytes
        .checked_mul(height as usize)
        .ok_or(CaptureError::SizeOverflow {
            context: "frame byte size",
        })?;

    if bytes > MAX_FRAME_BYTES {
        return Err(CaptureError::FrameTooLarge {
            bytes,
            max_bytes: MAX_FRAME_BYTES,
        });
    }

    Ok(FrameSize { pixels, bytes })
}
