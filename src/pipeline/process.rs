//! Processing stage: applies a [`FrameTransform`] to every frame between queue A and B.
//!
//! A frame the transform rejects is dropped, counted as lost, and recorded as a fault with
//! its sequence number. The run carries on with the next frame.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use super::{CloseOnExit, FrameQueue, RunContext, StopOnPanic};
use crate::fault::{FaultSeverity, Stage};
use crate::frame::{Frame, PixelEncoding};
use crate::limits::validate_frame_size;
use crate::queue::PushError;

/// Per-frame transform failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The transform cannot handle this encoding.
    #[error("unsupported pixel encoding {0}")]
    UnsupportedEncoding(PixelEncoding),

    /// The buffer is smaller than its geometry requires.
    #[error("buffer too short: {actual} bytes, geometry needs {expected}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Width, height and stride are inconsistent.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

/// Per-frame transform run by the processing stage.
///
/// Implementations must preserve `sequence`; a changed sequence number is treated as a
/// failure for that frame.
pub trait FrameTransform: Send {
    /// Transform one frame.
    fn apply(&mut self, frame: Frame) -> Result<Frame, TransformError>;

    /// Name for logs.
    fn name(&self) -> &str {
        "transform"
    }
}

impl<T: FrameTransform + ?Sized> FrameTransform for Box<T> {
    fn apply(&mut self, frame: Frame) -> Result<Frame, TransformError> {
        (**self).apply(frame)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Hands frames through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl FrameTransform for PassThrough {
    fn apply(&mut self, frame: Frame) -> Result<Frame, TransformError> {
        Ok(frame)
    }

    fn name(&self) -> &str {
        "pass-through"
    }
}

/// Converts every supported encoding to tightly packed little-endian Mono16.
///
/// Row padding is stripped. Mono8 is widened, Mono12 keeps its 12-bit values, and
/// Mono12Packed is unpacked two pixels per three bytes. Mono32 is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mono16Converter;

impl Mono16Converter {
    fn check_geometry(frame: &Frame) -> Result<usize, TransformError> {
        let row_bytes = frame.encoding.row_bytes(frame.width);
        validate_frame_size(frame.width, frame.height, row_bytes)
            .map_err(|e| TransformError::InvalidGeometry(e.to_string()))?;
        if frame.stride < row_bytes {
            return Err(TransformError::InvalidGeometry(format!(
                "stride {} shorter than row of {row_bytes} bytes",
                frame.stride
            )));
        }
        validate_frame_size(frame.width, frame.height, frame.stride)
            .map_err(|e| TransformError::InvalidGeometry(format!("stride {}: {e}", frame.stride)))?;
        // the last row may omit its padding
        let expected = match frame.height as usize {
            0 => Some(0),
            h => frame
                .stride
                .checked_mul(h - 1)
                .and_then(|body| body.checked_add(row_bytes)),
        }
        .ok_or_else(|| TransformError::InvalidGeometry(format!("stride {} overflows", frame.stride)))?;
        if frame.data.len() < expected {
            return Err(TransformError::BufferTooShort {
                expected,
                actual: frame.data.len(),
            });
        }
        Ok(row_bytes)
    }

    fn convert_row(encoding: PixelEncoding, row: &[u8], width: usize, out: &mut Vec<u8>) {
        match encoding {
            PixelEncoding::Mono8 => {
                for &px in &row[..width] {
                    out.extend_from_slice(&u16::from(px).to_le_bytes());
                }
            }
            PixelEncoding::Mono12 | PixelEncoding::Mono16 => {
                out.extend_from_slice(&row[..width * 2]);
            }
            PixelEncoding::Mono12Packed => {
                for pair in 0..width.div_ceil(2) {
                    let b = &row[pair * 3..];
                    let first = (u16::from(b[0]) << 4) | u16::from(b[1] & 0x0F);
                    out.extend_from_slice(&first.to_le_bytes());
                    if pair * 2 + 1 < width {
                        let second = (u16::from(b[2]) << 4) | u16::from(b[1] >> 4);
                        out.extend_from_slice(&second.to_le_bytes());
                    }
                }
            }
            PixelEncoding::Mono32 => {}
        }
    }
}

impl FrameTransform for Mono16Converter {
    fn apply(&mut self, frame: Frame) -> Result<Frame, TransformError> {
        if frame.encoding == PixelEncoding::Mono32 {
            return Err(TransformError::UnsupportedEncoding(frame.encoding));
        }
        let row_bytes = Self::check_geometry(&frame)?;
        let width = frame.width as usize;
        let height = frame.height as usize;
        let out_len = width * height * 2;

        let data = if frame.encoding == PixelEncoding::Mono16 && frame.is_packed() {
            // already in the target layout; keep the allocation
            frame.data.slice(..out_len)
        } else {
            let mut out = Vec::with_capacity(out_len);
            for y in 0..height {
                let start = y * frame.stride;
                let row = &frame.data[start..start + row_bytes];
                Self::convert_row(frame.encoding, row, width, &mut out);
            }
            Bytes::from(out)
        };

        Ok(Frame {
            stride: width * 2,
            encoding: PixelEncoding::Mono16,
            data,
            ..frame
        })
    }

    fn name(&self) -> &str {
        "mono16"
    }
}

/// Processing stage for one run.
pub struct ProcessingStage<T> {
    transform: T,
    input: Arc<FrameQueue>,
    output: Arc<FrameQueue>,
    ctx: RunContext,
}

impl<T: FrameTransform> ProcessingStage<T> {
    /// Prepare a stage between `input` and `output`.
    pub fn new(transform: T, input: Arc<FrameQueue>, output: Arc<FrameQueue>, ctx: RunContext) -> Self {
        Self {
            transform,
            input,
            output,
            ctx,
        }
    }

    /// Run until `input` is closed and drained. Returns the transform.
    pub fn run(mut self) -> T {
        let _close_output = CloseOnExit::new(Arc::clone(&self.output));
        let _release_input = StopOnPanic::new(Arc::clone(&self.input), Arc::clone(&self.ctx.control));
        let mut downstream_closed = false;

        while let Some(frame) = self.input.pop() {
            if downstream_closed {
                self.ctx.counters.record_discarded_after_fault();
                continue;
            }
            let sequence = frame.sequence;
            let frame = match self.transform.apply(frame) {
                Ok(out) if out.sequence == sequence => out,
                Ok(out) => {
                    self.lose(sequence, format!("transform changed sequence to {}", out.sequence));
                    continue;
                }
                Err(e) => {
                    self.lose(sequence, e.to_string());
                    continue;
                }
            };
            self.ctx.counters.record_processed();

            match self.output.push(frame) {
                Ok(()) => {}
                Err(PushError::Full(frame)) => {
                    self.ctx.counters.record_dropped_overflow();
                    self.ctx.fault(
                        Stage::Process,
                        FaultSeverity::Error,
                        Some(frame.sequence),
                        format!("write queue full ({}), frame dropped", self.output.capacity()),
                    );
                }
                Err(PushError::Closed(_)) => {
                    // writer is gone; keep draining so acquisition never blocks
                    self.ctx.counters.record_discarded_after_fault();
                    downstream_closed = true;
                }
            }
        }

        tracing::debug!(transform = self.transform.name(), "processing finished");
        self.transform
    }

    fn lose(&self, sequence: u64, reason: String) {
        self.ctx.counters.record_lost_to_processing();
        self.ctx.fault(
            Stage::Process,
            FaultSeverity::Error,
            Some(sequence),
            format!("frame dropped: {reason}"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use chrono::Utc;

    fn frame(raw: RawFrame) -> Frame {
        Frame::from_raw(raw, 42, Utc::now())
    }

    fn pixels(frame: &Frame) -> Vec<u16> {
        frame
            .data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn strips_padding_from_mono16() {
        let raw = RawFrame {
            width: 2,
            height: 2,
            stride: 6,
            encoding: PixelEncoding::Mono16,
            device_timestamp: Some(9),
            data: vec![1, 0, 2, 0, 0xEE, 0xEE, 3, 0, 4, 0, 0xEE, 0xEE].into(),
        };
        let out = Mono16Converter.apply(frame(raw)).unwrap();
        assert_eq!(pixels(&out), vec![1, 2, 3, 4]);
        assert_eq!(out.stride, 4);
        assert_eq!(out.sequence, 42);
        assert_eq!(out.device_timestamp, Some(9));
    }

    #[test]
    fn widens_mono8() {
        let raw = RawFrame::packed(3, 1, PixelEncoding::Mono8, vec![0u8, 128, 255]);
        let out = Mono16Converter.apply(frame(raw)).unwrap();
        assert_eq!(pixels(&out), vec![0, 128, 255]);
        assert_eq!(out.encoding, PixelEncoding::Mono16);
    }

    #[test]
    fn unpacks_mono12_packed() {
        // A = 0xABC, B = 0x123, then a lone C = 0xFED in the odd tail
        let raw = RawFrame::packed(
            3,
            1,
            PixelEncoding::Mono12Packed,
            vec![0xAB, 0x3C, 0x12, 0xFE, 0x0D],
        );
        let out = Mono16Converter.apply(frame(raw)).unwrap();
        assert_eq!(pixels(&out), vec![0xABC, 0x123, 0xFED]);
    }

    #[test]
    fn packed_mono16_keeps_buffer() {
        let data = Bytes::from(vec![7u8; 8]);
        let raw = RawFrame::packed(2, 2, PixelEncoding::Mono16, data.clone());
        let out = Mono16Converter.apply(frame(raw)).unwrap();
        assert_eq!(out.data.as_ptr(), data.as_ptr());
    }

    #[test]
    fn rejects_absurd_stride_without_panicking() {
        let raw = RawFrame {
            width: 1,
            height: 2,
            stride: usize::MAX,
            encoding: PixelEncoding::Mono16,
            device_timestamp: None,
            data: vec![0u8; 4].into(),
        };
        assert!(matches!(
            Mono16Converter.apply(frame(raw)),
            Err(TransformError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_short_buffer_and_mono32() {
        let short = RawFrame::packed(4, 4, PixelEncoding::Mono16, vec![0u8; 10]);
        assert!(matches!(
            Mono16Converter.apply(frame(short)),
            Err(TransformError::BufferTooShort { expected: 32, actual: 10 })
        ));

        let wide = RawFrame::packed(1, 1, PixelEncoding::Mono32, vec![0u8; 4]);
        assert_eq!(
            Mono16Converter.apply(frame(wide)).unwrap_err(),
            TransformError::UnsupportedEncoding(PixelEncoding::Mono32)
        );
    }
}
