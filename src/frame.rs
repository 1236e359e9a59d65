//! Frame data model.
//!
//! A [`RawFrame`] is what a camera hands over: a buffer with its geometry and pixel
//! encoding. The acquisition stage turns it into a [`Frame`] by assigning a sequence
//! number and a capture timestamp. Frames then move by value through the pipeline, so at
//! most one stage owns a given frame at any time.
//!
//! # Storage
//! Pixel data is kept as `bytes::Bytes`, which lets a transform hand the same allocation
//! onward when it has nothing to change. Multi-byte encodings are little endian.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

/// Pixel encoding of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelEncoding {
    /// 8 bits per pixel.
    Mono8,
    /// 12 significant bits stored in 16-bit little-endian words.
    Mono12,
    /// Two 12-bit pixels packed into three bytes.
    Mono12Packed,
    /// 16 bits per pixel, little endian.
    Mono16,
    /// 32 bits per pixel, little endian.
    Mono32,
}

impl PixelEncoding {
    /// All encodings, in tag order.
    pub const ALL: [PixelEncoding; 5] = [
        PixelEncoding::Mono8,
        PixelEncoding::Mono12,
        PixelEncoding::Mono12Packed,
        PixelEncoding::Mono16,
        PixelEncoding::Mono32,
    ];

    /// Stable numeric tag used by the output file format.
    pub fn tag(self) -> u8 {
        match self {
            PixelEncoding::Mono8 => 0,
            PixelEncoding::Mono12 => 1,
            PixelEncoding::Mono12Packed => 2,
            PixelEncoding::Mono16 => 3,
            PixelEncoding::Mono32 => 4,
        }
    }

    /// Inverse of [`tag`](Self::tag).
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.tag() == tag)
    }

    /// Minimum number of bytes needed to hold one row of `width` pixels.
    pub fn row_bytes(self, width: u32) -> usize {
        let width = width as usize;
        match self {
            PixelEncoding::Mono8 => width,
            PixelEncoding::Mono12 | PixelEncoding::Mono16 => width * 2,
            PixelEncoding::Mono12Packed => (width * 3).div_ceil(2),
            PixelEncoding::Mono32 => width * 4,
        }
    }

    /// Name as used by camera SDKs.
    pub fn name(self) -> &'static str {
        match self {
            PixelEncoding::Mono8 => "Mono8",
            PixelEncoding::Mono12 => "Mono12",
            PixelEncoding::Mono12Packed => "Mono12Packed",
            PixelEncoding::Mono16 => "Mono16",
            PixelEncoding::Mono32 => "Mono32",
        }
    }

    /// Case-insensitive parse of an SDK name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for PixelEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A buffer as delivered by a [`FrameSource`](crate::source::FrameSource).
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per row, including any padding the camera adds
    pub stride: usize,
    /// Pixel encoding of `data`
    pub encoding: PixelEncoding,
    /// Camera clock ticks from frame metadata, if the source provides them
    pub device_timestamp: Option<u64>,
    /// Raw buffer
    pub data: Bytes,
}

impl RawFrame {
    /// Create a raw frame with a tightly packed stride.
    pub fn packed(width: u32, height: u32, encoding: PixelEncoding, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            stride: encoding.row_bytes(width),
            encoding,
            device_timestamp: None,
            data: data.into(),
        }
    }
}

/// One captured image plus sequence metadata, flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in acquisition order, starting at 0
    pub sequence: u64,
    /// Host time at which the frame was accepted into the pipeline
    pub timestamp: DateTime<Utc>,
    /// Camera clock ticks, if known
    pub device_timestamp: Option<u64>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per row, including padding
    pub stride: usize,
    /// Pixel encoding of `data`
    pub encoding: PixelEncoding,
    /// Pixel buffer
    pub data: Bytes,
}

impl Frame {
    /// Tag a raw camera buffer with its sequence number and capture time.
    pub fn from_raw(raw: RawFrame, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            timestamp,
            device_timestamp: raw.device_timestamp,
            width: raw.width,
            height: raw.height,
            stride: raw.stride,
            encoding: raw.encoding,
            data: raw.data,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether rows carry no padding.
    pub fn is_packed(&self) -> bool {
        self.stride == self.encoding.row_bytes(self.width)
    }

    /// Read a 16-bit pixel from a packed or padded Mono12/Mono16 frame.
    pub fn pixel_u16(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        match self.encoding {
            PixelEncoding::Mono12 | PixelEncoding::Mono16 => {
                let start = y as usize * self.stride + x as usize * 2;
                let bytes = self.data.get(start..start + 2)?;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_bytes_per_encoding() {
        assert_eq!(PixelEncoding::Mono8.row_bytes(10), 10);
        assert_eq!(PixelEncoding::Mono16.row_bytes(10), 20);
        assert_eq!(PixelEncoding::Mono12Packed.row_bytes(10), 15);
        // odd widths round up to a whole byte
        assert_eq!(PixelEncoding::Mono12Packed.row_bytes(3), 5);
        assert_eq!(PixelEncoding::Mono32.row_bytes(10), 40);
    }

    #[test]
    fn tags_are_stable_and_reversible() {
        for encoding in PixelEncoding::ALL {
            assert_eq!(PixelEncoding::from_tag(encoding.tag()), Some(encoding));
        }
        assert_eq!(PixelEncoding::from_tag(99), None);
    }

    #[test]
    fn parses_sdk_names() {
        assert_eq!(PixelEncoding::parse("mono12packed"), Some(PixelEncoding::Mono12Packed));
        assert_eq!(PixelEncoding::parse(" Mono16 "), Some(PixelEncoding::Mono16));
        assert_eq!(PixelEncoding::parse("RGB8"), None);
    }

    #[test]
    fn pixel_access_honours_stride() {
        // 2x2 Mono16 with 2 bytes of padding per row
        let data = vec![1, 0, 2, 0, 0xEE, 0xEE, 3, 0, 4, 0, 0xEE, 0xEE];
        let raw = RawFrame {
            width: 2,
            height: 2,
            stride: 6,
            encoding: PixelEncoding::Mono16,
            device_timestamp: None,
            data: data.into(),
        };
        let frame = Frame::from_raw(raw, 0, Utc::now());
        assert!(!frame.is_packed());
        assert_eq!(frame.pixel_u16(1, 0), Some(2));
        assert_eq!(frame.pixel_u16(0, 1), Some(3));
        assert_eq!(frame.pixel_u16(2, 0), None);
    }
}
