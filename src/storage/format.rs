//! On-disk layout of a capture file.
//!
//! ```text
//! file header (32 bytes)
//!   0  magic        [u8; 8]  "RCAPRAW1"
//!   8  version      u16      1
//!  10  flags        u16      0
//!  12  reserved     u32
//!  16  created      i64      ns since the Unix epoch
//!  24  reserved     [u8; 8]
//!
//! frame record header (48 bytes), followed by `payload_len` bytes
//!   0  sync         u32      0xF7A3_E001
//!   4  encoding     u8       PixelEncoding tag
//!   5  flags        u8       bit 0: device_ts present
//!   6  header_len   u16      48
//!   8  sequence     u64
//!  16  captured     i64      ns since the Unix epoch
//!  24  device_ts    u64      meaningful only with flag bit 0
//!  32  width        u32
//!  36  height       u32
//!  40  stride       u32
//!  44  payload_len  u32
//! ```
//!
//! All integers are little endian.

use bytes::{Buf, BufMut};
use chrono::{DateTime, Utc};

use crate::error::{AppResult, CaptureError};
use crate::frame::{Frame, PixelEncoding};

/// File magic.
pub const FILE_MAGIC: [u8; 8] = *b"RCAPRAW1";
/// Current format version.
pub const FORMAT_VERSION: u16 = 1;
/// Size of the file header.
pub const FILE_HEADER_LEN: usize = 32;
/// Sync word at the start of every record.
pub const RECORD_SYNC: u32 = 0xF7A3_E001;
/// Size of a record header.
pub const RECORD_HEADER_LEN: usize = 48;
/// Record flag: the device timestamp field is set.
pub const RECORD_HAS_DEVICE_TS: u8 = 0b0000_0001;

fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or_default()
}

/// Leading header of a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version
    pub version: u16,
    /// Reserved flag bits
    pub flags: u16,
    /// When the file was created
    pub created: DateTime<Utc>,
}

impl FileHeader {
    /// Header for a file created now.
    pub fn now() -> Self {
        Self {
            version: FORMAT_VERSION,
            flags: 0,
            created: Utc::now(),
        }
    }

    /// Serialize into `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&FILE_MAGIC);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.flags);
        buf.put_u32_le(0);
        buf.put_i64_le(to_nanos(self.created));
        buf.put_bytes(0, 8);
    }

    /// Parse and validate a header.
    pub fn decode(mut buf: &[u8]) -> AppResult<Self> {
        if buf.len() < FILE_HEADER_LEN {
            return Err(CaptureError::Format(format!(
                "file header truncated: {} of {FILE_HEADER_LEN} bytes",
                buf.len()
            )));
        }
        if buf[..8] != FILE_MAGIC {
            return Err(CaptureError::Format("not a capture file (bad magic)".into()));
        }
        buf.advance(8);
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(CaptureError::Format(format!("unsupported format version {version}")));
        }
        let flags = buf.get_u16_le();
        buf.advance(4);
        let created = DateTime::from_timestamp_nanos(buf.get_i64_le());
        Ok(Self {
            version,
            flags,
            created,
        })
    }
}

/// Header preceding each frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Pixel encoding of the payload
    pub encoding: PixelEncoding,
    /// Frame sequence number
    pub sequence: u64,
    /// Capture time
    pub captured: DateTime<Utc>,
    /// Camera clock ticks, if known
    pub device_timestamp: Option<u64>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    /// Payload length in bytes
    pub payload_len: u32,
}

impl RecordHeader {
    /// Describe `frame`. Fails if a field does not fit the on-disk width.
    pub fn for_frame(frame: &Frame) -> AppResult<Self> {
        let stride = u32::try_from(frame.stride).map_err(|_| CaptureError::SizeOverflow {
            context: "record stride",
        })?;
        let payload_len = u32::try_from(frame.data.len()).map_err(|_| CaptureError::SizeOverflow {
            context: "record payload length",
        })?;
        Ok(Self {
            encoding: frame.encoding,
            sequence: frame.sequence,
            captured: frame.timestamp,
            device_timestamp: frame.device_timestamp,
            width: frame.width,
            height: frame.height,
            stride,
            payload_len,
        })
    }

    /// Serialize into `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(RECORD_SYNC);
        buf.put_u8(self.encoding.tag());
        buf.put_u8(if self.device_timestamp.is_some() { RECORD_HAS_DEVICE_TS } else { 0 });
        buf.put_u16_le(RECORD_HEADER_LEN as u16);
        buf.put_u64_le(self.sequence);
        buf.put_i64_le(to_nanos(self.captured));
        buf.put_u64_le(self.device_timestamp.unwrap_or(0));
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.stride);
        buf.put_u32_le(self.payload_len);
    }

    /// Parse and validate a record header.
    pub fn decode(mut buf: &[u8]) -> AppResult<Self> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(CaptureError::Format(format!(
                "record header truncated: {} of {RECORD_HEADER_LEN} bytes",
                buf.len()
            )));
        }
        let sync = buf.get_u32_le();
        if sync != RECORD_SYNC {
            return Err(CaptureError::Format(format!("bad record sync word {sync:#010x}")));
        }
        let tag = buf.get_u8();
        let encoding = PixelEncoding::from_tag(tag)
            .ok_or_else(|| CaptureError::Format(format!("unknown pixel encoding tag {tag}")))?;
        let flags = buf.get_u8();
        let header_len = buf.get_u16_le();
        if usize::from(header_len) != RECORD_HEADER_LEN {
            return Err(CaptureError::Format(format!("unexpected record header length {header_len}")));
        }
        let sequence = buf.get_u64_le();
        let captured = DateTime::from_timestamp_nanos(buf.get_i64_le());
        let device_ts = buf.get_u64_le();
        let device_timestamp = (flags & RECORD_HAS_DEVICE_TS != 0).then_some(device_ts);
        Ok(Self {
            encoding,
            sequence,
            captured,
            device_timestamp,
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            stride: buf.get_u32_le(),
            payload_len: buf.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn file_header_layout() {
        let mut buf = BytesMut::new();
        FileHeader::now().encode(&mut buf);
        assert_eq!(buf.len(), FILE_HEADER_LEN);
        assert_eq!(&buf[..8], b"RCAPRAW1");
        assert_eq!(&buf[8..10], &[1, 0]);
    }

    #[test]
    fn record_header_layout() {
        let header = RecordHeader {
            encoding: PixelEncoding::Mono16,
            sequence: 0x0102,
            captured: Utc::now(),
            device_timestamp: None,
            width: 640,
            height: 480,
            stride: 1280,
            payload_len: 1280 * 480,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), RECORD_HEADER_LEN);
        assert_eq!(&buf[..4], &RECORD_SYNC.to_le_bytes());
        assert_eq!(buf[4], PixelEncoding::Mono16.tag());
        assert_eq!(&buf[6..8], &[48, 0]);
        assert_eq!(&buf[8..10], &[0x02, 0x01]);
        assert_eq!(&buf[24..32], &[0; 8]);
        assert_eq!(RecordHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn zero_device_timestamp_is_kept_apart_from_none() {
        let mut header = RecordHeader {
            encoding: PixelEncoding::Mono8,
            sequence: 0,
            captured: Utc::now(),
            device_timestamp: Some(0),
            width: 1,
            height: 1,
            stride: 1,
            payload_len: 1,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf[5], RECORD_HAS_DEVICE_TS);
        assert_eq!(RecordHeader::decode(&buf).unwrap().device_timestamp, Some(0));

        header.device_timestamp = None;
        buf.clear();
        header.encode(&mut buf);
        assert_eq!(buf[5], 0);
        assert_eq!(RecordHeader::decode(&buf).unwrap().device_timestamp, None);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut buf = BytesMut::new();
        FileHeader::now().encode(&mut buf);

        let mut bad_magic = buf.to_vec();
        bad_magic[0] = b'X';
        assert!(matches!(FileHeader::decode(&bad_magic), Err(CaptureError::Format(_))));

        let mut bad_version = buf.to_vec();
        bad_version[8] = 9;
        let err = FileHeader::decode(&bad_version).unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn rejects_unknown_encoding() {
        let header = RecordHeader {
            encoding: PixelEncoding::Mono8,
            sequence: 1,
            captured: Utc::now(),
            device_timestamp: Some(5),
            width: 1,
            height: 1,
            stride: 1,
            payload_len: 1,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[4] = 200;
        let err = RecordHeader::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("200"));
    }
}
