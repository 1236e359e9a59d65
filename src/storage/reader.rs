//! Capture file reader.

use bytes::Bytes;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::format::{FileHeader, RecordHeader, FILE_HEADER_LEN, RECORD_HEADER_LEN};
use crate::error::{AppResult, CaptureError};
use crate::frame::{Frame, PixelEncoding};
use crate::limits::MAX_FRAME_BYTES;

/// Iterates the frame records of a capture file.
///
/// Iteration ends at a clean record boundary. Any structural problem (bad sync word,
/// unknown encoding, truncated record) is yielded once as an error and ends iteration.
#[derive(Debug)]
pub struct RawFrameReader<R> {
    inner: R,
    header: FileHeader,
    done: bool,
}

impl RawFrameReader<BufReader<File>> {
    /// Open a capture file.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> RawFrameReader<R> {
    /// Read and validate the file header from `inner`.
    pub fn new(mut inner: R) -> AppResult<Self> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        let filled = read_full(&mut inner, &mut buf)?;
        let header = FileHeader::decode(&buf[..filled])?;
        Ok(Self {
            inner,
            header,
            done: false,
        })
    }

    /// The file header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Read the next record, or `None` at end of file.
    pub fn next_frame(&mut self) -> AppResult<Option<Frame>> {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        let filled = read_full(&mut self.inner, &mut buf)?;
        if filled == 0 {
            return Ok(None);
        }
        let record = RecordHeader::decode(&buf[..filled])?;

        let payload_len = record.payload_len as usize;
        if payload_len > MAX_FRAME_BYTES {
            return Err(CaptureError::FrameTooLarge {
                bytes: payload_len,
                max_bytes: MAX_FRAME_BYTES,
            });
        }
        let mut payload = vec![0u8; payload_len];
        let got = read_full(&mut self.inner, &mut payload)?;
        if got < payload_len {
            return Err(CaptureError::Format(format!(
                "record {} truncated: payload {got} of {payload_len} bytes",
                record.sequence
            )));
        }

        Ok(Some(Frame {
            sequence: record.sequence,
            timestamp: record.captured,
            device_timestamp: record.device_timestamp,
            width: record.width,
            height: record.height,
            stride: record.stride as usize,
            encoding: record.encoding,
            data: Bytes::from(payload),
        }))
    }
}

impl<R: Read> Iterator for RawFrameReader<R> {
    type Item = AppResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Fill `buf` as far as the stream allows. Returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Overview of a capture file, as printed by `rust-capture inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileSummary {
    /// Number of frame records
    pub frames: u64,
    /// Sequence number of the first record
    pub first_sequence: Option<u64>,
    /// Sequence number of the last record
    pub last_sequence: Option<u64>,
    /// Whether every record's sequence is one more than its predecessor's
    pub contiguous: bool,
    /// Geometry and encoding of the first record
    pub geometry: Option<(u32, u32, PixelEncoding)>,
    /// Total payload bytes
    pub payload_bytes: u64,
}

/// Scan a capture file end to end.
pub fn summarize(path: impl AsRef<Path>) -> AppResult<FileSummary> {
    let mut summary = FileSummary {
        contiguous: true,
        ..FileSummary::default()
    };
    for frame in RawFrameReader::open(path)? {
        let frame = frame?;
        if let Some(last) = summary.last_sequence {
            if frame.sequence != last + 1 {
                summary.contiguous = false;
            }
        }
        summary.first_sequence.get_or_insert(frame.sequence);
        summary.last_sequence = Some(frame.sequence);
        summary
            .geometry
            .get_or_insert((frame.width, frame.height, frame.encoding));
        summary.frames += 1;
        summary.payload_bytes += frame.data.len() as u64;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;
    use crate::pipeline::write::FrameSink;
    use crate::storage::RawFrameWriter;
    use chrono::Utc;
    use tempfile::tempdir;

    fn frame(sequence: u64) -> Frame {
        let data: Vec<u8> = (0..16u8).map(|b| b.wrapping_add(sequence as u8)).collect();
        Frame::from_raw(
            RawFrame::packed(4, 2, PixelEncoding::Mono16, data),
            sequence,
            Utc::now(),
        )
    }

    #[test]
    fn reads_back_written_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let mut writer = RawFrameWriter::create(&path).unwrap();
        for seq in [0, 1, 3] {
            writer.write_frame(&frame(seq)).unwrap();
        }
        writer.finish().unwrap();

        let frames: Vec<Frame> = RawFrameReader::open(&path)
            .unwrap()
            .collect::<AppResult<_>>()
            .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].sequence, 3);
        assert_eq!(frames[2].data, frame(3).data);

        let summary = summarize(&path).unwrap();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.first_sequence, Some(0));
        assert_eq!(summary.last_sequence, Some(3));
        assert!(!summary.contiguous);
        assert_eq!(summary.geometry, Some((4, 2, PixelEncoding::Mono16)));
    }

    #[test]
    fn empty_capture_is_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        RawFrameWriter::create(&path).unwrap().finish().unwrap();

        let summary = summarize(&path).unwrap();
        assert_eq!(summary.frames, 0);
        assert!(summary.contiguous);
    }

    #[test]
    fn truncated_payload_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cut.bin");
        let mut writer = RawFrameWriter::create(&path).unwrap();
        writer.write_frame(&frame(0)).unwrap();
        writer.write_frame(&frame(1)).unwrap();
        writer.finish().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 5).unwrap();

        let mut reader = RawFrameReader::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("truncated"));
        assert!(reader.next().is_none());
    }

    #[test]
    fn rejects_foreign_file() {
        let err = RawFrameReader::new(&b"GIF89a this is not a capture file"[..]).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }
}
