//! Append-only capture file writer.

use bytes::BytesMut;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::format::{FileHeader, RecordHeader, FILE_HEADER_LEN, RECORD_HEADER_LEN};
use crate::frame::Frame;
use crate::pipeline::write::FrameSink;

const WRITE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Streams frames into a capture file.
///
/// The file header is written at creation, so even an empty run leaves a valid file.
/// `finish()` flushes and fsyncs; dropping without it still flushes through `BufWriter`
/// but skips the sync.
pub struct RawFrameWriter {
    path: PathBuf,
    out: BufWriter<File>,
    header: BytesMut,
    frames: u64,
    bytes: u64,
}

impl RawFrameWriter {
    /// Create (or truncate) `path` and write the file header.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut out = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);

        let mut header = BytesMut::with_capacity(FILE_HEADER_LEN.max(RECORD_HEADER_LEN));
        FileHeader::now().encode(&mut header);
        out.write_all(&header)?;
        header.clear();

        tracing::debug!(path = %path.display(), "capture file created");
        Ok(Self {
            path,
            out,
            header,
            frames: 0,
            bytes: FILE_HEADER_LEN as u64,
        })
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames appended so far.
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Bytes appended so far, file header included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Append one frame record.
    pub fn append(&mut self, frame: &Frame) -> io::Result<()> {
        let record = RecordHeader::for_frame(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.header.clear();
        record.encode(&mut self.header);
        self.out.write_all(&self.header)?;
        self.out.write_all(&frame.data)?;
        self.frames += 1;
        self.bytes += (RECORD_HEADER_LEN + frame.data.len()) as u64;
        Ok(())
    }

    /// Flush buffered records and sync the file to disk.
    pub fn sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }
}

impl FrameSink for RawFrameWriter {
    fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.append(frame)
    }

    fn finish(&mut self) -> io::Result<()> {
        self.sync()?;
        tracing::debug!(
            path = %self.path.display(),
            frames = self.frames,
            bytes = self.bytes,
            "capture file finalised"
        );
        Ok(())
    }
}

impl std::fmt::Debug for RawFrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrameWriter")
            .field("path", &self.path)
            .field("frames", &self.frames)
            .field("bytes", &self.bytes)
            .finish()
    }
}
