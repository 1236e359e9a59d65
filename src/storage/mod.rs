//! Self-describing capture file format.
//!
//! Frames are appended as fixed-size record headers followed by raw payloads, so an
//! archival converter (or [`RawFrameReader`]) can walk the file without any side channel.
//! See [`format`] for the byte layout.

pub mod format;
pub mod reader;
pub mod writer;

pub use reader::{summarize, FileSummary, RawFrameReader};
pub use writer::RawFrameWriter;
