//! Newline codec for agent stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so an
//! unterminated or oversized message from a misbehaving agent cannot grow
//! the read buffer without bound. `LinesCodec` keeps the trailing partial
//! line buffered between reads, so a JSON object split across several
//! stdout chunks is decoded exactly once, when its newline arrives.
//!
//! An oversized line is reported as [`DecodedLine::TooLong`] instead of an
//! error: `FramedRead` ends the stream after the first decoder error, while
//! `LinesCodec` itself discards the rest of the long line and resumes at the
//! next newline.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted on the agent's stdout: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded unit of agent stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedLine {
    /// A complete line, without its terminator.
    Line(String),
    /// A line longer than [`MAX_LINE_BYTES`]; its bytes are skipped up to
    /// the next newline.
    TooLong,
}

impl DecodedLine {
    /// Error text recorded for a [`DecodedLine::TooLong`] line.
    #[must_use]
    pub fn too_long_message() -> String {
        format!("line too long: exceeded {MAX_LINE_BYTES} bytes")
    }
}

/// Line codec for agent stdout.
///
/// I/O errors map to [`AppError::Io`] and end the stream.
#[derive(Debug)]
pub struct AcpCodec(LinesCodec);

impl AcpCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = DecodedLine;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        lift(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        lift(self.0.decode_eof(src))
    }
}

fn lift(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> Result<Option<DecodedLine>> {
    match decoded {
        Ok(line) => Ok(line.map(DecodedLine::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(DecodedLine::TooLong)),
        Err(LinesCodecError::Io(err)) => Err(AppError::from(err)),
    }
}
