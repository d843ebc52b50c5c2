//! Wire-format parsers: FLV records and streaming audio frame aligners.

pub mod adts;
pub mod flv;
pub mod mp3;

use bytes::Bytes;
use thiserror::Error;

/// A malformed or truncated record in an ingested stream.
///
/// These are fatal for the handler that hit them: a source that produces
/// invalid framing is closed, peers are left alone.
#[derive(Error, Debug)]
pub enum FormatError {
    /// Not enough bytes for a fixed-layout record. Streaming parsers treat
    /// this as "wait for more input" internally; it only escapes when a
    /// record can never be completed.
    #[error("truncated {0} record")]
    Truncated(&'static str),
    /// A field failed validation.
    #[error("invalid {field}: {value:#x}")]
    Invalid { field: &'static str, value: u64 },
}

impl FormatError {
    pub(crate) fn invalid(field: &'static str, value: u64) -> Self {
        FormatError::Invalid { field, value }
    }
}

/// A stateful frame aligner for a raw audio byte stream.
///
/// [`feed`] consumes arbitrary chunks and returns the longest prefix of the
/// accumulated stream that ends on a frame boundary, retaining the tail for
/// the next call. Bytes that cannot start a frame are discarded one at a
/// time until the stream resynchronizes.
///
/// [`feed`]: FrameAligner::feed
#[derive(Debug)]
pub enum FrameAligner {
    Mp3(mp3::Mp3Parser),
    Adts(adts::AdtsParser),
}

impl FrameAligner {
    pub fn mp3() -> Self {
        FrameAligner::Mp3(mp3::Mp3Parser::new())
    }

    pub fn adts() -> Self {
        FrameAligner::Adts(adts::AdtsParser::new())
    }

    pub fn feed(&mut self, data: &[u8]) -> Bytes {
        match self {
            FrameAligner::Mp3(parser) => parser.feed(data),
            FrameAligner::Adts(parser) => parser.feed(data),
        }
    }

    pub fn clear(&mut self) {
        match self {
            FrameAligner::Mp3(parser) => parser.clear(),
            FrameAligner::Adts(parser) => parser.clear(),
        }
    }
}
