//! MPEG audio (MP3) frame alignment.
//!
//! Splits a raw byte stream on frame boundaries so that a new subscriber
//! always starts at a decodable position. Only the 4-byte frame header is
//! examined; audio data is passed through untouched.

use bytes::Bytes;

/// Samples per frame divided by 8, per (version, layer).
const COEFF_LAYER_I: u32 = 12; // multiplied by 4 below, slot size
const COEFF_LAYER_II: u32 = 144;
const COEFF_LAYER_III_V1: u32 = 144;
const COEFF_LAYER_III_V2: u32 = 72;

/// Bitrates in kbit/s by index, per (version, layer). Index 0 ("free") and
/// 15 are not usable for framing.
const BITRATES_V1_L1: [u32; 14] = [
    32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
];
const BITRATES_V1_L2: [u32; 14] = [
    32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
];
const BITRATES_V1_L3: [u32; 14] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const BITRATES_V2_L1: [u32; 14] = [
    32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
];
const BITRATES_V2_L2_L3: [u32; 14] = [8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// Sample rates in Hz by index, per version.
const RATES_V1: [u32; 3] = [44100, 48000, 32000];
const RATES_V2: [u32; 3] = [22050, 24000, 16000];
const RATES_V2_5: [u32; 3] = [11025, 12000, 8000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    Mpeg1,
    Mpeg2,
    Mpeg2_5,
}

/// Computes the byte length of the frame starting at `header`, or `None`
/// if the four bytes cannot be a frame header.
pub(crate) fn frame_length(header: &[u8]) -> Option<usize> {
    if header.len() < 4 || header[0] != 0xff || header[1] & 0xe0 != 0xe0 {
        return None;
    }

    let version = match (header[1] >> 3) & 0x03 {
        0 => Version::Mpeg2_5,
        2 => Version::Mpeg2,
        3 => Version::Mpeg1,
        _ => return None,
    };
    let layer = (header[1] >> 1) & 0x03;
    if layer == 0 {
        return None;
    }

    let bitrate_index = (header[2] >> 4) as usize;
    if bitrate_index == 0 || bitrate_index == 15 {
        return None;
    }
    let rate_index = ((header[2] >> 2) & 0x03) as usize;
    if rate_index == 3 {
        return None;
    }
    let padding = ((header[2] >> 1) & 0x01) as u32;

    // Layer bits: 1 = Layer III, 2 = Layer II, 3 = Layer I.
    let bitrates = match (version, layer) {
        (Version::Mpeg1, 3) => &BITRATES_V1_L1,
        (Version::Mpeg1, 2) => &BITRATES_V1_L2,
        (Version::Mpeg1, 1) => &BITRATES_V1_L3,
        (_, 3) => &BITRATES_V2_L1,
        (_, _) => &BITRATES_V2_L2_L3,
    };
    let bitrate = bitrates[bitrate_index - 1] * 1000;

    let rates = match version {
        Version::Mpeg1 => &RATES_V1,
        Version::Mpeg2 => &RATES_V2,
        Version::Mpeg2_5 => &RATES_V2_5,
    };
    let sample_rate = rates[rate_index];

    let len = match layer {
        // Layer I counts in 4-byte slots.
        3 => (COEFF_LAYER_I * bitrate / sample_rate + padding) * 4,
        2 => COEFF_LAYER_II * bitrate / sample_rate + padding,
        _ => {
            let coeff = match version {
                Version::Mpeg1 => COEFF_LAYER_III_V1,
                _ => COEFF_LAYER_III_V2,
            };
            coeff * bitrate / sample_rate + padding
        }
    };

    Some(len as usize)
}

/// Streaming MP3 frame aligner.
#[derive(Debug, Default)]
pub struct Mp3Parser {
    buf: Vec<u8>,
}

impl Mp3Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns all complete frames accumulated so far.
    /// Bytes that cannot start a frame are discarded until the stream
    /// resynchronizes; a trailing partial frame is retained.
    pub fn feed(&mut self, data: &[u8]) -> Bytes {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 4 <= self.buf.len() {
            match frame_length(&self.buf[pos..pos + 4]) {
                Some(len) => {
                    if pos + len > self.buf.len() {
                        break;
                    }
                    out.extend_from_slice(&self.buf[pos..pos + len]);
                    pos += len;
                }
                None => pos += 1,
            }
        }
        self.buf.drain(..pos);

        Bytes::from(out)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// MPEG-1 Layer III, 128 kbit/s, 44100 Hz, no padding: 417 bytes.
    fn frame(fill: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 417];
        frame[0] = 0xff;
        frame[1] = 0xfb;
        frame[2] = 0x90;
        frame[3] = 0x00;
        for byte in frame.iter_mut().skip(4) {
            *byte = fill;
        }
        frame
    }

    #[test]
    fn header_length() {
        assert_eq!(frame_length(&[0xff, 0xfb, 0x90, 0x00]), Some(417));
        // Padding adds one byte.
        assert_eq!(frame_length(&[0xff, 0xfb, 0x92, 0x00]), Some(418));
        // No sync.
        assert_eq!(frame_length(&[0x00, 0xfb, 0x90, 0x00]), None);
        // Free-format bitrate is not framable.
        assert_eq!(frame_length(&[0xff, 0xfb, 0x00, 0x00]), None);
        // Reserved sample rate.
        assert_eq!(frame_length(&[0xff, 0xfb, 0x9c, 0x00]), None);
    }

    #[test]
    fn emits_only_whole_frames() {
        let mut parser = Mp3Parser::new();
        let f1 = frame(0xaa);
        let f2 = frame(0xbb);

        let mut stream = f1.clone();
        stream.extend_from_slice(&f2[..100]);

        let out = parser.feed(&stream);
        assert_eq!(out.as_ref(), f1.as_slice());

        let out = parser.feed(&f2[100..]);
        assert_eq!(out.as_ref(), f2.as_slice());
    }

    #[test]
    fn split_feed_equals_whole_feed() {
        let f1 = frame(0x11);
        let f2 = frame(0x22);
        let mut stream = f1.clone();
        stream.extend_from_slice(&f2);

        let mut whole = Mp3Parser::new();
        let expected = whole.feed(&stream);

        let mut split = Mp3Parser::new();
        let mut got = Vec::new();
        for chunk in stream.chunks(61) {
            got.extend_from_slice(&split.feed(chunk));
        }

        assert_eq!(got.as_slice(), expected.as_ref());
    }

    #[test]
    fn discards_garbage_before_sync() {
        let mut parser = Mp3Parser::new();
        let f1 = frame(0xcc);
        let mut stream = vec![0x01, 0x02, 0x03];
        stream.extend_from_slice(&f1);

        let out = parser.feed(&stream);
        assert_eq!(out.as_ref(), f1.as_slice());
    }

    #[test]
    fn clear_drops_partial_state() {
        let mut parser = Mp3Parser::new();
        let f1 = frame(0xdd);
        parser.feed(&f1[..200]);
        parser.clear();
        // The remainder has no frame header, so nothing aligns.
        let out = parser.feed(&f1[200..]);
        assert!(out.is_empty());
    }
}
