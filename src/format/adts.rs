//! ADTS (AAC transport) frame alignment.
//!
//! Same contract as the MP3 aligner: whole frames out, tail retained, no
//! decoding past the fixed header.

use bytes::Bytes;

/// Header length without the optional CRC.
const HEADER_SIZE: usize = 7;
/// Header length with the 16-bit CRC present.
const HEADER_SIZE_CRC: usize = 9;

/// Computes the total byte length of the ADTS frame starting at `header`,
/// or `None` if these bytes cannot start a frame.
pub(crate) fn frame_length(header: &[u8]) -> Option<usize> {
    if header.len() < 6 || header[0] != 0xff || header[1] & 0xf0 != 0xf0 {
        return None;
    }
    // Layer bits must be zero for AAC.
    if header[1] & 0x06 != 0 {
        return None;
    }
    let sampling_index = (header[2] >> 2) & 0x0f;
    if sampling_index == 15 {
        return None;
    }

    let protection_absent = header[1] & 0x01 == 1;
    let header_size = if protection_absent {
        HEADER_SIZE
    } else {
        HEADER_SIZE_CRC
    };

    // 13-bit frame length, header included.
    let len = ((header[3] & 0x03) as usize) << 11 | (header[4] as usize) << 3
        | (header[5] >> 5) as usize;
    if len < header_size {
        return None;
    }

    Some(len)
}

/// Streaming ADTS frame aligner.
#[derive(Debug, Default)]
pub struct AdtsParser {
    buf: Vec<u8>,
}

impl AdtsParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns all complete frames accumulated so far.
    pub fn feed(&mut self, data: &[u8]) -> Bytes {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 6 <= self.buf.len() {
            match frame_length(&self.buf[pos..pos + 6]) {
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
