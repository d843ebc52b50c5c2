//! FLV container records.
//!
//! Only the pieces needed to relay a stream are parsed: the file header,
//! tag headers, and the first byte or two of audio/video tag bodies, which
//! is enough to locate keyframes and AAC/AVC sequence headers. No codec
//! data is decoded.

use byteorder::{BigEndian, ByteOrder};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use super::FormatError;

/// File header (9 bytes) plus the leading zero previous-tag-size (4 bytes).
pub const HEADER_SIZE: usize = 13;
/// Fixed part of a tag: type, data size, timestamp, stream id.
pub const TAG_HEADER_SIZE: usize = 11;
/// The previous-tag-size trailer following every tag body.
pub const TAG_TRAILER_SIZE: usize = 4;

const AUDIO_PRESENT: u8 = 4;
const VIDEO_PRESENT: u8 = 1;

/// The 13-byte stream preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvHeader {
    pub version: u8,
    pub audio: bool,
    pub video: bool,
    raw: [u8; HEADER_SIZE],
}

impl FlvHeader {
    /// Parses and validates the preamble. Requires [`HEADER_SIZE`] bytes.
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < HEADER_SIZE {
            return Err(FormatError::Truncated("FLV header"));
        }
        if &data[..3] != b"FLV" {
            return Err(FormatError::invalid("FLV signature", data[0] as u64));
        }
        let version = data[3];
        if version != 1 {
            return Err(FormatError::invalid("FLV version", version as u64));
        }
        let flags = data[4];
        let data_offset = BigEndian::read_u32(&data[5..9]);
        if data_offset != 9 {
            return Err(FormatError::invalid("FLV data offset", data_offset as u64));
        }
        let previous_tag_size = BigEndian::read_u32(&data[9..13]);
        if previous_tag_size != 0 {
            return Err(FormatError::invalid(
                "FLV previous tag size",
                previous_tag_size as u64,
            ));
        }

        let mut raw = [0; HEADER_SIZE];
        raw.copy_from_slice(&data[..HEADER_SIZE]);
        Ok(Self {
            version,
            audio: flags & AUDIO_PRESENT == AUDIO_PRESENT,
            video: flags & VIDEO_PRESENT == VIDEO_PRESENT,
            raw,
        })
    }

    /// The header exactly as it appeared on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// FLV tag kinds carried by a stream.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum TagType {
    Audio = 8,
    Video = 9,
    Meta = 18,
}

/// The fixed 11-byte tag header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagHeader {
    pub tag_type: TagType,
    /// Body length, excluding this header and the 4-byte trailer.
    pub data_size: u32,
    /// Millisecond timestamp, extension byte included.
    pub timestamp: u32,
    raw: [u8; TAG_HEADER_SIZE],
}

impl TagHeader {
    /// Parses and validates one tag header. Requires [`TAG_HEADER_SIZE`]
    /// bytes.
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        if data.len() < TAG_HEADER_SIZE {
            return Err(FormatError::Truncated("FLV tag header"));
        }
        let tag_type = TagType::from_u8(data[0])
            .ok_or_else(|| FormatError::invalid("FLV tag type", data[0] as u64))?;
        let data_size = BigEndian::read_u24(&data[1..4]);
        let timestamp = BigEndian::read_u24(&data[4..7]) | (data[7] as u32) << 24;
        let stream_id = BigEndian::read_u24(&data[8..11]);
        if stream_id != 0 {
            return Err(FormatError::invalid("FLV stream id", stream_id as u64));
        }

        let mut raw = [0; TAG_HEADER_SIZE];
        raw.copy_from_slice(&data[..TAG_HEADER_SIZE]);
        Ok(Self {
            tag_type,
            data_size,
            timestamp,
            raw,
        })
    }

    /// Body length including the previous-tag-size trailer.
    pub fn body_size(&self) -> usize {
        self.data_size as usize + TAG_TRAILER_SIZE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Video frame types, from the high nibble of a video tag body.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum FrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

/// Video codec ids, from the low nibble of a video tag body.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum VideoCodec {
    Jpeg = 1,
    SorensonH263 = 2,
    ScreenVideo = 3,
    On2Vp6 = 4,
    On2Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    Avc = 7,
}

/// AVC packet type marking a sequence header.
pub const AVC_SEQUENCE_HEADER: u8 = 0;

/// The first two bytes of a video tag body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub frame_type: FrameType,
    pub codec: VideoCodec,
    pub avc_packet_type: u8,
}

impl VideoInfo {
    pub fn parse(body: &[u8]) -> Result<Self, FormatError> {
        if body.len() < 2 {
            return Err(FormatError::Truncated("FLV video data"));
        }
        let frame_type = FrameType::from_u8(body[0] >> 4)
            .ok_or_else(|| FormatError::invalid("FLV frame type", (body[0] >> 4) as u64))?;
        let codec = VideoCodec::from_u8(body[0] & 0x0f)
            .ok_or_else(|| FormatError::invalid("FLV video codec", (body[0] & 0x0f) as u64))?;
        Ok(Self {
            frame_type,
            codec,
            avc_packet_type: body[1],
        })
    }

    /// An AVC sequence header, sent once per stream ahead of any frames.
    pub fn is_avc_sequence_header(&self) -> bool {
        self.codec == VideoCodec::Avc && self.avc_packet_type == AVC_SEQUENCE_HEADER
    }
}

/// Audio encodings, from the high nibble of an audio tag body.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum SoundFormat {
    LinearPcmHostEndian = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLittleEndian = 3,
    Nellymoser16KhzMono = 4,
    Nellymoser8KhzMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Reserved = 9,
    Aac = 10,
    Speex = 11,
    Mp38Khz = 14,
    DeviceSpecific = 15,
}

/// AAC packet type marking a sequence header.
pub const AAC_SEQUENCE_HEADER: u8 = 0;

/// The first two bytes of an audio tag body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub sound_format: SoundFormat,
    pub aac_packet_type: u8,
}

impl AudioInfo {
    pub fn parse(body: &[u8]) -> Result<Self, FormatError> {
        if body.len() < 2 {
            return Err(FormatError::Truncated("FLV audio data"));
        }
        let sound_format = SoundFormat::from_u8(body[0] >> 4)
            .ok_or_else(|| FormatError::invalid("FLV sound format", (body[0] >> 4) as u64))?;
        Ok(Self {
            sound_format,
            aac_packet_type: body[1],
        })
    }

    /// An AAC sequence header, sent once per stream ahead of any frames.
    pub fn is_aac_sequence_header(&self) -> bool {
        self.sound_format == SoundFormat::Aac && self.aac_packet_type == AAC_SEQUENCE_HEADER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn header_bytes(flags: u8) -> [u8; HEADER_SIZE] {
        let mut data = [0; HEADER_SIZE];
        data[..3].copy_from_slice(b"FLV");
        data[3] = 1;
        data[4] = flags;
        data[8] = 9;
        data
    }

    #[test]
    fn header_roundtrip() {
        let data = header_bytes(5);
        let header = FlvHeader::parse(&data).unwrap();
        assert!(header.audio);
        assert!(header.video);
        assert_eq!(header.as_bytes(), &data);
    }

    #[test]
    fn header_flags() {
        let header = FlvHeader::parse(&header_bytes(4)).unwrap();
        assert!(header.audio);
        assert!(!header.video);

        let header = FlvHeader::parse(&header_bytes(1)).unwrap();
        assert!(!header.audio);
        assert!(header.video);
    }

    #[test]
    fn header_validation() {
        let mut data = header_bytes(5);
        data[0] = b'G';
        assert_matches!(FlvHeader::parse(&data), Err(FormatError::Invalid { .. }));

        let mut data = header_bytes(5);
        data[8] = 10;
        assert_matches!(FlvHeader::parse(&data), Err(FormatError::Invalid { .. }));

        assert_matches!(
            FlvHeader::parse(&header_bytes(5)[..10]),
            Err(FormatError::Truncated(_))
        );
    }

    fn tag_bytes(tag_type: u8, data_size: u32, timestamp: u32) -> [u8; TAG_HEADER_SIZE] {
        let mut data = [0; TAG_HEADER_SIZE];
        data[0] = tag_type;
        data[1] = (data_size >> 16) as u8;
        data[2] = (data_size >> 8) as u8;
        data[3] = data_size as u8;
        data[4] = (timestamp >> 16) as u8;
        data[5] = (timestamp >> 8) as u8;
        data[6] = timestamp as u8;
        data[7] = (timestamp >> 24) as u8;
        data
    }

    #[test]
    fn tag_header_fields() {
        let data = tag_bytes(9, 0x010203, 0x04050607);
        let tag = TagHeader::parse(&data).unwrap();
        assert_eq!(tag.tag_type, TagType::Video);
        assert_eq!(tag.data_size, 0x010203);
        assert_eq!(tag.timestamp, 0x04050607);
        assert_eq!(tag.body_size(), 0x010203 + TAG_TRAILER_SIZE);
        assert_eq!(tag.as_bytes(), &data);
    }

    #[test]
    fn tag_header_rejects_unknown_type() {
        let data = tag_bytes(7, 1, 0);
        assert_matches!(TagHeader::parse(&data), Err(FormatError::Invalid { .. }));
    }

    #[test]
    fn tag_header_rejects_stream_id() {
        let mut data = tag_bytes(8, 1, 0);
        data[10] = 1;
        assert_matches!(TagHeader::parse(&data), Err(FormatError::Invalid { .. }));
    }

    #[test]
    fn video_info() {
        let info = VideoInfo::parse(&[0x17, 0x00]).unwrap();
        assert_eq!(info.frame_type, FrameType::Keyframe);
        assert_eq!(info.codec, VideoCodec::Avc);
        assert!(info.is_avc_sequence_header());

        let info = VideoInfo::parse(&[0x27, 0x01]).unwrap();
        assert_eq!(info.frame_type, FrameType::InterFrame);
        assert!(!info.is_avc_sequence_header());
    }

    #[test]
    fn audio_info() {
        let info = AudioInfo::parse(&[0xaf, 0x00]).unwrap();
        assert_eq!(info.sound_format, SoundFormat::Aac);
        assert!(info.is_aac_sequence_header());

        let info = AudioInfo::parse(&[0x2f, 0x00]).unwrap();
        assert_eq!(info.sound_format, SoundFormat::Mp3);
        assert!(!info.is_aac_sequence_header());
    }
}
