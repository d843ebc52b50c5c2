//! FLV ingest: tag segmentation, initial setup tags, keyframe-aligned
//! burst groups.

use std::collections::VecDeque;
use std::mem;

use bytes::Bytes;

use crate::format::flv::{
    AudioInfo, FlvHeader, TagHeader, TagType, VideoInfo, FrameType, HEADER_SIZE, TAG_HEADER_SIZE,
};
use crate::format::FormatError;

/// Timestamp span kept in the burst history, in milliseconds.
pub const BURST_DURATION_MS: i64 = 5000;

#[derive(Debug)]
enum ParserState {
    WantHeader,
    WantTagHeader,
    WantTagBody(TagHeader),
}

/// A closed, keyframe-led group of tags kept for new-client replay.
#[derive(Debug)]
struct BurstGroup {
    first_timestamp: u32,
    data: Bytes,
}

/// The group currently being accumulated.
#[derive(Debug, Default)]
struct OpenGroup {
    /// Whether the group leads with a sync point. Only sync-led groups are
    /// promoted to the burst history: a new client must always start its
    /// decoder at a keyframe.
    synced: bool,
    first_timestamp: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
pub struct FlvSource {
    state: ParserState,
    buf: Vec<u8>,
    header: Option<FlvHeader>,
    header_raw: Bytes,
    initial_tags: Vec<Bytes>,
    got_meta: bool,
    got_audio_seq: bool,
    got_video_seq: bool,
    group: OpenGroup,
    burst_groups: VecDeque<BurstGroup>,
}

impl FlvSource {
    pub fn new() -> Self {
        Self {
            state: ParserState::WantHeader,
            buf: Vec::new(),
            header: None,
            header_raw: Bytes::new(),
            initial_tags: Vec::new(),
            got_meta: false,
            got_audio_seq: false,
            got_video_seq: false,
            group: OpenGroup::default(),
            burst_groups: VecDeque::new(),
        }
    }

    pub fn handle_packet(&mut self, data: &[u8], out: &mut Vec<Bytes>) -> Result<(), FormatError> {
        self.buf.extend_from_slice(data);

        loop {
            match &self.state {
                ParserState::WantHeader => {
                    if self.buf.len() < HEADER_SIZE {
                        return Ok(());
                    }
                    let header = FlvHeader::parse(&self.buf)?;
                    self.header_raw = Bytes::copy_from_slice(&self.buf[..HEADER_SIZE]);
                    self.buf.drain(..HEADER_SIZE);
                    out.push(self.header_raw.clone());
                    self.header = Some(header);
                    self.state = ParserState::WantTagHeader;
                }
                ParserState::WantTagHeader => {
                    if self.buf.len() < TAG_HEADER_SIZE {
                        return Ok(());
                    }
                    let tag = TagHeader::parse(&self.buf)?;
                    self.buf.drain(..TAG_HEADER_SIZE);
                    self.state = ParserState::WantTagBody(tag);
                }
                ParserState::WantTagBody(tag) => {
                    let body_size = tag.body_size();
                    if self.buf.len() < body_size {
                        return Ok(());
                    }
                    let tag = tag.clone();

                    let mut blob = Vec::with_capacity(TAG_HEADER_SIZE + body_size);
                    blob.extend_from_slice(tag.as_bytes());
                    blob.extend_from_slice(&self.buf[..body_size]);
                    self.buf.drain(..body_size);

                    let body = &blob[TAG_HEADER_SIZE..];
                    if self.is_initial_tag(&tag, body)? {
                        let blob = Bytes::from(blob);
                        self.initial_tags.push(blob.clone());
                        out.push(blob);
                    } else {
                        let sync = self.is_sync_point(&tag, body)?;
                        self.append_tag(sync, tag.timestamp, &blob, out);
                    }

                    self.state = ParserState::WantTagHeader;
                }
            }
        }
    }

    /// The first metadata tag and the first AAC/AVC sequence headers are
    /// one-time-per-stream setup units, published immediately and replayed
    /// to every new client.
    fn is_initial_tag(&mut self, tag: &TagHeader, body: &[u8]) -> Result<bool, FormatError> {
        match tag.tag_type {
            TagType::Meta if !self.got_meta => {
                self.got_meta = true;
                Ok(true)
            }
            TagType::Audio if !self.got_audio_seq && body.len() >= 2 => {
                let info = AudioInfo::parse(body)?;
                if info.is_aac_sequence_header() {
                    self.got_audio_seq = true;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            TagType::Video if !self.got_video_seq && body.len() >= 2 => {
                let info = VideoInfo::parse(body)?;
                if info.is_avc_sequence_header() {
                    self.got_video_seq = true;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => Ok(false),
        }
    }

    /// A unit a new subscriber's decoder can start from: with video in the
    /// stream, only keyframes; for audio-only streams, any tag.
    fn is_sync_point(&self, tag: &TagHeader, body: &[u8]) -> Result<bool, FormatError> {
        let has_video = self.header.as_ref().is_some_and(|h| h.video);
        if !has_video {
            return Ok(true);
        }
        if tag.tag_type != TagType::Video || body.len() < 2 {
            return Ok(false);
        }
        let info = VideoInfo::parse(body)?;
        Ok(info.frame_type == FrameType::Keyframe)
    }

    fn append_tag(&mut self, sync: bool, timestamp: u32, blob: &[u8], out: &mut Vec<Bytes>) {
        if sync {
            self.flush_group(out);
        }
        if self.group.data.is_empty() {
            self.group.synced = sync;
            self.group.first_timestamp = timestamp;
        }
        self.group.data.extend_from_slice(blob);
    }

    /// Publishes the open group as one blob and, if it leads with a sync
    /// point, promotes it to the burst history.
    fn flush_group(&mut self, out: &mut Vec<Bytes>) {
        if self.group.data.is_empty() {
            return;
        }
        let group = mem::take(&mut self.group);
        let blob = Bytes::from(group.data);
        out.push(blob.clone());

        if group.synced {
            while self.burst_groups.len() >= 2
                && group.first_timestamp as i64 - self.burst_groups[1].first_timestamp as i64
                    > BURST_DURATION_MS
            {
                self.burst_groups.pop_front();
            }
            self.burst_groups.push_back(BurstGroup {
                first_timestamp: group.first_timestamp,
                data: blob,
            });
        }
    }

    /// New-client replay: stream header, initial setup tags, then the
    /// keyframe-aligned burst groups, the still-open one included.
    pub fn replay(&self, out: &mut Vec<Bytes>) {
        if self.header.is_none() {
            return;
        }
        out.push(self.header_raw.clone());
        out.extend(self.initial_tags.iter().cloned());
        out.extend(self.burst_groups.iter().map(|g| g.data.clone()));
        if self.group.synced && !self.group.data.is_empty() {
            out.push(Bytes::from(self.group.data.clone()));
        }
    }

    pub fn reset(&mut self) {
        self.state = ParserState::WantHeader;
        self.buf.clear();
        self.header = None;
        self.header_raw = Bytes::new();
        self.initial_tags.clear();
        self.got_meta = false;
        self.got_audio_seq = false;
        self.got_video_seq = false;
        self.group = OpenGroup::default();
        self.burst_groups.clear();
    }
}

impl Default for FlvSource {
    fn default() -> Self {
        Self::new()
    }
}
