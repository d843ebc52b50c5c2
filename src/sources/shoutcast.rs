//! Shoutcast (MP3/ADTS) ingest: ICY metadata de-interleaving and frame
//! alignment.
//!
//! A producer that advertised `Icy-Metaint: N` interleaves the payload
//! with metadata: N payload bytes, one length byte L, then L*16 metadata
//! bytes, repeating. The source strips the metadata out of the published
//! stream, keeps the latest metadata blob for clients that asked for it,
//! and frame-aligns the remaining payload so new clients always start on
//! a frame boundary.

use bytes::Bytes;

use super::raw::RawSource;
use crate::format::FrameAligner;

/// ICY request/response properties a producer may advertise.
///
/// Everything except `metaint` is re-emitted to clients as `icy-*`
/// response headers.
#[derive(Debug, Clone, Default)]
pub struct IcyProperties {
    pub name: Option<String>,
    pub genre: Option<String>,
    pub url: Option<String>,
    pub public: Option<String>,
    pub br: Option<String>,
    pub notice1: Option<String>,
    pub notice2: Option<String>,
    pub metaint: Option<usize>,
}

impl IcyProperties {
    /// Collects `Icy-*` headers through `get`, which should perform a
    /// case-insensitive lookup in a request or response head.
    pub fn from_headers<'a>(get: impl Fn(&str) -> Option<&'a str>) -> Self {
        let metaint = get("Icy-Metaint").and_then(|v| v.trim().parse().ok());
        let own = |v: Option<&str>| v.map(str::to_owned);
        Self {
            name: own(get("Icy-Name")),
            genre: own(get("Icy-Genre")),
            url: own(get("Icy-Url")),
            public: own(get("Icy-Pub")),
            br: own(get("Icy-Br")),
            notice1: own(get("Icy-Notice1")),
            notice2: own(get("Icy-Notice2")),
            metaint,
        }
    }

    /// The `icy-*` response headers for a client, metaint excluded.
    pub fn response_headers(&self) -> Vec<(&'static str, &str)> {
        [
            ("icy-name", &self.name),
            ("icy-genre", &self.genre),
            ("icy-url", &self.url),
            ("icy-pub", &self.public),
            ("icy-br", &self.br),
            ("icy-notice1", &self.notice1),
            ("icy-notice2", &self.notice2),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|value| (name, value)))
        .collect()
    }
}

#[derive(Debug)]
enum IcyState {
    /// Consuming payload; this many bytes until the next metadata chunk.
    Payload(usize),
    /// The next byte is the metadata length byte.
    MetaLen,
    /// Collecting the metadata blob, length byte included.
    Meta { need: usize, blob: Vec<u8> },
}

#[derive(Debug)]
pub struct ShoutcastSource {
    icy: IcyProperties,
    state: Option<IcyState>,
    metadata: Bytes,
    aligner: FrameAligner,
    inner: RawSource,
}

impl ShoutcastSource {
    pub fn new(aligner: FrameAligner, icy: IcyProperties, burst_size: Option<usize>) -> Self {
        let state = icy.metaint.filter(|&n| n > 0).map(IcyState::Payload);
        Self {
            icy,
            state,
            metadata: Bytes::new(),
            aligner,
            inner: RawSource::low_bitrate(burst_size),
        }
    }

    pub fn icy(&self) -> &IcyProperties {
        &self.icy
    }

    /// The latest metadata blob seen from the producer, leading length
    /// byte included. Empty until the first metadata chunk arrives.
    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.inner.recv_buffer_size()
    }

    pub fn handle_packet(&mut self, data: &[u8], out: &mut Vec<Bytes>) {
        let cleaned = if self.state.is_some() {
            self.strip_metadata(data)
        } else {
            data.to_vec()
        };
        if cleaned.is_empty() {
            return;
        }

        let aligned = self.aligner.feed(&cleaned);
        if aligned.is_empty() {
            return;
        }
        self.inner.handle_packet(&aligned, out);
    }

    /// Removes interleaved metadata chunks, updating the stored blob, and
    /// returns the raw payload bytes.
    fn strip_metadata(&mut self, data: &[u8]) -> Vec<u8> {
        let metaint = self.icy.metaint.unwrap_or(0);
        let mut payload = Vec::with_capacity(data.len());
        let mut rest = data;

        while !rest.is_empty() {
            match self.state.as_mut().expect("stripper state present") {
                IcyState::Payload(remaining) => {
                    let take = (*remaining).min(rest.len());
                    payload.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    *remaining -= take;
                    if *remaining == 0 {
                        self.state = Some(IcyState::MetaLen);
                    }
                }
                IcyState::MetaLen => {
                    // The length byte stays part of the blob, so clients
                    // get it back verbatim.
                    let need = 1 + rest[0] as usize * 16;
                    self.state = Some(IcyState::Meta {
                        need,
                        blob: Vec::with_capacity(need),
                    });
                }
                IcyState::Meta { need, blob } => {
                    let take = (*need - blob.len()).min(rest.len());
                    blob.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    if blob.len() == *need {
                        self.metadata = Bytes::from(std::mem::take(blob));
                        self.state = Some(IcyState::Payload(metaint));
                    }
                }
            }
        }

        payload
    }

    pub fn replay(&self, out: &mut Vec<Bytes>) {
        self.inner.replay(out);
    }

    pub fn reset(&mut self) {
        self.state = self.icy.metaint.filter(|&n| n > 0).map(IcyState::Payload);
        self.aligner.clear();
        self.inner.reset();
    }

    /// Refreshes the ICY properties after an on-demand reconnect; the new
    /// response may advertise a different metadata cadence.
    pub fn set_icy(&mut self, icy: IcyProperties) {
        self.icy = icy;
        self.reset();
    }

    pub fn set_burst_size(&mut self, burst_size: Option<usize>) {
        self.inner.set_burst_size(burst_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn icy_with_metaint(metaint: usize) -> IcyProperties {
        IcyProperties {
            name: Some("test radio".into()),
            metaint: Some(metaint),
            ..Default::default()
        }
    }

    /// MPEG-1 Layer III, 128 kbit/s, 44100 Hz: a 417-byte frame.
    fn mp3_frame(fill: u8) -> Vec<u8> {
        let mut frame = vec![fill; 417];
        frame[0] = 0xff;
        frame[1] = 0xfb;
        frame[2] = 0x90;
        frame[3] = 0x00;
        frame
    }

    fn metadata_blob(text: &str) -> Vec<u8> {
        let mut padded = text.as_bytes().to_vec();
        while padded.len() % 16 != 0 {
            padded.push(0);
        }
        let mut blob = vec![(padded.len() / 16) as u8];
        blob.extend_from_slice(&padded);
        blob
    }

    fn interleave(payload: &[u8], metaint: usize, blob: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < payload.len() {
            let take = metaint.min(payload.len() - pos);
            out.extend_from_slice(&payload[pos..pos + take]);
            pos += take;
            if take == metaint {
                out.extend_from_slice(blob);
            }
        }
        out
    }

    #[test]
    fn strips_metadata_and_stores_the_blob() {
        let mut source =
            ShoutcastSource::new(FrameAligner::mp3(), icy_with_metaint(100), None);

        let payload: Vec<u8> = [mp3_frame(0xaa), mp3_frame(0xbb)].concat();
        let blob = metadata_blob("StreamTitle='x';");
        let wire = interleave(&payload, 100, &blob);

        let mut out = Vec::new();
        source.handle_packet(&wire, &mut out);

        assert_eq!(source.metadata().as_ref(), blob.as_slice());
        // Publishing is buffered; the aligned payload sits in the temp
        // buffer (under the low-bitrate threshold).
        assert!(out.is_empty());

        // Push enough extra payload through to force a publish.
        let mut extra = Vec::new();
        for _ in 0..20 {
            extra.extend_from_slice(&mp3_frame(0xcc));
        }
        source.handle_packet(&interleave(&extra, 100, &metadata_blob("")), &mut out);
        assert!(!out.is_empty());

        let published: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        let mut expected = payload.clone();
        expected.extend_from_slice(&extra);
        // Everything published is a prefix of the cleaned payload stream.
        assert_eq!(published.as_slice(), &expected[..published.len()]);
    }

    #[test]
    fn zero_length_metadata_is_the_empty_marker() {
        let mut source =
            ShoutcastSource::new(FrameAligner::mp3(), icy_with_metaint(10), None);

        let mut wire = vec![0x11; 10];
        wire.push(0); // L = 0
        wire.extend_from_slice(&[0x22; 5]);

        let mut out = Vec::new();
        source.handle_packet(&wire, &mut out);
        assert_eq!(source.metadata().as_ref(), &[0][..]);
    }

    #[test]
    fn byte_at_a_time_feed_matches_whole_feed() {
        let payload: Vec<u8> = [mp3_frame(0x31), mp3_frame(0x32)].concat();
        let blob = metadata_blob("StreamTitle='split';");
        let wire = interleave(&payload, 64, &blob);

        let mut whole =
            ShoutcastSource::new(FrameAligner::mp3(), icy_with_metaint(64), None);
        let mut whole_out = Vec::new();
        whole.handle_packet(&wire, &mut whole_out);

        let mut split =
            ShoutcastSource::new(FrameAligner::mp3(), icy_with_metaint(64), None);
        let mut split_out = Vec::new();
        for byte in &wire {
            split.handle_packet(std::slice::from_ref(byte), &mut split_out);
        }

        assert_eq!(whole.metadata(), split.metadata());
        assert_eq!(whole.inner.burst_size_bytes(), split.inner.burst_size_bytes());
    }

    #[test]
    fn no_metaint_passes_payload_through() {
        let mut source =
            ShoutcastSource::new(FrameAligner::mp3(), IcyProperties::default(), None);
        let mut out = Vec::new();
        let mut data = Vec::new();
        for _ in 0..25 {
            data.extend_from_slice(&mp3_frame(0x44));
        }
        source.handle_packet(&data, &mut out);

        let published: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(published.as_slice(), &data[..published.len()]);
        assert!(!published.is_empty());
    }

    #[test]
    fn icy_headers_roundtrip() {
        let icy = IcyProperties::from_headers(|name| match name {
            "Icy-Name" => Some("radio"),
            "Icy-Metaint" => Some("16000"),
            "Icy-Br" => Some("128"),
            _ => None,
        });
        assert_eq!(icy.metaint, Some(16000));
        let headers = icy.response_headers();
        assert!(headers.contains(&("icy-name", "radio")));
        assert!(headers.contains(&("icy-br", "128")));
        assert!(!headers.iter().any(|(n, _)| n.contains("metaint")));
    }
}
