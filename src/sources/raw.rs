//! Byte-oriented sources: buffered raw and fixed-packet-size (MPEG-TS).

use bytes::Bytes;

use crate::buffer::BurstQueue;

/// Incoming read size for generic sources.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;
/// Bytes accumulated before a publish.
pub const TEMP_BUFFER_SIZE: usize = 64 * 1024;
/// Default burst history size for new clients.
pub const BURST_SIZE: usize = 64 * 1024;

/// Smaller accumulation for low-bitrate audio streams, where a 64 KiB
/// publish granularity would stall clients past their timeout.
pub const LOW_BITRATE_TEMP_BUFFER_SIZE: usize = 8 * 1024;

pub const MPEGTS_PACKET_SIZE: usize = 188;
/// 188 * 7 = 1316 is the largest multiple of the TS packet size under the
/// typical 1500-byte MTU.
pub const MPEGTS_RECV_BUFFER_SIZE: usize = 50 * 7 * MPEGTS_PACKET_SIZE;
pub const MPEGTS_TEMP_BUFFER_SIZE: usize = 2 * MPEGTS_RECV_BUFFER_SIZE;
pub const MPEGTS_BURST_SIZE: usize = 2 * MPEGTS_RECV_BUFFER_SIZE;

/// A source that accumulates input and republishes it in fixed-granularity
/// chunks, keeping a bounded burst history for new clients.
///
/// With a `packet_size`, only whole multiples of it are ever published
/// (MPEG-TS); the remainder waits for more input.
#[derive(Debug)]
pub struct RawSource {
    temp: Vec<u8>,
    temp_buffer_size: usize,
    recv_buffer_size: usize,
    packet_size: Option<usize>,
    default_burst_size: usize,
    burst: BurstQueue,
}

impl RawSource {
    fn new(
        recv_buffer_size: usize,
        temp_buffer_size: usize,
        default_burst_size: usize,
        packet_size: Option<usize>,
        burst_size: Option<usize>,
    ) -> Self {
        Self {
            temp: Vec::new(),
            temp_buffer_size,
            recv_buffer_size,
            packet_size,
            default_burst_size,
            burst: BurstQueue::new(burst_size.unwrap_or(default_burst_size)),
        }
    }

    /// Generic byte stream (`application/octet-stream` and unknown types).
    pub fn buffered(burst_size: Option<usize>) -> Self {
        Self::new(RECV_BUFFER_SIZE, TEMP_BUFFER_SIZE, BURST_SIZE, None, burst_size)
    }

    /// Low-bitrate audio publish path (Shoutcast sources).
    pub fn low_bitrate(burst_size: Option<usize>) -> Self {
        Self::new(
            RECV_BUFFER_SIZE,
            LOW_BITRATE_TEMP_BUFFER_SIZE,
            BURST_SIZE,
            None,
            burst_size,
        )
    }

    /// MPEG transport stream: publish whole 188-byte packets only.
    pub fn mpegts(burst_size: Option<usize>) -> Self {
        Self::new(
            MPEGTS_RECV_BUFFER_SIZE,
            MPEGTS_TEMP_BUFFER_SIZE,
            MPEGTS_BURST_SIZE,
            Some(MPEGTS_PACKET_SIZE),
            burst_size,
        )
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    pub fn handle_packet(&mut self, data: &[u8], out: &mut Vec<Bytes>) {
        self.temp.extend_from_slice(data);
        if self.temp.len() < self.temp_buffer_size {
            return;
        }

        let flush_len = match self.packet_size {
            Some(packet_size) => self.temp.len() / packet_size * packet_size,
            None => self.temp.len(),
        };
        if flush_len == 0 {
            return;
        }

        let chunk = Bytes::from(self.temp[..flush_len].to_vec());
        self.temp.drain(..flush_len);
        self.burst.push(chunk.clone());
        out.push(chunk);
    }

    /// The burst history, oldest first, for new-client replay.
    pub fn replay(&self, out: &mut Vec<Bytes>) {
        out.extend(self.burst.iter().cloned());
    }

    pub fn reset(&mut self) {
        self.temp.clear();
        self.burst.clear();
    }

    pub fn set_burst_size(&mut self, burst_size: Option<usize>) {
        self.burst
            .set_maxbytes(burst_size.unwrap_or(self.default_burst_size));
    }

    #[cfg(test)]
    pub(crate) fn burst_size_bytes(&self) -> usize {
        self.burst.current_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn buffers_until_threshold() {
        let mut source = RawSource::buffered(None);
        let mut out = Vec::new();

        source.handle_packet(&[0xaa; 1000], &mut out);
        assert!(out.is_empty());

        source.handle_packet(&vec![0xbb; TEMP_BUFFER_SIZE], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 1000 + TEMP_BUFFER_SIZE);
        assert_eq!(&out[0][..1000], &[0xaa; 1000][..]);
    }

    #[test]
    fn mpegts_publishes_whole_packets_only() {
        let mut source = RawSource::mpegts(None);
        let mut out = Vec::new();

        let n = MPEGTS_TEMP_BUFFER_SIZE + 100;
        source.handle_packet(&vec![0x47; n], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len() % MPEGTS_PACKET_SIZE, 0);

        // The remainder is retained for the next flush.
        let published = out[0].len();
        assert_eq!(n - published, source.temp.len());
    }

    #[test]
    fn split_feed_equals_whole_feed() {
        let data: Vec<u8> = (0..2 * TEMP_BUFFER_SIZE).map(|i| i as u8).collect();

        let mut whole = RawSource::buffered(None);
        let mut whole_out = Vec::new();
        whole.handle_packet(&data, &mut whole_out);

        let mut split = RawSource::buffered(None);
        let mut split_out = Vec::new();
        for chunk in data.chunks(1000) {
            split.handle_packet(chunk, &mut split_out);
        }

        let whole_bytes: Vec<u8> = whole_out.iter().flat_map(|b| b.iter().copied()).collect();
        let split_bytes: Vec<u8> = split_out.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(whole_bytes, split_bytes);
    }

    #[test]
    fn replay_is_bounded_by_burst_size() {
        let mut source = RawSource::buffered(Some(TEMP_BUFFER_SIZE));
        let mut out = Vec::new();
        for _ in 0..4 {
            source.handle_packet(&vec![0xcc; TEMP_BUFFER_SIZE], &mut out);
        }

        let mut replay = Vec::new();
        source.replay(&mut replay);
        let total: usize = replay.iter().map(|b| b.len()).sum();
        assert!(total <= TEMP_BUFFER_SIZE);
        assert_eq!(source.burst_size_bytes(), total);
    }
}
