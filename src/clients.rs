//! Client-side handlers: one-shot HTTP responders and stream clients.
//!
//! A stream client never decides to finish on its own; its source's
//! lifetime controls it. A responder drains its prepared response and
//! closes.

use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;
use mio::net::TcpStream;
use mio::Token;

use crate::buffer::{BufferError, OutputBuffer};
use crate::http::Response;
use crate::stats::RequestInfo;

/// Payload bytes between metadata splices on a metadata-enabled client.
pub const ICY_META_INTERVAL: usize = 32 * 1024;

/// Splices ICY metadata into a payload stream every
/// [`ICY_META_INTERVAL`] bytes: the source's current metadata blob when
/// it changed since the last splice, else the single zero "unchanged"
/// marker.
#[derive(Debug)]
pub struct IcySplicer {
    interval: usize,
    bytes_count: usize,
    last_metadata: Bytes,
}

impl IcySplicer {
    pub fn new() -> IcySplicer {
        IcySplicer {
            interval: ICY_META_INTERVAL,
            bytes_count: 0,
            last_metadata: Bytes::new(),
        }
    }

    fn splice(&mut self, mut packet: Bytes, current: &Bytes, out: &mut Vec<Bytes>) {
        loop {
            let remaining = self.interval - self.bytes_count;
            if packet.len() > remaining {
                out.push(packet.slice(..remaining));
                packet = packet.slice(remaining..);
                if self.last_metadata != *current {
                    self.last_metadata = current.clone();
                    out.push(current.clone());
                } else {
                    out.push(Bytes::from_static(&[0]));
                }
                self.bytes_count = 0;
            } else {
                self.bytes_count += packet.len();
                out.push(packet);
                return;
            }
        }
    }
}

impl Default for IcySplicer {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber receiving a live stream.
#[derive(Debug)]
pub struct Client {
    pub sock: TcpStream,
    pub token: Token,
    pub address: SocketAddr,
    /// None while orphaned in the keepalive grace window.
    pub source: Option<crate::sources::SourceId>,
    pub buffer: OutputBuffer,
    splicer: Option<IcySplicer>,
    pub info: RequestInfo,
    pub status: u16,
    pub connect_time: SystemTime,
    pub bytes_sent: u64,
    /// Whether the inactivity timer is currently armed.
    pub timeout_armed: bool,
    /// Whether the socket is registered for write readiness.
    pub registered: bool,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sock: TcpStream,
        token: Token,
        address: SocketAddr,
        source: crate::sources::SourceId,
        response: &Response,
        info: RequestInfo,
        connect_time: SystemTime,
        max_queue_size: usize,
        with_metadata: bool,
    ) -> Client {
        let mut buffer = OutputBuffer::new(max_queue_size);
        buffer.add(response.to_bytes());
        Client {
            sock,
            token,
            address,
            source: Some(source),
            buffer,
            splicer: with_metadata.then(IcySplicer::new),
            info,
            status: response.status,
            connect_time,
            bytes_sent: 0,
            timeout_armed: false,
            registered: false,
        }
    }

    /// Appends one published unit, splicing metadata when enabled.
    pub fn add_packet(&mut self, packet: Bytes, metadata: Option<&Bytes>) {
        match &mut self.splicer {
            Some(splicer) => {
                let empty = Bytes::new();
                let current = metadata.unwrap_or(&empty);
                let mut cuts = Vec::new();
                splicer.splice(packet, current, &mut cuts);
                for cut in cuts {
                    if !cut.is_empty() {
                        self.buffer.add(cut);
                    }
                }
            }
            None => self.buffer.add(packet),
        }
    }

    pub fn flush(&mut self) -> Result<usize, BufferError> {
        let sent = self.buffer.flush(&mut self.sock)?;
        self.bytes_sent += sent as u64;
        Ok(sent)
    }
}

/// A handler draining one prepared HTTP response, then closing.
#[derive(Debug)]
pub struct Responder {
    pub sock: TcpStream,
    pub token: Token,
    pub address: SocketAddr,
    pub buffer: OutputBuffer,
    pub info: RequestInfo,
    pub status: u16,
    pub connect_time: SystemTime,
    pub bytes_sent: u64,
}

impl Responder {
    pub fn new(
        sock: TcpStream,
        token: Token,
        address: SocketAddr,
        response: &Response,
        info: RequestInfo,
        connect_time: SystemTime,
        max_queue_size: usize,
    ) -> Responder {
        let mut buffer = OutputBuffer::new(max_queue_size);
        buffer.add(response.to_bytes());
        Responder {
            sock,
            token,
            address,
            buffer,
            info,
            status: response.status,
            connect_time,
            bytes_sent: 0,
        }
    }

    pub fn flush(&mut self) -> Result<usize, BufferError> {
        let sent = self.buffer.flush(&mut self.sock)?;
        self.bytes_sent += sent as u64;
        Ok(sent)
    }

    pub fn finished(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn splice_all(splicer: &mut IcySplicer, packet: &[u8], metadata: &Bytes) -> Vec<u8> {
        let mut out = Vec::new();
        splicer.splice(Bytes::copy_from_slice(packet), metadata, &mut out);
        out.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[test]
    fn small_packets_pass_through() {
        let mut splicer = IcySplicer::new();
        let meta = Bytes::new();
        let out = splice_all(&mut splicer, &[1, 2, 3], &meta);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn boundary_inserts_the_unchanged_marker() {
        let mut splicer = IcySplicer::new();
        let meta = Bytes::new();
        let payload = vec![0xaa; ICY_META_INTERVAL + 10];
        let out = splice_all(&mut splicer, &payload, &meta);

        assert_eq!(out.len(), payload.len() + 1);
        assert_eq!(out[ICY_META_INTERVAL], 0);
        assert_eq!(&out[ICY_META_INTERVAL + 1..], &payload[ICY_META_INTERVAL..]);
    }

    #[test]
    fn changed_metadata_is_emitted_once() {
        let mut splicer = IcySplicer::new();
        // [L=1][16 metadata bytes]
        let mut raw = vec![1u8];
        raw.extend_from_slice(&[0x41; 16]);
        let meta = Bytes::from(raw.clone());

        let payload = vec![0xbb; 2 * ICY_META_INTERVAL];
        let out = splice_all(&mut splicer, &payload, &meta);

        // First boundary carries the blob, second the zero marker.
        let first = ICY_META_INTERVAL;
        assert_eq!(&out[first..first + raw.len()], raw.as_slice());
        let second = 2 * ICY_META_INTERVAL + raw.len();
        assert_eq!(out[second], 0);
        assert_eq!(out.len(), payload.len() + raw.len() + 1);
    }

    #[test]
    fn stripping_metadata_recovers_the_payload() {
        // The ICY invariant: removing each spliced chunk at the cadence
        // recovers the published payload bit-for-bit.
        let mut splicer = IcySplicer::new();
        let mut raw = vec![2u8];
        raw.extend_from_slice(&[0x58; 32]);
        let meta = Bytes::from(raw);

        let payload: Vec<u8> = (0..3 * ICY_META_INTERVAL + 123).map(|i| i as u8).collect();
        let mut out = Vec::new();
        for chunk in payload.chunks(1000) {
            splicer.splice(Bytes::copy_from_slice(chunk), &meta, &mut out);
        }
        let wire: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();

        // Strip: every ICY_META_INTERVAL payload bytes, read L, skip L*16.
        let mut recovered = Vec::new();
        let mut pos = 0;
        let mut since_meta = 0;
        while pos < wire.len() {
            if since_meta == ICY_META_INTERVAL {
                let len = wire[pos] as usize * 16;
                pos += 1 + len;
                since_meta = 0;
            } else {
                recovered.push(wire[pos]);
                pos += 1;
                since_meta += 1;
            }
        }
        assert_eq!(recovered, payload);
    }

    #[test]
    fn client_without_splicer_queues_directly() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let std_sock = std::net::TcpStream::connect(addr).unwrap();
        std_sock.set_nonblocking(true).unwrap();
        let sock = TcpStream::from_std(std_sock);

        let response = Response::new(200, "OK").streaming();
        let mut client = Client::new(
            sock,
            Token(10),
            addr,
            crate::sources::SourceId(1),
            &response,
            RequestInfo::default(),
            SystemTime::now(),
            1024 * 1024,
            false,
        );

        let before = client.buffer.queue_size();
        client.add_packet(Bytes::from_static(b"payload"), None);
        assert_eq!(client.buffer.queue_size(), before + 7);
    }
}
