//! Stream sources: per-format ingest state machines and the registry-side
//! source record.
//!
//! Format dispatch is a tagged sum rather than a trait hierarchy; the
//! variants share one small contract (`handle_packet` fills a publish
//! list, `replay` produces the new-client prelude) and the server never
//! needs to know which variant it holds.

mod flv;
mod raw;
mod shoutcast;

pub use flv::FlvSource;
pub use raw::{RawSource, MPEGTS_PACKET_SIZE, RECV_BUFFER_SIZE};
pub use shoutcast::{IcyProperties, ShoutcastSource};

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read};

use bytes::Bytes;
use mio::net::{TcpStream, UdpSocket};
use mio::Token;

use crate::format::{FormatError, FrameAligner};
use crate::relay::RelaySpec;

/// Stable identity of a source, independent of its (possibly replaced)
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stream format names accepted in configuration overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Raw,
    MpegTs,
    Flv,
    Mp3,
    Adts,
}

impl FormatKind {
    /// The default `Content-Type` mapping. Unknown types fall back to the
    /// generic buffered source.
    pub fn from_content_type(content_type: &str) -> FormatKind {
        match content_type {
            "video/x-flv" | "application/x-flv" => FormatKind::Flv,
            "video/MP2T" | "video/mpeg" => FormatKind::MpegTs,
            "audio/mpeg" | "audio/mp3" => FormatKind::Mp3,
            "audio/aacp" | "audio/aac" => FormatKind::Adts,
            _ => FormatKind::Raw,
        }
    }

    pub fn from_name(name: &str) -> Option<FormatKind> {
        match name {
            "raw" => Some(FormatKind::Raw),
            "mpegts" => Some(FormatKind::MpegTs),
            "flv" => Some(FormatKind::Flv),
            "mp3" => Some(FormatKind::Mp3),
            "adts" => Some(FormatKind::Adts),
            _ => None,
        }
    }
}

/// Per-format ingest state.
#[derive(Debug)]
pub enum SourceKind {
    Raw(RawSource),
    MpegTs(RawSource),
    Flv(FlvSource),
    Shoutcast(ShoutcastSource),
}

impl SourceKind {
    pub fn new(format: FormatKind, icy: IcyProperties, burst_size: Option<usize>) -> SourceKind {
        match format {
            FormatKind::Raw => SourceKind::Raw(RawSource::buffered(burst_size)),
            FormatKind::MpegTs => SourceKind::MpegTs(RawSource::mpegts(burst_size)),
            FormatKind::Flv => SourceKind::Flv(FlvSource::new()),
            FormatKind::Mp3 => {
                SourceKind::Shoutcast(ShoutcastSource::new(FrameAligner::mp3(), icy, burst_size))
            }
            FormatKind::Adts => {
                SourceKind::Shoutcast(ShoutcastSource::new(FrameAligner::adts(), icy, burst_size))
            }
        }
    }

    /// How much to ask the kernel for per read.
    pub fn recv_buffer_size(&self) -> usize {
        match self {
            SourceKind::Raw(s) | SourceKind::MpegTs(s) => s.recv_buffer_size(),
            SourceKind::Flv(_) => RECV_BUFFER_SIZE,
            SourceKind::Shoutcast(s) => s.recv_buffer_size(),
        }
    }

    /// Ingests one chunk, appending everything now publishable to `out`.
    pub fn handle_packet(&mut self, data: &[u8], out: &mut Vec<Bytes>) -> Result<(), FormatError> {
        match self {
            SourceKind::Raw(s) | SourceKind::MpegTs(s) => {
                s.handle_packet(data, out);
                Ok(())
            }
            SourceKind::Flv(s) => s.handle_packet(data, out),
            SourceKind::Shoutcast(s) => {
                s.handle_packet(data, out);
                Ok(())
            }
        }
    }

    /// The prelude for a new client: initial setup units, then the burst
    /// history.
    pub fn replay(&self, out: &mut Vec<Bytes>) {
        match self {
            SourceKind::Raw(s) | SourceKind::MpegTs(s) => s.replay(out),
            SourceKind::Flv(s) => s.replay(out),
            SourceKind::Shoutcast(s) => s.replay(out),
        }
    }

    /// Drops all parser and burst state (on-demand disconnect).
    pub fn reset(&mut self) {
        match self {
            SourceKind::Raw(s) | SourceKind::MpegTs(s) => s.reset(),
            SourceKind::Flv(s) => s.reset(),
            SourceKind::Shoutcast(s) => s.reset(),
        }
    }

    pub fn set_burst_size(&mut self, burst_size: Option<usize>) {
        match self {
            SourceKind::Raw(s) | SourceKind::MpegTs(s) => s.set_burst_size(burst_size),
            // FLV burst history is bounded by duration, not bytes.
            SourceKind::Flv(_) => {}
            SourceKind::Shoutcast(s) => s.set_burst_size(burst_size),
        }
    }

    pub fn as_shoutcast(&self) -> Option<&ShoutcastSource> {
        match self {
            SourceKind::Shoutcast(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_shoutcast_mut(&mut self) -> Option<&mut ShoutcastSource> {
        match self {
            SourceKind::Shoutcast(s) => Some(s),
            _ => None,
        }
    }
}

/// The socket feeding a source.
#[derive(Debug)]
pub enum SourceSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl SourceSocket {
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SourceSocket::Tcp(sock) => sock.read(buf),
            SourceSocket::Udp(sock) => sock.recv(buf),
        }
    }
}

/// On-demand relay lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDemandState {
    /// Not an on-demand source.
    Disabled,
    /// Disconnected; the next client triggers a connect.
    Stopped,
    /// Relay connect in flight.
    Connecting,
    Running,
    /// Running, but idle and about to close.
    Closing,
}

/// A registered source: socket, format state, and its subscribers.
#[derive(Debug)]
pub struct Source {
    pub id: SourceId,
    pub path: String,
    pub content_type: String,
    /// Peer address, for logs and the status endpoints.
    pub address: String,
    pub token: Option<Token>,
    pub sock: Option<SourceSocket>,
    pub kind: SourceKind,
    pub subscribers: HashSet<Token>,
    pub on_demand: OnDemandState,
    pub keepalive: Option<u64>,
    /// Present when this source was created by a relay; used for restarts
    /// and on-demand reconnects.
    pub relay: Option<RelaySpec>,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<source {} for {}, {}, {}>",
            self.id, self.path, self.address, self.content_type
        )
    }
}
