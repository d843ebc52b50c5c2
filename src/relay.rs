//! Outbound relays: pull a remote stream into a local mount.
//!
//! An HTTP relay walks connect → request → response, then hands its
//! socket over to a newly built source. A UDP relay binds (optionally
//! joining a multicast group) and waits for enough traffic to prove the
//! group is alive before a source is registered.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpStream, UdpSocket};
use mio::Token;
use thiserror::Error;
use url::Url;

use crate::buffer::{BufferError, OutputBuffer};
use crate::http::{HttpError, ResponseHead, MAX_HEAD_SIZE};

/// Upper bound on an upstream response head.
pub const RESPONSE_MAX_SIZE: usize = MAX_HEAD_SIZE;
/// Delay before a failed relay is retried.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);
/// Bytes a UDP relay must see before it becomes a source.
pub const MIN_START_BUFFER: usize = 64 * 1024;
/// Idle grace before an on-demand source disconnects.
pub const ON_DEMAND_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid relay URL {url:?}: {reason}")]
    BadUrl { url: String, reason: String },
    #[error("cannot resolve {0}")]
    Unresolvable(String),
    #[error("unexpected response status {0} {1}")]
    BadStatus(u16, String),
    #[error("oversized response head from upstream")]
    Oversized,
    #[error("unexpected end of stream from upstream")]
    Eof,
    #[error("{0}")]
    Http(#[from] HttpError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<BufferError> for RelayError {
    fn from(err: BufferError) -> RelayError {
        match err {
            BufferError::Io(err) => RelayError::Io(err),
            // A relay queues one small request; its cap cannot be hit.
            BufferError::QueueSizeExceeded { .. } => {
                RelayError::Io(io::Error::other("relay queue overflow"))
            }
        }
    }
}

/// Everything needed to (re)establish one relay.
#[derive(Debug, Clone)]
pub struct RelaySpec {
    pub url: Url,
    pub path: String,
    /// Pre-resolved address, set when `net_resolve_all` expands one URL
    /// into a relay per A record.
    pub addr: Option<SocketAddr>,
    pub burst_size: Option<usize>,
    pub on_demand: bool,
    pub keepalive: Option<u64>,
}

impl RelaySpec {
    pub fn new(
        url: &str,
        path: &str,
        addr: Option<SocketAddr>,
        burst_size: Option<usize>,
        on_demand: bool,
        keepalive: Option<u64>,
    ) -> Result<RelaySpec, RelayError> {
        let parsed = Url::parse(url).map_err(|err| RelayError::BadUrl {
            url: url.to_owned(),
            reason: err.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(RelayError::BadUrl {
                url: url.to_owned(),
                reason: "missing hostname".to_owned(),
            });
        }
        if parsed.port_or_known_default().is_none() {
            return Err(RelayError::BadUrl {
                url: url.to_owned(),
                reason: "missing port".to_owned(),
            });
        }
        Ok(RelaySpec {
            url: parsed,
            path: path.to_owned(),
            addr,
            burst_size,
            on_demand,
            keepalive,
        })
    }

    /// UDP and multicast URLs take the datagram path.
    pub fn is_udp(&self) -> bool {
        matches!(self.url.scheme(), "udp" | "multicast")
    }

    /// Identity for configuration diffing.
    pub fn identity(&self) -> (String, String, Option<SocketAddr>) {
        (self.url.as_str().to_owned(), self.path.clone(), self.addr)
    }

    fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// The connect address: pre-resolved if given, else the first address
    /// the resolver returns.
    pub fn resolve(&self) -> Result<SocketAddr, RelayError> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let target = (self.host(), self.port());
        target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RelayError::Unresolvable(format!("{}:{}", self.host(), self.port())))
    }

    /// `GET <path[?query]> HTTP/1.0` plus the headers upstreams expect.
    pub fn build_request(&self) -> Bytes {
        let mut selector = self.url.path().to_owned();
        if selector.is_empty() {
            selector.push('/');
        }
        if let Some(query) = self.url.query() {
            selector.push('?');
            selector.push_str(query);
        }

        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nicy-metadata: 1\r\n\r\n",
            selector,
            self.host(),
        );
        Bytes::from(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Connecting,
    Sending,
    Reading,
}

/// What one readiness event did to the handshake.
#[derive(Debug)]
pub enum RelayProgress {
    Pending,
    /// The request is flushed; re-register for read readiness.
    AwaitingResponse,
    /// Got a 2xx head; the socket is ready to become a source.
    Upgraded(ResponseHead),
}

/// The in-flight HTTP relay handshake.
#[derive(Debug)]
pub struct HttpRelay {
    pub spec: RelaySpec,
    pub sock: Option<TcpStream>,
    pub token: Token,
    /// The on-demand source waiting for this reconnect, if any.
    pub od_source: Option<crate::sources::SourceId>,
    state: RelayState,
    out: OutputBuffer,
    response_buf: Vec<u8>,
}

impl HttpRelay {
    /// Starts a non-blocking connect. `EINPROGRESS` is the expected
    /// outcome; the poller reports writability once the connect settles.
    pub fn connect(
        spec: RelaySpec,
        token: Token,
        od_source: Option<crate::sources::SourceId>,
    ) -> Result<HttpRelay, RelayError> {
        let addr = spec.resolve()?;
        let sock = TcpStream::connect(addr)?;
        Ok(HttpRelay {
            spec,
            sock: Some(sock),
            token,
            od_source,
            state: RelayState::Connecting,
            out: OutputBuffer::new(RESPONSE_MAX_SIZE),
            response_buf: Vec::new(),
        })
    }

    /// True once the handshake is waiting on upstream data rather than
    /// socket writability.
    pub fn reading(&self) -> bool {
        self.state == RelayState::Reading
    }

    pub fn handle_writable(&mut self) -> Result<RelayProgress, RelayError> {
        let sock = self.sock.as_mut().expect("relay socket present");

        if self.state == RelayState::Connecting {
            // Writability after connect(): check SO_ERROR before trusting
            // the socket.
            if let Some(err) = sock.take_error()? {
                return Err(err.into());
            }
            self.out.add(self.spec.build_request());
            self.state = RelayState::Sending;
        }

        if self.state == RelayState::Sending {
            self.out.flush(sock)?;
            if self.out.is_empty() {
                self.state = RelayState::Reading;
                return Ok(RelayProgress::AwaitingResponse);
            }
        }
        Ok(RelayProgress::Pending)
    }

    pub fn handle_readable(&mut self) -> Result<RelayProgress, RelayError> {
        let sock = self.sock.as_mut().expect("relay socket present");
        let mut chunk = [0u8; 1024];
        loop {
            let budget = RESPONSE_MAX_SIZE - self.response_buf.len();
            if budget == 0 {
                return Err(RelayError::Oversized);
            }
            let len = budget.min(chunk.len());
            let n = match sock.read(&mut chunk[..len]) {
                Ok(0) => return Err(RelayError::Eof),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(RelayProgress::Pending)
                }
                Err(err) => return Err(err.into()),
            };
            self.response_buf.extend_from_slice(&chunk[..n]);

            if let Some(head) = ResponseHead::parse(&self.response_buf)? {
                if !(200..300).contains(&head.status) {
                    return Err(RelayError::BadStatus(head.status, head.reason.clone()));
                }
                return Ok(RelayProgress::Upgraded(head));
            }
        }
    }

    /// Transfers the socket out for the source upgrade.
    pub fn take_socket(&mut self) -> TcpStream {
        self.sock.take().expect("relay socket present")
    }
}

/// A UDP (possibly multicast) input waiting to prove itself live.
#[derive(Debug)]
pub struct UdpRelay {
    pub spec: RelaySpec,
    pub sock: Option<UdpSocket>,
    pub token: Token,
    initial: Vec<u8>,
}

impl UdpRelay {
    pub fn bind(spec: RelaySpec, token: Token) -> Result<UdpRelay, RelayError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let host: Ipv4Addr = spec.host().parse().map_err(|_| RelayError::BadUrl {
            url: spec.url.as_str().to_owned(),
            reason: "UDP relays need a literal IPv4 address".to_owned(),
        })?;
        let port = spec
            .url
            .port()
            .ok_or_else(|| RelayError::BadUrl {
                url: spec.url.as_str().to_owned(),
                reason: "missing port".to_owned(),
            })?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr = (host, port).into();
        socket.bind(&bind_addr.into())?;
        if spec.url.scheme() == "multicast" {
            socket.join_multicast_v4(&host, &Ipv4Addr::UNSPECIFIED)?;
        }
        socket.set_nonblocking(true)?;

        let sock = UdpSocket::from_std(socket.into());
        Ok(UdpRelay {
            spec,
            sock: Some(sock),
            token,
            initial: Vec::new(),
        })
    }

    /// Accumulates datagrams; returns the buffered bytes once at least
    /// [`MIN_START_BUFFER`] arrived, meaning the group is worth a source.
    pub fn handle_readable(&mut self) -> Result<Option<Bytes>, RelayError> {
        let sock = self.sock.as_mut().expect("relay socket present");
        let mut chunk = vec![0u8; MIN_START_BUFFER];
        loop {
            match sock.recv(&mut chunk) {
                Ok(n) => self.initial.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            }
            if self.initial.len() >= MIN_START_BUFFER {
                return Ok(Some(Bytes::from(std::mem::take(&mut self.initial))));
            }
        }
    }

    pub fn take_socket(&mut self) -> UdpSocket {
        self.sock.take().expect("relay socket present")
    }
}
