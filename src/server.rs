//! The server core: accept loop, request routing, the source/client
//! registry, publish fan-out, relay lifecycle, and shutdown.
//!
//! Ownership follows the arena-and-index pattern: sources live in an arena
//! keyed by [`SourceId`], clients are keyed by their poll token, and one
//! owner map routes readiness events. A handler is taken out of its map
//! while it is driven, so fan-out and registry updates never fight the
//! borrow of the handler being run. No handler error ever stops the loop;
//! the failing handler is closed and everything else continues.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use rand::seq::IndexedRandom;
use thiserror::Error;

use crate::auth::{self, AuthDecision, Authorize};
use crate::buffer::BufferError;
use crate::clients::{Client, Responder, ICY_META_INTERVAL};
use crate::config::{Config, ConfigError};
use crate::format::FormatError;
use crate::http::{
    collapse_slashes, HttpError, Method, Request, Response, ResponseHead, MAX_HEAD_SIZE,
};
use crate::reactor::{Reactor, Ready};
use crate::relay::{
    HttpRelay, RelayProgress, RelaySpec, UdpRelay, ON_DEMAND_TIMEOUT, RESTART_DELAY,
};
use crate::sources::{
    FormatKind, IcyProperties, OnDemandState, Source, SourceId, SourceKind, SourceSocket,
};
use crate::stats::{RequestInfo, StatsSink};
use crate::status::{ClientStatus, SourceStatus, StatusRenderer, StatusSnapshot};
use crate::timer::{TimerAction, TimerKey, Timers};

const LISTENER: Token = Token(0);
const TIMER: Token = Token(1);
const FIRST_TOKEN: usize = 2;

/// Poll timeout for one loop tick.
pub const LOOP_TIMEOUT: Duration = Duration::from_millis(500);
/// Maximum I/O inactivity for any handler.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Why a handler is being closed; only drives logging.
#[derive(Error, Debug)]
enum HandlerError {
    #[error("unexpected end of stream")]
    Eof,
    #[error("oversized HTTP request")]
    Oversized,
    #[error("{0}")]
    Http(#[from] HttpError),
    #[error("{0}")]
    Format(#[from] FormatError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn is_peer_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// A connection whose HTTP request is still being read.
#[derive(Debug)]
struct RequestReader {
    sock: TcpStream,
    token: Token,
    address: SocketAddr,
    buf: Vec<u8>,
}

/// Handlers that are neither sources nor stream clients yet.
enum Pending {
    Request(RequestReader),
    Response(Responder),
    Relay(HttpRelay),
    UdpRelay(UdpRelay),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Source(SourceId),
    Client,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    /// Listener closed; draining remaining clients.
    Graceful,
    Stopped,
}

pub struct Server {
    bind_addr: SocketAddr,
    listener: Option<TcpListener>,
    reactor: Reactor,
    timers: Timers,

    config: Config,
    max_queue_size: usize,
    clients_limit: Option<usize>,
    content_types: HashMap<String, FormatKind>,

    next_token: usize,
    next_source_id: u64,
    next_restart_id: u64,

    owners: HashMap<Token, Owner>,
    sources: HashMap<SourceId, Source>,
    clients: HashMap<Token, Client>,
    pending: HashMap<Token, Pending>,
    /// mount path → sources registered under it.
    mounts: HashMap<String, Vec<SourceId>>,
    /// mount path → clients orphaned in a keepalive grace window.
    keepalived: HashMap<String, Vec<Token>>,
    relay_restarts: HashMap<u64, RelaySpec>,

    auth: Vec<Box<dyn Authorize>>,
    status: HashMap<String, Box<dyn StatusRenderer>>,
    stats: Vec<Box<dyn StatsSink>>,

    state: RunState,
    scratch: Vec<u8>,
}

impl Server {
    pub fn new(bind_addr: SocketAddr, config: Config) -> Result<Server, ServerError> {
        let reactor = Reactor::new()?;
        let mut timers = Timers::new()?;

        let mut listener = TcpListener::bind(bind_addr)?;
        reactor.register(&mut listener, LISTENER, Interest::READABLE)?;
        reactor.register(timers.fd_mut(), TIMER, Interest::READABLE)?;

        let mut server = Server {
            bind_addr,
            listener: Some(listener),
            reactor,
            timers,
            config: Config::default(),
            max_queue_size: config.max_queue_size(),
            clients_limit: None,
            content_types: HashMap::new(),
            next_token: FIRST_TOKEN,
            next_source_id: 0,
            next_restart_id: 0,
            owners: HashMap::new(),
            sources: HashMap::new(),
            clients: HashMap::new(),
            pending: HashMap::new(),
            mounts: HashMap::new(),
            keepalived: HashMap::new(),
            relay_restarts: HashMap::new(),
            auth: Vec::new(),
            status: HashMap::new(),
            stats: Vec::new(),
            state: RunState::Running,
            scratch: Vec::new(),
        };

        server.build_handlers(&config)?;
        server.apply_limits(&config)?;
        server.configure_relays(&config)?;
        server.config = config;

        log::info!("listening on {bind_addr}");
        Ok(server)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Runs until stopped (or, after a graceful stop, drained).
    pub fn run(&mut self) -> Result<(), ServerError> {
        while !self.finished() {
            self.run_once(LOOP_TIMEOUT)?;
        }
        log::info!("shutting down");
        Ok(())
    }

    /// One loop tick: poll, dispatch, done. Signals are checked by the
    /// caller between ticks.
    pub fn run_once(&mut self, timeout: Duration) -> Result<(), ServerError> {
        let events = self.reactor.wait(Some(timeout))?;
        for (token, ready) in events {
            self.dispatch(token, ready);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        log::info!("stopping main loop");
        self.state = RunState::Stopped;
    }

    /// Stops accepting; the loop keeps serving until no client remains.
    pub fn graceful_stop(&mut self) {
        if self.state != RunState::Running {
            return;
        }
        log::info!("graceful stop: closing listener, draining clients");
        if let Some(mut listener) = self.listener.take() {
            let _ = self.reactor.deregister(&mut listener, LISTENER);
        }
        self.state = RunState::Graceful;
    }

    pub fn finished(&self) -> bool {
        match self.state {
            RunState::Stopped => true,
            RunState::Graceful => self.clients.is_empty(),
            RunState::Running => false,
        }
    }

    fn dispatch(&mut self, token: Token, ready: Ready) {
        match token {
            LISTENER => self.accept_ready(),
            TIMER => {
                let actions = match self.timers.fire(self.reactor.now()) {
                    Ok(actions) => actions,
                    Err(err) => {
                        log::error!("timer error: {err}");
                        return;
                    }
                };
                for action in actions {
                    self.apply_timer_action(action);
                }
            }
            token => match self.owners.get(&token).copied() {
                Some(Owner::Source(id)) => self.source_event(id, token, ready),
                Some(Owner::Client) => self.client_event(token, ready),
                Some(Owner::Pending) => self.pending_event(token, ready),
                None => {
                    // The poller knows a token the registry does not;
                    // nothing to deregister without its socket, so just
                    // drop the event.
                    log::debug!("event {ready:?} for unknown token {token:?}");
                }
            },
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn alloc_source_id(&mut self) -> SourceId {
        let id = SourceId(self.next_source_id);
        self.next_source_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // Accept path

    fn accept_ready(&mut self) {
        loop {
            let listener = match self.listener.as_ref() {
                Some(listener) => listener,
                None => return,
            };
            match listener.accept() {
                Ok((mut sock, address)) => {
                    let token = self.alloc_token();
                    if let Err(err) = self.reactor.register(&mut sock, token, Interest::READABLE) {
                        log::error!("cannot register accepted connection: {err}");
                        continue;
                    }
                    let _ = self
                        .timers
                        .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);
                    self.owners.insert(token, Owner::Pending);
                    self.pending.insert(
                        token,
                        Pending::Request(RequestReader {
                            sock,
                            token,
                            address,
                            buf: Vec::new(),
                        }),
                    );
                    log::info!("new connection from {address}");
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                // EMFILE / ENFILE: the only way to clear the kernel
                // backlog is to close and re-open the listening socket.
                Err(err) if matches!(err.raw_os_error(), Some(23) | Some(24)) => {
                    log::error!("cannot accept, too many open files; re-listening");
                    if let Some(mut listener) = self.listener.take() {
                        let _ = self.reactor.deregister(&mut listener, LISTENER);
                    }
                    match TcpListener::bind(self.bind_addr) {
                        Ok(mut listener) => {
                            if let Err(err) =
                                self.reactor.register(&mut listener, LISTENER, Interest::READABLE)
                            {
                                log::error!("cannot re-register listener: {err}");
                            }
                            self.listener = Some(listener);
                        }
                        Err(err) => log::error!("cannot re-listen on {}: {err}", self.bind_addr),
                    }
                    return;
                }
                Err(err) => {
                    log::error!("accept error: {err}");
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Pending handlers (request readers, responders, relays)

    fn pending_event(&mut self, token: Token, ready: Ready) {
        let handler = match self.pending.remove(&token) {
            Some(handler) => handler,
            None => return,
        };

        match handler {
            Pending::Request(reader) => self.request_event(reader, ready),
            Pending::Response(responder) => self.response_event(responder, ready),
            Pending::Relay(relay) => self.relay_event(relay, ready),
            Pending::UdpRelay(relay) => self.udp_relay_event(relay, ready),
        }
    }

    fn request_event(&mut self, mut reader: RequestReader, ready: Ready) {
        if ready.intersects(Ready::ERROR | Ready::HUP) {
            self.close_request_reader(reader, "connection closed by peer");
            return;
        }

        match self.read_request(&mut reader) {
            Ok(Some(request)) => self.route(reader, request),
            Ok(None) => {
                self.owners.insert(reader.token, Owner::Pending);
                self.pending.insert(reader.token, Pending::Request(reader));
            }
            Err(err) => {
                let reason = format!("{err}");
                self.close_request_reader(reader, &reason);
            }
        }
    }

    fn read_request(&mut self, reader: &mut RequestReader) -> Result<Option<Request>, HandlerError> {
        let mut chunk = [0u8; 1024];
        loop {
            let budget = MAX_HEAD_SIZE.saturating_sub(reader.buf.len());
            if budget == 0 {
                return Err(HandlerError::Oversized);
            }
            let len = budget.min(chunk.len());
            let n = match reader.sock.read(&mut chunk[..len]) {
                Ok(0) => return Err(HandlerError::Eof),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            reader.buf.extend_from_slice(&chunk[..n]);

            if let Some(request) = Request::parse(&reader.buf)? {
                return Ok(Some(request));
            }
        }
    }

    fn close_request_reader(&mut self, mut reader: RequestReader, reason: &str) {
        log::error!("closing connection from {}: {reason}", reader.address);
        self.owners.remove(&reader.token);
        self.timers.remove_io(reader.token);
        let _ = self.reactor.deregister(&mut reader.sock, reader.token);
    }

    fn response_event(&mut self, mut responder: Responder, ready: Ready) {
        if ready.intersects(Ready::ERROR | Ready::HUP) {
            self.close_responder(responder, Some("connection closed by peer"));
            return;
        }

        match responder.flush() {
            Ok(_) if responder.finished() => self.close_responder(responder, None),
            Ok(_) => {
                self.owners.insert(responder.token, Owner::Pending);
                self.pending
                    .insert(responder.token, Pending::Response(responder));
            }
            Err(BufferError::Io(err)) if is_peer_reset(&err) => {
                self.close_responder(responder, Some("connection closed by peer"));
            }
            Err(err) => {
                let reason = format!("{err}");
                self.close_responder(responder, Some(&reason));
            }
        }
    }

    fn close_responder(&mut self, mut responder: Responder, reason: Option<&str>) {
        if let Some(reason) = reason {
            log::error!("closing response to {}: {reason}", responder.address);
        }
        self.owners.remove(&responder.token);
        self.timers.remove_io(responder.token);
        let _ = self.reactor.deregister(&mut responder.sock, responder.token);
        self.report_request_out(
            &responder.info,
            &responder.address,
            responder.bytes_sent,
            responder.connect_time,
            responder.status,
        );
    }

    // ------------------------------------------------------------------
    // Request routing

    fn route(&mut self, reader: RequestReader, mut request: Request) {
        request.path = collapse_slashes(&request.path);
        log::info!(
            "{} {} {} HTTP/1.{}",
            reader.address,
            request.method,
            request.path,
            request.version
        );

        for sink in &mut self.stats {
            sink.request_in(&request, &reader.address);
        }

        // Authorization chain: first decision wins.
        let mut denied = None;
        let now = self.reactor.wall_now();
        for handler in &self.auth {
            match handler.authorize(&reader.address, &mut request, now) {
                AuthDecision::Grant => break,
                AuthDecision::Deny(response) => {
                    denied = Some(response);
                    break;
                }
                AuthDecision::Pass => continue,
            }
        }
        if let Some(response) = denied {
            self.respond(reader, &request, response);
            return;
        }

        if request.method.is_ingest() {
            self.create_ingest_source(reader, request);
            return;
        }

        match request.method {
            Method::Get if self.status.contains_key(&request.path) => {
                let response = {
                    let snapshot = self.snapshot();
                    let renderer = &self.status[&request.path];
                    renderer.render(&snapshot, &request)
                };
                self.respond(reader, &request, response);
            }
            Method::Head if self.mounts.contains_key(&request.path) => {
                let content_type = self.mounts[&request.path]
                    .first()
                    .and_then(|id| self.sources.get(id))
                    .map(|s| s.content_type.clone())
                    .unwrap_or_else(|| "application/octet-stream".to_owned());
                let response = Response::new(200, "OK").with_header("Content-Type", &content_type);
                self.respond(reader, &request, response);
            }
            Method::Get if self.mounts.get(&request.path).is_some_and(|ids| !ids.is_empty()) => {
                self.create_stream_client(reader, request);
            }
            Method::Get | Method::Head => {
                let response = Response::new(404, "Stream Not Found")
                    .with_header("Content-Type", "text/plain")
                    .with_body(&b"Stream Not Found\n"[..]);
                self.respond(reader, &request, response);
            }
            _ => {
                let response = Response::new(405, "Method Not Allowed");
                self.respond(reader, &request, response);
            }
        }
    }

    /// Queues a one-shot response on the connection and flips it to write
    /// readiness.
    fn respond(&mut self, reader: RequestReader, request: &Request, response: Response) {
        let mut responder = Responder::new(
            reader.sock,
            reader.token,
            reader.address,
            &response,
            RequestInfo::from_request(request),
            self.reactor.wall_now(),
            self.max_queue_size,
        );
        if let Err(err) = self
            .reactor
            .reregister(&mut responder.sock, responder.token, Interest::WRITABLE)
        {
            log::error!("cannot switch {} to writing: {err}", responder.address);
            self.close_responder(responder, None);
            return;
        }
        let _ = self
            .timers
            .reset_io(self.reactor.now(), responder.token, INACTIVITY_TIMEOUT);
        self.owners.insert(responder.token, Owner::Pending);
        self.pending
            .insert(responder.token, Pending::Response(responder));
    }

    fn format_for(&self, content_type: &str) -> FormatKind {
        self.content_types
            .get(content_type)
            .copied()
            .unwrap_or_else(|| FormatKind::from_content_type(content_type))
    }

    /// PUT/SOURCE/POST: this connection becomes a source.
    fn create_ingest_source(&mut self, reader: RequestReader, request: Request) {
        let content_type = request
            .header_str("Content-Type")
            .unwrap_or("application/octet-stream")
            .to_owned();
        let format = self.format_for(&content_type);
        if self.content_types.get(&content_type).is_none()
            && FormatKind::from_content_type(&content_type) == FormatKind::Raw
            && content_type != "application/octet-stream"
        {
            log::warn!("no registered source handler for {content_type}, using generic handler");
        }

        let mount = self
            .config
            .mounts
            .iter()
            .find(|m| m.path == request.path)
            .cloned();
        let burst_size = mount
            .as_ref()
            .and_then(|m| self.config.mount_burst_size(m).ok())
            .flatten();
        let keepalive = mount
            .as_ref()
            .map(|m| self.config.mount_keepalive(m))
            .unwrap_or(self.config.keepalive);

        let icy = IcyProperties::from_headers(|name| request.header_str(name));
        let kind = SourceKind::new(format, icy, burst_size);

        let id = self.alloc_source_id();
        let source = Source {
            id,
            path: request.path.clone(),
            content_type,
            address: reader.address.to_string(),
            token: Some(reader.token),
            sock: Some(SourceSocket::Tcp(reader.sock)),
            kind,
            subscribers: Default::default(),
            on_demand: OnDemandState::Disabled,
            keepalive,
            relay: None,
        };
        log::info!("new source for {}: {}", source.path, source.address);

        self.install_source(source, &request.body);
    }

    /// Registers a built source, re-attaches any keepalive orphans for its
    /// path, and feeds it the bytes that arrived with the handshake.
    fn install_source(&mut self, mut source: Source, initial: &[u8]) {
        let id = source.id;
        let token = source.token.expect("installing a connected source");
        let path = source.path.clone();

        self.owners.insert(token, Owner::Source(id));
        if let Some(SourceSocket::Tcp(sock)) = source.sock.as_mut() {
            if let Err(err) = self.reactor.reregister(sock, token, Interest::READABLE) {
                log::error!("cannot register source socket: {err}");
            }
        }
        let _ = self
            .timers
            .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);

        self.mounts.entry(path.clone()).or_default().push(id);
        self.sources.insert(id, source);
        self.attach_keepalived(&path, id);

        if !initial.is_empty() {
            let mut source = self.sources.remove(&id).expect("source just inserted");
            let mut out = Vec::new();
            let result = source.kind.handle_packet(initial, &mut out);
            self.publish(&mut source, out);
            match result {
                Ok(()) => {
                    self.sources.insert(id, source);
                }
                Err(err) => {
                    log::error!("closing {source}: {err}");
                    self.drop_source(source, true);
                }
            }
        }
    }

    /// Moves any keepalive orphans for `path` onto the new source.
    fn attach_keepalived(&mut self, path: &str, id: SourceId) {
        let tokens = match self.keepalived.remove(path) {
            Some(tokens) => tokens,
            None => return,
        };
        self.timers.remove(&TimerKey::Keepalive(path.to_owned()));

        let source = self.sources.get_mut(&id).expect("attach target exists");
        let mut count = 0;
        for token in tokens {
            if let Some(client) = self.clients.get_mut(&token) {
                client.source = Some(id);
                source.subscribers.insert(token);
                count += 1;
            }
        }
        if count > 0 {
            log::info!("re-attached {count} kept-alive clients to {path}");
        }
    }

    /// GET on a live mount: this connection becomes a stream client.
    fn create_stream_client(&mut self, mut reader: RequestReader, request: Request) {
        if let Some(limit) = self.clients_limit {
            if self.clients.len() >= limit {
                log::warn!("client limit ({limit}) reached, rejecting {}", reader.address);
                let response = Response::new(503, "Cannot handle response. Too many clients.")
                    .with_header("Content-Type", "text/plain")
                    .with_body(&b"Cannot handle response. Too many clients.\n"[..]);
                self.respond(reader, &request, response);
                return;
            }
        }

        let id = {
            let ids = &self.mounts[&request.path];
            *ids.choose(&mut rand::rng()).expect("mount has sources")
        };

        // Build the response headers from the chosen source.
        let (response, with_metadata, replay, metadata) = {
            let source = self.sources.get(&id).expect("chosen source exists");
            let mut response = Response::new(200, "OK")
                .streaming()
                .with_header("Content-Type", &source.content_type);

            let mut with_metadata = false;
            if let Some(shoutcast) = source.kind.as_shoutcast() {
                for (name, value) in shoutcast.icy().response_headers() {
                    response = response.with_header(name, value);
                }
                if request.header("Icy-Metadata") == Some(&b"1"[..])
                    && shoutcast.icy().metaint.is_some()
                {
                    with_metadata = true;
                    response = response.with_header("icy-metaint", &ICY_META_INTERVAL.to_string());
                }
            }

            let mut replay = Vec::new();
            source.kind.replay(&mut replay);
            let metadata = source.kind.as_shoutcast().map(|s| s.metadata().clone());
            (response, with_metadata, replay, metadata)
        };

        let token = reader.token;
        if let Err(err) = self
            .reactor
            .reregister(&mut reader.sock, token, Interest::WRITABLE)
        {
            log::error!("cannot register client socket: {err}");
            self.owners.remove(&token);
            self.timers.remove_io(token);
            return;
        }

        let mut client = Client::new(
            reader.sock,
            token,
            reader.address,
            id,
            &response,
            RequestInfo::from_request(&request),
            self.reactor.wall_now(),
            self.max_queue_size,
            with_metadata,
        );
        client.registered = true;
        client.timeout_armed = true;
        let _ = self.timers.reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);

        // Initial setup units and burst replay, strictly before any live
        // packet.
        for packet in replay {
            client.add_packet(packet, metadata.as_ref());
        }

        log::info!("new client for {}: {}", request.path, reader.address);
        self.clients.insert(token, client);
        self.owners.insert(token, Owner::Client);

        // On-demand: a client arrival revives a stopped or closing relay
        // source.
        let needs_activation = {
            let source = self.sources.get_mut(&id).expect("chosen source exists");
            source.subscribers.insert(token);
            if source.on_demand == OnDemandState::Closing {
                source.on_demand = OnDemandState::Running;
                self.timers.remove(&TimerKey::OnDemand(id));
            }
            source.on_demand == OnDemandState::Stopped
        };
        if needs_activation {
            self.on_demand_activate(id);
        }
    }

    // ------------------------------------------------------------------
    // Stream clients

    fn client_event(&mut self, token: Token, ready: Ready) {
        if ready.intersects(Ready::ERROR | Ready::HUP) {
            self.close_client(token, "connection closed by peer");
            return;
        }
        if !ready.contains(Ready::WRITABLE) {
            return;
        }

        let client = match self.clients.get_mut(&token) {
            Some(client) => client,
            None => return,
        };

        match client.flush() {
            Ok(sent) => {
                if client.buffer.is_empty() {
                    // Drained: drop write interest and the inactivity
                    // timer until the next publish.
                    let _ = self.reactor.deregister(&mut client.sock, token);
                    client.registered = false;
                    client.timeout_armed = false;
                    self.timers.remove_io(token);
                } else if sent > 0 {
                    let _ = self
                        .timers
                        .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);
                }
            }
            Err(BufferError::QueueSizeExceeded { size, max }) => {
                log::info!("client queue size exceeded ({size} > {max})");
                self.close_client(token, "output queue overflow");
            }
            Err(BufferError::Io(err)) if is_peer_reset(&err) => {
                self.close_client(token, "connection closed by peer");
            }
            Err(BufferError::Io(err)) => {
                let reason = format!("{err}");
                self.close_client(token, &reason);
            }
        }
    }

    fn close_client(&mut self, token: Token, reason: &str) {
        let mut client = match self.clients.remove(&token) {
            Some(client) => client,
            None => return,
        };
        log::info!(
            "dropping client for {}, {}: {reason}",
            client.info.path,
            client.address
        );
        self.owners.remove(&token);
        self.timers.remove_io(token);
        if client.registered {
            let _ = self.reactor.deregister(&mut client.sock, token);
        }

        match client.source {
            Some(id) => {
                if let Some(source) = self.sources.get_mut(&id) {
                    source.subscribers.remove(&token);
                }
            }
            None => {
                for orphans in self.keepalived.values_mut() {
                    orphans.retain(|t| *t != token);
                }
            }
        }

        self.report_request_out(
            &client.info,
            &client.address,
            client.bytes_sent,
            client.connect_time,
            client.status,
        );
    }

    // ------------------------------------------------------------------
    // Sources

    fn source_event(&mut self, id: SourceId, token: Token, ready: Ready) {
        if !ready.contains(Ready::READABLE) {
            if ready.intersects(Ready::ERROR | Ready::HUP) {
                self.remove_source(id, "connection closed by peer");
            }
            return;
        }

        let mut source = match self.sources.remove(&id) {
            Some(source) => source,
            None => return,
        };
        debug_assert_eq!(source.token, Some(token));

        match self.drive_source(&mut source) {
            Ok(true) => {
                self.sources.insert(id, source);
            }
            Ok(false) => {
                log::warn!("end of stream for {source}");
                self.drop_source(source, true);
            }
            Err(err) => {
                log::error!("closing {source}: {err}");
                self.drop_source(source, true);
            }
        }
    }

    /// Reads until EAGAIN, feeding the parser and fanning out everything
    /// it yields. Returns false on end-of-stream.
    fn drive_source(&mut self, source: &mut Source) -> Result<bool, HandlerError> {
        let recv_size = source.kind.recv_buffer_size();
        if self.scratch.len() < recv_size {
            self.scratch.resize(recv_size, 0);
        }
        let token = source.token.expect("driving a connected source");

        loop {
            let sock = source.sock.as_mut().expect("driving a connected source");
            let n = match sock.recv(&mut self.scratch[..recv_size]) {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(err) if is_peer_reset(&err) => return Ok(false),
                Err(err) => return Err(err.into()),
            };

            let _ = self
                .timers
                .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);

            let mut out = Vec::new();
            source.kind.handle_packet(&self.scratch[..n], &mut out)?;
            self.publish(source, out);

            if n < recv_size {
                // A short read almost certainly drained the socket; the
                // poller will call back if not.
                return Ok(true);
            }
        }
    }

    /// Fans publishable units out to every subscriber, in order.
    fn publish(&mut self, source: &mut Source, packets: Vec<Bytes>) {
        if packets.is_empty() {
            return;
        }

        if source.subscribers.is_empty() {
            if source.on_demand == OnDemandState::Running {
                source.on_demand = OnDemandState::Closing;
                let _ = self.timers.reset(
                    self.reactor.now(),
                    TimerKey::OnDemand(source.id),
                    self.reactor.now() + ON_DEMAND_TIMEOUT,
                    TimerAction::OnDemandStop(source.id),
                );
                log::info!("{source} idle with no clients, closing in {ON_DEMAND_TIMEOUT:?}");
            }
            return;
        }

        let metadata = source.kind.as_shoutcast().map(|s| s.metadata().clone());
        for packet in &packets {
            for token in &source.subscribers {
                if let Some(client) = self.clients.get_mut(token) {
                    client.add_packet(packet.clone(), metadata.as_ref());
                }
            }
        }

        for token in &source.subscribers {
            let Some(client) = self.clients.get_mut(token) else {
                continue;
            };
            if !client.registered {
                if self
                    .reactor
                    .register(&mut client.sock, *token, Interest::WRITABLE)
                    .is_ok()
                {
                    client.registered = true;
                }
            }
            if !client.timeout_armed {
                client.timeout_armed = true;
                let _ = self
                    .timers
                    .reset_io(self.reactor.now(), *token, INACTIVITY_TIMEOUT);
            }
            self.reactor.inject(*token, Ready::WRITABLE);
        }
    }

    fn remove_source(&mut self, id: SourceId, reason: &str) {
        if let Some(source) = self.sources.remove(&id) {
            log::warn!("removing {source}: {reason}");
            self.drop_source(source, true);
        }
    }

    /// Tears a source down: unregisters its socket, hands its clients to a
    /// sibling source, the keepalive list, or closes them, and queues a
    /// relay restart when allowed.
    fn drop_source(&mut self, mut source: Source, restart_allowed: bool) {
        let id = source.id;
        let path = source.path.clone();

        if let Some(token) = source.token.take() {
            self.owners.remove(&token);
            self.timers.remove_io(token);
            if let Some(sock) = source.sock.as_mut() {
                let _ = match sock {
                    SourceSocket::Tcp(sock) => self.reactor.deregister(sock, token),
                    SourceSocket::Udp(sock) => self.reactor.deregister(sock, token),
                };
            }
        }
        self.timers.remove(&TimerKey::OnDemand(id));

        if let Some(ids) = self.mounts.get_mut(&path) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.mounts.remove(&path);
            }
        }

        let subscribers: Vec<Token> = source.subscribers.drain().collect();
        let siblings: Vec<SourceId> = self.mounts.get(&path).cloned().unwrap_or_default();

        if !siblings.is_empty() {
            // Distribute the clients evenly among the remaining sources
            // for this path.
            for (i, token) in subscribers.into_iter().enumerate() {
                let target = siblings[i % siblings.len()];
                if let Some(client) = self.clients.get_mut(&token) {
                    client.source = Some(target);
                    if let Some(sibling) = self.sources.get_mut(&target) {
                        sibling.subscribers.insert(token);
                    }
                }
            }
        } else if let Some(keepalive) = source.keepalive.filter(|_| !subscribers.is_empty()) {
            log::info!(
                "keeping {} clients of {path} for {keepalive}s pending a reconnect",
                subscribers.len()
            );
            for token in &subscribers {
                if let Some(client) = self.clients.get_mut(token) {
                    client.source = None;
                }
            }
            self.keepalived.entry(path.clone()).or_default().extend(subscribers);
            let _ = self.timers.reset(
                self.reactor.now(),
                TimerKey::Keepalive(path.clone()),
                self.reactor.now() + Duration::from_secs(keepalive),
                TimerAction::KeepaliveExpired(path.clone()),
            );
        } else {
            for token in subscribers {
                self.close_client(token, "source removed");
            }
        }

        if restart_allowed {
            if let Some(spec) = source.relay.take() {
                self.schedule_relay_restart(spec);
            }
        }
    }

    // ------------------------------------------------------------------
    // On-demand

    fn on_demand_activate(&mut self, id: SourceId) {
        let (spec, path) = match self.sources.get_mut(&id) {
            Some(source) => {
                if source.on_demand != OnDemandState::Stopped {
                    return;
                }
                source.on_demand = OnDemandState::Connecting;
                match source.relay.clone() {
                    Some(spec) => (spec, source.path.clone()),
                    None => return,
                }
            }
            None => return,
        };

        log::info!("activating on-demand source for {path}");
        let token = self.alloc_token();
        match HttpRelay::connect(spec.clone(), token, Some(id)) {
            Ok(relay) => self.install_relay(relay),
            Err(err) => {
                log::error!("on-demand connect for {path} failed: {err}");
                if let Some(source) = self.sources.get_mut(&id) {
                    source.on_demand = OnDemandState::Stopped;
                }
            }
        }
    }

    /// The on-demand idle grace expired: disconnect but keep the source
    /// registered for the next client.
    fn on_demand_deactivate(&mut self, id: SourceId) {
        let source = match self.sources.get_mut(&id) {
            Some(source) => source,
            None => return,
        };
        if source.on_demand != OnDemandState::Closing {
            return;
        }
        log::info!("deactivating on-demand source for {}", source.path);
        source.on_demand = OnDemandState::Stopped;
        source.kind.reset();
        if let Some(token) = source.token.take() {
            self.owners.remove(&token);
            self.timers.remove_io(token);
            if let Some(sock) = source.sock.as_mut() {
                let _ = match sock {
                    SourceSocket::Tcp(sock) => self.reactor.deregister(sock, token),
                    SourceSocket::Udp(sock) => self.reactor.deregister(sock, token),
                };
            }
        }
        source.sock = None;
    }

    // ------------------------------------------------------------------
    // Relays

    fn add_relay(&mut self, spec: RelaySpec) {
        let token = self.alloc_token();
        if spec.is_udp() {
            match UdpRelay::bind(spec.clone(), token) {
                Ok(mut relay) => {
                    let sock = relay.sock.as_mut().expect("fresh relay socket");
                    if let Err(err) = self.reactor.register(sock, token, Interest::READABLE) {
                        log::error!("cannot register UDP relay: {err}");
                        self.schedule_relay_restart(spec);
                        return;
                    }
                    let _ = self
                        .timers
                        .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);
                    self.owners.insert(token, Owner::Pending);
                    self.pending.insert(token, Pending::UdpRelay(relay));
                    log::info!("relaying {} into {}", spec.url, spec.path);
                }
                Err(err) => {
                    log::error!("cannot bind relay {}: {err}", spec.url);
                    self.schedule_relay_restart(spec);
                }
            }
        } else {
            match HttpRelay::connect(spec.clone(), token, None) {
                Ok(relay) => {
                    self.install_relay(relay);
                    log::info!("relaying {} into {}", spec.url, spec.path);
                }
                Err(err) => {
                    log::error!("cannot connect relay {}: {err}", spec.url);
                    self.schedule_relay_restart(spec);
                }
            }
        }
    }

    fn install_relay(&mut self, mut relay: HttpRelay) {
        let token = relay.token;
        let sock = relay.sock.as_mut().expect("fresh relay socket");
        if let Err(err) = self.reactor.register(sock, token, Interest::WRITABLE) {
            log::error!("cannot register relay: {err}");
            self.schedule_relay_restart(relay.spec.clone());
            return;
        }
        let _ = self
            .timers
            .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);
        self.owners.insert(token, Owner::Pending);
        self.pending.insert(token, Pending::Relay(relay));
    }

    fn relay_event(&mut self, mut relay: HttpRelay, ready: Ready) {
        if ready.intersects(Ready::ERROR | Ready::HUP) && !ready.contains(Ready::READABLE) {
            self.fail_relay(relay, "connection closed by upstream");
            return;
        }

        let progress = if relay.reading() {
            relay.handle_readable()
        } else {
            relay.handle_writable()
        };

        match progress {
            Ok(RelayProgress::Pending) => {
                self.owners.insert(relay.token, Owner::Pending);
                self.pending.insert(relay.token, Pending::Relay(relay));
            }
            Ok(RelayProgress::AwaitingResponse) => {
                let token = relay.token;
                let sock = relay.sock.as_mut().expect("relay socket present");
                if let Err(err) = self.reactor.reregister(sock, token, Interest::READABLE) {
                    log::error!("cannot switch relay to reading: {err}");
                    self.fail_relay(relay, "registration failure");
                    return;
                }
                self.owners.insert(token, Owner::Pending);
                self.pending.insert(token, Pending::Relay(relay));
            }
            Ok(RelayProgress::Upgraded(head)) => self.upgrade_relay(relay, head),
            Err(err) => {
                let reason = format!("{err}");
                self.fail_relay(relay, &reason);
            }
        }
    }

    fn fail_relay(&mut self, mut relay: HttpRelay, reason: &str) {
        log::error!(
            "relay {} for {} failed: {reason}",
            relay.spec.url,
            relay.spec.path
        );
        self.owners.remove(&relay.token);
        self.timers.remove_io(relay.token);
        if let Some(sock) = relay.sock.as_mut() {
            let _ = self.reactor.deregister(sock, relay.token);
        }

        // An on-demand reconnect that failed takes its stopped source
        // down with it; the restarted relay will build a fresh one.
        if let Some(id) = relay.od_source {
            if let Some(source) = self.sources.remove(&id) {
                self.drop_source(source, false);
            }
        }
        self.schedule_relay_restart(relay.spec);
    }

    fn schedule_relay_restart(&mut self, spec: RelaySpec) {
        let restart_id = self.next_restart_id;
        self.next_restart_id += 1;
        self.relay_restarts.insert(restart_id, spec);
        let _ = self.timers.reset(
            self.reactor.now(),
            TimerKey::RelayRestart(restart_id),
            self.reactor.now() + RESTART_DELAY,
            TimerAction::RelayRestart(restart_id),
        );
    }

    /// 2xx from upstream: the relay socket becomes a source fd.
    fn upgrade_relay(&mut self, mut relay: HttpRelay, head: ResponseHead) {
        let token = relay.token;
        let spec = relay.spec.clone();
        let sock = relay.take_socket();
        self.owners.remove(&token);

        if let Some(id) = relay.od_source {
            // Hand the socket back to the waiting on-demand source.
            let Some(source) = self.sources.get_mut(&id) else {
                return;
            };
            source.sock = Some(SourceSocket::Tcp(sock));
            source.token = Some(token);
            source.on_demand = OnDemandState::Running;
            if let Some(shoutcast) = source.kind.as_shoutcast_mut() {
                shoutcast.set_icy(IcyProperties::from_headers(|name| head.header_str(name)));
            }
            log::info!("on-demand source for {} reconnected", source.path);

            self.owners.insert(token, Owner::Source(id));
            if let Some(SourceSocket::Tcp(sock)) = source.sock.as_mut() {
                let _ = self.reactor.reregister(sock, token, Interest::READABLE);
            }
            let _ = self
                .timers
                .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);

            if !head.body.is_empty() {
                let mut source = self.sources.remove(&id).expect("source present");
                let mut out = Vec::new();
                match source.kind.handle_packet(&head.body, &mut out) {
                    Ok(()) => {
                        self.publish(&mut source, out);
                        self.sources.insert(id, source);
                    }
                    Err(err) => {
                        log::error!("closing {source}: {err}");
                        self.drop_source(source, true);
                    }
                }
            }
            return;
        }

        let content_type = head
            .header_str("Content-Type")
            .unwrap_or("application/octet-stream")
            .to_owned();
        let format = self.format_for(&content_type);
        let icy = IcyProperties::from_headers(|name| head.header_str(name));
        let kind = SourceKind::new(format, icy, spec.burst_size);

        let address = spec
            .resolve()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| spec.url.to_string());
        let id = self.alloc_source_id();
        let source = Source {
            id,
            path: spec.path.clone(),
            content_type,
            address,
            token: Some(token),
            sock: Some(SourceSocket::Tcp(sock)),
            kind,
            subscribers: Default::default(),
            on_demand: if spec.on_demand {
                OnDemandState::Running
            } else {
                OnDemandState::Disabled
            },
            keepalive: spec.keepalive,
            relay: Some(spec),
        };
        log::info!("relay for {} became {source}", source.path);
        self.install_source(source, &head.body);
    }

    fn udp_relay_event(&mut self, mut relay: UdpRelay, ready: Ready) {
        if !ready.contains(Ready::READABLE) {
            self.owners.insert(relay.token, Owner::Pending);
            self.pending.insert(relay.token, Pending::UdpRelay(relay));
            return;
        }

        let _ = self
            .timers
            .reset_io(self.reactor.now(), relay.token, INACTIVITY_TIMEOUT);

        match relay.handle_readable() {
            Ok(None) => {
                self.owners.insert(relay.token, Owner::Pending);
                self.pending.insert(relay.token, Pending::UdpRelay(relay));
            }
            Ok(Some(initial)) => {
                let token = relay.token;
                let spec = relay.spec.clone();
                let sock = relay.take_socket();
                self.owners.remove(&token);

                // A UDP input is assumed to carry MPEG-TS.
                let content_type = "video/MP2T".to_owned();
                let kind = SourceKind::new(
                    FormatKind::MpegTs,
                    IcyProperties::default(),
                    spec.burst_size,
                );
                let id = self.alloc_source_id();
                let source = Source {
                    id,
                    path: spec.path.clone(),
                    content_type,
                    address: spec.url.to_string(),
                    token: Some(token),
                    sock: Some(SourceSocket::Udp(sock)),
                    kind,
                    subscribers: Default::default(),
                    on_demand: OnDemandState::Disabled,
                    keepalive: spec.keepalive,
                    relay: Some(spec),
                };
                log::info!("UDP relay became {source}");

                let id = source.id;
                let path = source.path.clone();
                self.owners.insert(token, Owner::Source(id));
                // The socket keeps its read registration.
                let _ = self
                    .timers
                    .reset_io(self.reactor.now(), token, INACTIVITY_TIMEOUT);
                self.mounts.entry(path.clone()).or_default().push(id);
                self.sources.insert(id, source);
                self.attach_keepalived(&path, id);

                let mut source = self.sources.remove(&id).expect("source just inserted");
                let mut out = Vec::new();
                let result = source.kind.handle_packet(&initial, &mut out);
                self.publish(&mut source, out);
                match result {
                    Ok(()) => {
                        self.sources.insert(id, source);
                    }
                    Err(err) => {
                        log::error!("closing {source}: {err}");
                        self.drop_source(source, true);
                    }
                }
            }
            Err(err) => {
                log::error!("UDP relay {} failed: {err}", relay.spec.url);
                self.owners.remove(&relay.token);
                self.timers.remove_io(relay.token);
                if let Some(sock) = relay.sock.as_mut() {
                    let _ = self.reactor.deregister(sock, relay.token);
                }
                self.schedule_relay_restart(relay.spec);
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers

    fn apply_timer_action(&mut self, action: TimerAction) {
        match action {
            TimerAction::InactivityTimeout(token) => self.handle_inactivity(token),
            TimerAction::OnDemandStop(id) => self.on_demand_deactivate(id),
            TimerAction::KeepaliveExpired(path) => {
                if let Some(tokens) = self.keepalived.remove(&path) {
                    log::info!(
                        "keepalive for {path} expired, closing {} clients",
                        tokens.len()
                    );
                    for token in tokens {
                        self.close_client(token, "keepalive expired");
                    }
                }
            }
            TimerAction::RelayRestart(restart_id) => {
                if let Some(spec) = self.relay_restarts.remove(&restart_id) {
                    log::info!("restarting relay {} for {}", spec.url, spec.path);
                    self.add_relay(spec);
                }
            }
        }
    }

    fn handle_inactivity(&mut self, token: Token) {
        let timeout = INACTIVITY_TIMEOUT.as_secs();
        match self.owners.get(&token).copied() {
            Some(Owner::Client) => {
                log::error!("timeout: {timeout} seconds without I/O");
                self.close_client(token, "inactivity timeout");
            }
            Some(Owner::Source(id)) => {
                log::error!("timeout: {timeout} seconds without I/O");
                self.remove_source(id, "inactivity timeout");
            }
            Some(Owner::Pending) => {
                let handler = match self.pending.remove(&token) {
                    Some(handler) => handler,
                    None => return,
                };
                log::error!("timeout: {timeout} seconds without I/O");
                match handler {
                    Pending::Request(reader) => {
                        self.close_request_reader(reader, "inactivity timeout")
                    }
                    Pending::Response(responder) => {
                        self.close_responder(responder, Some("inactivity timeout"))
                    }
                    Pending::Relay(relay) => self.fail_relay(relay, "inactivity timeout"),
                    Pending::UdpRelay(mut relay) => {
                        self.owners.remove(&token);
                        if let Some(sock) = relay.sock.as_mut() {
                            let _ = self.reactor.deregister(sock, token);
                        }
                        self.schedule_relay_restart(relay.spec);
                    }
                }
            }
            None => {}
        }
    }

    // ------------------------------------------------------------------
    // Configuration

    fn build_handlers(&mut self, config: &Config) -> Result<(), ConfigError> {
        let mut auth_handlers = Vec::new();
        for handler in &config.auth {
            auth_handlers.push(auth::build(handler, config)?);
        }

        let mut status_handlers = HashMap::new();
        for (path, handler) in &config.status {
            status_handlers.insert(path.clone(), crate::status::build(handler)?);
        }

        let mut stats_handlers = Vec::new();
        for handler in &config.statistics {
            stats_handlers.push(crate::stats::build(handler)?);
        }

        self.auth = auth_handlers;
        self.status = status_handlers;
        self.stats = stats_handlers;
        Ok(())
    }

    fn apply_limits(&mut self, config: &Config) -> Result<(), ConfigError> {
        self.clients_limit = config.clients_limit;
        if let Some(limit) = self.clients_limit {
            log::info!("client limit set to {limit}");
        }
        self.max_queue_size = config.max_queue_size();

        let mut content_types = HashMap::new();
        for (content_type, name) in &config.content_types {
            let format =
                FormatKind::from_name(name).ok_or_else(|| ConfigError::UnknownHandler {
                    kind: "format",
                    name: name.clone(),
                })?;
            content_types.insert(content_type.clone(), format);
        }
        self.content_types = content_types;
        Ok(())
    }

    /// Relay specs the configuration asks for, expanded per resolved
    /// address when `net_resolve_all` is set.
    fn desired_relays(&self, config: &Config) -> Result<Vec<RelaySpec>, ConfigError> {
        use std::net::ToSocketAddrs;

        let mut specs = Vec::new();
        for mount in &config.mounts {
            let burst_size = config.mount_burst_size(mount)?;
            let on_demand = config.mount_on_demand(mount);
            let keepalive = config.mount_keepalive(mount);

            for url in &mount.source_urls {
                let base = match RelaySpec::new(url, &mount.path, None, burst_size, on_demand, keepalive)
                {
                    Ok(spec) => spec,
                    Err(err) => {
                        log::error!("skipping relay {url}: {err}");
                        continue;
                    }
                };
                if base.is_udp() {
                    specs.push(RelaySpec {
                        on_demand: false,
                        keepalive: None,
                        ..base
                    });
                } else if config.mount_net_resolve_all(mount) {
                    let host = base.url.host_str().unwrap_or_default().to_owned();
                    let port = base.url.port_or_known_default().unwrap_or(80);
                    match (host.as_str(), port).to_socket_addrs() {
                        Ok(addrs) => {
                            for addr in addrs {
                                specs.push(RelaySpec {
                                    addr: Some(addr),
                                    ..base.clone()
                                });
                            }
                        }
                        Err(err) => log::error!("cannot resolve {host}: {err}"),
                    }
                } else {
                    specs.push(base);
                }
            }
        }
        Ok(specs)
    }

    /// Identities of every relay currently alive in some form.
    fn existing_relay_identities(&self) -> Vec<(String, String, Option<SocketAddr>)> {
        let mut identities = Vec::new();
        for source in self.sources.values() {
            if let Some(spec) = &source.relay {
                identities.push(spec.identity());
            }
        }
        for handler in self.pending.values() {
            match handler {
                Pending::Relay(relay) => identities.push(relay.spec.identity()),
                Pending::UdpRelay(relay) => identities.push(relay.spec.identity()),
                _ => {}
            }
        }
        for spec in self.relay_restarts.values() {
            identities.push(spec.identity());
        }
        identities
    }

    fn configure_relays(&mut self, config: &Config) -> Result<(), ConfigError> {
        let existing = self.existing_relay_identities();
        for spec in self.desired_relays(config)? {
            if !existing.contains(&spec.identity()) {
                log::info!("trying to relay {}", spec.url);
                self.add_relay(spec);
            }
        }
        Ok(())
    }

    /// Applies a new configuration document: handlers are rebuilt through
    /// the registries, removed relays (and their sources) are closed,
    /// surviving ones have burst size and keepalive updated in place, and
    /// new relays are started.
    pub fn reconfigure(&mut self, config: Config) -> Result<(), ConfigError> {
        log::info!("reconfiguring");
        self.build_handlers(&config)?;
        self.apply_limits(&config)?;

        // (url, path) → (burst_size, keepalive) for every configured relay.
        let mut desired: HashMap<(String, String), (Option<usize>, Option<u64>)> = HashMap::new();
        for spec in self.desired_relays(&config)? {
            desired.insert(
                (spec.url.as_str().to_owned(), spec.path.clone()),
                (spec.burst_size, spec.keepalive),
            );
        }

        // Queued restarts for dropped relays must not fire.
        self.relay_restarts.retain(|_, spec| {
            desired.contains_key(&(spec.url.as_str().to_owned(), spec.path.clone()))
        });

        // Relay-created sources: update in place or drop.
        let mut dropped = Vec::new();
        for (id, source) in self.sources.iter_mut() {
            let Some(spec) = source.relay.as_mut() else {
                continue;
            };
            match desired.get(&(spec.url.as_str().to_owned(), spec.path.clone())) {
                Some((burst_size, keepalive)) => {
                    spec.burst_size = *burst_size;
                    spec.keepalive = *keepalive;
                    source.keepalive = *keepalive;
                    source.kind.set_burst_size(*burst_size);
                }
                None => dropped.push(*id),
            }
        }
        for id in dropped {
            if let Some(source) = self.sources.remove(&id) {
                log::info!("dropping {source}: removed from configuration");
                self.drop_source(source, false);
            }
        }

        // In-flight relay handshakes for dropped relays.
        let doomed: Vec<Token> = self
            .pending
            .iter()
            .filter_map(|(token, handler)| {
                let spec = match handler {
                    Pending::Relay(relay) => &relay.spec,
                    Pending::UdpRelay(relay) => &relay.spec,
                    _ => return None,
                };
                let key = (spec.url.as_str().to_owned(), spec.path.clone());
                (!desired.contains_key(&key)).then_some(*token)
            })
            .collect();
        for token in doomed {
            let Some(handler) = self.pending.remove(&token) else {
                continue;
            };
            self.owners.remove(&token);
            self.timers.remove_io(token);
            match handler {
                Pending::Relay(mut relay) => {
                    if let Some(sock) = relay.sock.as_mut() {
                        let _ = self.reactor.deregister(sock, token);
                    }
                }
                Pending::UdpRelay(mut relay) => {
                    if let Some(sock) = relay.sock.as_mut() {
                        let _ = self.reactor.deregister(sock, token);
                    }
                }
                _ => unreachable!("filtered to relays"),
            }
        }

        self.configure_relays(&config)?;
        self.config = config;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection

    fn snapshot(&self) -> StatusSnapshot {
        let mut sources = BTreeMap::new();
        for (path, ids) in &self.mounts {
            let mut by_label = BTreeMap::new();
            for id in ids {
                let Some(source) = self.sources.get(id) else {
                    continue;
                };
                let clients = source
                    .subscribers
                    .iter()
                    .filter_map(|token| self.clients.get(token))
                    .map(|client| ClientStatus {
                        token: client.token.0,
                        address: client.address.to_string(),
                        queue_size: client.buffer.queue_size(),
                    })
                    .collect();
                by_label.insert(
                    format!("{} ({})", source.address, source.id),
                    SourceStatus {
                        address: source.address.clone(),
                        clients,
                    },
                );
            }
            sources.insert(path.clone(), by_label);
        }
        StatusSnapshot {
            pid: std::process::id(),
            sources,
        }
    }

    fn report_request_out(
        &mut self,
        info: &RequestInfo,
        address: &SocketAddr,
        bytes_sent: u64,
        connect_time: std::time::SystemTime,
        status: u16,
    ) {
        for sink in &mut self.stats {
            sink.request_out(info, address, bytes_sent, connect_time, status);
        }
    }
}
