//! The readiness loop.
//!
//! A thin wrapper over `mio::Poll` that adds the two things the server
//! needs on top: synthesized ("injected") readiness, merged bitwise into
//! the next tick's results, and a per-tick snapshot of the current time so
//! every handler and timer in one tick agrees on "now".

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant, SystemTime};

use bitflags::bitflags;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

bitflags! {
    /// Readiness reported for a token.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR = 0b0100;
        const HUP = 0b1000;
    }
}

impl From<&mio::event::Event> for Ready {
    fn from(event: &mio::event::Event) -> Ready {
        let mut ready = Ready::empty();
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready |= Ready::HUP;
        }
        ready
    }
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    injected: HashMap<Token, Ready>,
    now: Instant,
    wall_now: SystemTime,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            injected: HashMap::new(),
            now: Instant::now(),
            wall_now: SystemTime::now(),
        })
    }

    pub fn register(&self, source: &mut impl Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&mut self, source: &mut impl Source, token: Token) -> io::Result<()> {
        self.injected.remove(&token);
        self.poll.registry().deregister(source)
    }

    /// Synthesizes readiness for `token`, OR-merged with whatever the
    /// poller reports on the next tick. Used when a client's queue goes
    /// from empty to non-empty: the socket may already be writable, so no
    /// edge would arrive.
    pub fn inject(&mut self, token: Token, ready: Ready) {
        *self.injected.entry(token).or_default() |= ready;
    }

    /// Monotonic time snapshotted at the top of the current tick.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Wall-clock time snapshotted at the top of the current tick.
    pub fn wall_now(&self) -> SystemTime {
        self.wall_now
    }

    /// Waits for readiness, retrying on `EINTR`, and returns the merged
    /// event list for this tick.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, Ready)>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        self.now = Instant::now();
        self.wall_now = SystemTime::now();

        let mut order = Vec::with_capacity(self.events.iter().count() + self.injected.len());
        let mut merged: HashMap<Token, usize> = HashMap::new();
        for event in self.events.iter() {
            let ready = Ready::from(event);
            match merged.get(&event.token()) {
                Some(&i) => {
                    let entry: &mut (Token, Ready) = &mut order[i];
                    entry.1 |= ready;
                }
                None => {
                    merged.insert(event.token(), order.len());
                    order.push((event.token(), ready));
                }
            }
        }
        for (token, ready) in self.injected.drain() {
            match merged.get(&token) {
                Some(&i) => order[i].1 |= ready,
                None => order.push((token, ready)),
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn injected_events_surface_without_io() {
        let mut reactor = Reactor::new().unwrap();
        reactor.inject(Token(7), Ready::WRITABLE);
        reactor.inject(Token(7), Ready::READABLE);

        let events = reactor.wait(Some(Duration::from_millis(0))).unwrap();
        assert_eq!(events, vec![(Token(7), Ready::READABLE | Ready::WRITABLE)]);

        // Injected events are one-shot.
        let events = reactor.wait(Some(Duration::from_millis(0))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn readiness_for_a_live_socket() {
        use mio::net::TcpListener;

        let mut reactor = Reactor::new().unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        reactor
            .register(&mut listener, Token(1), Interest::READABLE)
            .unwrap();

        let addr = listener.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        // Poll until the accept readiness shows up.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let events = reactor.wait(Some(Duration::from_millis(50))).unwrap();
            if events.iter().any(|(t, r)| *t == Token(1) && r.contains(Ready::READABLE)) {
                break;
            }
            assert!(Instant::now() < deadline, "no readiness within 2s");
        }
    }
}
