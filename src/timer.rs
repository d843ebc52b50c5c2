//! The timer service.
//!
//! One timerfd, armed to the earliest pending expiration. Entries are keyed
//! so re-arming an existing key overwrites it, and expirations map to
//! [`TimerAction`]s executed by the server loop — the actions must tolerate
//! their subject having disappeared, since an earlier action in the same
//! tick may have closed it.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::{Duration, Instant};

use mio::Token;
use mio_timerfd::{ClockId, TimerFd};

use crate::sources::SourceId;

/// What to do when an expiration is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    /// An I/O handler went [`crate::server::INACTIVITY_TIMEOUT`] without
    /// traffic; close it.
    InactivityTimeout(Token),
    /// An on-demand source spent its idle grace with no clients; disconnect.
    OnDemandStop(SourceId),
    /// The keepalive window for a mount elapsed; close its orphaned clients.
    KeepaliveExpired(String),
    /// A failed relay is due for another attempt.
    RelayRestart(u64),
}

/// Timer identity. Resetting a key cancels its previous expiration.
///
/// I/O inactivity entries are keyed by poll token, which a relay hands to
/// the source it becomes, so both share one inactivity timeout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Io(Token),
    OnDemand(SourceId),
    Keepalive(String),
    RelayRestart(u64),
}

pub struct Timers {
    fd: TimerFd,
    entries: HashMap<TimerKey, Instant>,
    schedule: BTreeMap<Instant, HashMap<TimerKey, TimerAction>>,
    /// The expiration the fd is currently armed for.
    armed: Option<Instant>,
}

impl Timers {
    pub fn new() -> io::Result<Timers> {
        Ok(Timers {
            fd: TimerFd::new(ClockId::Monotonic)?,
            entries: HashMap::new(),
            schedule: BTreeMap::new(),
            armed: None,
        })
    }

    /// The timerfd, for registration with the poller.
    pub fn fd_mut(&mut self) -> &mut TimerFd {
        &mut self.fd
    }

    fn min_expiration(&self) -> Option<Instant> {
        self.schedule.keys().next().copied()
    }

    /// Re-arms the fd whenever the earliest expiration moved. Without
    /// this, a moved entry would leave the fd firing at a stale deadline
    /// and its action would run early.
    fn sync_arm(&mut self, now: Instant) -> io::Result<()> {
        let min = self.min_expiration();
        if min == self.armed {
            return Ok(());
        }
        match min {
            Some(at) => {
                // A zero timeout would disarm the fd; clamp so late
                // arming still fires.
                let timeout = at.saturating_duration_since(now).max(Duration::from_nanos(1));
                self.fd.set_timeout(&timeout)?;
            }
            None => self.fd.disarm()?,
        }
        self.armed = min;
        Ok(())
    }

    fn detach(&mut self, key: &TimerKey) {
        if let Some(at) = self.entries.remove(key) {
            if let Some(bucket) = self.schedule.get_mut(&at) {
                bucket.remove(key);
                if bucket.is_empty() {
                    self.schedule.remove(&at);
                }
            }
        }
    }

    /// Schedules `action` at `at`, replacing any previous entry for `key`.
    pub fn reset(
        &mut self,
        now: Instant,
        key: TimerKey,
        at: Instant,
        action: TimerAction,
    ) -> io::Result<()> {
        self.detach(&key);
        self.entries.insert(key.clone(), at);
        self.schedule.entry(at).or_default().insert(key, action);
        self.sync_arm(now)
    }

    /// Cancels the entry for `key`, if any.
    pub fn remove(&mut self, key: &TimerKey) {
        self.detach(key);
        // The fd may now be armed for a gone deadline; firing on it is
        // harmless, fire() only pops entries that are actually due.
    }

    pub fn contains(&self, key: &TimerKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Drains the expiration counter and pops every entry that is due.
    /// Entries at one expiration are popped one by one, so an action
    /// cancelling a sibling at the same tick is tolerated. The returned
    /// actions run after this call and may find their subject already
    /// gone; that is expected.
    pub fn fire(&mut self, now: Instant) -> io::Result<Vec<TimerAction>> {
        match self.fd.read() {
            Ok(_) => {}
            // A stale wakeup from a deadline that has since moved.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }

        let mut actions = Vec::new();
        while let Some(min) = self.min_expiration() {
            if min > now {
                break;
            }
            let mut bucket = self.schedule.remove(&min).unwrap_or_default();
            while let Some(key) = bucket.keys().next().cloned() {
                let action = bucket.remove(&key).expect("key just observed");
                self.entries.remove(&key);
                actions.push(action);
            }
        }

        self.armed = None;
        self.sync_arm(now)?;
        Ok(actions)
    }

    /// Arms (or re-arms) the inactivity timeout for an I/O handler.
    pub fn reset_io(&mut self, now: Instant, token: Token, timeout: Duration) -> io::Result<()> {
        self.reset(
            now,
            TimerKey::Io(token),
            now + timeout,
            TimerAction::InactivityTimeout(token),
        )
    }

    /// Cancels the inactivity timeout for an I/O handler.
    pub fn remove_io(&mut self, token: Token) {
        self.remove(&TimerKey::Io(token));
    }
}
