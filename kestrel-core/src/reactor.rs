//! The reactor adapter (§4.A): wait for fd readiness, deliver read/write/hup
//! events, register/deregister fds.
//!
//! Backed by `mio`, which wraps epoll (Linux) / kqueue (BSD, macOS) behind a
//! single portable API. The core always registers connections edge-triggered
//! (`mio`'s default); since edge-triggered mode delivers no further writable
//! event until interest is re-armed, the adapter tracks each connection's
//! current `Interest` and re-registers whenever it changes (readable is
//! always wanted, writable only while the write buffer is non-empty).

use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

/// Token used for the listening socket, distinct from any real fd (fds are
/// small non-negative integers, this value never collides with one).
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// A single readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
}

/// Thin wrapper over `mio::Poll` exposing exactly the surface §4.A
/// describes: register / modify / deregister / wait.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity.max(64)),
        })
    }

    /// Register a source as edge-triggered with the given interest.
    pub fn register(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Change a previously-registered source's interest set.
    pub fn reregister(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut dyn mio::event::Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Wait for readiness events, or for `timeout` to elapse (`None` blocks
    /// indefinitely). Returns an empty slice on timeout.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|ev| ReadyEvent {
                token: ev.token().0,
                readable: ev.is_readable(),
                writable: ev.is_writable(),
                hup: ev.is_read_closed() || ev.is_write_closed() || ev.is_error(),
            })
            .collect())
    }
}

/// The interest a connection wants registered: readable always, writable
/// only while there is pending outbound data.
#[must_use]
pub fn interest_for(wants_writable: bool) -> Interest {
    if wants_writable {
        Interest::READABLE.add(Interest::WRITABLE)
    } else {
        Interest::READABLE
    }
}
