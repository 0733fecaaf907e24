//! The protocol capability set and the busy-flag guard that serializes
//! callback invocation per connection.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::server::Server;
use crate::Fd;

/// User-supplied connection behavior.
///
/// Every invocation of `on_data`/`on_ready`/`ping` (and any `fd_task`/`each`
/// task targeting the connection) is serialized by the connection's busy
/// flag — see [`BusyGuard`]. Implementations are shared (`Arc<dyn
/// Protocol<U>>`) and therefore carry no per-connection mutable state of
/// their own; that lives in the connection's user data (`U`).
pub trait Protocol<U>: Send + Sync {
    /// A string identifying this protocol's service (used by `each`/
    /// `each_block` filtering). `None` means "no service" — `each(None, ..)`
    /// still reaches the connection, `each(Some(name), ..)` does not.
    fn service(&self) -> Option<&str> {
        None
    }

    /// Called when a connection is attached.
    fn on_open(&self, _server: &Server<U>, _fd: Fd) {}

    /// Called when the connection's fd reports readable data.
    fn on_data(&self, server: &Server<U>, fd: Fd);

    /// Called when the write buffer has fully drained (room for more
    /// writes).
    fn on_ready(&self, _server: &Server<U>, _fd: Fd) {}

    /// Called on every active connection when the server begins graceful
    /// stop, before any connection is closed.
    fn on_shutdown(&self, _server: &Server<U>, _fd: Fd) {}

    /// Called exactly once, when the connection is fully closed.
    fn on_close(&self, _server: &Server<U>, _fd: Fd) {}

    /// Called when the connection's idle timeout has been reached.
    ///
    /// The default implementation closes the connection, which is exactly
    /// the original's "if `ping` is set call it, else `close`" rule
    /// collapsed into a single call: protocols that want a heartbeat
    /// instead of a hard close override this and call
    /// [`Server::touch`](crate::server::Server::touch).
    fn ping(&self, server: &Server<U>, fd: Fd)
    where
        U: Send + Sync + 'static,
    {
        server.close(fd);
    }
}

/// RAII guard over a connection's busy flag.
///
/// Mirrors the "arm on construction, defuse on an explicit call" shape of a
/// poison guard, but inverted: acquiring the guard takes the lock, and
/// dropping it (whether via `std::mem::drop` or falling out of scope)
/// releases the lock. There is no "disarm" step — the guard's entire
/// lifetime *is* the protected critical section.
pub(crate) struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    /// Attempt to acquire the busy flag. Returns `None` if another callback
    /// is already running on this connection.
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_acquires_and_releases() {
        let flag = AtomicBool::new(false);
        {
            let guard = BusyGuard::try_acquire(&flag);
            assert!(guard.is_some());
            assert!(flag.load(Ordering::Acquire));
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn contended_guard_fails() {
        let flag = AtomicBool::new(false);
        let _first = BusyGuard::try_acquire(&flag).unwrap();
        assert!(BusyGuard::try_acquire(&flag).is_none());
    }
}
