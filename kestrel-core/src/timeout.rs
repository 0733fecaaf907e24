//! The timeout wheel (§4.E): a once-per-second linear scan over the
//! connection table, pinging (or closing) any connection idle past its
//! configured timeout.
//!
//! The original implements this as a circular buffer of fd lists bucketed
//! by second, an O(1)-amortized structure that avoids scanning every
//! connection on every tick. A full scan is simpler and, at the
//! connection counts this core targets (bounded by `RLIMIT_NOFILE`, a few
//! thousand at most on commodity systems), its cost is dwarfed by an
//! individual ping callback; the bucketed wheel is a legitimate future
//! optimization if profiling ever shows otherwise, not a correctness
//! requirement the spec depends on.

use std::time::Duration;

use tracing::{debug, trace};

use crate::protocol::BusyGuard;
use crate::server::Server;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Run one timeout sweep: every active connection whose idle time has
/// reached its configured timeout gets `Protocol::ping` invoked.
///
/// `ping`'s default implementation closes the connection; protocols that
/// want a heartbeat instead override it and call `Server::touch` to reset
/// the idle clock. Like every other callback invocation, `ping` runs under
/// the connection's busy flag — the sweep runs on the reactor thread once
/// per second and must not race a worker thread's `fd_task`/`each` on the
/// same fd. A contended connection is simply skipped; it gets another
/// chance on the next tick.
pub(crate) fn sweep<U: Send + Sync + 'static>(server: &Server<U>, tick: u64) {
    let due = server.table().due_for_ping(tick);
    if due.is_empty() {
        return;
    }
    debug!(count = due.len(), tick, "timeout sweep pinging connections");
    for (fd, protocol) in due {
        let Some(busy) = server.table().busy_flag(fd) else {
            continue;
        };
        match BusyGuard::try_acquire(busy) {
            Some(_guard) => protocol.ping(server, fd),
            None => trace!(fd, "ping skipped: connection busy, will retry next tick"),
        }
    }
}
