//! The protocol dispatcher (§4.D): invokes `on_data`/`on_ready`/`ping`
//! serialized per connection via the busy flag.
//!
//! Readiness events never call into a protocol directly. Instead, the
//! reactor loop hands each ready fd to [`dispatch_readable`] /
//! [`dispatch_writable`], which try to acquire the connection's
//! [`BusyGuard`]; on success the callback runs inline on the reactor
//! thread. On contention (another callback already running, e.g. a slow
//! `fd_task` from a worker thread) a readable event is re-armed by
//! handing it to the worker pool rather than invoked recursively or
//! dropped — edge triggering means a connection with no further incoming
//! bytes would otherwise never see `on_data` run at all. This keeps the
//! reactor thread itself free of any blocking pool queueing logic: the
//! retry runs on a worker thread, not inline.

use tracing::{trace, warn};

use crate::protocol::BusyGuard;
use crate::server::Server;
use crate::Fd;

/// Try to run `on_data` for `fd`. No-op if the connection is inactive; on
/// contention, re-arms by resubmitting itself to the worker pool.
pub(crate) fn dispatch_readable<U: Send + Sync + 'static>(server: &Server<U>, fd: Fd) {
    let Some(busy) = server.table().busy_flag(fd) else {
        return;
    };
    let Some(_guard) = BusyGuard::try_acquire(busy) else {
        trace!(fd, "on_data contended, re-arming via worker pool");
        server.dispatcher_inner().submit(Box::new(move |server: &Server<U>| {
            dispatch_readable(server, fd);
        }));
        return;
    };
    let Some(protocol) = server.table().get_protocol(fd) else {
        return;
    };
    protocol.on_data(server, fd);
}

/// Drain the write buffer for `fd`, then run `on_ready` if it fully
/// emptied, or finish a scheduled close if one was pending.
pub(crate) fn dispatch_writable<U: Send + Sync + 'static>(server: &Server<U>, fd: Fd) {
    let Some(busy) = server.table().busy_flag(fd) else {
        return;
    };
    let Some(_guard) = BusyGuard::try_acquire(busy) else {
        trace!(fd, "on_ready skipped: connection busy");
        return;
    };
    match server.drain_and_reregister(fd) {
        crate::server::DrainResult::StillPending => {}
        crate::server::DrainResult::Emptied => {
            if let Some(protocol) = server.table().get_protocol(fd) {
                protocol.on_ready(server, fd);
            }
        }
        crate::server::DrainResult::Fatal => {
            warn!(fd, "write hook reported fatal error, closing");
            server.close(fd);
        }
        crate::server::DrainResult::Inactive => {}
    }
}
