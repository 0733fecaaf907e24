//! The connection table (§4.C): a fixed-size slot array indexed by fd.
//!
//! Activity (`active`) and contention (`busy`) are plain atomics, readable
//! without taking any lock — the "readers are lock-free" half of §5's
//! concurrency model. Mutating a slot's fields (protocol, user data, write
//! buffer, ...) takes that slot's own short-lived `Mutex`, which is a
//! different thing from the busy flag: the busy flag spans an entire
//! callback invocation (held by [`crate::protocol::BusyGuard`]), while the
//! data mutex is only ever held for the few instructions needed to read or
//! mutate a field. A callback can therefore call back into the table (e.g.
//! `write()` from within `on_data`) without deadlocking against its own
//! busy flag.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mio::net::TcpStream;
use parking_lot::Mutex;

use crate::buffer::WriteBuffer;
use crate::hooks::{ReadHook, WriteHook};
use crate::protocol::Protocol;
use crate::reactor::{interest_for, Reactor};
use crate::Fd;

/// fds reserved and never accepted as connections (historically used by the
/// original for global data storage; see `Server::global_data` for the
/// supported replacement).
pub const RESERVED_FDS: std::ops::Range<Fd> = 0..3;

pub(crate) struct SlotData<U> {
    pub protocol: Arc<dyn Protocol<U>>,
    pub udata: Option<Box<U>>,
    pub read_hook: Box<dyn ReadHook>,
    pub write_hook: Box<dyn WriteHook>,
    pub timeout: u8,
    pub last_touch: u64,
    pub buffer: WriteBuffer,
    pub scheduled_close: bool,
    pub stream: TcpStream,
    pub wants_writable: bool,
}

struct Slot<U> {
    active: AtomicBool,
    busy: AtomicBool,
    data: Mutex<Option<SlotData<U>>>,
}

impl<U> Default for Slot<U> {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            data: Mutex::new(None),
        }
    }
}

/// What `begin_close` should do next.
pub(crate) enum CloseAction<U> {
    /// Buffer was empty: the slot has already been freed; the caller owns
    /// `SlotData` and must deregister it and invoke `on_close`.
    Immediate(SlotData<U>),
    /// Buffer was non-empty: `scheduled_close` was set, drain will finish
    /// the job.
    Deferred,
    /// The fd was already inactive.
    AlreadyClosed,
}

pub struct ConnectionTable<U> {
    slots: Vec<Slot<U>>,
    /// Reverse index from a protocol's `service()` name to the fds
    /// currently running it, so `each`/`each_block` fan-out doesn't need to
    /// lock and inspect every slot in the table. Connections with no
    /// service name are never indexed here; `fds_for_service(None)` falls
    /// back to [`Self::active_fds`].
    service_index: DashMap<String, Vec<Fd>>,
}

impl<U: Send + 'static> ConnectionTable<U> {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            slots,
            service_index: DashMap::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, fd: Fd) -> Option<&Slot<U>> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }

    #[must_use]
    pub fn is_valid_target(&self, fd: Fd) -> bool {
        !RESERVED_FDS.contains(&fd) && (fd as usize) < self.slots.len()
    }

    #[must_use]
    pub fn is_active(&self, fd: Fd) -> bool {
        self.slot(fd)
            .is_some_and(|s| s.active.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_busy(&self, fd: Fd) -> bool {
        self.slot(fd)
            .is_some_and(|s| s.busy.load(Ordering::Acquire))
    }

    pub(crate) fn busy_flag(&self, fd: Fd) -> Option<&AtomicBool> {
        self.slot(fd).map(|s| &s.busy)
    }

    /// Register and activate a slot for `fd`. Does *not* invoke `on_open` —
    /// that is the caller's job once this returns successfully, so the
    /// callback runs without holding the table's internal lock.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attach(
        &self,
        fd: Fd,
        reactor: &Mutex<Reactor>,
        protocol: Arc<dyn Protocol<U>>,
        stream: TcpStream,
        read_hook: Box<dyn ReadHook>,
        write_hook: Box<dyn WriteHook>,
        timeout: u8,
        tick: u64,
    ) -> bool {
        if !self.is_valid_target(fd) {
            return false;
        }
        let Some(slot) = self.slot(fd) else {
            return false;
        };
        let mut guard = slot.data.lock();
        if guard.is_some() {
            return false;
        }
        let mut stream = stream;
        if reactor
            .lock()
            .register(&mut stream, mio::Token(fd as usize), interest_for(false))
            .is_err()
        {
            return false;
        }
        if let Some(service) = protocol.service() {
            self.service_index.entry(service.to_owned()).or_default().push(fd);
        }
        *guard = Some(SlotData {
            protocol,
            udata: None,
            read_hook,
            write_hook,
            timeout,
            last_touch: tick,
            buffer: WriteBuffer::new(),
            scheduled_close: false,
            stream,
            wants_writable: false,
        });
        slot.active.store(true, Ordering::Release);
        true
    }

    /// Access a slot's mutable data under its short-lived lock.
    pub(crate) fn with_data<R>(&self, fd: Fd, f: impl FnOnce(&mut SlotData<U>) -> R) -> Option<R> {
        let slot = self.slot(fd)?;
        let mut guard = slot.data.lock();
        guard.as_mut().map(f)
    }

    #[must_use]
    pub fn get_protocol(&self, fd: Fd) -> Option<Arc<dyn Protocol<U>>> {
        self.with_data(fd, |d| d.protocol.clone())
    }

    /// Swap the active protocol. Safe with respect to an in-flight callback
    /// because dispatch always clones the protocol `Arc` under this same
    /// lock *before* releasing it and calling out — an in-progress call
    /// keeps its own reference, a swap here only changes what the *next*
    /// dispatch observes.
    pub fn set_protocol(&self, fd: Fd, protocol: Arc<dyn Protocol<U>>) -> Result<(), ()> {
        let old_service = self
            .with_data(fd, |d| d.protocol.service().map(str::to_owned))
            .flatten();
        let new_service = protocol.service().map(str::to_owned);
        let result = self.with_data(fd, |d| d.protocol = protocol).ok_or(());
        if result.is_ok() && old_service != new_service {
            if let Some(old) = old_service {
                self.unindex(fd, Some(&old));
            }
            if let Some(new) = new_service {
                self.service_index.entry(new).or_default().push(fd);
            }
        }
        result
    }

    fn unindex(&self, fd: Fd, service: Option<&str>) {
        if let Some(service) = service {
            if let Some(mut fds) = self.service_index.get_mut(service) {
                fds.retain(|&x| x != fd);
            }
        }
    }

    #[must_use]
    pub fn touch(&self, fd: Fd, tick: u64) -> bool {
        self.with_data(fd, |d| d.last_touch = tick).is_some()
    }

    pub fn set_timeout(&self, fd: Fd, timeout: u8) -> bool {
        self.with_data(fd, |d| d.timeout = timeout).is_some()
    }

    /// Begin closing `fd`. See [`CloseAction`].
    pub(crate) fn begin_close(&self, fd: Fd, reactor: &Mutex<Reactor>) -> CloseAction<U> {
        let Some(slot) = self.slot(fd) else {
            return CloseAction::AlreadyClosed;
        };
        let mut guard = slot.data.lock();
        let Some(data) = guard.as_mut() else {
            return CloseAction::AlreadyClosed;
        };
        if data.buffer.is_empty() {
            let mut data = guard.take().expect("checked Some above");
            slot.active.store(false, Ordering::Release);
            let _ = reactor.lock().deregister(&mut data.stream);
            self.unindex(fd, data.protocol.service());
            CloseAction::Immediate(data)
        } else {
            data.scheduled_close = true;
            CloseAction::Deferred
        }
    }

    /// Called from the drain path once a scheduled-close connection's
    /// buffer has fully emptied. Returns the slot data for the caller to
    /// deregister and invoke `on_close` with.
    pub(crate) fn finish_scheduled_close(
        &self,
        fd: Fd,
        reactor: &Mutex<Reactor>,
    ) -> Option<SlotData<U>> {
        let slot = self.slot(fd)?;
        let mut guard = slot.data.lock();
        let data_ref = guard.as_ref()?;
        if !data_ref.scheduled_close || !data_ref.buffer.is_empty() {
            return None;
        }
        let mut data = guard.take()?;
        slot.active.store(false, Ordering::Release);
        let _ = reactor.lock().deregister(&mut data.stream);
        self.unindex(fd, data.protocol.service());
        Some(data)
    }

    /// Block the calling thread until `fd`'s buffer drains, then release it
    /// from the table without ever invoking `on_close`. Returns the raw fd.
    pub fn hijack(&self, fd: Fd, reactor: &Mutex<Reactor>) -> Option<Fd> {
        let slot = self.slot(fd)?;
        loop {
            let mut guard = slot.data.lock();
            let Some(data) = guard.as_ref() else {
                return None;
            };
            if data.buffer.is_empty() {
                let mut data = guard.take().expect("checked Some above");
                slot.active.store(false, Ordering::Release);
                let raw = data.stream.as_raw_fd();
                let _ = reactor.lock().deregister(&mut data.stream);
                self.unindex(fd, data.protocol.service());
                std::mem::forget(data.stream);
                return Some(raw);
            }
            drop(guard);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Collect the fds of every active connection whose protocol's service
    /// string matches `service`. `None` matches every connection and falls
    /// back to a full scan; a named service is served straight from the
    /// `service_index`, filtered for staleness against `active`.
    #[must_use]
    pub fn fds_for_service(&self, service: Option<&str>) -> Vec<Fd> {
        let Some(service) = service else {
            return self.active_fds();
        };
        self.service_index
            .get(service)
            .map(|fds| {
                fds.iter()
                    .copied()
                    .filter(|&fd| self.is_active(fd))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fds whose idle time has reached their configured timeout, along with
    /// the protocol to invoke `ping` on.
    #[must_use]
    pub fn due_for_ping(&self, tick: u64) -> Vec<(Fd, Arc<dyn Protocol<U>>)> {
        let mut out = Vec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let guard = slot.data.lock();
            if let Some(data) = guard.as_ref() {
                if data.timeout != 0 && tick.saturating_sub(data.last_touch) >= u64::from(data.timeout)
                {
                    out.push((idx as Fd, data.protocol.clone()));
                }
            }
        }
        out
    }

    /// All currently active fds, for shutdown/close-all sweeps.
    #[must_use]
    pub fn active_fds(&self) -> Vec<Fd> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active.load(Ordering::Acquire))
            .map(|(idx, _)| idx as Fd)
            .collect()
    }
}
