//! The server: binds a listener, owns the reactor loop, and exposes the
//! public per-connection API (§4.B, §4.G, §6).

use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffer::{DrainOutcome, Packet, Urgency};
use crate::dispatcher;
use crate::error::{ServerError, ServerResult};
use crate::hooks::{DefaultReadHook, DefaultWriteHook};
use crate::protocol::Protocol;
use crate::reactor::{interest_for, Reactor, LISTENER_TOKEN};
use crate::settings::ServerSettings;
use crate::table::ConnectionTable;
use crate::task::{self, TaskDispatcher};
use crate::tcp::enable_tcp_nodelay;
use crate::timeout;
use crate::Fd;

/// Registry of every `Server`'s stop flag, so `stop_all` can reach servers
/// it has no direct handle to (e.g. one listening on a background thread
/// started by application code outside this crate's control).
static STOP_FLAGS: Lazy<Mutex<Vec<Arc<AtomicBool>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Signal every running `Server` in this process to begin graceful stop.
pub fn stop_all() {
    for flag in STOP_FLAGS.lock().iter() {
        flag.store(true, Ordering::Release);
    }
}

pub(crate) enum DrainResult {
    StillPending,
    Emptied,
    Fatal,
    Inactive,
}

/// A running (or about-to-run) server core.
///
/// Generic over `U`, the per-connection user data type — the Rust
/// replacement for the original's `void *udata`. `Server` itself carries
/// no protocol-specific state; everything connection-specific lives in the
/// connection table, everything server-wide the application wants to share
/// lives behind [`Server::global_data`].
pub struct Server<U> {
    listener_fd: Fd,
    reactor: Mutex<Reactor>,
    table: ConnectionTable<U>,
    settings: ServerSettings<U>,
    dispatcher: OnceCell<TaskDispatcher<U>>,
    global_data: Mutex<Option<Box<dyn std::any::Any + Send + Sync>>>,
    running: Arc<AtomicBool>,
    count: AtomicUsize,
    tick: AtomicUsize,
}

impl<U: Send + Sync + 'static> Server<U> {
    /// Bind, register the listener with the reactor, and run the accept
    /// loop until the server is stopped (via [`Server::stop`] or
    /// [`stop_all`]). Blocks the calling thread.
    pub fn listen(mut settings: ServerSettings<U>) -> ServerResult<()> {
        let udata = settings.udata.take();
        let addr = SocketAddr::new(
            settings.address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            settings.port,
        );
        let processes = settings.processes.max(1);

        #[cfg(unix)]
        let fork_role = if processes > 1 {
            fork_workers(processes)?
        } else {
            ForkRole::Standalone
        };
        #[cfg(not(unix))]
        let fork_role = ForkRole::Standalone;

        let std_listener = bind_reuseaddr(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        std_listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(std_listener);
        let listener_fd = listener.as_raw_fd() as Fd;

        let reactor = Reactor::new(1024).map_err(ServerError::ReactorInit)?;
        reactor.register(&mut listener, LISTENER_TOKEN, mio::Interest::READABLE)?;

        let capacity = raise_and_read_fd_limit();
        let running = Arc::new(AtomicBool::new(true));
        STOP_FLAGS.lock().push(running.clone());

        let server = Arc::new(Server {
            listener_fd,
            reactor: Mutex::new(reactor),
            table: ConnectionTable::with_capacity(capacity),
            settings,
            dispatcher: OnceCell::new(),
            global_data: Mutex::new(udata),
            running,
            count: AtomicUsize::new(0),
            tick: AtomicUsize::new(0),
        });
        let workers = match server.settings.threads {
            0 => num_cpus::get(),
            n => n,
        };
        let _ = server.dispatcher.set(TaskDispatcher::new(workers, server.clone()));

        info!(port = server.settings.port, capacity, workers, "server listening");

        if let Some(on_init) = server.settings.on_init.clone() {
            on_init(&server);
        }

        server.run_loop(&mut listener);

        if let Some(on_finish) = server.settings.on_finish.clone() {
            on_finish(&server);
        }
        STOP_FLAGS.lock().retain(|f| !Arc::ptr_eq(f, &server.running));

        #[cfg(unix)]
        if let ForkRole::Parent(children) = fork_role {
            for pid in children {
                unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
            }
        }
        let _ = fork_role;

        Ok(())
    }

    fn run_loop(self: &Arc<Self>, listener: &mut TcpListener) {
        let mut last_tick = Instant::now();
        let mut idle_since: Option<Instant> = None;

        while self.running.load(Ordering::Acquire) {
            let events = match self.reactor.lock().wait(Some(Duration::from_millis(250))) {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "reactor wait failed");
                    Vec::new()
                }
            };

            if events.is_empty() {
                let now = Instant::now();
                let idle_start = *idle_since.get_or_insert(now);
                if now.duration_since(idle_start) >= Duration::from_secs(1) {
                    if let Some(on_idle) = self.settings.on_idle.clone() {
                        on_idle(self);
                    }
                    idle_since = Some(now);
                }
            } else {
                idle_since = None;
            }

            for event in events {
                if event.token == LISTENER_TOKEN.0 {
                    self.accept_loop(listener);
                    continue;
                }
                let fd = event.token as Fd;
                if event.hup {
                    self.close(fd);
                    continue;
                }
                if event.writable {
                    dispatcher::dispatch_writable(self, fd);
                }
                if event.readable {
                    dispatcher::dispatch_readable(self, fd);
                }
            }

            if let Some(on_tick) = self.settings.on_tick.clone() {
                on_tick(self);
            }

            if last_tick.elapsed() >= timeout::TICK_INTERVAL {
                last_tick = Instant::now();
                let tick = self.tick.fetch_add(1, Ordering::AcqRel) as u64 + 1;
                timeout::sweep(self, tick);
            }
        }

        self.graceful_shutdown();
    }

    fn accept_loop(self: &Arc<Self>, listener: &mut TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
                    self.accept_one(stream, peer)
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn accept_one(self: &Arc<Self>, stream: std::net::TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(error = %e, "failed to set accepted socket nonblocking");
            return;
        }
        let mut stream = TcpStream::from_std(stream);
        let _ = enable_tcp_nodelay(&stream);
        let fd = stream.as_raw_fd() as Fd;

        if self.count.load(Ordering::Acquire) >= self.table.capacity() {
            warn!(fd, %peer, "connection rejected: server at capacity");
            if let Some(msg) = &self.settings.busy_msg {
                let _ = io::Write::write_all(&mut stream, msg);
            }
            return;
        }

        let tick = self.tick.load(Ordering::Acquire) as u64;
        let attached = self.table.attach(
            fd,
            &self.reactor,
            self.settings.protocol.clone(),
            stream,
            Box::new(DefaultReadHook),
            Box::new(DefaultWriteHook),
            self.settings.timeout,
            tick,
        );
        if !attached {
            warn!(fd, "failed to attach accepted connection");
            return;
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        debug!(fd, %peer, "connection accepted");
        if let Some(protocol) = self.table.get_protocol(fd) {
            protocol.on_open(self, fd);
        }
    }

    fn graceful_shutdown(&self) {
        info!("beginning graceful shutdown");
        for fd in self.table.active_fds() {
            if let Some(protocol) = self.table.get_protocol(fd) {
                protocol.on_shutdown(self, fd);
            }
        }
        // Give queued writes a bounded chance to flush before closing.
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let active = self.table.active_fds();
            if active.iter().all(|&fd| self.table.with_data(fd, |d| d.buffer.is_empty()).unwrap_or(true))
            {
                break;
            }
            for fd in active {
                self.drain_and_reregister(fd);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        for fd in self.table.active_fds() {
            self.close(fd);
        }
        // Worker threads are detached (see `TaskDispatcher`'s doc comment)
        // and keep running past this point; already-queued jobs still get
        // to run, just not necessarily before `listen` returns.
    }

    #[must_use]
    pub(crate) fn table(&self) -> &ConnectionTable<U> {
        &self.table
    }

    #[must_use]
    pub(crate) fn settings(&self) -> &ServerSettings<U> {
        &self.settings
    }

    pub(crate) fn dispatcher_inner(&self) -> &TaskDispatcher<U> {
        self.dispatcher.get().expect("dispatcher initialized before accept loop runs")
    }

    /// Request this server to stop; the accept loop exits at the start of
    /// its next iteration and runs graceful shutdown.
    pub fn stop(&self) {
        info!("stop requested");
        self.running.store(false, Ordering::Release);
    }

    /// fd of the listening socket.
    #[must_use]
    pub fn listener_fd(&self) -> Fd {
        self.listener_fd
    }

    /// Number of currently active connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    #[must_use]
    pub fn is_busy(&self, fd: Fd) -> bool {
        self.table.is_busy(fd)
    }

    /// Reset `fd`'s idle timer, as if data had just been exchanged.
    pub fn touch(&self, fd: Fd) -> bool {
        let tick = self.tick.load(Ordering::Acquire) as u64;
        self.table.touch(fd, tick)
    }

    pub fn set_timeout(&self, fd: Fd, timeout: u8) -> bool {
        self.table.set_timeout(fd, timeout)
    }

    pub fn set_protocol(&self, fd: Fd, protocol: Arc<dyn Protocol<U>>) -> Result<(), ()> {
        self.table.set_protocol(fd, protocol)
    }

    #[must_use]
    pub fn get_udata(&self, fd: Fd) -> Option<Box<U>>
    where
        U: Clone,
    {
        self.table.with_data(fd, |d| d.udata.clone())?
    }

    pub fn set_udata(&self, fd: Fd, udata: U) -> bool {
        self.table.with_data(fd, |d| d.udata = Some(Box::new(udata))).is_some()
    }

    /// Read directly through the connection's read hook (for protocols that
    /// drive their own buffering inside `on_data` rather than relying on a
    /// push model).
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> isize {
        self.table
            .with_data(fd, |d| d.read_hook.read(&mut d.stream, buf))
            .unwrap_or(-1)
    }

    pub fn write(&self, fd: Fd, data: &[u8]) -> bool {
        self.enqueue(fd, Packet::copied(data, Urgency::Normal))
    }

    pub fn write_move(&self, fd: Fd, data: Vec<u8>) -> bool {
        self.enqueue(fd, Packet::moved(data, Urgency::Normal))
    }

    pub fn write_urgent(&self, fd: Fd, data: &[u8]) -> bool {
        self.enqueue(fd, Packet::copied(data, Urgency::Urgent))
    }

    pub fn write_move_urgent(&self, fd: Fd, data: Vec<u8>) -> bool {
        self.enqueue(fd, Packet::moved(data, Urgency::Urgent))
    }

    pub fn sendfile(&self, fd: Fd, file: File, len: u64) -> bool {
        self.enqueue(fd, Packet::file(file, len))
    }

    fn enqueue(&self, fd: Fd, packet: Packet) -> bool {
        let queued = self
            .table
            .with_data(fd, |d| d.buffer.push(packet))
            .is_some();
        if queued {
            // Opportunistic immediate drain: a packet enqueued here can
            // become partially sent ("in flight") before returning, which
            // is what lets a following `write_urgent` observe it as
            // in-flight and insert strictly after it rather than before.
            self.drain_and_reregister(fd);
        }
        queued
    }

    pub(crate) fn drain_and_reregister(&self, fd: Fd) -> DrainResult {
        let Some(outcome) = self.table.with_data(fd, |d| {
            let outcome = d.buffer.drain(&mut d.stream, &mut *d.write_hook);
            let wants_writable = !d.buffer.is_empty();
            if wants_writable != d.wants_writable {
                d.wants_writable = wants_writable;
                let _ = self.reactor.lock().reregister(
                    &mut d.stream,
                    mio::Token(fd as usize),
                    interest_for(wants_writable),
                );
            }
            outcome
        }) else {
            return DrainResult::Inactive;
        };

        match outcome {
            DrainOutcome::Fatal => DrainResult::Fatal,
            DrainOutcome::WouldBlock => DrainResult::StillPending,
            DrainOutcome::Empty => {
                if let Some(mut data) = self.table.finish_scheduled_close(fd, &self.reactor) {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    let protocol = data.protocol.clone();
                    protocol.on_close(self, fd);
                    data.udata = None;
                }
                DrainResult::Emptied
            }
        }
    }

    /// Close `fd`. If its write buffer is non-empty the close is deferred
    /// until the buffer fully drains.
    pub fn close(&self, fd: Fd) {
        match self.table.begin_close(fd, &self.reactor) {
            crate::table::CloseAction::Immediate(data) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                data.protocol.on_close(self, fd);
            }
            crate::table::CloseAction::Deferred | crate::table::CloseAction::AlreadyClosed => {}
        }
    }

    /// Remove `fd` from the server entirely (deregistering it and blocking
    /// until its buffer drains) without invoking `on_close`, handing
    /// ownership of the raw fd back to the caller.
    pub fn hijack(&self, fd: Fd) -> Option<Fd> {
        let raw = self.table.hijack(fd, &self.reactor);
        if raw.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        raw
    }

    /// Store server-wide opaque data, reachable from any connection's
    /// callbacks. Replaces the original's convention of stashing a pointer
    /// behind a reserved low-numbered fd.
    pub fn set_global_data<T: std::any::Any + Send + Sync>(&self, value: T) {
        *self.global_data.lock() = Some(Box::new(value));
    }

    #[must_use]
    pub fn global_data<T: std::any::Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.global_data
            .lock()
            .as_ref()
            .and_then(|b| b.downcast_ref::<T>())
            .cloned()
    }

    /// Schedule `f` to run once on a worker thread. Safe to call from
    /// inside a protocol callback: workers hold their own `Arc<Server<U>>`
    /// independent of the `&Server<U>` handed to callbacks.
    pub fn run_async(&self, f: impl FnOnce(&Server<U>) + Send + 'static) {
        task::run_async(self.dispatcher_inner(), f);
    }

    pub fn fd_task(
        &self,
        fd: Fd,
        task_fn: impl FnOnce(&Server<U>, Fd) + Send + 'static,
        fallback: Option<impl FnOnce(&Server<U>) + Send + 'static>,
    ) {
        task::fd_task(self.dispatcher_inner(), fd, task_fn, fallback);
    }

    /// Fire `task_fn` for every connection matching `service`, then invoke
    /// `on_finish` once with `origin_fd` — the connection `each` is being
    /// called on behalf of — once every instance has completed.
    pub fn each(
        &self,
        origin_fd: Fd,
        service: Option<String>,
        task_fn: Arc<dyn Fn(&Server<U>, Fd) + Send + Sync>,
        on_finish: Option<impl FnOnce(&Server<U>, Fd) + Send + Sync + 'static>,
    ) {
        task::each(self.dispatcher_inner(), origin_fd, service, task_fn, on_finish);
    }

    pub fn each_block(
        &self,
        service: Option<&str>,
        task_fn: impl Fn(&Server<U>, Fd) + Send + Sync + 'static,
    ) {
        task::each_block(self.dispatcher_inner(), self, service, task_fn);
    }

    pub fn run_after(&self, delay: Duration, f: impl FnOnce(&Server<U>) + Send + 'static) {
        task::run_after(task::sender(self.dispatcher_inner()), delay, f);
    }

    pub fn run_every(
        &self,
        interval: Duration,
        f: impl Fn(&Server<U>) + Send + Sync + 'static,
    ) {
        task::run_every(
            task::sender(self.dispatcher_inner()),
            interval,
            self.running.clone(),
            f,
        );
    }
}

#[cfg(unix)]
enum ForkRole {
    Standalone,
    Parent(Vec<libc::pid_t>),
}

#[cfg(unix)]
fn fork_workers(processes: usize) -> ServerResult<ForkRole> {
    let mut children = Vec::new();
    for _ in 1..processes {
        // SAFETY: fork() is called before any additional threads exist in
        // this process (the reactor, dispatcher and listener are all
        // created after this point), so the child inherits a
        // single-threaded, consistent process image.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => return Err(ServerError::Fork(io::Error::last_os_error())),
            0 => return Ok(ForkRole::Standalone),
            pid => children.push(pid),
        }
    }
    Ok(ForkRole::Parent(children))
}

/// Bind a listening socket with `SO_REUSEADDR` set, so a restarted server
/// doesn't have to wait out the previous listener's `TIME_WAIT` sockets.
fn bind_reuseaddr(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Margin subtracted from the raised `RLIMIT_NOFILE` to get the connection
/// table's capacity: the reactor's own fd, up to 8 timer fds (`run_after`/
/// `run_every` each borrow one for their lifetime), the listening socket,
/// and headroom for response files opened via `sendfile`.
const FD_MARGIN: usize = 1 + 8 + 1 + 1024;

/// Raise `RLIMIT_NOFILE` to its hard limit if possible, then return the
/// resulting soft limit, minus [`FD_MARGIN`], as the connection table's
/// capacity.
#[cfg(unix)]
fn raise_and_read_fd_limit() -> usize {
    use std::mem::MaybeUninit;
    let raised = unsafe {
        let mut limits = MaybeUninit::<libc::rlimit>::uninit();
        if libc::getrlimit(libc::RLIMIT_NOFILE, limits.as_mut_ptr()) == 0 {
            let mut limits = limits.assume_init();
            if limits.rlim_cur < limits.rlim_max {
                limits.rlim_cur = limits.rlim_max;
                let _ = libc::setrlimit(libc::RLIMIT_NOFILE, &limits);
            }
            if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) == 0 {
                Some(limits.rlim_cur as usize)
            } else {
                None
            }
        } else {
            None
        }
    };
    raised.unwrap_or(1024).saturating_sub(FD_MARGIN).max(1)
}

#[cfg(not(unix))]
fn raise_and_read_fd_limit() -> usize {
    1024usize.saturating_sub(FD_MARGIN).max(1)
}
