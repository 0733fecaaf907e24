//! Server configuration.
//!
//! `ServerSettings` mirrors the original's `ServerSettings` struct: a plain
//! record of fields with sensible defaults, filled in by `listen` and
//! assembled here with a small builder for ergonomic construction.

use std::net::IpAddr;
use std::sync::Arc;

use crate::protocol::Protocol;

/// Default listening port, used when `ServerSettings::port` is left `None`.
pub const DEFAULT_PORT: u16 = 8080;

/// Default per-connection idle timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u8 = 5;

/// Default worker thread count (single-threaded, cooperative core).
pub const DEFAULT_THREADS: usize = 1;

/// Default process count (no forking).
pub const DEFAULT_PROCESSES: usize = 1;

/// Settings controlling how `Server::listen` behaves.
///
/// Only `protocol` is required; every other field has a default matching the
/// original C core (port 8080, bind-any address, single thread, single
/// process, 5 second timeout).
pub struct ServerSettings<U> {
    /// The default protocol assigned to every newly-accepted connection.
    pub protocol: Arc<dyn Protocol<U>>,

    /// Port to listen on.
    ///
    /// - Default: `8080`
    pub port: u16,

    /// Address to bind to.
    ///
    /// - `None` (default): bind to all local addresses (`0.0.0.0`)
    pub address: Option<IpAddr>,

    /// Called once per process, after `fork` (if `processes > 1`), before the
    /// accept loop starts.
    pub on_init: Option<Arc<dyn Fn(&crate::server::Server<U>) + Send + Sync>>,

    /// Called once per process when `listen` is about to return.
    pub on_finish: Option<Arc<dyn Fn(&crate::server::Server<U>) + Send + Sync>>,

    /// Called once per reactor pass (whether or not any events fired).
    pub on_tick: Option<Arc<dyn Fn(&crate::server::Server<U>) + Send + Sync>>,

    /// Called when a reactor pass returns with no pending events, debounced
    /// to at most once per second of continuous idleness.
    pub on_idle: Option<Arc<dyn Fn(&crate::server::Server<U>) + Send + Sync>>,

    /// Called once in each newly-spawned worker thread.
    pub on_init_thread: Option<Arc<dyn Fn(&crate::server::Server<U>) + Send + Sync>>,

    /// Message written to rejected connections when the server is at
    /// capacity.
    ///
    /// - `None` (default): rejected connections are closed silently.
    pub busy_msg: Option<Vec<u8>>,

    /// Opaque, server-wide user data, reachable through
    /// [`Server::global_data`](crate::server::Server::global_data).
    pub udata: Option<Box<dyn std::any::Any + Send + Sync>>,

    /// Number of worker threads dedicated to `run_async`/`fd_task`/`each`
    /// jobs (the reactor thread itself never blocks on a task callback).
    ///
    /// - `0`: auto-detect, one worker per logical CPU (`num_cpus::get()`).
    /// - `1` (default): a single worker thread.
    pub threads: usize,

    /// Number of worker processes (`fork`ed after bind).
    ///
    /// - `1` (default): no forking.
    pub processes: usize,

    /// Per-connection idle timeout, in seconds, 0-255.
    ///
    /// - Default: `5`
    /// - `0` means "no timeout".
    pub timeout: u8,
}

impl<U> ServerSettings<U> {
    /// Create settings with the given default protocol and every other field
    /// at its default value.
    #[must_use]
    pub fn new(protocol: Arc<dyn Protocol<U>>) -> Self {
        Self {
            protocol,
            port: DEFAULT_PORT,
            address: None,
            on_init: None,
            on_finish: None,
            on_tick: None,
            on_idle: None,
            on_init_thread: None,
            busy_msg: None,
            udata: None,
            threads: DEFAULT_THREADS,
            processes: DEFAULT_PROCESSES,
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: u8) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_busy_msg(mut self, msg: impl Into<Vec<u8>>) -> Self {
        self.busy_msg = Some(msg.into());
        self
    }

    #[must_use]
    pub fn with_on_init<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::server::Server<U>) + Send + Sync + 'static,
    {
        self.on_init = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_finish<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::server::Server<U>) + Send + Sync + 'static,
    {
        self.on_finish = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_tick<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::server::Server<U>) + Send + Sync + 'static,
    {
        self.on_tick = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_idle<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::server::Server<U>) + Send + Sync + 'static,
    {
        self.on_idle = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_on_init_thread<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::server::Server<U>) + Send + Sync + 'static,
    {
        self.on_init_thread = Some(Arc::new(f));
        self
    }

    /// Seed [`Server::global_data`](crate::server::Server::global_data) with
    /// `data`, available before `on_init` runs.
    #[must_use]
    pub fn with_udata(mut self, data: impl std::any::Any + Send + Sync + 'static) -> Self {
        self.udata = Some(Box::new(data));
        self
    }
}
