//! Kestrel Core
//!
//! A protocol-agnostic TCP server core: a single-threaded event reactor
//! (backed by `mio`, wrapping epoll/kqueue) augmented by a worker pool and
//! optional process forking.
//!
//! This crate owns the **connection lifecycle and I/O engine**:
//! - The reactor/event-loop integration (`reactor`)
//! - The per-connection state table (`table`)
//! - The write buffer with urgency ordering and pluggable transport hooks
//!   (`buffer`, `hooks`)
//! - The idle-timeout wheel (`timeout`)
//! - The task dispatcher: `each` / `fd_task` / `run_async` / `run_every`
//!   (`task`)
//! - The protocol-dispatch state machine (`protocol`, `dispatcher`)
//! - Process lifecycle: listen, accept loop, graceful stop (`server`)
//!
//! No application protocol (HTTP, etc.) and no TLS are built in. Byte framing
//! and transport encryption are delegated entirely to user-supplied
//! [`Protocol`](protocol::Protocol) implementations and read/write hooks.

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

pub mod buffer;
pub mod dispatcher;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod settings;
pub mod table;
pub mod task;
pub mod tcp;
pub mod timeout;

/// File descriptor type used to index connections.
///
/// This core is POSIX-oriented (raw fds, `fork`, `rlimit`); non-Unix targets
/// are out of scope, matching the original's reliance on `recv`/`write`/fork
/// semantics.
pub type Fd = std::os::unix::io::RawFd;

pub mod prelude {
    pub use crate::error::{ServerError, ServerResult};
    pub use crate::hooks::{ReadHook, WriteHook};
    pub use crate::protocol::Protocol;
    pub use crate::server::Server;
    pub use crate::settings::ServerSettings;
    pub use crate::Fd;
}
