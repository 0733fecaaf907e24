//! # Kestrel
//!
//! A protocol-agnostic TCP server core: one reactor thread driving
//! connection lifecycle and I/O, an optional worker pool for blocking or
//! long-running per-connection work, and a small, explicit callback
//! surface ([`Protocol`]) that an application protocol implements on top.
//!
//! ## Architecture
//!
//! - **`kestrel-core`**: reactor adapter, write buffer, connection table,
//!   protocol dispatcher, timeout wheel, task dispatcher — the engine.
//! - **`kestrel`**: public API surface (this crate), re-exporting
//!   `kestrel-core`'s prelude.
//!
//! Kestrel does not speak any application protocol itself — no HTTP
//! framing, no TLS. Those are built on top by implementing [`Protocol`]
//! and, if needed, swapping the per-connection [`ReadHook`]/[`WriteHook`]
//! pair for a different transport.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use kestrel::prelude::*;
//!
//! struct Echo;
//!
//! impl Protocol<()> for Echo {
//!     fn on_data(&self, server: &Server<()>, fd: Fd) {
//!         let mut buf = [0u8; 4096];
//!         loop {
//!             match server.read(fd, &mut buf) {
//!                 n if n > 0 => {
//!                     server.write(fd, &buf[..n as usize]);
//!                 }
//!                 0 => break,
//!                 _ => {
//!                     server.close(fd);
//!                     break;
//!                 }
//!             }
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = ServerSettings::new(std::sync::Arc::new(Echo)).with_port(9000);
//! Server::listen(settings)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub use bytes::Bytes;
pub use kestrel_core::buffer::{Packet, Urgency, WriteBuffer};
pub use kestrel_core::error::{ServerError, ServerResult};
pub use kestrel_core::hooks::{DefaultReadHook, DefaultWriteHook, ReadHook, WriteHook};
pub use kestrel_core::protocol::Protocol;
pub use kestrel_core::server::{stop_all, Server};
pub use kestrel_core::settings::ServerSettings;
pub use kestrel_core::Fd;

/// Everything needed to implement a protocol and start a server.
pub mod prelude {
    pub use crate::{Fd, Protocol, Server, ServerSettings};
}

/// Development helper for enabling `tracing` output in examples and
/// benches via `RUST_LOG`.
pub mod dev_tracing;
