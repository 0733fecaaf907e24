//! Injectable transport hooks.
//!
//! A per-connection pair of read/write hooks replaces the default
//! `recv`/`write` calls, the seam a TLS engine (or a test double) plugs into.
//! Swapped at attach time; the contract is preserved verbatim from the
//! original:
//!
//! - `n > 0`: progress was made, `n` bytes read/written.
//! - `n == 0`: no progress (`EAGAIN`/`EWOULDBLOCK`/`EINTR`), try again later.
//! - `n < 0`: fatal, the connection should be closed.

use std::io::{self, Read, Write};

use mio::net::TcpStream;

/// Per-connection read hook.
pub trait ReadHook: Send {
    /// Read into `buf`, following the `n>0`/`n==0`/`n<0` convention above.
    fn read(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> isize;
}

/// Per-connection write hook.
pub trait WriteHook: Send {
    /// Write from `buf`, following the `n>0`/`n==0`/`n<0` convention above.
    fn write(&mut self, stream: &mut TcpStream, buf: &[u8]) -> isize;
}

/// Default read hook: `recv(fd, ...)`.
///
/// Mirrors the original's documented default implementation exactly,
/// including the detail that an orderly peer shutdown (`Ok(0)`) is reported
/// as fatal (`-1`), not as "no data yet" (`0`) — the original's reference
/// reading hook falls through to `return -1` when `recv` returns zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReadHook;

impl ReadHook for DefaultReadHook {
    fn read(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> isize {
        match stream.read(buf) {
            Ok(0) => -1,
            Ok(n) => n as isize,
            Err(e) if is_transient(&e) => 0,
            Err(_) => -1,
        }
    }
}

/// Default write hook: `write(fd, ...)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultWriteHook;

impl WriteHook for DefaultWriteHook {
    fn write(&mut self, stream: &mut TcpStream, buf: &[u8]) -> isize {
        match stream.write(buf) {
            Ok(n) => n as isize,
            Err(e) if is_transient(&e) => 0,
            Err(_) => -1,
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_recognized() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }
}
