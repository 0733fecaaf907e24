//! TCP socket tuning shared by every accepted connection.

use std::io;

use mio::net::TcpStream;

/// Disable Nagle's algorithm. `mio::net::TcpStream` exposes `set_nodelay`
/// directly (unlike the teacher's compio stream, it needs no raw-fd
/// round-trip through `socket2`), so this is a thin documented wrapper
/// rather than unsafe plumbing.
#[inline]
pub fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
