//! The per-connection write buffer: an ordered queue of outbound packets
//! with urgency ordering, move-vs-copy ownership, and `sendfile`-style file
//! packets.
//!
//! A packet's bytes are never interleaved with another packet's — each
//! `write*`/`sendfile` call is atomic. Ownership tags map onto owned Rust
//! values rather than destructor flags: a `Copied` packet owns a private
//! `Bytes` the buffer allocated, a `Moved` packet owns the caller's `Vec<u8>`
//! taken by value (zero extra copy), and a `File` packet owns the
//! `std::fs::File` handle, closed automatically (via `Drop`) once fully
//! drained or the connection tears down.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};

use bytes::Bytes;

use crate::hooks::WriteHook;

/// Chunk size used to read a `sendfile` packet's backing file into memory
/// before handing it to the write hook.
///
/// The original recommends 64 KiB-256 KiB; 128 KiB splits the difference
/// between syscall overhead and per-connection memory footprint.
pub const SENDFILE_CHUNK: usize = 128 * 1024;

/// Urgency class of a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Normal,
    /// Inserted after the currently in-flight packet (if any), before all
    /// other pending packets — never in the middle of an in-flight send.
    Urgent,
}

enum Payload {
    Memory(Bytes),
    File {
        file: File,
        total: u64,
        file_sent: u64,
        chunk: Vec<u8>,
        chunk_sent: usize,
    },
}

/// A single outbound packet.
pub struct Packet {
    payload: Payload,
    sent: usize,
    urgency: Urgency,
}

impl Packet {
    #[must_use]
    pub fn copied(data: &[u8], urgency: Urgency) -> Self {
        Self {
            payload: Payload::Memory(Bytes::copy_from_slice(data)),
            sent: 0,
            urgency,
        }
    }

    #[must_use]
    pub fn moved(data: Vec<u8>, urgency: Urgency) -> Self {
        Self {
            payload: Payload::Memory(Bytes::from(data)),
            sent: 0,
            urgency,
        }
    }

    /// Build a file packet. `len` is the number of bytes to send, starting
    /// from the file's current position.
    #[must_use]
    pub fn file(file: File, len: u64) -> Self {
        Self {
            payload: Payload::File {
                file,
                total: len,
                file_sent: 0,
                chunk: Vec::new(),
                chunk_sent: 0,
            },
            sent: 0,
            urgency: Urgency::Normal,
        }
    }

    fn is_in_flight(&self) -> bool {
        self.sent > 0
    }

    fn is_done(&self) -> bool {
        match &self.payload {
            Payload::Memory(b) => self.sent >= b.len(),
            Payload::File {
                total, file_sent, ..
            } => *file_sent >= *total && self.sent >= *total as usize,
        }
    }

    /// Return the next slice of bytes ready to hand to the write hook,
    /// refilling the in-memory chunk from disk for file packets as needed.
    fn next_chunk(&mut self) -> io::Result<&[u8]> {
        match &mut self.payload {
            Payload::Memory(b) => Ok(&b[self.sent..]),
            Payload::File {
                file,
                total,
                file_sent,
                chunk,
                chunk_sent,
            } => {
                if *chunk_sent >= chunk.len() && *file_sent < *total {
                    let want = SENDFILE_CHUNK.min((*total - *file_sent) as usize);
                    chunk.resize(want, 0);
                    let n = file.read(&mut chunk[..])?;
                    chunk.truncate(n);
                    *chunk_sent = 0;
                    *file_sent += n as u64;
                }
                Ok(&chunk[*chunk_sent..])
            }
        }
    }

    fn advance(&mut self, n: usize) {
        self.sent += n;
        if let Payload::File { chunk_sent, .. } = &mut self.payload {
            *chunk_sent += n;
        }
    }
}

/// Outcome of a single drain pass.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue is now empty.
    Empty,
    /// Progress was made but the hook signalled backpressure (`n == 0`).
    WouldBlock,
    /// The hook reported a fatal error (`n < 0`); the connection must close.
    Fatal,
}

/// The per-connection outbound packet queue.
#[derive(Default)]
pub struct WriteBuffer {
    queue: VecDeque<Packet>,
}

impl WriteBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueue `packet`, honoring its urgency class.
    pub fn push(&mut self, packet: Packet) {
        match packet.urgency {
            Urgency::Normal => self.queue.push_back(packet),
            Urgency::Urgent => {
                let mut insert_at = match self.queue.front() {
                    Some(front) if front.is_in_flight() => 1,
                    _ => 0,
                };
                // Skip past any not-yet-sent urgent packets already queued
                // so consecutive urgent pushes stay FIFO among themselves,
                // instead of each landing ahead of the last.
                while self.queue.get(insert_at).map(|p| p.urgency) == Some(Urgency::Urgent) {
                    insert_at += 1;
                }
                self.queue.insert(insert_at, packet);
            }
        }
    }

    /// Drain as much as possible without blocking, using `hook` to perform
    /// each write. Fully-sent packets are popped and dropped (freeing or
    /// closing their payload via `Drop`).
    pub fn drain(&mut self, stream: &mut mio::net::TcpStream, hook: &mut dyn WriteHook) -> DrainOutcome {
        loop {
            let Some(packet) = self.queue.front_mut() else {
                return DrainOutcome::Empty;
            };

            let chunk = match packet.next_chunk() {
                Ok(chunk) => chunk,
                Err(_) => return DrainOutcome::Fatal,
            };

            if chunk.is_empty() {
                if packet.is_done() {
                    self.queue.pop_front();
                    continue;
                }
                // File packet momentarily has nothing buffered but isn't
                // done (shouldn't happen outside of a zero-length file);
                // treat as blocked rather than spinning.
                return DrainOutcome::WouldBlock;
            }

            let n = hook.write(stream, chunk);
            if n > 0 {
                #[allow(clippy::cast_sign_loss)]
                packet.advance(n as usize);
                if packet.is_done() {
                    self.queue.pop_front();
                }
                continue;
            } else if n == 0 {
                return DrainOutcome::WouldBlock;
            } else {
                return DrainOutcome::Fatal;
            }
        }
    }
}
