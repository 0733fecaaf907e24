//! End-to-end tests driving `Server` over real loopback TCP connections.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kestrel_core::prelude::*;

fn spawn_server<U: Send + Sync + 'static>(settings: ServerSettings<U>) -> u16 {
    let port = settings.port;
    thread::spawn(move || {
        let _ = Server::listen(settings);
    });
    thread::sleep(Duration::from_millis(150));
    port
}

struct Echo;

impl Protocol<()> for Echo {
    fn on_data(&self, server: &Server<()>, fd: Fd) {
        let mut buf = [0u8; 1024];
        loop {
            match server.read(fd, &mut buf) {
                n if n > 0 => {
                    #[allow(clippy::cast_sign_loss)]
                    server.write(fd, &buf[..n as usize]);
                }
                0 => break,
                _ => {
                    server.close(fd);
                    break;
                }
            }
        }
    }
}

#[test]
fn s1_echo_roundtrip() {
    let port = portpicker::pick_unused_port().expect("no free port");
    let settings = ServerSettings::new(Arc::new(Echo) as Arc<dyn Protocol<()>>).with_port(port);
    spawn_server(settings);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"hello kestrel").unwrap();
    let mut buf = [0u8; 32];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello kestrel");
}

/// Queues a large "normal" write immediately followed by a one-byte
/// "urgent" write the moment a connection opens, then closes once the
/// write buffer has fully drained — used to observe urgency ordering from
/// outside the server over a real socket.
struct UrgentOrdering {
    payload_len: usize,
}

impl Protocol<()> for UrgentOrdering {
    fn on_open(&self, server: &Server<()>, fd: Fd) {
        let payload = vec![b'A'; self.payload_len];
        server.write(fd, &payload);
        server.write_urgent(fd, b"!");
    }

    fn on_data(&self, _server: &Server<()>, _fd: Fd) {}

    fn on_ready(&self, server: &Server<()>, fd: Fd) {
        server.close(fd);
    }
}

#[test]
fn s2_urgent_packet_preempts_pending_normal_write() {
    const PAYLOAD_LEN: usize = 4 * 1024 * 1024;

    let port = portpicker::pick_unused_port().expect("no free port");
    let settings = ServerSettings::new(Arc::new(UrgentOrdering {
        payload_len: PAYLOAD_LEN,
    }) as Arc<dyn Protocol<()>>)
    .with_port(port);
    spawn_server(settings);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let mut received = Vec::with_capacity(PAYLOAD_LEN + 1);
    let mut buf = [0u8; 65536];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e) => panic!("read error before connection closed: {e}"),
        }
    }

    // The urgent byte must never land ahead of bytes from the normal write
    // that were already queued (or in flight) before it was pushed: the
    // whole of A, uninterrupted, then "!".
    assert_eq!(received.len(), PAYLOAD_LEN + 1);
    assert!(received[..PAYLOAD_LEN].iter().all(|&b| b == b'A'));
    assert_eq!(received[PAYLOAD_LEN], b'!');
}

/// Schedules an `fd_task` on a connection it has just closed — exercises
/// the "fd went inactive before dispatch" fallback path from outside the
/// server.
struct FdTaskFallbackOnClose {
    ran: Arc<AtomicUsize>,
    fell_back: Arc<AtomicUsize>,
}

impl Protocol<()> for FdTaskFallbackOnClose {
    fn on_open(&self, server: &Server<()>, fd: Fd) {
        server.close(fd);
        let ran = self.ran.clone();
        let fell_back = self.fell_back.clone();
        server.fd_task(
            fd,
            move |_server: &Server<()>, _fd: Fd| {
                ran.fetch_add(1, Ordering::SeqCst);
            },
            Some(move |_server: &Server<()>| {
                fell_back.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    fn on_data(&self, _server: &Server<()>, _fd: Fd) {}
}

#[test]
fn s4_fd_task_falls_back_when_fd_closes_before_dispatch() {
    let ran = Arc::new(AtomicUsize::new(0));
    let fell_back = Arc::new(AtomicUsize::new(0));

    let port = portpicker::pick_unused_port().expect("no free port");
    let settings = ServerSettings::new(Arc::new(FdTaskFallbackOnClose {
        ran: ran.clone(),
        fell_back: fell_back.clone(),
    }) as Arc<dyn Protocol<()>>)
    .with_port(port);
    spawn_server(settings);

    let _conn = TcpStream::connect(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(ran.load(Ordering::SeqCst), 0, "task must never run once the fd is closed");
    assert_eq!(fell_back.load(Ordering::SeqCst), 1, "fallback must run exactly once");
}

struct Pinger {
    pinged: Arc<AtomicUsize>,
}

impl Protocol<()> for Pinger {
    fn on_data(&self, _server: &Server<()>, _fd: Fd) {}

    fn ping(&self, server: &Server<()>, fd: Fd) {
        self.pinged.fetch_add(1, Ordering::SeqCst);
        server.close(fd);
    }
}

#[test]
fn s3_idle_timeout_triggers_ping() {
    let pinged = Arc::new(AtomicUsize::new(0));
    let port = portpicker::pick_unused_port().expect("no free port");
    let settings = ServerSettings::new(Arc::new(Pinger {
        pinged: pinged.clone(),
    }) as Arc<dyn Protocol<()>>)
    .with_port(port)
    .with_timeout(1);
    spawn_server(settings);

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(1500));
    assert!(pinged.load(Ordering::SeqCst) >= 1);
    drop(stream);
}

struct Counter {
    fired: std::sync::atomic::AtomicBool,
}

impl Protocol<()> for Counter {
    fn service(&self) -> Option<&str> {
        Some("chat")
    }

    fn on_data(&self, _server: &Server<()>, _fd: Fd) {}
}

#[test]
fn s5_each_reaches_every_matching_connection() {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let port = portpicker::pick_unused_port().expect("no free port");
    let protocol = Arc::new(Counter {
        fired: std::sync::atomic::AtomicBool::new(false),
    });
    let hits_for_tick = hits.clone();
    let settings = ServerSettings::new(protocol.clone() as Arc<dyn Protocol<()>>)
        .with_port(port)
        .with_on_tick(move |server: &Server<()>| {
            if protocol.fired.swap(true, Ordering::SeqCst) || server.count() < 2 {
                return;
            }
            let hits = hits_for_tick.clone();
            server.each(
                -1,
                Some("chat".to_string()),
                Arc::new(move |_server: &Server<()>, fd: Fd| {
                    hits.lock().unwrap().push(fd);
                }),
                None::<fn(&Server<()>, Fd)>,
            );
        });
    spawn_server(settings);

    let _a = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let _b = TcpStream::connect(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(400));

    let seen = hits.lock().unwrap();
    assert_eq!(seen.len(), 2);
}

/// Writes a large buffer on open and records `on_shutdown`/`on_close`
/// invocations — used to verify S6's multi-connection graceful-stop
/// ordering (shutdown notified, buffers flushed, then closed, then
/// `on_finish`).
struct GracefulStop {
    payload_len: usize,
    shutdown_order: Arc<Mutex<Vec<Fd>>>,
    close_order: Arc<Mutex<Vec<Fd>>>,
}

impl Protocol<()> for GracefulStop {
    fn on_open(&self, server: &Server<()>, fd: Fd) {
        let payload = vec![b'x'; self.payload_len];
        server.write(fd, &payload);
    }

    fn on_data(&self, _server: &Server<()>, _fd: Fd) {}

    fn on_shutdown(&self, _server: &Server<()>, fd: Fd) {
        self.shutdown_order.lock().unwrap().push(fd);
    }

    fn on_close(&self, _server: &Server<()>, fd: Fd) {
        self.close_order.lock().unwrap().push(fd);
    }
}

#[test]
fn s6_graceful_stop_flushes_then_closes() {
    const CONNS: usize = 10;
    const PAYLOAD_LEN: usize = 1024 * 1024;

    let shutdown_order = Arc::new(Mutex::new(Vec::new()));
    let close_order = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicUsize::new(0));
    let should_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let port = portpicker::pick_unused_port().expect("no free port");
    let protocol = Arc::new(GracefulStop {
        payload_len: PAYLOAD_LEN,
        shutdown_order: shutdown_order.clone(),
        close_order: close_order.clone(),
    });
    let finished_for_settings = finished.clone();
    let should_stop_for_tick = should_stop.clone();
    let settings = ServerSettings::new(protocol as Arc<dyn Protocol<()>>)
        .with_port(port)
        .with_threads(2)
        .with_on_finish(move |_server: &Server<()>| {
            finished_for_settings.fetch_add(1, Ordering::SeqCst);
        })
        // Stop only this server, rather than `stop_all`, so this test
        // doesn't cut short the other integration tests' servers running
        // concurrently in the same test binary.
        .with_on_tick(move |server: &Server<()>| {
            if should_stop_for_tick.load(Ordering::SeqCst) {
                server.stop();
            }
        });
    let handle = thread::spawn(move || Server::listen(settings));
    thread::sleep(Duration::from_millis(150));

    let streams: Vec<TcpStream> = (0..CONNS)
        .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
        .collect();

    // Drain every connection concurrently so the server's bounded flush
    // window during graceful shutdown isn't starved by a slow reader.
    let readers: Vec<_> = streams
        .into_iter()
        .map(|mut stream| {
            thread::spawn(move || {
                stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
                let mut total = 0usize;
                let mut buf = [0u8; 65536];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => total += n,
                        Err(e) => panic!("read error: {e}"),
                    }
                }
                total
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(200));
    should_stop.store(true, Ordering::SeqCst);

    for reader in readers {
        assert_eq!(reader.join().unwrap(), PAYLOAD_LEN);
    }

    let result = handle.join().unwrap();
    assert!(result.is_ok());

    assert_eq!(shutdown_order.lock().unwrap().len(), CONNS);
    assert_eq!(close_order.lock().unwrap().len(), CONNS);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}
