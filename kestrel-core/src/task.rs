//! The task dispatcher (§4.F): a small worker pool plus the
//! `run_async`/`fd_task`/`each`/`each_block`/`run_after`/`run_every`
//! scheduling primitives built on top of it.
//!
//! Jobs are boxed closures over `&Server<U>`, queued on a `flume`
//! channel and picked up by a fixed pool of worker threads — the same
//! bounded-queue, fixed-pool shape the teacher uses for its actor
//! channels, just carrying `FnOnce` jobs instead of protocol commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{trace, warn};

use crate::protocol::BusyGuard;
use crate::server::Server;
use crate::Fd;

type Job<U> = Box<dyn FnOnce(&Server<U>) + Send>;
type TaskFn<U> = Box<dyn FnOnce(&Server<U>, Fd) + Send>;
type FallbackFn<U> = Box<dyn FnOnce(&Server<U>) + Send>;

/// A fixed-size pool of worker threads draining a shared job queue.
///
/// Workers are detached, not joined: each holds its own `Arc<Server<U>>`
/// clone for the life of the process (the same reference the reactor thread
/// holds), so nothing ever drops the queue's last `Sender` while the
/// process runs. They exit only when the process does — acceptable for a
/// core with no "undeploy a single server and keep the process alive"
/// requirement (§5: no preemption, no requirement to reclaim worker threads
/// short of process exit).
pub(crate) struct TaskDispatcher<U> {
    tx: Sender<Job<U>>,
}

impl<U: Send + Sync + 'static> TaskDispatcher<U> {
    pub fn new(workers: usize, server: Arc<Server<U>>) -> Self {
        let (tx, rx): (Sender<Job<U>>, Receiver<Job<U>>) = flume::unbounded();
        for idx in 0..workers.max(1) {
            let rx = rx.clone();
            let server = server.clone();
            thread::Builder::new()
                .name(format!("kestrel-worker-{idx}"))
                .spawn(move || {
                    if let Some(on_init) = server.settings().on_init_thread.clone() {
                        on_init(&server);
                    }
                    while let Ok(job) = rx.recv() {
                        job(&server);
                    }
                })
                .expect("failed to spawn worker thread");
        }
        Self { tx }
    }

    pub fn submit(&self, job: Job<U>) {
        if self.tx.send(job).is_err() {
            warn!("task dispatcher queue closed, dropping job");
        }
    }
}

/// Schedule `f` to run once on a worker thread.
pub(crate) fn run_async<U: Send + Sync + 'static>(
    dispatcher: &TaskDispatcher<U>,
    f: impl FnOnce(&Server<U>) + Send + 'static,
) {
    dispatcher.submit(Box::new(f));
}

/// Schedule `task` to run with exclusive (busy-flag-guarded) access to
/// `fd`. If `fd` is no longer active by the time a worker picks the job
/// up, `fallback` runs instead (if provided) — mirrors the original's
/// "fd may have closed while the task was queued" contract. A fd that is
/// merely *busy* (another callback mid-flight on it) is not the same as
/// inactive: the job requeues itself onto the worker pool and waits its
/// turn rather than giving up to `fallback`.
pub(crate) fn fd_task<U: Send + Sync + 'static>(
    dispatcher: &TaskDispatcher<U>,
    fd: Fd,
    task: impl FnOnce(&Server<U>, Fd) + Send + 'static,
    fallback: Option<impl FnOnce(&Server<U>) + Send + 'static>,
) {
    dispatcher.submit(make_fd_task_job(
        fd,
        Box::new(task),
        fallback.map(|f| Box::new(f) as FallbackFn<U>),
    ));
}

fn make_fd_task_job<U: Send + Sync + 'static>(fd: Fd, task: TaskFn<U>, fallback: Option<FallbackFn<U>>) -> Job<U> {
    Box::new(move |server: &Server<U>| {
        if !server.table().is_active(fd) {
            trace!(fd, "fd_task fallback: connection closed before dispatch");
            if let Some(fallback) = fallback {
                fallback(server);
            }
            return;
        }
        let Some(busy) = server.table().busy_flag(fd) else {
            if let Some(fallback) = fallback {
                fallback(server);
            }
            return;
        };
        match BusyGuard::try_acquire(busy) {
            Some(_guard) => task(server, fd),
            None => {
                trace!(fd, "fd_task requeued: connection busy");
                server.dispatcher_inner().submit(make_fd_task_job(fd, task, fallback));
            }
        }
    })
}

/// Fire `task` for every connection whose protocol service matches
/// `service` (`None` matches all), then run `on_finish` once every
/// instance has completed. `origin_fd` is the fd `each` was invoked on
/// behalf of (the connection driving the fan-out, if any) and is handed
/// back to `on_finish` unchanged, mirroring the original's `on_finish`
/// receiving the originating fd.
pub(crate) fn each<U: Send + Sync + 'static>(
    dispatcher: &TaskDispatcher<U>,
    origin_fd: Fd,
    service: Option<String>,
    task: Arc<dyn Fn(&Server<U>, Fd) + Send + Sync>,
    on_finish: Option<impl FnOnce(&Server<U>, Fd) + Send + Sync + 'static>,
) {
    let task_for_count = task.clone();
    dispatcher.submit(Box::new(move |server: &Server<U>| {
        // Resolved lazily inside the job so the fan-out always reflects the
        // table at execution time, not at schedule time.
        let targets = server.table().fds_for_service(service.as_deref());
        if targets.is_empty() {
            if let Some(on_finish) = on_finish {
                on_finish(server, origin_fd);
            }
            return;
        }
        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(targets.len()));
        let on_finish = on_finish.map(Arc::new);
        for fd in targets {
            let task = task_for_count.clone();
            let remaining = remaining.clone();
            let on_finish = on_finish.clone();
            server.dispatcher_inner().submit(Box::new(move |server: &Server<U>| {
                if server.table().is_active(fd) {
                    task(server, fd);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(on_finish_arc) = on_finish {
                        if let Ok(f) = Arc::try_unwrap(on_finish_arc) {
                            f(server, origin_fd);
                        }
                    }
                }
            }));
        }
    }));
}

/// Synchronous counterpart to [`each`]: blocks the calling thread until
/// every matching connection's task has completed, then calls
/// `on_finish` inline before returning.
pub(crate) fn each_block<U: Send + Sync + 'static>(
    dispatcher: &TaskDispatcher<U>,
    server: &Server<U>,
    service: Option<&str>,
    task: impl Fn(&Server<U>, Fd) + Send + Sync + 'static,
) {
    let targets = server.table().fds_for_service(service);
    if targets.is_empty() {
        return;
    }
    let barrier = Arc::new(Barrier::new(targets.len() + 1));
    let task = Arc::new(task);
    for fd in targets {
        let task = task.clone();
        let barrier = barrier.clone();
        dispatcher.submit(Box::new(move |server: &Server<U>| {
            if server.table().is_active(fd) {
                task(server, fd);
            }
            barrier.wait();
        }));
    }
    barrier.wait();
}

/// Run `f` once after `delay`, on a worker thread.
pub(crate) fn run_after<U: Send + Sync + 'static>(
    dispatcher_tx: Sender<Job<U>>,
    delay: Duration,
    f: impl FnOnce(&Server<U>) + Send + 'static,
) {
    thread::spawn(move || {
        thread::sleep(delay);
        let _ = dispatcher_tx.send(Box::new(f));
    });
}

/// Run `f` every `interval` until `stop` is set, on worker threads.
pub(crate) fn run_every<U: Send + Sync + 'static>(
    dispatcher_tx: Sender<Job<U>>,
    interval: Duration,
    stop: Arc<AtomicBool>,
    f: impl Fn(&Server<U>) + Send + Sync + 'static,
) {
    let f = Arc::new(f);
    thread::spawn(move || {
        while !stop.load(Ordering::Acquire) {
            thread::sleep(interval);
            if stop.load(Ordering::Acquire) {
                break;
            }
            let f = f.clone();
            if dispatcher_tx.send(Box::new(move |server: &Server<U>| f(server))).is_err() {
                break;
            }
        }
    });
}

pub(crate) fn sender<U: Send + Sync + 'static>(dispatcher: &TaskDispatcher<U>) -> Sender<Job<U>> {
    dispatcher.tx.clone()
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::AtomicUsize;

    use crate::protocol::{BusyGuard, Protocol};
    use crate::settings::ServerSettings;

    use super::*;

    struct NoOp;
    impl Protocol<()> for NoOp {
        fn on_data(&self, _server: &Server<()>, _fd: Fd) {}
    }

    // Reach the accepted connection's fd and the live `&Server<()>` by
    // capturing both through `on_tick`, the same technique the S5
    // integration test (`tests/server.rs`) uses for `each`.
    fn accepted_fd(server: &Server<()>) -> Option<Fd> {
        server.table().active_fds().into_iter().next()
    }

    #[test]
    fn fd_task_requeues_while_busy_instead_of_falling_back() {
        let ran = Arc::new(AtomicUsize::new(0));
        let fell_back = Arc::new(AtomicUsize::new(0));

        let port = portpicker::pick_unused_port().expect("no free port");
        let ran_tick = ran.clone();
        let fell_back_tick = fell_back.clone();
        let scheduled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        // Stop only this test's server from within its own `on_tick`,
        // rather than the process-wide `stop_all`, so this test can't race
        // other tests' servers running concurrently in the same binary.
        let should_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let should_stop_tick = should_stop.clone();
        let settings = ServerSettings::new(Arc::new(NoOp) as Arc<dyn Protocol<()>>)
            .with_port(port)
            .with_threads(2)
            .with_on_tick(move |server: &Server<()>| {
                if should_stop_tick.load(Ordering::SeqCst) {
                    server.stop();
                    return;
                }
                let Some(fd) = accepted_fd(server) else {
                    return;
                };
                if scheduled.swap(true, Ordering::SeqCst) {
                    return;
                }
                // Hold the busy flag from here (the reactor thread) so the
                // first fd_task job a worker picks up finds it contended.
                let busy = server.table().busy_flag(fd).expect("fd registered");
                let guard = BusyGuard::try_acquire(busy).expect("fd not yet busy");
                let ran = ran_tick.clone();
                let ran_for_task = ran.clone();
                let fell_back = fell_back_tick.clone();
                server.fd_task(
                    fd,
                    move |_server: &Server<()>, _fd: Fd| {
                        ran_for_task.fetch_add(1, Ordering::SeqCst);
                    },
                    Some(move |_server: &Server<()>| {
                        fell_back.fetch_add(1, Ordering::SeqCst);
                    }),
                );
                // Give a worker a chance to observe contention and requeue
                // at least once before releasing the flag.
                std::thread::sleep(Duration::from_millis(50));
                assert_eq!(ran.load(Ordering::SeqCst), 0, "task must not run while fd is busy");
                drop(guard);
            });
        let handle = std::thread::spawn(move || Server::listen(settings));
        std::thread::sleep(Duration::from_millis(150));

        let _conn = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(400));

        assert_eq!(ran.load(Ordering::SeqCst), 1, "requeued task should eventually run");
        assert_eq!(fell_back.load(Ordering::SeqCst), 0, "fallback must not run for a merely-busy fd");

        should_stop.store(true, Ordering::SeqCst);
        let _ = handle.join().unwrap();
    }

    #[test]
    fn fd_task_falls_back_when_fd_closed_before_dispatch() {
        let ran = Arc::new(AtomicUsize::new(0));
        let fell_back = Arc::new(AtomicUsize::new(0));
        let scheduled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let should_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let (port, handle) = {
            let ran_tick = ran.clone();
            let fell_back_tick = fell_back.clone();
            let should_stop_tick = should_stop.clone();
            let port = portpicker::pick_unused_port().expect("no free port");
            let settings = ServerSettings::new(Arc::new(NoOp) as Arc<dyn Protocol<()>>)
                .with_port(port)
                .with_threads(1)
                .with_on_tick(move |server: &Server<()>| {
                    if should_stop_tick.load(Ordering::SeqCst) {
                        server.stop();
                        return;
                    }
                    let Some(fd) = accepted_fd(server) else {
                        return;
                    };
                    if scheduled.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    // Close before scheduling so the job is guaranteed to
                    // find the fd already inactive on first dispatch,
                    // rather than racing the worker pool for it.
                    server.close(fd);
                    let ran = ran_tick.clone();
                    let fell_back = fell_back_tick.clone();
                    server.fd_task(
                        fd,
                        move |_server: &Server<()>, _fd: Fd| {
                            ran.fetch_add(1, Ordering::SeqCst);
                        },
                        Some(move |_server: &Server<()>| {
                            fell_back.fetch_add(1, Ordering::SeqCst);
                        }),
                    );
                });
            let handle = std::thread::spawn(move || Server::listen(settings));
            std::thread::sleep(Duration::from_millis(150));
            (port, handle)
        };

        let conn = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        drop(conn);

        assert_eq!(ran.load(Ordering::SeqCst), 0, "task must never run once the fd is closed");
        assert_eq!(fell_back.load(Ordering::SeqCst), 1, "fallback must run exactly once");

        should_stop.store(true, Ordering::SeqCst);
        let _ = handle.join().unwrap();
    }
}
