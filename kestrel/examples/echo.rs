//! A minimal echo server: everything a connection sends is written back
//! verbatim. Run with `cargo run -p kestrel --example echo`, then
//! `nc 127.0.0.1 9000`.

use std::sync::Arc;

use kestrel::{Fd, Protocol, Server, ServerSettings};

struct Echo;

impl Protocol<()> for Echo {
    fn on_open(&self, _server: &Server<()>, fd: Fd) {
        tracing::info!(fd, "connection opened");
    }

    fn on_data(&self, server: &Server<()>, fd: Fd) {
        let mut buf = [0u8; 4096];
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

    fn on_close(&self, _server: &Server<()>, fd: Fd) {
        tracing::info!(fd, "connection closed");
    }
}

fn main() {
    kestrel::dev_tracing::init_tracing();
    let settings = ServerSettings::new(Arc::new(Echo) as Arc<dyn Protocol<()>>).with_port(9000);
    if let Err(e) = Server::listen(settings) {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}
