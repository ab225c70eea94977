//! Echo server: everything a connection sends comes straight back.
//!
//! ```text
//! cargo run --example echo -- 7000
//! ncat 127.0.0.1 7000
//! ```

use std::env;
use std::io;

use eddy::{EventLoop, TcpServer};
use log::info;

fn main() -> io::Result<()> {
    env_logger::init();

    let port: u16 = env::args()
        .nth(1)
        .map(|arg| arg.parse().expect("port must be a number"))
        .unwrap_or(7000);
    let addr = format!("0.0.0.0:{}", port).parse().unwrap();

    let base = EventLoop::new()?;
    let server = TcpServer::new(&base, addr, "echo", false)?;
    server.set_thread_num(num_cpus::get());
    server.set_connection_callback(|conn| {
        if conn.connected() {
            info!("{} up, peer {}", conn.name(), conn.peer_addr());
        } else {
            info!("{} down", conn.name());
        }
    });
    server.set_message_callback(|conn, input, _ts| {
        let data = input.take();
        conn.send(&data);
    });
    server.start()?;

    base.run();
    Ok(())
}
