//! Minimal HTTP-ish responder, showing how a request handler plugs into the
//! framework as a message callback. There is deliberately no request
//! parsing here; protocol handling stays outside the core.

use std::io;

use eddy::{EventLoop, TcpServer};

const BODY: &str = "Hello from eddy!\n";

fn main() -> io::Result<()> {
    env_logger::init();

    let base = EventLoop::new()?;
    let server = TcpServer::new(&base, "0.0.0.0:8080".parse().unwrap(), "hello-http", false)?;
    server.set_thread_num(num_cpus::get());
    server.set_message_callback(|conn, input, _ts| {
        input.retrieve_all();
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            BODY.len(),
            BODY
        );
        conn.send(response.as_bytes());
        conn.shutdown();
    });
    server.start()?;

    base.run();
    Ok(())
}
