// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use eddy::{EventLoop, TcpServer};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A server on an ephemeral loopback port, with its base loop running on a
/// dedicated thread. Dropping it quits the base loop, which tears the
/// server (and its worker pool) down.
pub struct TestServer {
    pub addr: SocketAddr,
    pub base: EventLoop,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(workers: usize, configure: impl FnOnce(&TcpServer) + Send + 'static) -> TestServer {
        init();

        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let base = EventLoop::new().expect("unable to create base loop");
            let server = TcpServer::new(
                &base,
                "127.0.0.1:0".parse().unwrap(),
                "test",
                false,
            )
            .expect("unable to create server");
            server.set_thread_num(workers);
            configure(&server);
            server.start().expect("unable to start server");
            let addr = server.local_addr().expect("unable to get listen address");

            tx.send((addr, base.clone())).expect("publishing server failed");
            base.run();
            // `server` drops here, on the base loop thread.
        });

        let (addr, base) = rx.recv().expect("server did not start");
        TestServer {
            addr,
            base,
            thread: Some(thread),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.base.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
