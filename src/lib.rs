//! Multi-threaded, non-blocking TCP server framework.
//!
//! eddy runs one [`EventLoop`] per thread: a base loop accepts connections
//! and hands each one, round-robin, to a worker loop that owns it for its
//! whole life. Readiness (epoll, level-triggered) is translated into user
//! callbacks; writes go straight to the socket when possible and spill into
//! a per-connection output buffer with high-water-mark backpressure
//! otherwise.
//!
//! The user-facing surface is [`TcpServer`] plus the callbacks it accepts;
//! every callback for a given connection runs on that connection's worker
//! loop, so handler code needs no synchronization of its own.
//!
//! ```no_run
//! use eddy::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let base = EventLoop::new()?;
//!     let server = TcpServer::new(&base, "0.0.0.0:7000".parse().unwrap(), "echo", false)?;
//!     server.set_thread_num(2);
//!     server.set_message_callback(|conn, input, _ts| {
//!         let data = input.take();
//!         conn.send(&data);
//!     });
//!     server.start()?;
//!     base.run();
//!     Ok(())
//! }
//! ```
//!
//! Thread discipline is asserted, not inferred: loop-affine operations
//! panic when called from the wrong thread. The only thread-safe entry
//! points are [`EventLoop::run_in_loop`], [`EventLoop::queue_in_loop`],
//! [`EventLoop::wakeup`], [`EventLoop::quit`], and the connection's
//! [`send`](TcpConnection::send)/[`shutdown`](TcpConnection::shutdown)/
//! [`force_close`](TcpConnection::force_close).

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("eddy requires epoll, eventfd and accept4 (Linux/Android)");

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod channel;
mod connection;
mod event_loop;
mod interest;
mod loop_pool;
mod net;
mod poller;
mod server;
mod timestamp;

pub use buffer::Buffer;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use event_loop::EventLoop;
pub use interest::Interest;
pub use loop_pool::{LoopThread, LoopThreadPool, ThreadInitCallback};
pub use server::TcpServer;
pub use timestamp::Timestamp;
