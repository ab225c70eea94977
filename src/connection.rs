use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::Socket;
use crate::timestamp::Timestamp;

/// Fired on the transitions to Connected and to Disconnected; discriminate
/// with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired on every successful read, with the input buffer and receive time.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired each time the output buffer transitions from non-empty to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired on the rising edge of the output buffer crossing the high-water
/// mark, with the buffered size after the offending append.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal hook through which the server learns about closed connections.
pub(crate) type CloseCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

fn state_from(value: u8) -> State {
    match value {
        0 => State::Disconnected,
        1 => State::Connecting,
        2 => State::Connected,
        _ => State::Disconnecting,
    }
}

/// One accepted TCP connection, bound to a single worker loop.
///
/// Shared via `Arc`: the server registry holds one strong reference and
/// every in-flight loop task holds another for its own duration. All state
/// transitions, buffer access and user callbacks happen on the owning
/// worker loop; [`send`], [`shutdown`] and [`force_close`] may be called
/// from any thread and route themselves there.
///
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
/// [`force_close`]: TcpConnection::force_close
pub struct TcpConnection {
    event_loop: EventLoop,
    name: String,
    weak_self: Weak<TcpConnection>,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// Constructed by the server on the base loop; everything after
    /// [`connect_established`] happens on `event_loop`.
    ///
    /// [`connect_established`]: TcpConnection::connect_established
    pub(crate) fn new(
        event_loop: EventLoop,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let channel = Channel::new(&event_loop, socket.as_raw_fd());
        let conn = Arc::new_cyclic(|weak_self| TcpConnection {
            event_loop,
            name,
            weak_self: weak_self.clone(),
            state: AtomicU8::new(State::Disconnected as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        });
        debug!("TcpConnection::new [{}] fd={}", conn.name, conn.channel.fd());

        if let Err(err) = conn.socket.set_nodelay(true) {
            warn!("[{}] setting TCP_NODELAY failed: {}", conn.name, err);
        }
        conn.install_channel_handlers();
        conn
    }

    fn install_channel_handlers(&self) {
        // Handlers hold only weak references: the channel is owned by the
        // connection, so a strong capture would leak both. Upgrading at
        // dispatch also keeps the connection alive across the callback.
        let weak = self.weak_self.clone();
        self.channel.set_read_handler(move |ts| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(ts);
            }
        });
        let weak = self.weak_self.clone();
        self.channel.set_write_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = self.weak_self.clone();
        self.channel.set_close_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = self.weak_self.clone();
        self.channel.set_error_handler(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
    }

    /// The connection's name, `"<server>#<seq>"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The worker loop this connection lives on.
    pub fn owner_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Output-buffer size past which the high-water-mark callback fires.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Release);
    }

    /// Sends `data`, from any thread. On the owning loop the bytes go
    /// straight to the socket (spill to the output buffer); from other
    /// threads a copy-owning task is queued there.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.as_arc();
            let data = data.to_vec();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Half-closes the write side once the output buffer has drained.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.as_arc();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Tears the connection down without waiting for buffered output.
    pub fn force_close(&self) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let conn = self.as_arc();
            self.event_loop
                .queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    pub(crate) fn set_connection_callback(&self, cb: Option<ConnectionCallback>) {
        *self.connection_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_message_callback(&self, cb: Option<MessageCallback>) {
        *self.message_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_write_complete_callback(&self, cb: Option<WriteCompleteCallback>) {
        *self.write_complete_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_high_water_callback(&self, cb: Option<HighWaterMarkCallback>) {
        *self.high_water_cb.lock().unwrap() = cb;
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    /// First step of the lifecycle, run on the owning loop: arm reading and
    /// announce the connection.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        debug_assert!(state == State::Disconnected || state == State::Connecting);
        self.set_state(State::Connected);
        self.channel.enable_reading();

        let guard = self.as_arc();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            self.run_user_callback("connection", || cb(&guard));
        }
    }

    /// Last step of the lifecycle, run on the owning loop when the server
    /// lets go of the connection. Idempotent: a second call finds the state
    /// already Disconnected and the channel already gone from the poller.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();

            let guard = self.as_arc();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                self.run_user_callback("connection", || cb(&guard));
            }
        }
        if self.event_loop.has_channel(&self.channel) {
            self.event_loop.remove_channel(&self.channel);
        }
    }

    fn handle_read(&self, ts: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        let mut input = self.input.lock().unwrap();
        match input.read_from(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                // The close handler may already have run for this same
                // readiness (hangup plus read-half-close).
                if self.state() != State::Disconnected {
                    self.handle_close();
                }
            }
            Ok(n) => {
                trace!("[{}] read {} bytes", self.name, n);
                if let Some(cb) = self.message_cb.lock().unwrap().clone() {
                    let conn = self.as_arc();
                    self.run_user_callback("message", || cb(&conn, &mut input, ts));
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!("[{}] read failed: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("[{}] is down, no more writing", self.name);
            return;
        }
        let mut output = self.output.lock().unwrap();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.is_empty() {
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("[{}] write failed: {}", self.name, err),
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        debug!("[{}] closing, fd={} state={:?}", self.name, self.channel.fd(), state);
        debug_assert!(state == State::Connected || state == State::Disconnecting);
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        // Hold a strong self-reference: the close callback makes the server
        // drop its registry entry, and the callbacks must outlive that.
        let guard = self.as_arc();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            self.run_user_callback("connection", || cb(&guard));
        }
        if let Some(cb) = self.close_cb.lock().unwrap().as_ref() {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!("[{}] SO_ERROR = {}", self.name, err),
            Ok(None) => {}
            Err(err) => error!("[{}] getsockopt(SO_ERROR) failed: {}", self.name, err),
        }
    }

    /// The only code that touches the output buffer. Tries a direct write
    /// when nothing is queued ahead, buffers the remainder, arms the write
    /// side, and reports the high-water crossing computed against the
    /// pre-append size.
    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("[{}] disconnected, dropping {} bytes", self.name, data.len());
            return;
        }

        let mut output = self.output.lock().unwrap();
        let mut written = 0;
        let mut remaining = data.len();
        let mut fault = false;

        if !self.channel.is_writing() && output.is_empty() {
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    remaining -= n;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("[{}] write failed: {}", self.name, err);
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            // The peer is gone; buffering more is pointless.
                            fault = true;
                        }
                    }
                }
            }
        }

        debug_assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let old_len = output.len();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
                    let conn = self.as_arc();
                    let buffered = old_len + remaining;
                    self.event_loop.queue_in_loop(move || {
                        let guard = Arc::clone(&conn);
                        conn.run_user_callback("high-water-mark", || cb(&guard, buffered));
                    });
                }
            }
            output.append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("[{}] shutdown failed: {}", self.name, err);
            }
        }
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.handle_close();
        }
    }

    fn queue_write_complete(&self) {
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            let conn = self.as_arc();
            self.event_loop.queue_in_loop(move || {
                let guard = Arc::clone(&conn);
                conn.run_user_callback("write-complete", || cb(&guard));
            });
        }
    }

    /// A panicking user callback must not take the whole worker loop (and
    /// every other connection on it) down with it; invariant violations in
    /// the framework itself stay fatal because they panic outside this
    /// wrapper.
    fn run_user_callback(&self, what: &str, f: impl FnOnce()) {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!("[{}] {} callback panicked", self.name, what);
        }
    }

    fn state(&self) -> State {
        state_from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The stand-in for `shared_from_this`: any caller necessarily holds a
    /// strong reference, so the upgrade cannot fail outside of drop.
    fn as_arc(&self) -> Arc<TcpConnection> {
        self.weak_self
            .upgrade()
            .expect("connection used during drop")
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish()
    }
}
