use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::loop_pool::{LoopThreadPool, ThreadInitCallback};
use crate::net::Socket;

/// TCP server facade: an acceptor on the base loop, a pool of worker
/// loops, and the registry of live connections.
///
/// All callbacks run on the worker loop owning the respective connection.
/// The registry maps connection names to strong references and is mutated
/// only from the base loop thread; a connection's close therefore bounces
/// from its worker loop back to the base loop before the entry disappears.
///
/// ```no_run
/// use eddy::{EventLoop, TcpServer};
///
/// fn main() -> std::io::Result<()> {
///     let base = EventLoop::new()?;
///     let server = TcpServer::new(&base, "127.0.0.1:7000".parse().unwrap(), "echo", false)?;
///     server.set_thread_num(4);
///     server.set_message_callback(|conn, input, _ts| {
///         let data = input.take();
///         conn.send(&data);
///     });
///     server.start()?;
///     base.run();
///     Ok(())
/// }
/// ```
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base: EventLoop,
    name: String,
    listen_addr: SocketAddr,
    weak_self: Weak<ServerInner>,
    acceptor: Arc<Acceptor>,
    pool: LoopThreadPool,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    // Zero means "leave the connection default alone".
    high_water_mark: AtomicUsize,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
}

impl TcpServer {
    /// Binds `listen_addr` (with `SO_REUSEADDR`; `SO_REUSEPORT` when
    /// `reuseport` is set) and wires the acceptor onto `base`. Nothing is
    /// accepted until [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn new(
        base: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuseport: bool,
    ) -> io::Result<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(base, &listen_addr, reuseport)?;
        let pool = LoopThreadPool::new(base, name.clone());

        let inner = Arc::new_cyclic(|weak_self| ServerInner {
            base: base.clone(),
            name,
            listen_addr,
            weak_self: weak_self.clone(),
            acceptor,
            pool,
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            high_water_mark: AtomicUsize::new(0),
            thread_init_cb: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.acceptor.set_new_connection_handler(move |socket, peer| {
            if let Some(inner) = weak.upgrade() {
                inner.new_connection(socket, peer);
            }
        });

        Ok(TcpServer { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The actual listening address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    /// Number of worker loops. Zero (the default) serves every connection
    /// on the base loop. Must be called before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_thread_num(&self, num_threads: usize) {
        self.inner.pool.set_thread_num(num_threads);
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.inner.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut crate::Buffer, crate::Timestamp) + Send + Sync + 'static,
    ) {
        *self.inner.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.inner.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Also see [`set_high_water_mark`]; without it connections keep their
    /// 64 MiB default threshold.
    ///
    /// [`set_high_water_mark`]: TcpServer::set_high_water_mark
    pub fn set_high_water_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        *self.inner.high_water_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.inner.high_water_mark.store(bytes, Ordering::Release);
    }

    /// Runs once on every worker loop right after it is created, before it
    /// polls.
    pub fn set_thread_init_callback(&self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        *self.inner.thread_init_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Spawns the worker pool and starts listening. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner
            .pool
            .start(self.inner.thread_init_cb.lock().unwrap().clone())?;

        debug_assert!(!self.inner.acceptor.listening());
        let acceptor = Arc::clone(&self.inner.acceptor);
        self.inner.base.run_in_loop(move || {
            if let Err(err) = acceptor.listen() {
                error!("listen failed: {}", err);
            }
        });
        Ok(())
    }
}

impl ServerInner {
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.base.assert_in_loop_thread();

        let io_loop = self.pool.get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn_name = format!("{}#{}", self.name, id);
        info!(
            "[{}] new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        // The original reused the listen address here; the accepted socket
        // knows better.
        let local_addr = socket.local_addr().unwrap_or(self.listen_addr);
        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&conn));

        conn.set_connection_callback(self.connection_cb.lock().unwrap().clone());
        conn.set_message_callback(self.message_cb.lock().unwrap().clone());
        conn.set_write_complete_callback(self.write_complete_cb.lock().unwrap().clone());
        conn.set_high_water_callback(self.high_water_cb.lock().unwrap().clone());
        let mark = self.high_water_mark.load(Ordering::Acquire);
        if mark != 0 {
            conn.set_high_water_mark(mark);
        }

        let weak = self.weak_self.clone();
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection(conn);
            }
        }));

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Runs on whichever worker loop closed the connection; registry
    /// mutation belongs to the base loop, so bounce there.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let weak = self.weak_self.clone();
        let conn = Arc::clone(conn);
        self.base.run_in_loop(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection_in_loop(&conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.base.assert_in_loop_thread();
        info!("[{}] removing connection [{}]", self.name, conn.name());
        let removed = self.connections.lock().unwrap().remove(conn.name());
        debug_assert!(removed.is_some());

        let io_loop = conn.owner_loop().clone();
        let conn = Arc::clone(conn);
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        debug!("TcpServer [{}] shutting down", self.name);
        let conns: Vec<_> = self
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in conns {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
        // The pool drops after this body: each worker's quit is queued
        // behind the destroy tasks above, then the threads are joined.
    }
}
