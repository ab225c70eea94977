use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::Socket;

pub(crate) type NewConnectionHandler = Box<dyn FnMut(Socket, SocketAddr) + Send>;

/// Turns readiness on a listening socket into accepted connections.
///
/// Lives on the base loop. One descriptor (`/dev/null`, read-only) is held
/// in reserve: when the process runs out of descriptors, the reserve is
/// released so the pending connection can be accepted and immediately
/// closed, which advances the kernel backlog instead of busy-looping on a
/// connection that can never be accepted.
pub(crate) struct Acceptor {
    event_loop: EventLoop,
    socket: Socket,
    channel: Arc<Channel>,
    on_connection: Mutex<Option<NewConnectionHandler>>,
    listening: AtomicBool,
    idle_fd: Mutex<Option<File>>,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: &EventLoop,
        listen_addr: &SocketAddr,
        reuseport: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let family = if listen_addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let socket = Socket::new_stream(family)?;
        socket.set_reuseaddr(true)?;
        if reuseport {
            socket.set_reuseport(true)?;
        }
        socket.bind(listen_addr)?;
        let idle_fd = File::open("/dev/null")?;

        let channel = Channel::new(event_loop, socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            socket,
            channel,
            on_connection: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_handler(move |_ts| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_handler(
        &self,
        handler: impl FnMut(Socket, SocketAddr) + Send + 'static,
    ) {
        *self.on_connection.lock().unwrap() = Some(Box::new(handler));
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Starts listening and arms the read side. Loop thread only.
    pub(crate) fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.socket.listen()?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        if let Ok(addr) = self.socket.local_addr() {
            info!("listening on {}", addr);
        }
        Ok(())
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    let mut handler = self.on_connection.lock().unwrap();
                    match handler.as_mut() {
                        Some(on_connection) => on_connection(socket, peer),
                        // Nobody to hand the connection to; dropping the
                        // socket closes it.
                        None => drop(socket),
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.raw_os_error() == Some(libc::EMFILE) => {
                    error!("accept: process out of file descriptors");
                    self.shed_one_connection();
                }
                Err(ref err) if is_transient_accept_error(err) => {
                    warn!("accept failed transiently: {}", err);
                }
                Err(err) => {
                    error!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    /// The EMFILE mitigation: close the reserve, accept the pending
    /// connection, close it, take the reserve back.
    fn shed_one_connection(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        let _ = idle.take();
        match syscall!(accept(
            self.socket.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )) {
            Ok(fd) => {
                let _ = syscall!(close(fd));
            }
            Err(err) => warn!("accept while shedding load failed: {}", err),
        }
        match File::open("/dev/null") {
            Ok(file) => *idle = Some(file),
            Err(err) => error!("could not re-reserve idle fd: {}", err),
        }
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::ECONNABORTED) | Some(libc::EPROTO) | Some(libc::EPERM)
    )
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // The server owning this acceptor may be dropped off the base loop;
        // detach through the any-thread path.
        self.event_loop.deregister_channel(&self.channel);
    }
}
