use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::net::addr;

/// Owning handle over a socket file descriptor.
///
/// The descriptor is closed when the handle is dropped; ownership can be
/// moved but never copied.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec TCP stream socket of the given
    /// address family (`libc::AF_INET` or `libc::AF_INET6`).
    pub(crate) fn new_stream(family: libc::c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        // SAFETY: `socket(2)` returned a valid, otherwise unowned fd.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Takes ownership of an already-open descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be a valid open socket owned by nobody else.
    pub(crate) unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr::socket_addr(addr);
        syscall!(bind(
            self.fd.as_raw_fd(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        ))
        .map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), libc::SOMAXCONN)).map(|_| ())
    }

    /// Accepts one pending connection; the returned socket is non-blocking
    /// and close-on-exec, and the peer address is canonicalized (an
    /// IPv4-mapped IPv6 peer comes back as plain IPv4).
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        let socket = unsafe { Socket::from_raw_fd(fd) };
        let peer = addr::canonicalize(addr::to_socket_addr(&storage)?);
        Ok((socket, peer))
    }

    /// The locally bound address, via `getsockname(2)`.
    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd.as_raw_fd(),
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        ))?;
        addr::to_socket_addr(&storage)
    }

    /// Half-closes the write side; the peer observes end of stream once the
    /// in-flight data drains.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd.as_raw_fd(), libc::SHUT_WR)).map(|_| ())
    }

    /// Writes from `buf`, returning the number of bytes the kernel took.
    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        ))
        .map(|n| n as usize)
    }

    pub(crate) fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    pub(crate) fn set_reuseport(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on as libc::c_int)
    }

    pub(crate) fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    pub(crate) fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as libc::c_int)
    }

    /// Pending socket error, via `SO_ERROR` (reading clears it).
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut optval: libc::c_int = 0;
        let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        ))?;
        if optval == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(optval)))
        }
    }

    fn set_opt(&self, level: libc::c_int, name: libc::c_int, optval: libc::c_int) -> io::Result<()> {
        syscall!(setsockopt(
            self.fd.as_raw_fd(),
            level,
            name,
            &optval as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::Socket;
    use std::net::SocketAddr;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn bind_listen_accept_loopback() {
        let listener = Socket::new_stream(libc::AF_INET).expect("socket");
        listener.set_reuseaddr(true).expect("reuseaddr");
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&any).expect("bind");
        listener.listen().expect("listen");

        let addr = listener.local_addr().expect("local_addr");
        assert_ne!(addr.port(), 0);

        let client = std::net::TcpStream::connect(addr).expect("connect");
        // The listening socket is non-blocking; the handshake for a
        // loopback connect completes quickly, so retry briefly.
        let accepted = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        };
        assert_eq!(accepted.1, client.local_addr().unwrap());
        assert!(accepted.0.as_raw_fd() >= 0);
    }

    #[test]
    fn nodelay_and_keepalive() {
        let sock = Socket::new_stream(libc::AF_INET).expect("socket");
        sock.set_nodelay(true).expect("nodelay");
        sock.set_keepalive(true).expect("keepalive");
        assert!(sock.take_error().expect("so_error").is_none());
    }
}
