use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

/// Reserved space at the front of the buffer. Retrieval never shrinks the
/// allocation; compaction slides unread data back to this offset instead.
const RESERVED_HEAD: usize = 8;

/// Initial capacity of the data section.
const INITIAL_SIZE: usize = 1024;

/// Size of the stack extension used by [`Buffer::read_from`].
const EXTRA_BUF_SIZE: usize = 65536;

/// Byte buffer with separate read and write cursors.
///
/// ```text
/// +----------------+------------------+------------------+
/// | reserved head  |  readable bytes  |  writable bytes  |
/// +----------------+------------------+------------------+
/// 0            read_pos           write_pos         storage.len()
/// ```
///
/// Appending grows or compacts the storage as needed; retrieving only moves
/// the read cursor, so repeated append/retrieve cycles settle into a steady
/// allocation.
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    /// Creates an empty buffer with the default capacity.
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// Creates an empty buffer with room for `capacity` bytes before the
    /// first growth.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            storage: vec![0; RESERVED_HEAD + capacity],
            read_pos: RESERVED_HEAD,
            write_pos: RESERVED_HEAD,
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Whether there are no unread bytes.
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Bytes that can be appended without reallocating or compacting.
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    /// The unread bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Consumes `n` unread bytes (all of them if `n` exceeds `len`).
    pub fn retrieve(&mut self, n: usize) {
        if n >= self.len() {
            self.retrieve_all();
        } else {
            self.read_pos += n;
        }
    }

    /// Consumes every unread byte and rewinds both cursors.
    pub fn retrieve_all(&mut self) {
        self.read_pos = RESERVED_HEAD;
        self.write_pos = RESERVED_HEAD;
    }

    /// Consumes and returns every unread byte.
    pub fn take(&mut self) -> Vec<u8> {
        let data = self.peek().to_vec();
        self.retrieve_all();
        data
    }

    /// Appends `data` after the currently unread bytes.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Makes room for at least `n` more bytes, compacting the consumed
    /// prefix away when that suffices and growing the storage otherwise.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        let readable = self.len();
        if self.writable_bytes() + self.read_pos < n + RESERVED_HEAD {
            self.storage.resize(self.write_pos + n, 0);
        } else {
            self.storage.copy_within(self.read_pos..self.write_pos, RESERVED_HEAD);
            self.read_pos = RESERVED_HEAD;
            self.write_pos = RESERVED_HEAD + readable;
        }
    }

    /// Reads from `fd` directly into the buffer with a single `readv(2)`,
    /// spilling into a stack buffer when the ready data exceeds the writable
    /// space. Returns the number of bytes read; zero means end of stream.
    pub fn read_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.storage[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let n = syscall!(readv(fd, iov.as_ptr(), iov.len() as libc::c_int))? as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("writable", &self.writable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, EXTRA_BUF_SIZE, INITIAL_SIZE, RESERVED_HEAD};

    use std::os::unix::io::{FromRawFd, OwnedFd};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC)).expect("pipe2");
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_all(fd: &OwnedFd, mut data: &[u8]) {
        use std::os::unix::io::AsRawFd;
        while !data.is_empty() {
            let n = syscall!(write(
                fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len()
            ))
            .expect("write") as usize;
            data = &data[n..];
        }
    }

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);

        buf.append(b"hello world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");

        assert_eq!(buf.take(), b"world");
        assert!(buf.is_empty());
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = Buffer::new();
        let data = vec![0x5a; INITIAL_SIZE * 3];
        buf.append(&data);
        assert_eq!(buf.len(), data.len());
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn compacts_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![1; INITIAL_SIZE - 100]);
        buf.retrieve(INITIAL_SIZE - 200);
        let cap_before = buf.storage.len();

        // 100 readable bytes remain; there is plenty of consumed prefix to
        // reclaim, so this append must not grow the storage.
        buf.append(&vec![2; 500]);
        assert_eq!(buf.storage.len(), cap_before);
        assert_eq!(buf.len(), 600);
        assert_eq!(buf.read_pos, RESERVED_HEAD);
    }

    #[test]
    fn retrieve_past_end_clamps() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100);
        assert!(buf.is_empty());
    }

    #[test]
    fn read_from_small() {
        use std::os::unix::io::AsRawFd;
        let (rx, tx) = pipe();
        write_all(&tx, b"ping");

        let mut buf = Buffer::new();
        let n = buf.read_from(rx.as_raw_fd()).expect("read_from");
        assert_eq!(n, 4);
        assert_eq!(buf.peek(), b"ping");
    }

    #[test]
    fn read_from_spills_into_extra_buf() {
        use std::os::unix::io::AsRawFd;
        let (rx, tx) = pipe();

        // More than the default writable space, less than a pipe buffer, so
        // a single readv must use the stack extension.
        let payload: Vec<u8> = (0..INITIAL_SIZE * 8).map(|i| i as u8).collect();
        assert!(payload.len() < EXTRA_BUF_SIZE);
        write_all(&tx, &payload);

        let mut buf = Buffer::new();
        let n = buf.read_from(rx.as_raw_fd()).expect("read_from");
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
    }

    #[test]
    fn read_from_end_of_stream() {
        use std::os::unix::io::AsRawFd;
        let (rx, tx) = pipe();
        drop(tx);

        let mut buf = Buffer::new();
        assert_eq!(buf.read_from(rx.as_raw_fd()).expect("read_from"), 0);
    }
}
