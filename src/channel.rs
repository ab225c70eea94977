use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI8, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::event_loop::{EventLoop, LoopInner};
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Registration states a channel moves through inside its poller.
///
/// Never registered; not in the poller map.
pub(crate) const NEW: i8 = -1;
/// In the poller map and armed in the kernel.
pub(crate) const REGISTERED: i8 = 1;
/// In the poller map but removed from the kernel (interest mask emptied).
pub(crate) const DETACHED: i8 = 2;

pub(crate) type ReadHandler = Box<dyn FnMut(Timestamp) + Send>;
pub(crate) type EventHandler = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<ReadHandler>,
    write: Option<EventHandler>,
    close: Option<EventHandler>,
    error: Option<EventHandler>,
}

/// Binding of one file descriptor to readiness handlers in a specific loop.
///
/// The channel does not own the descriptor; its owner (acceptor,
/// connection, the loop's wakeup fd) does. Interest mutators funnel through
/// the owning loop and are therefore restricted to the loop thread.
///
/// Handlers are dispatched with the handler slot locked; a handler must not
/// replace handlers on its own channel (nothing in the crate does).
pub(crate) struct Channel {
    fd: RawFd,
    owner: Weak<LoopInner>,
    weak_self: Weak<Channel>,
    interest: AtomicU8,
    revents: AtomicU32,
    registration: AtomicI8,
    handlers: Mutex<Handlers>,
}

impl Channel {
    pub(crate) fn new(owner: &EventLoop, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            fd,
            owner: owner.downgrade(),
            weak_self: weak_self.clone(),
            interest: AtomicU8::new(Interest::NONE.bits()),
            revents: AtomicU32::new(0),
            registration: AtomicI8::new(NEW),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> Interest {
        Interest::from_bits(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.interest().is_empty()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    pub(crate) fn registration(&self) -> i8 {
        self.registration.load(Ordering::Acquire)
    }

    pub(crate) fn set_registration(&self, state: i8) {
        self.registration.store(state, Ordering::Release);
    }

    /// The loop this channel belongs to. Loops outlive their channels by
    /// construction; an upgrade failure is an invariant breach.
    pub(crate) fn owner_loop(&self) -> EventLoop {
        match self.owner.upgrade() {
            Some(inner) => EventLoop::from_inner(inner),
            None => panic!("channel for fd {} outlived its event loop", self.fd),
        }
    }

    pub(crate) fn set_read_handler(&self, handler: impl FnMut(Timestamp) + Send + 'static) {
        self.handlers.lock().unwrap().read = Some(Box::new(handler));
    }

    pub(crate) fn set_write_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().write = Some(Box::new(handler));
    }

    pub(crate) fn set_close_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().close = Some(Box::new(handler));
    }

    pub(crate) fn set_error_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.handlers.lock().unwrap().error = Some(Box::new(handler));
    }

    pub(crate) fn enable_reading(&self) {
        self.add_interest(Interest::READABLE);
    }

    pub(crate) fn disable_reading(&self) {
        self.remove_interest(Interest::READABLE);
    }

    pub(crate) fn enable_writing(&self) {
        self.add_interest(Interest::WRITABLE);
    }

    pub(crate) fn disable_writing(&self) {
        self.remove_interest(Interest::WRITABLE);
    }

    pub(crate) fn disable_all(&self) {
        self.interest.store(Interest::NONE.bits(), Ordering::Release);
        self.update();
    }

    /// Drops the interest bits without touching the poller. Only for the
    /// any-thread teardown path, after [`Poller::deregister`] has already
    /// detached the fd.
    ///
    /// [`Poller::deregister`]: crate::poller::Poller::deregister
    pub(crate) fn clear_interest(&self) {
        self.interest.store(Interest::NONE.bits(), Ordering::Release);
    }

    /// Dispatches the pending readiness to the handlers, in a fixed order:
    /// hangup (without readable) first, then error, read (including
    /// peer-half-close, so residual data can drain before the close is
    /// acknowledged), and finally write.
    pub(crate) fn handle_event(&self, ts: Timestamp) {
        let revents = self.revents.load(Ordering::Acquire);
        trace!("fd {} revents {:#x}", self.fd, revents);

        if (revents & libc::EPOLLHUP as u32) != 0 && (revents & libc::EPOLLIN as u32) == 0 {
            self.invoke_close();
        }
        if (revents & libc::EPOLLERR as u32) != 0 {
            self.invoke_error();
        }
        if (revents & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) as u32) != 0 {
            self.invoke_read(ts);
        }
        if (revents & libc::EPOLLOUT as u32) != 0 {
            self.invoke_write();
        }
    }

    fn invoke_read(&self, ts: Timestamp) {
        if let Some(handler) = self.handlers.lock().unwrap().read.as_mut() {
            handler(ts);
        }
    }

    fn invoke_write(&self) {
        if let Some(handler) = self.handlers.lock().unwrap().write.as_mut() {
            handler();
        }
    }

    fn invoke_close(&self) {
        if let Some(handler) = self.handlers.lock().unwrap().close.as_mut() {
            handler();
        }
    }

    fn invoke_error(&self) {
        if let Some(handler) = self.handlers.lock().unwrap().error.as_mut() {
            handler();
        }
    }

    fn add_interest(&self, interest: Interest) {
        let current = Interest::from_bits(self.interest.load(Ordering::Acquire));
        self.interest.store(current.add(interest).bits(), Ordering::Release);
        self.update();
    }

    fn remove_interest(&self, interest: Interest) {
        let current = Interest::from_bits(self.interest.load(Ordering::Acquire));
        self.interest.store(current.remove(interest).bits(), Ordering::Release);
        self.update();
    }

    fn update(&self) {
        let me = match self.weak_self.upgrade() {
            Some(me) => me,
            None => panic!("channel for fd {} updated during drop", self.fd),
        };
        self.owner_loop().update_channel(&me);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // A channel must be disarmed before its fd's owner lets go of it.
        debug_assert!(
            self.is_none_event(),
            "channel for fd {} dropped while armed",
            self.fd
        );
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Channel, DETACHED, NEW, REGISTERED};
    use crate::event_loop::EventLoop;
    use crate::timestamp::Timestamp;

    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::{Arc, Mutex};

    fn some_fd() -> OwnedFd {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)).expect("eventfd");
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    #[test]
    fn interest_mutators_track_registration() {
        let event_loop = EventLoop::new().expect("event loop");
        let fd = some_fd();
        let ch = Channel::new(&event_loop, fd.as_raw_fd());
        assert!(ch.is_none_event());
        assert_eq!(ch.registration(), NEW);

        ch.enable_reading();
        assert!(ch.is_reading());
        assert!(!ch.is_writing());
        assert_eq!(ch.registration(), REGISTERED);
        assert!(event_loop.has_channel(&ch));

        ch.enable_writing();
        assert!(ch.is_writing());
        ch.disable_reading();
        assert!(!ch.is_reading());
        assert!(ch.is_writing());

        // Emptying the mask detaches from the kernel but stays known.
        ch.disable_all();
        assert!(ch.is_none_event());
        assert_eq!(ch.registration(), DETACHED);
        assert!(event_loop.has_channel(&ch));

        // A detached channel can be re-armed.
        ch.enable_reading();
        assert_eq!(ch.registration(), REGISTERED);

        ch.disable_all();
        event_loop.remove_channel(&ch);
        assert_eq!(ch.registration(), NEW);
        assert!(!event_loop.has_channel(&ch));
    }

    #[test]
    fn dispatch_order_is_close_error_read_write() {
        let event_loop = EventLoop::new().expect("event loop");
        let fd = some_fd();
        let ch = Channel::new(&event_loop, fd.as_raw_fd());

        let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        {
            let calls = Arc::clone(&calls);
            ch.set_read_handler(move |_ts| calls.lock().unwrap().push("read"));
        }
        {
            let calls = Arc::clone(&calls);
            ch.set_write_handler(move || calls.lock().unwrap().push("write"));
        }
        {
            let calls = Arc::clone(&calls);
            ch.set_close_handler(move || calls.lock().unwrap().push("close"));
        }
        {
            let calls = Arc::clone(&calls);
            ch.set_error_handler(move || calls.lock().unwrap().push("error"));
        }

        ch.set_revents(
            (libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP | libc::EPOLLOUT) as u32,
        );
        ch.handle_event(Timestamp::now());
        assert_eq!(*calls.lock().unwrap(), vec!["close", "error", "read", "write"]);

        // Hangup with readable data still pending goes through the read
        // path, not the close handler.
        calls.lock().unwrap().clear();
        ch.set_revents((libc::EPOLLHUP | libc::EPOLLIN) as u32);
        ch.handle_event(Timestamp::now());
        assert_eq!(*calls.lock().unwrap(), vec!["read"]);
    }
}
