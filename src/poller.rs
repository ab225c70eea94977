use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, trace};

use crate::channel::{self, Channel};
use crate::interest::Interest;
use crate::timestamp::Timestamp;

/// Initial size of the `epoll_wait` output array; doubled every time a poll
/// comes back full.
const INITIAL_EVENTS: usize = 64;

/// Readiness demultiplexer over `epoll(7)`.
///
/// Holds the kernel handle plus the fd → channel map used to resolve ready
/// events back to their channels. All registration traffic arrives through
/// the owning [`EventLoop`], which enforces thread affinity; the maps are
/// additionally lock-protected so the any-thread teardown path
/// ([`Poller::deregister`]) stays sound.
///
/// [`EventLoop`]: crate::event_loop::EventLoop
pub(crate) struct Poller {
    ep: OwnedFd,
    channels: Mutex<HashMap<RawFd, Arc<Channel>>>,
    events: Mutex<Vec<libc::epoll_event>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Poller {
            ep,
            channels: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::with_capacity(INITIAL_EVENTS)),
        })
    }

    /// Waits for readiness, fills `active` with the ready channels (revents
    /// already stamped), and returns the wall-clock time right after the
    /// wait. A signal interruption produces an empty round; other failures
    /// are logged and likewise produce an empty round.
    pub(crate) fn poll(&self, timeout: Option<Duration>, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let timeout_ms = timeout
            .map(|to| {
                // Round sub-millisecond timeouts up so they do not turn
                // into a busy-loop zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut events = self.events.lock().unwrap();
        events.clear();
        let res = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            timeout_ms,
        ));
        let now = Timestamp::now();

        match res {
            Ok(n_events) => {
                // SAFETY: `epoll_wait` initialised exactly `n_events` entries.
                unsafe { events.set_len(n_events as usize) };
                trace!("{} events ready", n_events);
                let channels = self.channels.lock().unwrap();
                for event in events.iter() {
                    let fd = event.u64 as RawFd;
                    if let Some(ch) = channels.get(&fd) {
                        ch.set_revents(event.events);
                        active.push(Arc::clone(ch));
                    }
                }
                if n_events as usize == events.capacity() {
                    let additional = events.capacity();
                    events.reserve(additional);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait failed: {}", err),
        }

        now
    }

    /// Applies a channel's current interest to the kernel, tracking the
    /// registration protocol: first registration inserts into the map and
    /// ADDs; an emptied mask DELs but keeps the map entry (detached); a
    /// re-armed detached channel ADDs again; otherwise MOD.
    pub(crate) fn update_channel(&self, ch: &Arc<Channel>) {
        let fd = ch.fd();
        match ch.registration() {
            channel::NEW | channel::DETACHED => {
                let mut channels = self.channels.lock().unwrap();
                if ch.registration() == channel::NEW {
                    debug_assert!(!channels.contains_key(&fd));
                    channels.insert(fd, Arc::clone(ch));
                } else {
                    debug_assert!(channels.contains_key(&fd));
                }
                ch.set_registration(channel::REGISTERED);
                self.ctl(libc::EPOLL_CTL_ADD, ch);
            }
            _ => {
                debug_assert!(self.channels.lock().unwrap().contains_key(&fd));
                if ch.interest().is_empty() {
                    self.ctl(libc::EPOLL_CTL_DEL, ch);
                    ch.set_registration(channel::DETACHED);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, ch);
                }
            }
        }
    }

    /// Removes a channel for good. The interest mask must already be empty
    /// and the channel present in the map.
    pub(crate) fn remove_channel(&self, ch: &Arc<Channel>) {
        let fd = ch.fd();
        debug_assert!(ch.interest().is_empty());
        let removed = self.channels.lock().unwrap().remove(&fd);
        debug_assert!(removed.map_or(false, |c| Arc::ptr_eq(&c, ch)));
        if ch.registration() == channel::REGISTERED {
            self.ctl(libc::EPOLL_CTL_DEL, ch);
        }
        ch.set_registration(channel::NEW);
    }

    pub(crate) fn has_channel(&self, ch: &Arc<Channel>) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(&ch.fd())
            .map_or(false, |c| Arc::ptr_eq(c, ch))
    }

    /// Teardown-only removal that is safe from any thread: `epoll_ctl` is
    /// thread-safe and the map is lock-protected. The loop may observe one
    /// final spurious readiness for the fd, which dispatch tolerates.
    pub(crate) fn deregister(&self, ch: &Arc<Channel>) {
        self.channels.lock().unwrap().remove(&ch.fd());
        if ch.registration() == channel::REGISTERED {
            if let Err(err) = syscall!(epoll_ctl(
                self.ep.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                ch.fd(),
                std::ptr::null_mut(),
            )) {
                error!("epoll_ctl(DEL) for fd {} failed: {}", ch.fd(), err);
            }
        }
        ch.set_registration(channel::NEW);
        ch.clear_interest();
    }

    /// `EPOLL_CTL_ADD`/`MOD` failures are programming errors and panic;
    /// `DEL` can legitimately race the kernel closing the fd and only logs.
    fn ctl(&self, op: libc::c_int, ch: &Arc<Channel>) {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(ch.interest()),
            u64: ch.fd() as u64,
        };
        if let Err(err) = syscall!(epoll_ctl(self.ep.as_raw_fd(), op, ch.fd(), &mut event)) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl(DEL) for fd {} failed: {}", ch.fd(), err);
            } else {
                panic!("epoll_ctl(op={}) for fd {} failed: {}", op, ch.fd(), err);
            }
        }
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP;
    }

    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }

    kind as u32
}
