use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::Poller;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Cross-thread wakeup backed by `eventfd(2)`.
///
/// The eventfd is a 64-bit counter: every wake adds one, the loop's read
/// resets it to zero, so any number of wakes coalesce into one readiness.
struct Waker {
    fd: File,
}

impl Waker {
    fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a valid, otherwise unowned fd.
        Ok(Waker {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The counter is about to overflow; reset it and try once
                // more.
                self.drain()?;
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    fn drain(&self) -> io::Result<()> {
        let mut buf: [u8; 8] = [0; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub(crate) struct LoopInner {
    thread: ThreadId,
    poller: Poller,
    waker: Waker,
    wake_channel: OnceLock<Arc<Channel>>,
    pending: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quit: AtomicBool,
    running_queued: AtomicBool,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        // The wakeup channel is read-armed for the loop's whole life;
        // detach it through the any-thread path so it drops disarmed.
        if let Some(ch) = self.wake_channel.get() {
            self.poller.deregister(ch);
        }
    }
}

/// Single-threaded event loop: poll for readiness, dispatch channel
/// handlers, then drain queued tasks.
///
/// The loop is anchored to the thread that constructs it. `EventLoop`
/// itself is a cheap clonable handle; every clone refers to the same loop,
/// and only [`queue_in_loop`], [`run_in_loop`], [`wakeup`] and [`quit`] may
/// be used from other threads. Everything else asserts thread affinity and
/// panics on violation; those are programming errors, not runtime
/// conditions.
///
/// [`queue_in_loop`]: EventLoop::queue_in_loop
/// [`run_in_loop`]: EventLoop::run_in_loop
/// [`wakeup`]: EventLoop::wakeup
/// [`quit`]: EventLoop::quit
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Creates an event loop owned by the calling thread.
    pub fn new() -> io::Result<EventLoop> {
        let inner = Arc::new(LoopInner {
            thread: thread::current().id(),
            poller: Poller::new()?,
            waker: Waker::new()?,
            wake_channel: OnceLock::new(),
            pending: Mutex::new(Vec::new()),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            running_queued: AtomicBool::new(false),
        });
        let event_loop = EventLoop { inner };

        let wake_channel = Channel::new(&event_loop, event_loop.inner.waker.as_raw_fd());
        let weak = Arc::downgrade(&event_loop.inner);
        wake_channel.set_read_handler(move |_ts| {
            if let Some(inner) = weak.upgrade() {
                if let Err(err) = inner.waker.drain() {
                    error!("draining wakeup fd failed: {}", err);
                }
            }
        });
        wake_channel.enable_reading();
        let _ = event_loop.inner.wake_channel.set(wake_channel);

        Ok(event_loop)
    }

    pub(crate) fn from_inner(inner: Arc<LoopInner>) -> EventLoop {
        EventLoop { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<LoopInner> {
        Arc::downgrade(&self.inner)
    }

    /// Runs the loop until [`quit`] is called. Must be called on the owning
    /// thread. Each iteration services every ready channel before draining
    /// the task queue, so queued tasks cannot be starved by I/O.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.inner.looping.load(Ordering::Acquire),
            "event loop already running"
        );
        self.inner.looping.store(true, Ordering::Release);
        // No quit-flag reset here: a quit that lands between construction
        // and run() must still stop the loop, or a joining thread hangs.
        trace!("event loop on {:?} started", self.inner.thread);

        let mut active = Vec::new();
        while !self.inner.quit.load(Ordering::Acquire) {
            active.clear();
            let ts = self.inner.poller.poll(None, &mut active);
            for ch in &active {
                ch.handle_event(ts);
            }
            self.run_queued_tasks();
        }

        self.inner.looping.store(false, Ordering::Release);
        trace!("event loop on {:?} stopped", self.inner.thread);
    }

    /// Stops the loop after the current iteration. Pending queued tasks are
    /// not drained. Safe from any thread.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Panics unless called on the owning thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "event loop owned by thread {:?} used from {:?}",
                self.inner.thread,
                thread::current().id(),
            );
        }
    }

    /// Runs `task` now when called on the loop thread, otherwise queues it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the end of the current (or next) loop iteration.
    /// The only thread-safe way to hand work to a loop. Tasks queued from
    /// one thread run in FIFO order.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.pending.lock().unwrap().push(Box::new(task));
        // A foreign caller must interrupt the poll; so must a task queued
        // from inside the drain, which the current swap no longer covers.
        if !self.is_in_loop_thread() || self.inner.running_queued.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Interrupts a blocking poll. Idempotent and safe from any thread.
    pub fn wakeup(&self) {
        if let Err(err) = self.inner.waker.wake() {
            error!("waking event loop failed: {}", err);
        }
    }

    pub(crate) fn update_channel(&self, ch: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.inner.poller.update_channel(ch);
    }

    pub(crate) fn remove_channel(&self, ch: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.inner.poller.remove_channel(ch);
    }

    pub(crate) fn has_channel(&self, ch: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.inner.poller.has_channel(ch)
    }

    /// Teardown-only channel removal usable from any thread; see
    /// [`Poller::deregister`].
    ///
    /// [`Poller::deregister`]: crate::poller::Poller::deregister
    pub(crate) fn deregister_channel(&self, ch: &Arc<Channel>) {
        self.inner.poller.deregister(ch);
    }

    fn run_queued_tasks(&self) {
        self.inner.running_queued.store(true, Ordering::Release);
        // Swap the queue out so tasks run without the lock held; new tasks
        // queued by a running task land in the fresh queue and trigger a
        // wakeup via the flag above.
        let tasks = mem::take(&mut *self.inner.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.inner.running_queued.store(false, Ordering::Release);
    }
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventLoop {}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.inner.thread)
            .field("looping", &self.inner.looping.load(Ordering::Acquire))
            .finish()
    }
}
