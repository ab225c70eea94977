use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::debug;

use crate::event_loop::EventLoop;

/// Invoked once on each worker loop, after the loop exists and before it
/// starts polling.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// A thread hosting exactly one [`EventLoop`] for its lifetime.
pub struct LoopThread {
    event_loop: EventLoop,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    /// Spawns the thread and blocks until its loop handle has been
    /// published, so the returned `LoopThread` always carries a live loop.
    pub fn spawn(name: String, init: Option<ThreadInitCallback>) -> io::Result<LoopThread> {
        type Handshake = (Mutex<Option<io::Result<EventLoop>>>, Condvar);
        let handshake: Arc<Handshake> = Arc::new((Mutex::new(None), Condvar::new()));

        let published = Arc::clone(&handshake);
        let thread = thread::Builder::new().name(name).spawn(move || {
            let (slot, cvar) = &*published;
            let event_loop = match EventLoop::new() {
                Ok(event_loop) => event_loop,
                Err(err) => {
                    *slot.lock().unwrap() = Some(Err(err));
                    cvar.notify_one();
                    return;
                }
            };
            if let Some(init) = init {
                init(&event_loop);
            }
            *slot.lock().unwrap() = Some(Ok(event_loop.clone()));
            cvar.notify_one();

            event_loop.run();
        })?;

        let (slot, cvar) = &*handshake;
        let mut published = slot.lock().unwrap();
        while published.is_none() {
            published = cvar.wait(published).unwrap();
        }
        let result = published.take().unwrap();
        drop(published);

        match result {
            Ok(event_loop) => Ok(LoopThread {
                event_loop,
                thread: Some(thread),
            }),
            Err(err) => {
                let _ = thread.join();
                Err(err)
            }
        }
    }

    /// The loop hosted by this thread.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        // Quit through the task queue rather than directly: anything queued
        // before this drop (connection teardown in particular) drains
        // first, FIFO, before the loop exits.
        let event_loop = self.event_loop.clone();
        self.event_loop.queue_in_loop(move || event_loop.quit());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// N worker loops plus round-robin dispatch, owned by the base loop.
///
/// With zero workers the base loop doubles as the sole worker.
pub struct LoopThreadPool {
    base: EventLoop,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<LoopThread>>,
    loops: Mutex<Vec<EventLoop>>,
}

impl LoopThreadPool {
    pub fn new(base: &EventLoop, name: impl Into<String>) -> LoopThreadPool {
        LoopThreadPool {
            base: base.clone(),
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Sets the worker count. Must be called before [`start`].
    ///
    /// [`start`]: LoopThreadPool::start
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(
            !self.started.load(Ordering::Acquire),
            "pool already started"
        );
        self.num_threads.store(num_threads, Ordering::Release);
    }

    /// Spawns the workers. Base loop thread only; returns once every worker
    /// loop is up.
    pub fn start(&self, init: Option<ThreadInitCallback>) -> io::Result<()> {
        self.base.assert_in_loop_thread();
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "pool already started"
        );

        let num_threads = self.num_threads.load(Ordering::Acquire);
        debug!("pool [{}] starting {} workers", self.name, num_threads);

        let mut threads = self.threads.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for i in 0..num_threads {
            let thread = LoopThread::spawn(format!("{}-io-{}", self.name, i), init.clone())?;
            loops.push(thread.event_loop().clone());
            threads.push(thread);
        }

        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
        Ok(())
    }

    /// The next worker loop, round-robin; the base loop when the pool has
    /// no workers. Base loop thread only.
    pub fn get_next_loop(&self) -> EventLoop {
        self.base.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Acquire), "pool not started");

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base.clone();
        }
        let next = self.next.fetch_add(1, Ordering::AcqRel);
        loops[next % loops.len()].clone()
    }

    /// Every worker loop, or the base loop when there are none.
    pub fn get_all_loops(&self) -> Vec<EventLoop> {
        self.base.assert_in_loop_thread();
        assert!(self.started.load(Ordering::Acquire), "pool not started");

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base.clone()]
        } else {
            loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
