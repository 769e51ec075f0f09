//! Single-threaded event loop.
//!
//! Two kinds of work reach the loop: readiness of registered descriptors, and
//! tasks posted from other threads through a [`ReactorHandle`]. Both run on
//! whichever thread drives [`Reactor::turn`] / [`Reactor::run`], one at a time.
//! Nothing dispatched here may block on a round-trip to another thread that
//! itself needs the loop to make progress.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use polling::{Event, Events, Poller};
use tracing::warn;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAction {
    /// Re-arm and keep watching.
    Keep,
    /// Stop watching and drop the source.
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceKey(usize);

trait ReadySource: Send {
    fn fd(&self) -> BorrowedFd<'_>;
    fn ready(&mut self) -> SourceAction;
}

struct FdSource<S, F> {
    source: S,
    on_ready: F,
}

impl<S, F> ReadySource for FdSource<S, F>
where
    S: AsFd + Send,
    F: FnMut(&S) -> SourceAction + Send,
{
    fn fd(&self) -> BorrowedFd<'_> {
        self.source.as_fd()
    }

    fn ready(&mut self) -> SourceAction {
        (self.on_ready)(&self.source)
    }
}

pub struct Reactor {
    poller: Arc<Poller>,
    events: Events,
    sources: HashMap<usize, Box<dyn ReadySource>>,
    next_key: usize,
    tasks_tx: mpsc::Sender<Task>,
    tasks_rx: mpsc::Receiver<Task>,
    stopped: Arc<AtomicBool>,
}

/// Thread-safe way into a [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    poller: Arc<Poller>,
    tasks: mpsc::Sender<Task>,
    stopped: Arc<AtomicBool>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let (tasks_tx, tasks_rx) = mpsc::channel();
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            events: Events::new(),
            sources: HashMap::new(),
            next_key: 0,
            tasks_tx,
            tasks_rx,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            poller: Arc::clone(&self.poller),
            tasks: self.tasks_tx.clone(),
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// Watches `source` for readability. `on_ready` runs on the loop thread
    /// once per readiness event; the source stays registered (and owned by the
    /// reactor) until the callback returns [`SourceAction::Remove`].
    pub fn add_readable<S, F>(&mut self, source: S, on_ready: F) -> io::Result<SourceKey>
    where
        S: AsFd + Send + 'static,
        F: FnMut(&S) -> SourceAction + Send + 'static,
    {
        let key = self.next_key;
        let raw = source.as_fd().as_raw_fd();

        // SAFETY: the source is moved into `self.sources` below and is deleted
        // from the poller before it is dropped.
        unsafe { self.poller.add(raw, Event::readable(key))? };

        self.next_key += 1;
        self.sources
            .insert(key, Box::new(FdSource { source, on_ready }));
        Ok(SourceKey(key))
    }

    pub fn remove(&mut self, key: SourceKey) -> bool {
        match self.sources.remove(&key.0) {
            Some(source) => {
                if let Err(err) = self.poller.delete(source.fd()) {
                    warn!(error = %err, "failed to deregister reactor source");
                }
                true
            }
            None => false,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Waits up to `timeout` for work and dispatches whatever is ready.
    /// Returns how many callbacks and tasks ran.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let ready: Vec<usize> = self
            .events
            .iter()
            .filter(|ev| ev.readable)
            .map(|ev| ev.key)
            .collect();

        let mut dispatched = 0;
        for key in ready {
            let Some(source) = self.sources.get_mut(&key) else {
                continue;
            };
            dispatched += 1;
            match source.ready() {
                SourceAction::Keep => self.poller.modify(source.fd(), Event::readable(key))?,
                SourceAction::Remove => {
                    self.remove(SourceKey(key));
                }
            }
        }

        while let Ok(task) = self.tasks_rx.try_recv() {
            task();
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Turns the loop until [`ReactorHandle::stop`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.stopped.load(Ordering::Acquire) {
            self.turn(None)?;
        }
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for source in self.sources.values() {
            let _ = self.poller.delete(source.fd());
        }
    }
}

impl ReactorHandle {
    /// Queues `task` to run on the loop thread. Returns `false` if the
    /// reactor is gone.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tasks.send(Box::new(task)).is_err() {
            return false;
        }
        if let Err(err) = self.poller.notify() {
            warn!(error = %err, "failed to wake reactor");
        }
        true
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.poller.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}
