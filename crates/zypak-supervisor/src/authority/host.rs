//! An [`Authority`] that creates processes directly on the current host.
//!
//! There is no pid namespace in between, so a process's internal pid equals
//! its external pid. A single worker thread starts processes and watches
//! them until they exit.

use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt as _, ExitStatusExt as _};
use std::process::{Child, Command};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    Authority, AuthorityError, ExitedHandler, SpawnExited, SpawnReply, SpawnStarted,
    StartedHandler,
};
use crate::request::{SpawnCall, SpawnIntent};
use crate::table::{ExternalPid, InternalPid};

const WATCH_TICK: Duration = Duration::from_millis(50);

struct SpawnJob {
    call: SpawnCall,
    reply: SpawnReply,
}

#[derive(Default)]
struct Subscribers {
    started: Mutex<Vec<StartedHandler>>,
    exited: Mutex<Vec<ExitedHandler>>,
}

impl Subscribers {
    fn started(&self, message: SpawnStarted) {
        for handler in self.started.lock().iter() {
            handler(message);
        }
    }

    fn exited(&self, message: SpawnExited) {
        for handler in self.exited.lock().iter() {
            handler(message);
        }
    }
}

pub struct HostAuthority {
    jobs: mpsc::Sender<SpawnJob>,
    subscribers: Arc<Subscribers>,
    running: Arc<Mutex<HashSet<i32>>>,
}

impl HostAuthority {
    pub fn new() -> io::Result<Self> {
        let (jobs, rx) = mpsc::channel::<SpawnJob>();
        let subscribers = Arc::new(Subscribers::default());
        let running = Arc::new(Mutex::new(HashSet::new()));

        {
            let subscribers = Arc::clone(&subscribers);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("zypak-host-authority".to_string())
                .spawn(move || worker_loop(rx, &subscribers, &running))?;
        }

        Ok(Self {
            jobs,
            subscribers,
            running,
        })
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }
}

impl Authority for HostAuthority {
    fn spawn(&self, call: SpawnCall, reply: SpawnReply) {
        if let Err(mpsc::SendError(job)) = self.jobs.send(SpawnJob { call, reply }) {
            job.reply.complete(Err(AuthorityError::Unavailable(
                "host authority worker is gone".to_string(),
            )));
        }
    }

    fn spawn_signal(&self, external: ExternalPid, signal: i32) -> Result<(), AuthorityError> {
        let running = self.running.lock();
        if !running.contains(&external.0) {
            return Err(AuthorityError::UnknownProcess(external));
        }
        // Held across the kill so the worker cannot collect the pid (and let
        // it be reused) in between.
        if unsafe { libc::kill(external.0, signal) } == -1 {
            return Err(AuthorityError::Failed {
                method: "SpawnSignal",
                message: io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    fn subscribe_spawn_started(&self, handler: StartedHandler) {
        self.subscribers.started.lock().push(handler);
    }

    fn subscribe_spawn_exited(&self, handler: ExitedHandler) {
        self.subscribers.exited.lock().push(handler);
    }
}

fn worker_loop(
    rx: mpsc::Receiver<SpawnJob>,
    subscribers: &Subscribers,
    running: &Mutex<HashSet<i32>>,
) {
    let mut children: Vec<Child> = Vec::new();
    let mut rx_open = true;

    while rx_open || !children.is_empty() {
        match rx.recv_timeout(WATCH_TICK) {
            Ok(job) => {
                if let Some(child) = start(job, subscribers, running) {
                    children.push(child);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => rx_open = false,
        }

        children.retain_mut(|child| {
            let pid = child.id() as i32;
            let mut running = running.lock();
            match child.try_wait() {
                Ok(Some(status)) => {
                    running.remove(&pid);
                    drop(running);
                    debug!(pid, status = status.into_raw(), "host process exited");
                    subscribers.exited(SpawnExited {
                        external: ExternalPid(pid),
                        status: status.into_raw(),
                    });
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    if err.raw_os_error() == Some(libc::ECHILD) {
                        running.remove(&pid);
                        warn!(pid, "host process collected elsewhere; no exit status");
                        return false;
                    }
                    true
                }
            }
        });
    }
}

fn start(job: SpawnJob, subscribers: &Subscribers, running: &Mutex<HashSet<i32>>) -> Option<Child> {
    let SpawnJob { call, reply } = job;
    let stub = reply.stub();

    let mut cmd = match build_command(&call.intent, &call.fds) {
        Ok(cmd) => cmd,
        Err(err) => {
            reply.complete(Err(err));
            return None;
        }
    };

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            reply.complete(Err(AuthorityError::Failed {
                method: "Spawn",
                message: format!("{}: {err}", call.intent.argv[0]),
            }));
            return None;
        }
    };
    // The child holds its own copies now.
    drop(call.fds);

    let pid = child.id() as i32;
    running.lock().insert(pid);
    debug!(%stub, pid, "host process started");

    reply.complete(Ok(ExternalPid(pid)));
    subscribers.started(SpawnStarted {
        external: ExternalPid(pid),
        internal: InternalPid(pid),
    });

    Some(child)
}

fn build_command(intent: &SpawnIntent, fds: &[OwnedFd]) -> Result<Command, AuthorityError> {
    let Some((program, args)) = intent.argv.split_first() else {
        return Err(AuthorityError::Failed {
            method: "Spawn",
            message: "empty argv".to_string(),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    if intent.clear_env {
        cmd.env_clear();
    }
    for (k, v) in &intent.env {
        cmd.env(k, v);
    }
    if let Some(cwd) = intent.cwd.as_ref() {
        cmd.current_dir(cwd);
    }

    if !fds.is_empty() {
        let sources: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let targets = intent.fd_map.clone();
        let floor = sources
            .iter()
            .chain(targets.iter())
            .copied()
            .max()
            .unwrap_or(2)
            + 1;
        let mut staged: Vec<RawFd> = vec![-1; sources.len()];

        // SAFETY: the hook only calls async-signal-safe fcntl/dup2 and writes
        // into a buffer allocated before fork.
        unsafe {
            cmd.pre_exec(move || {
                // Stage everything above the highest fd involved first, so a
                // target never overwrites a source that is still needed.
                for (slot, src) in staged.iter_mut().zip(sources.iter()) {
                    let fd = libc::fcntl(*src, libc::F_DUPFD_CLOEXEC, floor);
                    if fd == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    *slot = fd;
                }
                for (fd, target) in staged.iter().zip(targets.iter()) {
                    if libc::dup2(*fd, *target) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    Ok(cmd)
}
