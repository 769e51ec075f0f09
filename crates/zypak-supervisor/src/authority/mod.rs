//! The privileged service that actually creates processes, and the bridge
//! that routes its answers onto the reactor thread.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::reactor::ReactorHandle;
use crate::request::SpawnCall;
use crate::table::{ExternalPid, InternalPid, StubPid};

pub mod host;

/// The created process has been assigned an identity inside its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnStarted {
    pub external: ExternalPid,
    pub internal: InternalPid,
}

/// The created process terminated. `status` is the raw wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnExited {
    pub external: ExternalPid,
    pub status: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    /// The authority could not be reached at all.
    Unavailable(String),
    /// The authority answered with an error.
    Failed {
        method: &'static str,
        message: String,
    },
    /// The pid is not one the authority created, or it is already gone.
    UnknownProcess(ExternalPid),
}

impl fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityError::Unavailable(msg) => write!(f, "authority unavailable: {msg}"),
            AuthorityError::Failed { method, message } => {
                write!(f, "authority call {method} failed: {message}")
            }
            AuthorityError::UnknownProcess(pid) => {
                write!(f, "authority does not know process {pid}")
            }
        }
    }
}

impl std::error::Error for AuthorityError {}

pub type SpawnResult = Result<ExternalPid, AuthorityError>;
pub type StartedHandler = Box<dyn Fn(SpawnStarted) + Send + Sync + 'static>;
pub type ExitedHandler = Box<dyn Fn(SpawnExited) + Send + Sync + 'static>;

/// Continuation for one `spawn` call, tagged with the stub pid it answers.
///
/// An authority must call [`SpawnReply::complete`] exactly once per spawn,
/// from any thread.
pub struct SpawnReply {
    stub: StubPid,
    deliver: Box<dyn FnOnce(StubPid, SpawnResult) + Send + 'static>,
}

impl SpawnReply {
    pub fn new<F>(stub: StubPid, deliver: F) -> Self
    where
        F: FnOnce(StubPid, SpawnResult) + Send + 'static,
    {
        Self {
            stub,
            deliver: Box::new(deliver),
        }
    }

    pub fn stub(&self) -> StubPid {
        self.stub
    }

    pub fn complete(self, result: SpawnResult) {
        (self.deliver)(self.stub, result)
    }
}

impl fmt::Debug for SpawnReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnReply")
            .field("stub", &self.stub)
            .finish_non_exhaustive()
    }
}

pub trait Authority: Send + Sync {
    /// Starts creating a process. Must return without waiting for the
    /// outcome, which is delivered through `reply`.
    fn spawn(&self, call: SpawnCall, reply: SpawnReply);

    /// Asks the authority to deliver `signal` to a process it created.
    /// Blocks until the authority answers.
    fn spawn_signal(&self, external: ExternalPid, signal: i32) -> Result<(), AuthorityError>;

    fn subscribe_spawn_started(&self, handler: StartedHandler);

    fn subscribe_spawn_exited(&self, handler: ExitedHandler);
}

/// Wraps an [`Authority`] so that replies and notifications are handled on
/// the reactor thread, in the order the authority emitted them.
#[derive(Clone)]
pub struct AuthorityBridge {
    authority: Arc<dyn Authority>,
    reactor: ReactorHandle,
}

impl AuthorityBridge {
    pub fn new(authority: Arc<dyn Authority>, reactor: ReactorHandle) -> Self {
        Self { authority, reactor }
    }

    pub fn spawn<F>(&self, stub: StubPid, call: SpawnCall, on_reply: F)
    where
        F: FnOnce(StubPid, SpawnResult) + Send + 'static,
    {
        let reactor = self.reactor.clone();
        let reply = SpawnReply::new(stub, move |stub, result| {
            if !reactor.post(move || on_reply(stub, result)) {
                warn!(%stub, "reactor gone, dropping spawn reply");
            }
        });
        self.authority.spawn(call, reply);
    }

    pub fn subscribe_spawn_started<F>(&self, handler: F)
    where
        F: Fn(SpawnStarted) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let reactor = self.reactor.clone();
        self.authority
            .subscribe_spawn_started(Box::new(move |message| {
                let handler = Arc::clone(&handler);
                if !reactor.post(move || handler(message)) {
                    warn!(external = %message.external, "reactor gone, dropping SpawnStarted");
                }
            }));
    }

    pub fn subscribe_spawn_exited<F>(&self, handler: F)
    where
        F: Fn(SpawnExited) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let reactor = self.reactor.clone();
        self.authority
            .subscribe_spawn_exited(Box::new(move |message| {
                let handler = Arc::clone(&handler);
                if !reactor.post(move || handler(message)) {
                    warn!(external = %message.external, "reactor gone, dropping SpawnExited");
                }
            }));
    }
}
