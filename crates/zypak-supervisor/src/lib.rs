//! Spawn supervisor for confined processes.
//!
//! A confined process cannot create children itself. It sends a request over
//! the supervisor socket instead; the supervisor has a privileged
//! [`Authority`] create the process, tracks it under the requester's stub
//! pid, and tells the requester when it is gone.

pub mod authority;

mod client;
mod config;
mod logging;
mod monitor;
mod process;
mod reactor;
mod request;
pub mod socket;
mod supervisor;
mod table;

pub use authority::host::HostAuthority;
pub use authority::{
    Authority, AuthorityBridge, AuthorityError, ExitedHandler, SpawnExited, SpawnReply,
    SpawnResult, SpawnStarted, StartedHandler,
};
pub use client::{send_raw_request, SpawnHandle, SupervisorClient};
pub use config::{
    SupervisorConfig, DEFAULT_MAX_INTENT_BYTES, DEFAULT_SUPERVISOR_FD, ENV_DEBUG,
    ENV_MAX_INTENT_BYTES, ENV_SUPERVISOR_FD, MAX_INTENT_BYTES_LIMIT,
};
pub use logging::{init_logging, init_test_logging};
pub use monitor::{Monitor, MonitorGuard, ReleaseNotify};
pub use process::{is_already_reaped, OsProcessControl, ProcessControl};
pub use reactor::{Reactor, ReactorHandle, SourceAction, SourceKey};
pub use request::{
    validate_intent, RequestError, SpawnCall, SpawnFlags, SpawnIntent, SpawnRequest,
    SpawnRequestListener, SPAWN_EXIT_TOKEN, SPAWN_REQUEST_MARKER,
};
pub use supervisor::{Supervisor, SupervisorError, SupervisorResult};
pub use table::{
    ExitLookup, ExitedEntry, ExternalPid, InternalPid, PidTables, PidTranslationTable,
    SetExternalError, StubPid, StubPidData, StubPidSnapshot,
};
