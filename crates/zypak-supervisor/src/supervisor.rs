//! Ties the request listener, the authority and the pid table together.
//!
//! Requests and authority events are handled on the reactor thread. The
//! public accessors are meant for other threads; the blocking ones
//! ([`Supervisor::wait_for_exit_status`], [`Supervisor::find_internal_pid_blocking`])
//! must never run on the reactor thread, since only the reactor can make them
//! return.

use std::fmt;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::authority::{
    Authority, AuthorityBridge, AuthorityError, SpawnExited, SpawnResult, SpawnStarted,
};
use crate::config::SupervisorConfig;
use crate::process::{is_already_reaped, OsProcessControl, ProcessControl};
use crate::reactor::{Reactor, SourceAction};
use crate::request::{RequestError, SpawnRequest, SpawnRequestListener, SPAWN_EXIT_TOKEN};
use crate::socket;
use crate::table::{
    ExitLookup, ExitedEntry, InternalPid, PidTranslationTable, StubPid, StubPidData,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// No entry for the stub pid, or not far enough along for the operation.
    NotFound,
    /// The process has not exited yet.
    TryLater,
    Failed(AuthorityError),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::NotFound => f.write_str("no such supervised process"),
            SupervisorError::TryLater => f.write_str("supervised process has not exited yet"),
            SupervisorError::Failed(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Failed(err) => Some(err),
            SupervisorError::NotFound | SupervisorError::TryLater => None,
        }
    }
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

pub struct Supervisor {
    table: PidTranslationTable,
    authority: Arc<dyn Authority>,
    process: Arc<dyn ProcessControl>,
}

impl Supervisor {
    pub fn new(authority: Arc<dyn Authority>) -> Arc<Self> {
        Self::with_process_control(authority, Arc::new(OsProcessControl))
    }

    pub fn with_process_control(
        authority: Arc<dyn Authority>,
        process: Arc<dyn ProcessControl>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: PidTranslationTable::new(),
            authority,
            process,
        })
    }

    pub fn table(&self) -> &PidTranslationTable {
        &self.table
    }

    /// Opens the request socket, publishes its client end on the configured
    /// descriptor, and attaches everything to `reactor`. Returns the client
    /// end.
    pub fn init_and_attach(
        self: &Arc<Self>,
        config: &SupervisorConfig,
        reactor: &mut Reactor,
    ) -> Result<OwnedFd> {
        let (listener, client_end) = SpawnRequestListener::open(config)?;

        if let Some(target) = config.supervisor_fd {
            socket::dup_onto(client_end.as_fd(), target)
                .with_context(|| format!("failed to dup supervisor client onto fd {target}"))?;
        }

        self.attach(reactor, listener)?;
        Ok(client_end)
    }

    /// Subscribes to the authority's notifications and starts serving
    /// `listener` on `reactor`.
    pub fn attach(self: &Arc<Self>, reactor: &mut Reactor, listener: SpawnRequestListener) -> Result<()> {
        let bridge = AuthorityBridge::new(Arc::clone(&self.authority), reactor.handle());

        let weak = Arc::downgrade(self);
        bridge.subscribe_spawn_started(move |message| {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.handle_spawn_started(message);
            }
        });

        let weak = Arc::downgrade(self);
        bridge.subscribe_spawn_exited(move |message| {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.handle_spawn_exited(message);
            }
        });

        let supervisor = Arc::clone(self);
        reactor
            .add_readable(listener, move |listener| supervisor.handle_readable(listener, &bridge))
            .context("failed to watch spawn request socket")?;

        info!("spawn supervisor attached");
        Ok(())
    }

    fn handle_readable(
        self: &Arc<Self>,
        listener: &SpawnRequestListener,
        bridge: &AuthorityBridge,
    ) -> SourceAction {
        match listener.read_request() {
            Ok(Some(request)) => self.accept_request(request, bridge),
            Ok(None) => debug!("spurious wakeup on spawn request socket"),
            Err(RequestError::Closed) => {
                info!("spawn request socket closed; no longer accepting requests");
                return SourceAction::Remove;
            }
            Err(err) => warn!(error = %err, "dropping spawn request"),
        }
        SourceAction::Keep
    }

    fn accept_request(self: &Arc<Self>, request: SpawnRequest, bridge: &AuthorityBridge) {
        let SpawnRequest {
            stub,
            notify_exit,
            call,
        } = request;

        if !self.table.insert(stub, StubPidData::new(notify_exit)) {
            error!(%stub, "stub pid already has a pending spawn; dropping request");
            return;
        }
        debug!(%stub, argv = ?call.intent.argv, "accepted spawn request");

        let weak = Arc::downgrade(self);
        bridge.spawn(stub, call, move |stub, result| {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.handle_spawn_reply(stub, result);
            }
        });
    }

    fn handle_spawn_reply(&self, stub: StubPid, result: SpawnResult) {
        let external = match result {
            Ok(external) => external,
            Err(err) => {
                warn!(%stub, error = %err, "spawn failed");
                self.table.remove(stub);
                return;
            }
        };

        match self.table.set_external(stub, external) {
            Ok(()) => debug!(%stub, %external, "spawn created process"),
            Err(err) => error!(%stub, %external, ?err, "cannot record external pid"),
        }
    }

    fn handle_spawn_started(&self, message: SpawnStarted) {
        let SpawnStarted { external, internal } = message;
        let updated = self.table.update_by_external(external, |stub, data| {
            if !data.set_internal(internal) {
                debug!(%stub, %internal, "internal pid already known");
            }
            stub
        });
        match updated {
            Some(stub) => debug!(%stub, %external, %internal, "process started"),
            None => debug!(%external, "start of unknown process ignored"),
        }
    }

    fn handle_spawn_exited(&self, message: SpawnExited) {
        let SpawnExited { external, status } = message;
        let notified = self.table.update_by_external(external, |stub, data| {
            if data.exit_status().is_some() {
                debug!(%stub, %external, "duplicate exit ignored");
                return Ok(());
            }
            let notified = socket::try_write_message(data.notify_exit(), SPAWN_EXIT_TOKEN.as_bytes());
            data.set_exit_status(status);
            debug!(%stub, %external, status, "process exited");
            notified.map_err(|err| (stub, err))
        });

        match notified {
            None => debug!(%external, "exit of unknown process ignored"),
            Some(Ok(())) => {}
            Some(Err((stub, err))) => {
                warn!(%stub, %external, error = %err, "cannot notify stub of exit; killing");
                // The authority reports exit after the fact, so this pid may
                // already be collected and even reused. An authority that
                // reaps before reporting (HostAuthority does) cannot rule
                // that out; one that keeps its child unreaped until the
                // report is consumed can.
                if let Err(err) = self.process.kill(external.0, libc::SIGKILL) {
                    warn!(%stub, %external, error = %err, "kill failed");
                }
            }
        }
    }

    /// Non-blocking. Reaps and forgets the entry once it has an exit status.
    pub fn get_exit_status(&self, stub: StubPid) -> SupervisorResult<i32> {
        match self.table.take_exited(stub) {
            ExitLookup::Exited(entry) => Ok(self.reap(entry)),
            ExitLookup::Running => Err(SupervisorError::TryLater),
            ExitLookup::Missing => Err(SupervisorError::NotFound),
        }
    }

    /// Blocks until `stub` exits or its entry goes away.
    pub fn wait_for_exit_status(&self, stub: StubPid) -> SupervisorResult<i32> {
        self.table
            .wait_exited(stub)
            .map(|entry| self.reap(entry))
            .ok_or(SupervisorError::NotFound)
    }

    /// Only works once the authority has replied; there is no waiting for it.
    pub fn send_signal(&self, stub: StubPid, signal: i32) -> SupervisorResult<()> {
        let external = self
            .table
            .lookup(stub)
            .and_then(|snapshot| snapshot.external)
            .ok_or(SupervisorError::NotFound)?;

        self.authority.spawn_signal(external, signal).map_err(|err| {
            warn!(%stub, %external, signal, error = %err, "signal delivery failed");
            SupervisorError::Failed(err)
        })
    }

    pub fn find_internal_pid_blocking(&self, stub: StubPid) -> SupervisorResult<InternalPid> {
        self.table
            .wait_internal(stub)
            .ok_or(SupervisorError::NotFound)
    }

    fn reap(&self, entry: ExitedEntry) -> i32 {
        let ExitedEntry { stub, status, data } = entry;
        drop(data);

        match self.process.reap(stub.0) {
            Ok(()) => debug!(%stub, status, "reaped stub"),
            Err(err) if is_already_reaped(&err) => debug!(%stub, "stub already reaped"),
            Err(err) => warn!(%stub, error = %err, "failed to reap stub"),
        }
        status
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::authority::{ExitedHandler, SpawnReply, StartedHandler};
    use crate::client::{SpawnHandle, SupervisorClient};
    use crate::logging::init_test_logging;
    use crate::request::{SpawnCall, SpawnIntent};
    use crate::table::ExternalPid;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct ScriptedAuthority {
        pending: Mutex<VecDeque<SpawnReply>>,
        started: Mutex<Vec<StartedHandler>>,
        exited: Mutex<Vec<ExitedHandler>>,
        signals: Mutex<Vec<(ExternalPid, i32)>>,
        fail_signals: AtomicBool,
    }

    impl ScriptedAuthority {
        fn pending(&self) -> usize {
            self.pending.lock().len()
        }

        fn next_reply(&self) -> SpawnReply {
            self.pending.lock().pop_front().expect("no spawn call pending")
        }

        fn start(&self, external: i32, internal: i32) {
            for handler in self.started.lock().iter() {
                handler(SpawnStarted {
                    external: ExternalPid(external),
                    internal: InternalPid(internal),
                });
            }
        }

        fn exit(&self, external: i32, status: i32) {
            for handler in self.exited.lock().iter() {
                handler(SpawnExited {
                    external: ExternalPid(external),
                    status,
                });
            }
        }
    }

    impl Authority for ScriptedAuthority {
        fn spawn(&self, _call: SpawnCall, reply: SpawnReply) {
            self.pending.lock().push_back(reply);
        }

        fn spawn_signal(&self, external: ExternalPid, signal: i32) -> Result<(), AuthorityError> {
            if self.fail_signals.load(Ordering::SeqCst) {
                return Err(AuthorityError::Failed {
                    method: "SpawnSignal",
                    message: "denied".to_string(),
                });
            }
            self.signals.lock().push((external, signal));
            Ok(())
        }

        fn subscribe_spawn_started(&self, handler: StartedHandler) {
            self.started.lock().push(handler);
        }

        fn subscribe_spawn_exited(&self, handler: ExitedHandler) {
            self.exited.lock().push(handler);
        }
    }

    #[derive(Default)]
    struct RecordingProcess {
        kills: Mutex<Vec<(libc::pid_t, libc::c_int)>>,
        reaps: Mutex<Vec<libc::pid_t>>,
    }

    impl ProcessControl for RecordingProcess {
        fn kill(&self, pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
            self.kills.lock().push((pid, signal));
            Ok(())
        }

        fn reap(&self, pid: libc::pid_t) -> io::Result<()> {
            self.reaps.lock().push(pid);
            Ok(())
        }
    }

    struct Harness {
        supervisor: Arc<Supervisor>,
        authority: Arc<ScriptedAuthority>,
        process: Arc<RecordingProcess>,
        reactor: Reactor,
        client: SupervisorClient,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(SupervisorConfig {
                supervisor_fd: None,
                ..SupervisorConfig::default()
            })
        }

        fn with_config(config: SupervisorConfig) -> Self {
            init_test_logging();
            let authority = Arc::new(ScriptedAuthority::default());
            let process = Arc::new(RecordingProcess::default());
            let supervisor = Supervisor::with_process_control(authority.clone(), process.clone());
            let mut reactor = Reactor::new().unwrap();
            let client_end = supervisor.init_and_attach(&config, &mut reactor).unwrap();
            Self {
                supervisor,
                authority,
                process,
                reactor,
                client: SupervisorClient::new(client_end),
            }
        }

        fn pump_until(&mut self, what: &str, mut done: impl FnMut(&Self) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(self) {
                assert!(Instant::now() < deadline, "timed out waiting for {what}");
                self.reactor.turn(Some(Duration::from_millis(20))).unwrap();
            }
        }

        /// Sends a request and returns once the supervisor has passed it to
        /// the authority.
        fn request(&mut self) -> SpawnHandle {
            let before = self.authority.pending();
            let handle = self
                .client
                .request_spawn(&SpawnIntent::new(["app", "--flag"]), &[])
                .unwrap();
            self.pump_until("spawn call", |h| h.authority.pending() > before);
            handle
        }

        fn reply(&mut self, result: SpawnResult) {
            self.authority.next_reply().complete(result);
            self.reactor.turn(Some(Duration::from_millis(100))).unwrap();
        }
    }

    fn own_stub() -> StubPid {
        StubPid(std::process::id() as i32)
    }

    #[test]
    fn request_to_reap_walks_every_state() {
        let mut h = Harness::new();
        let stub = own_stub();

        let handle = h.request();
        let snapshot = h.supervisor.table().lookup(stub).expect("entry created");
        assert_eq!(snapshot.external, None);

        h.reply(Ok(ExternalPid(500)));
        let (found, _) = h
            .supervisor
            .table()
            .lookup_by_external(ExternalPid(500))
            .expect("indexed by external pid");
        assert_eq!(found, stub);

        let supervisor = Arc::clone(&h.supervisor);
        let finder = thread::spawn(move || supervisor.find_internal_pid_blocking(stub));
        h.authority.start(500, 9);
        h.pump_until("internal pid", |_| finder.is_finished());
        assert_eq!(finder.join().unwrap(), Ok(InternalPid(9)));

        assert_eq!(h.supervisor.get_exit_status(stub), Err(SupervisorError::TryLater));

        h.authority.exit(500, 0);
        h.pump_until("exit status", |h| {
            h.supervisor
                .table()
                .lookup(stub)
                .is_some_and(|s| s.exit_status.is_some())
        });
        handle.wait_for_exit().unwrap();

        assert_eq!(h.supervisor.get_exit_status(stub), Ok(0));
        assert_eq!(h.supervisor.get_exit_status(stub), Err(SupervisorError::NotFound));
        assert_eq!(*h.process.reaps.lock(), vec![stub.0]);
        assert!(h.process.kills.lock().is_empty());
        assert!(h.supervisor.table().is_empty());
    }

    #[test]
    fn unread_notify_channel_gets_process_killed() {
        let mut h = Harness::new();
        let stub = own_stub();

        let handle = h.request();
        h.reply(Ok(ExternalPid(500)));
        drop(handle);

        h.authority.exit(500, libc::SIGTERM);
        h.pump_until("exit status", |h| {
            h.supervisor
                .table()
                .lookup(stub)
                .is_some_and(|s| s.exit_status.is_some())
        });

        assert_eq!(*h.process.kills.lock(), vec![(500, libc::SIGKILL)]);
        assert_eq!(h.supervisor.get_exit_status(stub), Ok(libc::SIGTERM));
    }

    #[test]
    fn signal_needs_external_pid() {
        let mut h = Harness::new();
        let stub = own_stub();

        assert_eq!(
            h.supervisor.send_signal(stub, libc::SIGTERM),
            Err(SupervisorError::NotFound)
        );

        let _handle = h.request();
        assert_eq!(
            h.supervisor.send_signal(stub, libc::SIGTERM),
            Err(SupervisorError::NotFound)
        );

        h.reply(Ok(ExternalPid(500)));
        assert_eq!(h.supervisor.send_signal(stub, libc::SIGTERM), Ok(()));
        assert_eq!(
            *h.authority.signals.lock(),
            vec![(ExternalPid(500), libc::SIGTERM)]
        );

        h.authority.fail_signals.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.supervisor.send_signal(stub, libc::SIGTERM),
            Err(SupervisorError::Failed(AuthorityError::Failed { .. }))
        ));
    }

    #[test]
    fn failed_spawn_discards_entry() {
        let mut h = Harness::new();
        let stub = own_stub();

        let handle = h.request();
        let supervisor = Arc::clone(&h.supervisor);
        let finder = thread::spawn(move || supervisor.find_internal_pid_blocking(stub));

        h.reply(Err(AuthorityError::Failed {
            method: "Spawn",
            message: "no such file".to_string(),
        }));
        h.pump_until("blocked finder", |_| finder.is_finished());

        assert_eq!(finder.join().unwrap(), Err(SupervisorError::NotFound));
        assert_eq!(h.supervisor.get_exit_status(stub), Err(SupervisorError::NotFound));
        assert_eq!(h.supervisor.wait_for_exit_status(stub), Err(SupervisorError::NotFound));
        assert!(handle.wait_for_exit().is_err(), "channel should close without a token");
        assert!(h.process.reaps.lock().is_empty());
    }

    #[test]
    fn events_for_unknown_processes_are_ignored() {
        let mut h = Harness::new();
        let stub = own_stub();
        let _handle = h.request();
        h.reply(Ok(ExternalPid(500)));

        h.authority.start(777, 1);
        h.authority.exit(777, 0);
        h.reactor.turn(Some(Duration::from_millis(100))).unwrap();

        let snapshot = h.supervisor.table().lookup(stub).unwrap();
        assert_eq!(snapshot.internal, None);
        assert_eq!(snapshot.exit_status, None);
        assert!(h.process.kills.lock().is_empty());
    }

    #[test]
    fn wait_for_exit_status_blocks_until_exit() {
        let mut h = Harness::new();
        let stub = own_stub();
        let handle = h.request();
        h.reply(Ok(ExternalPid(500)));

        let supervisor = Arc::clone(&h.supervisor);
        let waiter = thread::spawn(move || supervisor.wait_for_exit_status(stub));
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        h.authority.exit(500, 3 << 8);
        h.pump_until("waiter", |_| waiter.is_finished());

        assert_eq!(waiter.join().unwrap(), Ok(3 << 8));
        handle.wait_for_exit().unwrap();
        assert_eq!(h.supervisor.wait_for_exit_status(stub), Err(SupervisorError::NotFound));
    }

    #[test]
    fn second_request_from_same_stub_is_dropped() {
        let mut h = Harness::new();

        let _first = h.request();
        let second = h
            .client
            .request_spawn(&SpawnIntent::new(["app"]), &[])
            .unwrap();
        h.reactor.turn(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(h.authority.pending(), 1);
        assert_eq!(h.supervisor.table().len(), 1);
        assert!(second.wait_for_exit().is_err());
    }

    #[test]
    fn duplicate_exit_does_not_renotify() {
        let mut h = Harness::new();
        let stub = own_stub();
        let handle = h.request();
        h.reply(Ok(ExternalPid(500)));

        h.authority.exit(500, 0);
        h.authority.exit(500, 9);
        h.reactor.turn(Some(Duration::from_millis(100))).unwrap();

        handle.wait_for_exit().unwrap();
        socket::set_nonblocking(handle.as_fd(), true).unwrap();
        let mut buf = [0u8; 32];
        let again = socket::recv_with_ancillary(handle.as_fd(), &mut buf, Default::default());
        assert_eq!(again.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(h.supervisor.get_exit_status(stub), Ok(0));
    }

    #[test]
    fn closed_request_socket_is_deregistered() {
        let h = Harness::new();
        let Harness {
            supervisor,
            mut reactor,
            client,
            ..
        } = h;
        assert_eq!(reactor.source_count(), 1);

        drop(client);
        reactor.turn(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(reactor.source_count(), 0);

        for _ in 0..10 {
            assert_eq!(reactor.turn(Some(Duration::from_millis(5))).unwrap(), 0);
        }
        assert!(supervisor.table().is_empty());
    }

    #[test]
    fn client_reaches_supervisor_through_fixed_fd() {
        const FIXED_FD: i32 = 611;
        let config = SupervisorConfig {
            supervisor_fd: Some(FIXED_FD),
            ..SupervisorConfig::default()
        };
        let mut h = Harness::with_config(config.clone());

        let flags = unsafe { libc::fcntl(FIXED_FD, libc::F_GETFD) };
        assert!(flags >= 0, "fixed fd should be open");
        assert_eq!(flags & libc::FD_CLOEXEC, 0, "fixed fd must survive exec");

        // Only the fixed fd keeps the request socket reachable from here on.
        h.client = SupervisorClient::from_config(&config).unwrap();
        let handle = h.request();
        h.reply(Ok(ExternalPid(500)));
        h.authority.exit(500, 0);
        h.pump_until("exit status", |h| {
            h.supervisor
                .table()
                .lookup(own_stub())
                .is_some_and(|s| s.exit_status.is_some())
        });
        handle.wait_for_exit().unwrap();
        assert_eq!(h.supervisor.get_exit_status(own_stub()), Ok(0));

        unsafe { libc::close(FIXED_FD) };
        assert_eq!(h.reactor.source_count(), 1);
    }
}
