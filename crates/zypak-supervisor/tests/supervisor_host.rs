#![cfg(target_os = "linux")]

use std::io::Read;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use zypak_supervisor::{
    init_test_logging, send_raw_request, socket, HostAuthority, Reactor, ReactorHandle,
    SpawnIntent, StubPid, Supervisor, SupervisorClient, SupervisorConfig, SupervisorError,
};

struct Running {
    supervisor: Arc<Supervisor>,
    client_end: OwnedFd,
    reactor: ReactorHandle,
    thread: Option<JoinHandle<()>>,
}

impl Running {
    fn start() -> Self {
        init_test_logging();
        let authority = Arc::new(HostAuthority::new().expect("start host authority"));
        let supervisor = Supervisor::new(authority);

        let (tx, rx) = mpsc::channel();
        let sup = Arc::clone(&supervisor);
        let thread = thread::spawn(move || {
            let mut reactor = Reactor::new().expect("reactor");
            let config = SupervisorConfig {
                supervisor_fd: None,
                ..SupervisorConfig::default()
            };
            let client_end = sup
                .init_and_attach(&config, &mut reactor)
                .expect("attach supervisor");
            tx.send((client_end, reactor.handle())).expect("hand out client end");
            reactor.run().expect("reactor run");
        });

        let (client_end, reactor) = rx.recv().expect("supervisor thread started");
        Self {
            supervisor,
            client_end,
            reactor,
            thread: Some(thread),
        }
    }

    fn client(&self) -> SupervisorClient {
        SupervisorClient::new(self.client_end.try_clone().expect("dup client end"))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.reactor.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn own_stub() -> StubPid {
    StubPid(std::process::id() as i32)
}

#[test]
fn exit_code_reaches_requester_and_waiter() {
    let running = Running::start();
    let stub = own_stub();

    let handle = running
        .client()
        .request_spawn(&SpawnIntent::new(["sh", "-c", "exit 7"]), &[])
        .expect("request spawn");
    handle.wait_for_exit().expect("exit notification");

    assert_eq!(running.supervisor.wait_for_exit_status(stub), Ok(7 << 8));
    assert_eq!(
        running.supervisor.get_exit_status(stub),
        Err(SupervisorError::NotFound)
    );
}

#[test]
fn malformed_request_does_not_stop_listener() {
    let running = Running::start();
    let stub = own_stub();

    let (stray, _peer) = socket::seqpacket_pair().expect("socketpair");
    send_raw_request(running.client_end.as_fd(), b"NOT_A_SPAWN_REQUEST", &[stray.as_fd()])
        .expect("send bad request");

    let handle = running
        .client()
        .request_spawn(&SpawnIntent::new(["true"]), &[])
        .expect("request spawn");
    handle.wait_for_exit().expect("exit notification");
    assert_eq!(running.supervisor.wait_for_exit_status(stub), Ok(0));
}

#[test]
fn mapped_descriptor_reaches_child() {
    let running = Running::start();
    let stub = own_stub();

    let (mut ours, theirs) = UnixStream::pair().expect("stream pair");
    let mut intent = SpawnIntent::new(["sh", "-c", "echo hello >&3"]);
    intent.fd_map = vec![3];

    let handle = running
        .client()
        .request_spawn(&intent, &[theirs.as_fd()])
        .expect("request spawn");
    drop(theirs);

    handle.wait_for_exit().expect("exit notification");
    assert_eq!(running.supervisor.wait_for_exit_status(stub), Ok(0));

    let mut out = String::new();
    ours.read_to_string(&mut out).expect("read child output");
    assert_eq!(out, "hello\n");
}

#[test]
fn signal_is_forwarded_to_created_process() {
    let running = Running::start();
    let stub = own_stub();

    let handle = running
        .client()
        .request_spawn(&SpawnIntent::new(["sleep", "30"]), &[])
        .expect("request spawn");

    let internal = running
        .supervisor
        .find_internal_pid_blocking(stub)
        .expect("internal pid");
    assert!(internal.0 > 0);
    assert_eq!(
        running.supervisor.get_exit_status(stub),
        Err(SupervisorError::TryLater)
    );

    running
        .supervisor
        .send_signal(stub, libc::SIGTERM)
        .expect("signal");
    handle.wait_for_exit().expect("exit notification");
    assert_eq!(
        running.supervisor.wait_for_exit_status(stub),
        Ok(libc::SIGTERM)
    );
}

#[test]
fn failed_spawn_closes_notify_channel() {
    let running = Running::start();
    let stub = own_stub();

    let handle = running
        .client()
        .request_spawn(&SpawnIntent::new(["/nonexistent/zypak-test-binary"]), &[])
        .expect("request spawn");

    assert!(handle.wait_for_exit().is_err());
    assert_eq!(
        running.supervisor.get_exit_status(stub),
        Err(SupervisorError::NotFound)
    );
    assert_eq!(
        running.supervisor.send_signal(stub, libc::SIGTERM),
        Err(SupervisorError::NotFound)
    );
}

#[test]
fn client_refuses_mismatched_fd_map() {
    let running = Running::start();

    let (_a, b) = UnixStream::pair().expect("stream pair");
    let err = running
        .client()
        .request_spawn(&SpawnIntent::new(["true"]), &[b.as_fd()])
        .expect_err("fd_map does not cover the descriptor");
    assert!(format!("{err:#}").contains("fd_map"));
    assert!(running.supervisor.table().is_empty());
}
