use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use anyhow::{Context, Result};

use crate::config::SupervisorConfig;
use crate::request::{validate_intent, SpawnIntent, SPAWN_EXIT_TOKEN, SPAWN_REQUEST_MARKER};
use crate::socket::{self, ReadOptions};

/// Confined-side end of the spawn request socket.
#[derive(Debug)]
pub struct SupervisorClient {
    socket: OwnedFd,
}

impl SupervisorClient {
    pub fn new(socket: OwnedFd) -> Self {
        Self { socket }
    }

    /// Attaches to the request socket inherited on the configured descriptor.
    /// The inherited descriptor stays open; the client works on a duplicate.
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let fd = config
            .supervisor_fd
            .context("no supervisor fd configured")?;
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("supervisor fd {fd} is not open"));
        }
        // SAFETY: checked open above; only borrowed long enough to duplicate.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let socket = borrowed
            .try_clone_to_owned()
            .with_context(|| format!("duplicate supervisor fd {fd}"))?;
        Ok(Self { socket })
    }

    /// Queues `intent` (with `fds`, mapped per `intent.fd_map`) on a fresh
    /// notify channel and hands that channel to the supervisor.
    pub fn request_spawn(&self, intent: &SpawnIntent, fds: &[BorrowedFd<'_>]) -> Result<SpawnHandle> {
        validate_intent(intent, fds.len()).context("refusing to send spawn intent")?;

        let (ours, theirs) = socket::seqpacket_pair().context("open notify channel")?;

        let bytes = serde_json::to_vec(intent).context("encode spawn intent")?;
        let sent = socket::send_with_fds(ours.as_fd(), &bytes, fds).context("send spawn intent")?;
        socket::check_full_write(sent, &bytes).context("send spawn intent")?;

        send_raw_request(
            self.socket.as_fd(),
            SPAWN_REQUEST_MARKER.as_bytes(),
            &[theirs.as_fd()],
        )
        .context("send spawn request")?;

        Ok(SpawnHandle { channel: ours })
    }
}

/// Sends a request message verbatim. [`SupervisorClient::request_spawn`] is
/// the normal way in; this exists for callers that speak the protocol
/// themselves.
pub fn send_raw_request(
    socket: BorrowedFd<'_>,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> io::Result<()> {
    let n = socket::send_with_fds(socket, payload, fds)?;
    socket::check_full_write(n, payload)
}

/// The requester's side of one spawn: blocks until the supervisor says the
/// process is gone.
#[derive(Debug)]
pub struct SpawnHandle {
    channel: OwnedFd,
}

impl SpawnHandle {
    pub fn wait_for_exit(&self) -> Result<()> {
        let mut buf = [0u8; SPAWN_EXIT_TOKEN.len() + 1];
        let received = socket::recv_with_ancillary(self.channel.as_fd(), &mut buf, ReadOptions::default())
            .context("read exit notification")?;

        if received.len == 0 {
            anyhow::bail!("supervisor closed notify channel without an exit notification");
        }
        if received.data_truncated || &buf[..received.len] != SPAWN_EXIT_TOKEN.as_bytes() {
            anyhow::bail!("unexpected exit notification payload");
        }
        Ok(())
    }
}

impl AsFd for SpawnHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.channel.as_fd()
    }
}
