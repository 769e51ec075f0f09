use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{SupervisorConfig, MAX_INTENT_BYTES_LIMIT};
use crate::socket::{self, ReadOptions, MAX_FDS_PER_MESSAGE};
use crate::table::StubPid;

/// Payload of every spawn request message.
pub const SPAWN_REQUEST_MARKER: &str = "ZYPAK_SPAWN_REQUEST";
/// Written into a stub's notify channel once its process is gone.
pub const SPAWN_EXIT_TOKEN: &str = "ZYPAK_SPAWN_EXITED";

// Room for the marker, its NUL terminator, and one byte to catch longer payloads.
const REQUEST_BUF_LEN: usize = SPAWN_REQUEST_MARKER.len() + 2;
// Enough control space to count a few stray descriptors instead of truncating at one.
const REQUEST_MAX_FDS: usize = 4;

/// What the confined caller wants run. Opaque to the supervisor; it is
/// forwarded to the authority as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnIntent {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub clear_env: bool,
    /// Target descriptor numbers in the new process, one per descriptor sent
    /// along with the intent, in the same order.
    #[serde(default)]
    pub fd_map: Vec<RawFd>,
    #[serde(default)]
    pub flags: SpawnFlags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnFlags {
    #[serde(default)]
    pub expose_pids: bool,
    #[serde(default)]
    pub watch_bus: bool,
}

impl SpawnIntent {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Everything the authority needs to create the process.
#[derive(Debug)]
pub struct SpawnCall {
    pub intent: SpawnIntent,
    pub fds: Vec<OwnedFd>,
}

/// A validated request, ready to be recorded and forwarded.
#[derive(Debug)]
pub struct SpawnRequest {
    pub stub: StubPid,
    pub notify_exit: OwnedFd,
    pub call: SpawnCall,
}

#[derive(Debug)]
pub enum RequestError {
    Io(io::Error),
    /// Every client end of the request socket is gone.
    Closed,
    BadMarker,
    DescriptorCount(usize),
    MissingCredentials,
    MissingIntent,
    IntentTooLarge,
    BadIntent(serde_json::Error),
    InvalidIntent(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Io(err) => write!(f, "failed to read spawn request: {err}"),
            RequestError::Closed => f.write_str("spawn request socket closed by all clients"),
            RequestError::BadMarker => f.write_str("invalid supervisor spawn request data"),
            RequestError::DescriptorCount(n) => {
                write!(f, "expected one descriptor from supervisor client, got {n}")
            }
            RequestError::MissingCredentials => f.write_str("spawn request carried no sender pid"),
            RequestError::MissingIntent => f.write_str("no spawn intent waiting on notify channel"),
            RequestError::IntentTooLarge => f.write_str("spawn intent exceeds size limit"),
            RequestError::BadIntent(err) => write!(f, "malformed spawn intent: {err}"),
            RequestError::InvalidIntent(msg) => write!(f, "invalid spawn intent: {msg}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Io(err) => Some(err),
            RequestError::Closed => None,
            RequestError::BadMarker => None,
            RequestError::DescriptorCount(_) => None,
            RequestError::MissingCredentials => None,
            RequestError::MissingIntent => None,
            RequestError::IntentTooLarge => None,
            RequestError::BadIntent(err) => Some(err),
            RequestError::InvalidIntent(_) => None,
        }
    }
}

/// Supervisor end of the request socket.
#[derive(Debug)]
pub struct SpawnRequestListener {
    socket: OwnedFd,
    max_intent_bytes: usize,
}

impl SpawnRequestListener {
    /// Creates the request socket pair. The second value is the client end,
    /// to be handed to confined processes.
    pub fn open(config: &SupervisorConfig) -> Result<(Self, OwnedFd)> {
        let (listener_end, client_end) =
            socket::seqpacket_pair().context("open spawn request socket pair")?;
        let listener = Self::from_socket(listener_end, config.max_intent_bytes)?;
        Ok((listener, client_end))
    }

    pub fn from_socket(socket: OwnedFd, max_intent_bytes: usize) -> Result<Self> {
        if max_intent_bytes == 0 || max_intent_bytes > MAX_INTENT_BYTES_LIMIT {
            anyhow::bail!(
                "intent size cap {max_intent_bytes} outside 1..={MAX_INTENT_BYTES_LIMIT}"
            );
        }
        socket::enable_receive_pid(socket.as_fd())
            .context("cannot enable pid receival on supervisor fd")?;
        socket::set_nonblocking(socket.as_fd(), true).context("set supervisor fd non-blocking")?;
        Ok(Self {
            socket,
            max_intent_bytes,
        })
    }

    /// Reads and validates one request. `Ok(None)` means nothing was queued.
    ///
    /// Rejected requests are fully consumed; any descriptors they carried are
    /// closed before this returns.
    pub fn read_request(&self) -> Result<Option<SpawnRequest>, RequestError> {
        let mut buf = [0u8; REQUEST_BUF_LEN];
        let received = match socket::recv_with_ancillary(
            self.socket.as_fd(),
            &mut buf,
            ReadOptions {
                max_fds: REQUEST_MAX_FDS,
                want_pid: true,
                dont_wait: true,
            },
        ) {
            Ok(r) => r,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(RequestError::Io(err)),
        };

        debug!(bytes = received.len, fds = received.fds.len(), "read spawn request");

        // Credentials ride along with every real message, even an empty one;
        // a bare zero-length read is end of stream.
        if received.len == 0 && received.fds.is_empty() && received.pid.is_none() {
            return Err(RequestError::Closed);
        }

        if received.data_truncated || !is_marker(&buf[..received.len]) {
            return Err(RequestError::BadMarker);
        }

        if received.control_truncated || received.fds.len() != 1 {
            let n = if received.control_truncated {
                received.fds.len().max(REQUEST_MAX_FDS + 1)
            } else {
                received.fds.len()
            };
            return Err(RequestError::DescriptorCount(n));
        }

        let pid = received.pid.ok_or(RequestError::MissingCredentials)?;
        let mut fds = received.fds;
        let notify_exit = fds.remove(0);

        let call = read_intent(notify_exit.as_fd(), self.max_intent_bytes)?;

        Ok(Some(SpawnRequest {
            stub: StubPid(pid),
            notify_exit,
            call,
        }))
    }
}

impl AsFd for SpawnRequestListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

fn is_marker(payload: &[u8]) -> bool {
    let marker = SPAWN_REQUEST_MARKER.as_bytes();
    match payload.strip_suffix(b"\0") {
        Some(trimmed) => trimmed == marker,
        None => payload == marker,
    }
}

/// Pulls the intent the client queued on its notify channel before sending
/// the request. Never blocks.
fn read_intent(channel: BorrowedFd<'_>, max_bytes: usize) -> Result<SpawnCall, RequestError> {
    let mut buf = vec![0u8; max_bytes.saturating_add(1)];
    let received = match socket::recv_with_ancillary(
        channel,
        &mut buf,
        ReadOptions {
            max_fds: MAX_FDS_PER_MESSAGE,
            want_pid: false,
            dont_wait: true,
        },
    ) {
        Ok(r) => r,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            return Err(RequestError::MissingIntent)
        }
        Err(err) => return Err(RequestError::Io(err)),
    };

    if received.len == 0 {
        return Err(RequestError::MissingIntent);
    }
    if received.data_truncated || received.len > max_bytes {
        return Err(RequestError::IntentTooLarge);
    }
    if received.control_truncated {
        return Err(RequestError::InvalidIntent(format!(
            "more than {MAX_FDS_PER_MESSAGE} descriptors attached"
        )));
    }

    let intent: SpawnIntent =
        serde_json::from_slice(&buf[..received.len]).map_err(RequestError::BadIntent)?;
    validate_intent(&intent, received.fds.len())?;

    Ok(SpawnCall {
        intent,
        fds: received.fds,
    })
}

pub fn validate_intent(intent: &SpawnIntent, fd_count: usize) -> Result<(), RequestError> {
    if intent.argv.is_empty() {
        return Err(RequestError::InvalidIntent("argv is empty".to_string()));
    }
    if intent.fd_map.len() != fd_count {
        return Err(RequestError::InvalidIntent(format!(
            "fd_map names {} descriptors, {} attached",
            intent.fd_map.len(),
            fd_count
        )));
    }
    if let Some(bad) = intent.fd_map.iter().find(|fd| **fd < 0) {
        return Err(RequestError::InvalidIntent(format!(
            "fd_map target {bad} is negative"
        )));
    }
    Ok(())
}
