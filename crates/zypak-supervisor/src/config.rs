use std::os::fd::RawFd;

use anyhow::{Context, Result};

pub const ENV_DEBUG: &str = "ZYPAK_DEBUG";
pub const ENV_SUPERVISOR_FD: &str = "ZYPAK_SUPERVISOR_FD";
pub const ENV_MAX_INTENT_BYTES: &str = "ZYPAK_MAX_INTENT_BYTES";

/// Well-known descriptor number confined processes find the request socket on.
pub const DEFAULT_SUPERVISOR_FD: RawFd = 235;
pub const DEFAULT_MAX_INTENT_BYTES: usize = 64 * 1024;
/// Upper bound for `ZYPAK_MAX_INTENT_BYTES`. The whole intent arrives as one
/// seqpacket message, which is already capped by the socket send buffer.
pub const MAX_INTENT_BYTES_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub debug: bool,
    /// Where the client end of the request socket gets duplicated to. `None`
    /// leaves it wherever `socketpair` put it.
    pub supervisor_fd: Option<RawFd>,
    pub max_intent_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            debug: false,
            supervisor_fd: Some(DEFAULT_SUPERVISOR_FD),
            max_intent_bytes: DEFAULT_MAX_INTENT_BYTES,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = lookup(ENV_DEBUG) {
            cfg.debug = parse_flag(&v);
        }

        if let Some(v) = lookup(ENV_SUPERVISOR_FD) {
            cfg.supervisor_fd = parse_fd(&v)
                .with_context(|| format!("invalid {ENV_SUPERVISOR_FD}={v:?}"))?;
        }

        if let Some(v) = lookup(ENV_MAX_INTENT_BYTES) {
            let n: usize = v
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_MAX_INTENT_BYTES}={v:?}"))?;
            if n == 0 {
                anyhow::bail!("{ENV_MAX_INTENT_BYTES} must be non-zero");
            }
            if n > MAX_INTENT_BYTES_LIMIT {
                anyhow::bail!("{ENV_MAX_INTENT_BYTES}={n} exceeds the limit of {MAX_INTENT_BYTES_LIMIT}");
            }
            cfg.max_intent_bytes = n;
        }

        Ok(cfg)
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_fd(v: &str) -> Result<Option<RawFd>> {
    let v = v.trim();
    if v.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let fd: RawFd = v.parse().context("not a descriptor number")?;
    if fd <= 2 {
        anyhow::bail!("descriptor {fd} is reserved for stdio");
    }
    Ok(Some(fd))
}
