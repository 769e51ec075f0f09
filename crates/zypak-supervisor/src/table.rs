use std::collections::HashMap;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::monitor::{Monitor, ReleaseNotify};

/// Pid of the confined stub process that asked for the spawn, as reported by
/// the kernel alongside its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubPid(pub i32);

/// Pid the authority assigned to the process it created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalPid(pub i32);

/// Pid of the created process inside its own pid namespace. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternalPid(pub i32);

impl fmt::Display for StubPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ExternalPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InternalPid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping for one spawn request.
#[derive(Debug)]
pub struct StubPidData {
    notify_exit: OwnedFd,
    external: Option<ExternalPid>,
    internal: Option<InternalPid>,
    exit_status: Option<i32>,
}

impl StubPidData {
    pub fn new(notify_exit: OwnedFd) -> Self {
        Self {
            notify_exit,
            external: None,
            internal: None,
            exit_status: None,
        }
    }

    pub fn notify_exit(&self) -> BorrowedFd<'_> {
        self.notify_exit.as_fd()
    }

    pub fn external(&self) -> Option<ExternalPid> {
        self.external
    }

    pub fn internal(&self) -> Option<InternalPid> {
        self.internal
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Returns `false` if an internal pid was already recorded.
    pub fn set_internal(&mut self, internal: InternalPid) -> bool {
        if self.internal.is_some() {
            return false;
        }
        self.internal = Some(internal);
        true
    }

    /// Returns `false` if an exit status was already recorded.
    pub fn set_exit_status(&mut self, status: i32) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        self.exit_status = Some(status);
        true
    }

    pub fn snapshot(&self) -> StubPidSnapshot {
        StubPidSnapshot {
            external: self.external,
            internal: self.internal,
            exit_status: self.exit_status,
        }
    }
}

/// Copy of the plain values of an entry, safe to hold after the lock is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubPidSnapshot {
    pub external: Option<ExternalPid>,
    pub internal: Option<InternalPid>,
    pub exit_status: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetExternalError {
    NoEntry,
    AlreadySet(ExternalPid),
    /// Another live stub already claims this external pid.
    Claimed(StubPid),
}

#[derive(Debug, Default)]
pub struct PidTables {
    stubs: HashMap<StubPid, StubPidData>,
    by_external: HashMap<ExternalPid, StubPid>,
}

impl PidTables {
    pub fn get(&self, stub: StubPid) -> Option<&StubPidData> {
        self.stubs.get(&stub)
    }

    pub fn stub_for_external(&self, external: ExternalPid) -> Option<StubPid> {
        self.by_external.get(&external).copied()
    }

    pub fn get_by_external_mut(
        &mut self,
        external: ExternalPid,
    ) -> Option<(StubPid, &mut StubPidData)> {
        let stub = self.stub_for_external(external)?;
        let data = self.stubs.get_mut(&stub)?;
        debug_assert_eq!(data.external, Some(external));
        Some((stub, data))
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }

    fn insert(&mut self, stub: StubPid, data: StubPidData) -> Result<(), StubPidData> {
        if self.stubs.contains_key(&stub) {
            return Err(data);
        }
        self.stubs.insert(stub, data);
        Ok(())
    }

    fn set_external(&mut self, stub: StubPid, external: ExternalPid) -> Result<(), SetExternalError> {
        if let Some(&other) = self.by_external.get(&external) {
            if other != stub {
                return Err(SetExternalError::Claimed(other));
            }
        }
        let data = self.stubs.get_mut(&stub).ok_or(SetExternalError::NoEntry)?;
        if let Some(existing) = data.external {
            return Err(SetExternalError::AlreadySet(existing));
        }
        data.external = Some(external);
        self.by_external.insert(external, stub);
        Ok(())
    }

    fn remove(&mut self, stub: StubPid) -> Option<StubPidData> {
        let data = self.stubs.remove(&stub)?;
        if let Some(external) = data.external {
            if self.by_external.get(&external) == Some(&stub) {
                self.by_external.remove(&external);
            }
        }
        Some(data)
    }

    fn take_exited(&mut self, stub: StubPid) -> Option<ExitedEntry> {
        let status = self.stubs.get(&stub)?.exit_status?;
        let data = self.remove(stub)?;
        Some(ExitedEntry { stub, status, data })
    }
}

/// An entry taken out of the table after its process exited.
#[derive(Debug)]
pub struct ExitedEntry {
    pub stub: StubPid,
    pub status: i32,
    pub data: StubPidData,
}

/// Non-blocking look at whether an entry is ready to be reaped.
#[derive(Debug)]
pub enum ExitLookup {
    /// The entry had an exit status and has been removed from the table.
    Exited(ExitedEntry),
    Running,
    Missing,
}

/// Stub pid → process bookkeeping, plus the external → stub index.
///
/// Every operation runs under one lock and every mutation wakes all blocked
/// waiters.
#[derive(Debug, Default)]
pub struct PidTranslationTable {
    tables: Monitor<PidTables>,
}

impl PidTranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false`, dropping `data`, if `stub` already has an entry.
    pub fn insert(&self, stub: StubPid, data: StubPidData) -> bool {
        let mut tables = self.tables.acquire(ReleaseNotify::All);
        tables.insert(stub, data).is_ok()
    }

    pub fn set_external(&self, stub: StubPid, external: ExternalPid) -> Result<(), SetExternalError> {
        let mut tables = self.tables.acquire(ReleaseNotify::All);
        tables.set_external(stub, external)
    }

    pub fn lookup(&self, stub: StubPid) -> Option<StubPidSnapshot> {
        let tables = self.tables.acquire(ReleaseNotify::None);
        tables.get(stub).map(StubPidData::snapshot)
    }

    pub fn lookup_by_external(&self, external: ExternalPid) -> Option<(StubPid, StubPidSnapshot)> {
        let tables = self.tables.acquire(ReleaseNotify::None);
        let stub = tables.stub_for_external(external)?;
        tables.get(stub).map(|data| (stub, data.snapshot()))
    }

    /// Runs `f` against the entry registered under `external`, as one locked step.
    pub fn update_by_external<R>(
        &self,
        external: ExternalPid,
        f: impl FnOnce(StubPid, &mut StubPidData) -> R,
    ) -> Option<R> {
        let mut tables = self.tables.acquire(ReleaseNotify::All);
        let (stub, data) = tables.get_by_external_mut(external)?;
        Some(f(stub, data))
    }

    pub fn remove(&self, stub: StubPid) -> Option<StubPidData> {
        let mut tables = self.tables.acquire(ReleaseNotify::All);
        tables.remove(stub)
    }

    pub fn len(&self) -> usize {
        self.tables.acquire(ReleaseNotify::None).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until `f` yields a value, re-running it after every mutation.
    pub fn wait_until<R>(&self, f: impl FnMut(&PidTables) -> Option<R>) -> R {
        let (mut tables, out) = self.tables.acquire_map(f);
        tables.set_notify(ReleaseNotify::None);
        out
    }

    pub fn take_exited(&self, stub: StubPid) -> ExitLookup {
        let mut tables = self.tables.acquire(ReleaseNotify::None);
        match tables.get(stub).map(StubPidData::exit_status) {
            None => ExitLookup::Missing,
            Some(None) => ExitLookup::Running,
            Some(Some(_)) => {
                tables.set_notify(ReleaseNotify::All);
                tables
                    .take_exited(stub)
                    .map_or(ExitLookup::Missing, ExitLookup::Exited)
            }
        }
    }

    /// Blocks until `stub` has either exited or vanished. An exited entry is
    /// removed and handed back.
    pub fn wait_exited(&self, stub: StubPid) -> Option<ExitedEntry> {
        let (mut tables, exited) = self.tables.acquire_map(|t| match t.get(stub) {
            None => Some(false),
            Some(data) => data.exit_status.map(|_| true),
        });
        if !exited {
            tables.set_notify(ReleaseNotify::None);
            return None;
        }
        tables.take_exited(stub)
    }

    /// Blocks until `stub` has an internal pid or has vanished.
    pub fn wait_internal(&self, stub: StubPid) -> Option<InternalPid> {
        self.wait_until(|t| match t.get(stub) {
            None => Some(None),
            Some(data) => data.internal.map(Some),
        })
    }
}
