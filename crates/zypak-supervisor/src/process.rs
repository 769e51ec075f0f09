use std::io;

/// OS-level process operations the supervisor performs itself, as opposed to
/// the ones it asks the authority for.
pub trait ProcessControl: Send + Sync {
    fn kill(&self, pid: libc::pid_t, signal: libc::c_int) -> io::Result<()>;

    /// Blocks until `pid` has terminated and its process record is collected.
    fn reap(&self, pid: libc::pid_t) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn kill(&self, pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
        if pid <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {pid}"),
            ));
        }
        if unsafe { libc::kill(pid, signal) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn reap(&self, pid: libc::pid_t) -> io::Result<()> {
        if pid <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to wait on pid {pid}"),
            ));
        }
        loop {
            let mut status: libc::c_int = 0;
            if unsafe { libc::waitpid(pid, &mut status, 0) } != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// `ECHILD` from a reap means someone else already collected the process.
pub fn is_already_reaped(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ECHILD)
}
