//! Unix seqpacket plumbing: socket pairs, descriptor passing (`SCM_RIGHTS`)
//! and kernel-attested sender pids (`SCM_CREDENTIALS`).

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Largest descriptor batch accepted in a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// How many descriptors the control buffer has room for. Anything past
    /// that is cut off by the kernel and reported via `control_truncated`.
    pub max_fds: usize,
    pub want_pid: bool,
    pub dont_wait: bool,
}

#[derive(Debug, Default)]
pub struct Received {
    pub len: usize,
    pub fds: Vec<OwnedFd>,
    pub pid: Option<libc::pid_t>,
    pub data_truncated: bool,
    pub control_truncated: bool,
}

/// A `SOCK_SEQPACKET` pair. Both ends are close-on-exec.
pub fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair succeeded, so both descriptors are open and ours.
    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((a, b))
}

/// Asks the kernel to attach the sender's credentials to every message
/// received on `fd`.
pub fn enable_receive_pid(fd: BorrowedFd<'_>) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            (&on as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicates `fd` onto `target`. The copy is inheritable across exec.
pub fn dup_onto(fd: BorrowedFd<'_>, target: RawFd) -> io::Result<()> {
    loop {
        if unsafe { libc::dup2(fd.as_raw_fd(), target) } != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sends one message, attaching `fds` as `SCM_RIGHTS`. Never raises SIGPIPE;
/// a closed peer shows up as `EPIPE`.
pub fn send_with_fds(fd: BorrowedFd<'_>, payload: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    send_message(fd, payload, fds, libc::MSG_NOSIGNAL)
}

fn send_message(
    fd: BorrowedFd<'_>,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
    flags: libc::c_int,
) -> io::Result<usize> {
    let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let fd_bytes = mem::size_of_val(raw_fds.as_slice());

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    // u64 words keep the buffer aligned for cmsghdr.
    let mut control: Vec<u64> = Vec::new();
    if !raw_fds.is_empty() {
        let space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        control.resize(space.div_ceil(mem::size_of::<u64>()), 0);
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        // SAFETY: the control buffer is large enough for one header plus the
        // descriptor array, as computed by CMSG_SPACE above.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
            ptr::copy_nonoverlapping(
                raw_fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                raw_fds.len(),
            );
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, flags) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Writes `payload` as one message. Short writes are reported as errors,
/// since seqpacket messages cannot be resumed.
pub fn write_message(fd: BorrowedFd<'_>, payload: &[u8]) -> io::Result<()> {
    check_full_write(send_message(fd, payload, &[], libc::MSG_NOSIGNAL)?, payload)
}

/// [`write_message`] that fails with `WouldBlock` instead of waiting for
/// buffer space.
pub fn try_write_message(fd: BorrowedFd<'_>, payload: &[u8]) -> io::Result<()> {
    let n = send_message(fd, payload, &[], libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT)?;
    check_full_write(n, payload)
}

pub fn check_full_write(n: usize, payload: &[u8]) -> io::Result<()> {
    if n != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {n} of {} bytes", payload.len()),
        ));
    }
    Ok(())
}

/// Receives one message into `buf`. Any descriptors that arrive are owned by
/// the result, so dropping it closes them.
pub fn recv_with_ancillary(
    fd: BorrowedFd<'_>,
    buf: &mut [u8],
    options: ReadOptions,
) -> io::Result<Received> {
    let max_fds = options.max_fds.min(MAX_FDS_PER_MESSAGE);
    let mut space = 0usize;
    if max_fds > 0 {
        space += unsafe { libc::CMSG_SPACE((max_fds * mem::size_of::<RawFd>()) as u32) } as usize;
    }
    if options.want_pid {
        space += unsafe { libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as u32) } as usize;
    }
    let mut control: Vec<u64> = vec![0; space.div_ceil(mem::size_of::<u64>())];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if space > 0 {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
    }

    let mut flags = libc::MSG_CMSG_CLOEXEC;
    if options.dont_wait {
        flags |= libc::MSG_DONTWAIT;
    }

    let len = loop {
        let n = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, flags) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut out = Received {
        len,
        data_truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        control_truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
        ..Received::default()
    };

    if space == 0 {
        return Ok(out);
    }

    // SAFETY: recvmsg filled the control buffer; the CMSG_* helpers walk it
    // within msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            let data = libc::CMSG_DATA(cmsg);
            let data_len = (hdr.cmsg_len as usize).saturating_sub(libc::CMSG_LEN(0) as usize);

            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_RIGHTS {
                let count = data_len / mem::size_of::<RawFd>();
                for i in 0..count {
                    let raw = ptr::read_unaligned(data.cast::<RawFd>().add(i));
                    out.fds.push(OwnedFd::from_raw_fd(raw));
                }
            } else if hdr.cmsg_level == libc::SOL_SOCKET
                && hdr.cmsg_type == libc::SCM_CREDENTIALS
                && data_len >= mem::size_of::<libc::ucred>()
            {
                let cred = ptr::read_unaligned(data.cast::<libc::ucred>());
                out.pid = Some(cred.pid);
            }

            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(out)
}
