// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Supervisor-death detection.
//!
//! The supervisor holds the write end of a pipe it never writes to and
//! every child inherits the read end. When the supervisor exits for any
//! reason the read end turns readable (EOF), which readiness backends can
//! watch without polling.

use core::sync::atomic::{AtomicI32, Ordering};
use std::os::unix::io::RawFd;

use dberr::{DbError, DbResult};

use crate::Pid;

static SUPERVISOR_FD: AtomicI32 = AtomicI32::new(-1);
static SUPERVISOR_PID: AtomicI32 = AtomicI32::new(0);

/// Creates the liveness pipe in the supervisor, before any fork.
///
/// Returns `(read_fd, write_fd)`. The supervisor keeps the write end open
/// and does nothing with it; children close their inherited write end and
/// register the read end with [`set_supervisor_pipe`].
pub fn make_liveness_pipe() -> DbResult<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(DbError::last_os());
    }
    for fd in fds {
        unsafe {
            if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) == -1 {
                return Err(DbError::last_os());
            }
        }
    }
    Ok((fds[0], fds[1]))
}

/// Registers the inherited read end in a child process.
pub fn set_supervisor_pipe(read_fd: RawFd, supervisor: Pid) {
    SUPERVISOR_FD.store(read_fd, Ordering::Release);
    SUPERVISOR_PID.store(supervisor, Ordering::Release);
}

/// Whether this process runs under a supervisor at all. Standalone tools
/// that never called [`set_supervisor_pipe`] silently skip death checks.
pub fn under_supervisor() -> bool {
    SUPERVISOR_FD.load(Ordering::Acquire) >= 0
}

pub(crate) fn liveness_fd() -> RawFd {
    SUPERVISOR_FD.load(Ordering::Acquire)
}

/// Probes whether the supervisor is still alive.
///
/// A readiness report on the pipe can be stale by the time we act on it,
/// so callers re-verify with this read probe before trusting it:
/// `EAGAIN`/`EWOULDBLOCK` means no data and no EOF, hence alive; a zero
/// return is EOF, hence dead. Actual data on the pipe is a protocol
/// violation and treated as death.
pub fn supervisor_alive() -> bool {
    let fd = SUPERVISOR_FD.load(Ordering::Acquire);
    if fd < 0 {
        return true;
    }
    let mut byte = 0u8;
    loop {
        let rc = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if rc < 0 {
            match dberr::errno() {
                libc::EAGAIN => return true,
                libc::EINTR => continue,
                _ => dberr::fatal("read() on supervisor liveness pipe failed"),
            }
        }
        return false;
    }
}
