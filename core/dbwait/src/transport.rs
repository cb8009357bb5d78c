// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The per-process wakeup transport.
//!
//! Contract: a process entering a blocking wait arms the transport, the
//! waker side calls [`wake_local`] or [`wake_remote`], and the in-flight
//! wait returns promptly. State lives in raw statics rather than behind a
//! lock because [`wake_local`] runs in signal-handler context.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::os::unix::io::RawFd;

use dberr::{DbError, DbResult};
use log::debug;

use crate::Pid;

/// How latch wakes travel between processes.
///
/// `SelfPipe` works with every readiness backend and is the default; a
/// `SIGUSR1` handler in the target writes a byte to the target's own pipe.
/// `SignalFd` (Linux) keeps `SIGURG` blocked and delivers it through a
/// nonblocking signalfd watched by the epoll set instead; the caller must
/// guarantee `SIGURG` is blocked in every thread of the process.
/// `KqueueSignal` (BSDs, macOS) registers an `EVFILT_SIGNAL` node for
/// `SIGURG` and leaves the disposition ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeMode {
    #[default]
    SelfPipe,
    #[cfg(target_os = "linux")]
    SignalFd,
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    KqueueSignal,
}

const KIND_UNINIT: u8 = 0;
const KIND_SELF_PIPE: u8 = 1;
const KIND_SIGNAL_FD: u8 = 2;
const KIND_KQUEUE_SIGNAL: u8 = 3;

static KIND: AtomicU8 = AtomicU8::new(KIND_UNINIT);
static OWNER_PID: AtomicI32 = AtomicI32::new(0);
static PIPE_READ_FD: AtomicI32 = AtomicI32::new(-1);
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

// Are we currently inside WaitEventSet::wait? The signal handler wants to
// know so it only fills the pipe when someone is listening.
static WAITING: AtomicBool = AtomicBool::new(false);

fn my_pid() -> Pid {
    unsafe { libc::getpid() }
}

fn set_nonblock_cloexec(fd: RawFd) -> DbResult {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) == -1 {
            return Err(DbError::last_os());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == -1 {
            return Err(DbError::last_os());
        }
    }
    Ok(())
}

/// Initialises the wakeup transport for this process.
///
/// Must run before the first wait and before owning any latch. Calling it
/// twice in the same process is a startup bug and is reported as such;
/// after `fork` the child calls [`post_fork_reset`] instead.
pub fn init_latch_support(mode: WakeMode) -> DbResult {
    if OWNER_PID.load(Ordering::Acquire) == my_pid() {
        return Err(DbError::InvalidState("latch support already initialized"));
    }
    init_for_this_process(mode)
}

fn init_for_this_process(mode: WakeMode) -> DbResult {
    match mode {
        WakeMode::SelfPipe => {
            let mut fds = [0 as RawFd; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(DbError::last_os());
            }
            // Nonblocking on both ends: the write side must not stall a
            // waker when the buffer is full, and the read side is drained
            // until EAGAIN.
            set_nonblock_cloexec(fds[0])?;
            set_nonblock_cloexec(fds[1])?;
            PIPE_READ_FD.store(fds[0], Ordering::Release);
            PIPE_WRITE_FD.store(fds[1], Ordering::Release);
            KIND.store(KIND_SELF_PIPE, Ordering::Release);
            dbsignal::set_wake_hook(signal_wake_hook);
        }
        #[cfg(target_os = "linux")]
        WakeMode::SignalFd => {
            unsafe {
                let mut mask: libc::sigset_t = core::mem::zeroed();
                libc::sigemptyset(&mut mask);
                libc::sigaddset(&mut mask, libc::SIGURG);
                if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, core::ptr::null_mut()) != 0 {
                    return Err(DbError::last_os());
                }
                let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
                if fd < 0 {
                    return Err(DbError::last_os());
                }
                SIGNAL_FD.store(fd, Ordering::Release);
            }
            KIND.store(KIND_SIGNAL_FD, Ordering::Release);
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        WakeMode::KqueueSignal => {
            // The kqueue filter sees the signal regardless of disposition;
            // ignore it so an unwatched delivery cannot kill the process.
            unsafe {
                libc::signal(libc::SIGURG, libc::SIG_IGN);
            }
            KIND.store(KIND_KQUEUE_SIGNAL, Ordering::Release);
        }
    }

    OWNER_PID.store(my_pid(), Ordering::Release);
    debug!("wakeup transport ready: {mode:?}");
    Ok(())
}

/// Re-creates the transport in a freshly forked child.
///
/// The inherited pipe fds belong to the parent's transport; the child
/// closes its copies and builds its own pair before its first wait.
pub fn post_fork_reset() -> DbResult {
    let owner = OWNER_PID.load(Ordering::Acquire);
    if owner == my_pid() {
        return Err(DbError::InvalidState(
            "post_fork_reset called without an intervening fork",
        ));
    }

    let r = PIPE_READ_FD.swap(-1, Ordering::AcqRel);
    let w = PIPE_WRITE_FD.swap(-1, Ordering::AcqRel);
    let s = SIGNAL_FD.swap(-1, Ordering::AcqRel);
    unsafe {
        if r >= 0 {
            libc::close(r);
        }
        if w >= 0 {
            libc::close(w);
        }
        if s >= 0 {
            libc::close(s);
        }
    }

    let mode = match KIND.load(Ordering::Acquire) {
        #[cfg(target_os = "linux")]
        KIND_SIGNAL_FD => WakeMode::SignalFd,
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        KIND_KQUEUE_SIGNAL => WakeMode::KqueueSignal,
        _ => WakeMode::SelfPipe,
    };
    init_for_this_process(mode)
}

/// Ensures the transport belongs to the calling process, initialising it
/// lazily on first use and refusing to run on fds inherited from a parent.
pub(crate) fn ensure_current() -> DbResult {
    let owner = OWNER_PID.load(Ordering::Acquire);
    if owner == my_pid() {
        return Ok(());
    }
    if owner == 0 {
        init_for_this_process(WakeMode::SelfPipe)
    } else {
        // Forked child still pointing at the parent's pipe.
        post_fork_reset()
    }
}

fn kind() -> u8 {
    KIND.load(Ordering::Acquire)
}

/// The fd a readiness backend watches for latch wakes, or -1 when the
/// transport has no fd (kqueue signal filter).
pub(crate) fn latch_fd() -> RawFd {
    match kind() {
        KIND_SELF_PIPE => PIPE_READ_FD.load(Ordering::Acquire),
        KIND_SIGNAL_FD => SIGNAL_FD.load(Ordering::Acquire),
        _ => -1,
    }
}

pub(crate) fn set_waiting(waiting: bool) {
    WAITING.store(waiting, Ordering::Release);
}

/// Wakes an in-flight wait in this process. Async-signal-safe.
pub(crate) fn wake_local() {
    match kind() {
        KIND_SELF_PIPE => {
            if WAITING.load(Ordering::Acquire) {
                send_self_pipe_byte();
            }
        }
        KIND_SIGNAL_FD | KIND_KQUEUE_SIGNAL => unsafe {
            libc::kill(libc::getpid(), libc::SIGURG);
        },
        _ => {}
    }
}

/// Wakes an in-flight wait in another process. A dead pid is ignored.
pub(crate) fn wake_remote(pid: Pid) {
    match kind() {
        KIND_SELF_PIPE => dbsignal::kick(pid),
        KIND_SIGNAL_FD | KIND_KQUEUE_SIGNAL => unsafe {
            libc::kill(pid, libc::SIGURG);
        },
        _ => {}
    }
}

// Runs at the tail of the SIGUSR1 handler: write the wake byte on behalf
// of whichever process signalled us.
fn signal_wake_hook() {
    if WAITING.load(Ordering::Acquire) {
        send_self_pipe_byte();
    }
}

/// Writes one byte to the self-pipe.
///
/// Runs in signal handlers: errno is saved and restored, `EINTR` retried,
/// `EAGAIN` ignored (a full pipe already suffices to wake), anything else
/// silently dropped because there is no safe way to report it here.
fn send_self_pipe_byte() {
    let fd = PIPE_WRITE_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let saved_errno = dberr::errno();
    let dummy: u8 = 0;
    loop {
        let rc = unsafe { libc::write(fd, &dummy as *const u8 as *const libc::c_void, 1) };
        if rc >= 0 {
            break;
        }
        match dberr::errno() {
            libc::EINTR => continue,
            _ => break,
        }
    }
    dberr::set_errno(saved_errno);
}

/// Empties the latch fd after it reported readable, so a queued byte does
/// not cause a second spurious wake.
pub(crate) fn drain() {
    match kind() {
        KIND_SELF_PIPE => {
            let fd = PIPE_READ_FD.load(Ordering::Acquire);
            // Normally one byte, maybe a few if several processes ran
            // SetLatch at the same instant.
            let mut buf = [0u8; 16];
            loop {
                let rc =
                    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if rc < 0 {
                    match dberr::errno() {
                        libc::EAGAIN => break,
                        libc::EINTR => continue,
                        _ => dberr::fatal("read() on self-pipe failed"),
                    }
                } else if rc == 0 {
                    dberr::fatal("unexpected EOF on self-pipe");
                } else if (rc as usize) < buf.len() {
                    break;
                }
            }
        }
        #[cfg(target_os = "linux")]
        KIND_SIGNAL_FD => {
            let fd = SIGNAL_FD.load(Ordering::Acquire);
            let mut info: libc::signalfd_siginfo = unsafe { core::mem::zeroed() };
            let sz = core::mem::size_of::<libc::signalfd_siginfo>();
            loop {
                let rc =
                    unsafe { libc::read(fd, &mut info as *mut _ as *mut libc::c_void, sz) };
                if rc < 0 {
                    match dberr::errno() {
                        libc::EAGAIN => break,
                        libc::EINTR => continue,
                        _ => dberr::fatal("read() on signalfd failed"),
                    }
                }
            }
        }
        _ => {}
    }
}
