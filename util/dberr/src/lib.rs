// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error codes shared by the x-dbcore IPC crates.

#[macro_use]
extern crate log;

use core::fmt;

mod tests;

/// Errors surfaced by the IPC primitives.
///
/// Transient syscall failures (`EINTR`, `EAGAIN` on the self-pipe) are
/// retried internally and never appear here. Fatal syscall failures go
/// through [`fatal`] instead of being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbError {
    /// No free slot or wait-set entry left.
    CapacityExceeded,
    /// The operation is not valid in the current state; the payload names
    /// the violated rule.
    InvalidState(&'static str),
    /// A cancellation request was observed; the caller is expected to run
    /// its interrupt handler before re-entering the wait.
    Interrupted,
    /// The supervisor process died and the death was positively verified.
    SupervisorDied,
    /// The message-queue counterparty detached.
    Detached,
    /// `nowait` was requested and the resource is not ready.
    WouldBlock,
    /// An unexpected errno from a recoverable syscall path.
    Sys(i32),
}

/// Result type used throughout the x-dbcore crates.
pub type DbResult<T = ()> = Result<T, DbError>;

impl DbError {
    /// Builds a [`DbError::Sys`] from the calling thread's current errno.
    pub fn last_os() -> Self {
        DbError::Sys(errno())
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::CapacityExceeded => write!(f, "capacity exceeded"),
            DbError::InvalidState(what) => write!(f, "invalid state: {what}"),
            DbError::Interrupted => write!(f, "interrupted by cancellation request"),
            DbError::SupervisorDied => write!(f, "supervisor process died"),
            DbError::Detached => write!(f, "counterparty detached"),
            DbError::WouldBlock => write!(f, "operation would block"),
            DbError::Sys(errno) => write!(f, "syscall failed: errno {errno}"),
        }
    }
}

impl std::error::Error for DbError {}

/// Reads the calling thread's errno.
pub fn errno() -> i32 {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    unsafe {
        *libc::__error()
    }
}

/// Overwrites the calling thread's errno.
///
/// Signal-handler paths save errno on entry and restore it on exit so the
/// interrupted code never observes a clobbered value.
pub fn set_errno(value: i32) {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = value;
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    unsafe {
        *libc::__error() = value;
    }
}

/// Logs a fatal condition and terminates the process.
///
/// Used for syscall failures that leave the wait machinery in an unusable
/// state (`epoll_ctl`, `kevent` returning an unexpected code). These are
/// not recoverable and must not unwind through callers.
pub fn fatal(what: &str) -> ! {
    error!("FATAL: {what}: errno {}", errno());
    std::process::exit(1);
}
