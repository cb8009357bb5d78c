// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Readiness backends behind [`WaitEventSet`](crate::WaitEventSet).
//!
//! Each backend holds a kernel polling object keyed by the event's
//! position in the owning set, so a readiness report maps straight back to
//! the registered event without a search.

use dbconfig::BackendPreference;
use dberr::{DbError, DbResult};

mod poll;
pub(crate) use poll::PollFdBackend;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub(crate) use epoll::EpollBackend;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))] {
        mod kqueue;
        pub(crate) use kqueue::KqueueBackend;
    }
}

/// What a backend wants to watch on one fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

/// One readiness report. `closed` covers error and hangup conditions,
/// which the set owner folds into whichever direction was requested.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub pos: usize,
    pub readable: bool,
    pub writeable: bool,
    pub closed: bool,
}

pub(crate) enum PollStatus {
    /// `out[..n]` holds readiness reports.
    Ready(usize),
    Timeout,
    /// A signal arrived; the caller rechecks its higher-priority sources
    /// and retries.
    Interrupted,
}

pub(crate) enum Backend {
    #[cfg(target_os = "linux")]
    Epoll(EpollBackend),
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue(KqueueBackend),
    Poll(PollFdBackend),
}

impl Backend {
    pub fn create(pref: BackendPreference, capacity: usize) -> DbResult<Backend> {
        match pref {
            BackendPreference::Auto => {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "linux")] {
                        Ok(Backend::Epoll(EpollBackend::new(capacity)?))
                    } else if #[cfg(any(
                        target_os = "macos",
                        target_os = "freebsd",
                        target_os = "netbsd",
                        target_os = "openbsd"
                    ))] {
                        Ok(Backend::Kqueue(KqueueBackend::new(capacity)?))
                    } else {
                        Ok(Backend::Poll(PollFdBackend::new(capacity)))
                    }
                }
            }
            BackendPreference::Epoll => {
                cfg_if::cfg_if! {
                    if #[cfg(target_os = "linux")] {
                        Ok(Backend::Epoll(EpollBackend::new(capacity)?))
                    } else {
                        Err(DbError::InvalidState("epoll backend not available on this platform"))
                    }
                }
            }
            BackendPreference::Kqueue => {
                cfg_if::cfg_if! {
                    if #[cfg(any(
                        target_os = "macos",
                        target_os = "freebsd",
                        target_os = "netbsd",
                        target_os = "openbsd"
                    ))] {
                        Ok(Backend::Kqueue(KqueueBackend::new(capacity)?))
                    } else {
                        Err(DbError::InvalidState("kqueue backend not available on this platform"))
                    }
                }
            }
            BackendPreference::Poll => Ok(Backend::Poll(PollFdBackend::new(capacity))),
        }
    }

    pub fn add(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.add(pos, fd, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(b) => b.add(pos, fd, interest),
            Backend::Poll(b) => b.add(pos, fd, interest),
        }
    }

    pub fn modify(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.modify(pos, fd, interest),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(b) => b.modify(pos, fd, interest),
            Backend::Poll(b) => b.modify(pos, fd, interest),
        }
    }

    /// Watch `SIGURG` delivery instead of an fd. Only meaningful on the
    /// kqueue backend; others reach the latch through an fd.
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    pub fn add_wake_signal(&mut self, pos: usize) -> DbResult {
        match self {
            Backend::Kqueue(b) => b.add_signal(pos, libc::SIGURG),
            Backend::Poll(_) => Err(DbError::InvalidState(
                "signal watch requires the kqueue backend",
            )),
        }
    }

    pub fn poll(&mut self, timeout_ms: i32, out: &mut [Readiness]) -> DbResult<PollStatus> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Epoll(b) => b.poll(timeout_ms, out),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(b) => b.poll(timeout_ms, out),
            Backend::Poll(b) => b.poll(timeout_ms, out),
        }
    }
}
