// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Inter-process latches and the wait-event-set API.
//!
//! A latch is a level-triggered single-bit event with one owner-waiter and
//! many wakers; setting it from another process or from a signal handler
//! reliably wakes the owner out of a blocked wait. The self-pipe trick
//! carries the wake: a signal alone does not interrupt `poll()` on every
//! platform, and a signal that arrives just before the syscall does not
//! prevent it from sleeping, but a byte in a pipe the set also watches
//! reliably does.
//!
//! A [`WaitEventSet`] aggregates heterogeneous wake sources (one latch,
//! sockets, the supervisor liveness pipe, a timeout) behind a single
//! blocking syscall, dispatched to epoll, kqueue or poll per platform.

#[macro_use]
extern crate log;

mod backend;
mod latch;
mod parent;
mod tests;
mod transport;
mod waitset;

pub use dbsignal::Pid;
pub use latch::{Latch, MAX_PROCS, SharedLatchTable};
pub use parent::{make_liveness_pipe, set_supervisor_pipe, supervisor_alive, under_supervisor};
pub use transport::{WakeMode, init_latch_support, post_fork_reset};
pub use waitset::{WaitEvent, WaitEventMask, WaitEventSet, wait_latch};
