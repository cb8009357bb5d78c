// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Wait-event sets: one blocking point per process that multiplexes the
//! latch, supervisor liveness, and any number of sockets.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use dbconfig::BackendPreference;
use dberr::{DbError, DbResult};
use log::error;

use crate::backend::{Backend, Interest, PollStatus, Readiness};
use crate::latch::Latch;
use crate::{parent, transport};

bitflags! {
    /// What to wait for, and what fired.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WaitEventMask: u32 {
        const LATCH_SET = 1 << 0;
        const SOCKET_READABLE = 1 << 1;
        const SOCKET_WRITEABLE = 1 << 2;
        const TIMEOUT = 1 << 3;
        const SUPERVISOR_DEATH = 1 << 4;
        /// Like `SUPERVISOR_DEATH`, but the waiting process exits
        /// immediately instead of seeing an event.
        const EXIT_ON_SUPERVISOR_DEATH = 1 << 5;
        /// Peer closed its end. Detection quality varies by backend; a
        /// close may also surface through the readable/writeable bits.
        const SOCKET_CLOSED = 1 << 6;
    }
}

impl WaitEventMask {
    /// An in-progress non-blocking connect completing is reported as
    /// writeable on POSIX.
    pub const SOCKET_CONNECTED: WaitEventMask = WaitEventMask::SOCKET_WRITEABLE;

    const SOCKET_BITS: WaitEventMask = WaitEventMask::SOCKET_READABLE
        .union(WaitEventMask::SOCKET_WRITEABLE)
        .union(WaitEventMask::SOCKET_CLOSED);
}

/// One fired event, as returned by [`WaitEventSet::wait`].
#[derive(Debug, Clone, Copy)]
pub struct WaitEvent {
    /// Registration position, as returned by the `add_*` methods.
    pub pos: usize,
    /// The subset of the registered mask that fired.
    pub events: WaitEventMask,
    pub fd: RawFd,
    /// Opaque value supplied at registration, handed back untouched.
    pub tag: u64,
}

impl WaitEvent {
    pub const fn empty() -> Self {
        WaitEvent {
            pos: 0,
            events: WaitEventMask::empty(),
            fd: -1,
            tag: 0,
        }
    }
}

struct Registered {
    mask: WaitEventMask,
    fd: RawFd,
    tag: u64,
}

/// A fixed-capacity set of wait events backed by a kernel polling object.
///
/// Registrations are made once (sockets may later change direction with
/// [`modify_socket`](Self::modify_socket)); the kernel object persists
/// across waits, which is what makes repeated waiting cheap.
pub struct WaitEventSet {
    backend: Backend,
    events: Vec<Registered>,
    capacity: usize,
    latch: Option<&'static Latch>,
    latch_pos: Option<usize>,
    death_pos: Option<usize>,
    exit_on_death: bool,
    ready: Vec<Readiness>,
}

impl WaitEventSet {
    pub fn new(pref: BackendPreference, capacity: usize) -> DbResult<Self> {
        transport::ensure_current()?;
        Ok(WaitEventSet {
            backend: Backend::create(pref, capacity)?,
            events: Vec::with_capacity(capacity),
            capacity,
            latch: None,
            latch_pos: None,
            death_pos: None,
            exit_on_death: false,
            ready: vec![
                Readiness {
                    pos: 0,
                    readable: false,
                    writeable: false,
                    closed: false
                };
                capacity.max(1)
            ],
        })
    }

    fn push(&mut self, mask: WaitEventMask, fd: RawFd, tag: u64) -> DbResult<usize> {
        if self.events.len() >= self.capacity {
            return Err(DbError::CapacityExceeded);
        }
        self.events.push(Registered { mask, fd, tag });
        Ok(self.events.len() - 1)
    }

    /// Registers the process latch. The caller must own the latch; a set
    /// can watch at most one. `tag` travels back in the fired event.
    pub fn add_latch(&mut self, latch: &'static Latch, tag: u64) -> DbResult<usize> {
        if self.latch_pos.is_some() {
            return Err(DbError::InvalidState("wait set already watches a latch"));
        }
        if !latch.is_owned_by_me() {
            return Err(DbError::InvalidState("waiting on a latch we do not own"));
        }

        let fd = transport::latch_fd();
        let pos = self.push(WaitEventMask::LATCH_SET, fd, tag)?;
        if fd >= 0 {
            self.backend.add(
                pos,
                fd,
                Interest {
                    read: true,
                    write: false,
                },
            )?;
        } else {
            cfg_if::cfg_if! {
                if #[cfg(any(
                    target_os = "macos",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))] {
                    self.backend.add_wake_signal(pos)?;
                } else {
                    return Err(DbError::InvalidState("wakeup transport has no fd"));
                }
            }
        }
        self.latch = Some(latch);
        self.latch_pos = Some(pos);
        Ok(pos)
    }

    /// Registers supervisor-death monitoring. With `exit_on_death` the
    /// process exits with status 1 the moment death is confirmed instead
    /// of receiving an event.
    pub fn add_supervisor_death(&mut self, exit_on_death: bool, tag: u64) -> DbResult<usize> {
        if self.death_pos.is_some() {
            return Err(DbError::InvalidState(
                "wait set already watches supervisor death",
            ));
        }
        let fd = parent::liveness_fd();
        if fd < 0 {
            return Err(DbError::InvalidState(
                "no supervisor liveness pipe registered",
            ));
        }
        let mask = if exit_on_death {
            WaitEventMask::EXIT_ON_SUPERVISOR_DEATH
        } else {
            WaitEventMask::SUPERVISOR_DEATH
        };
        let pos = self.push(mask, fd, tag)?;
        self.backend.add(
            pos,
            fd,
            Interest {
                read: true,
                write: false,
            },
        )?;
        self.death_pos = Some(pos);
        self.exit_on_death = exit_on_death;
        Ok(pos)
    }

    /// Registers a socket (or any pollable fd) for the directions in
    /// `mask`.
    pub fn add_socket(&mut self, fd: RawFd, mask: WaitEventMask, tag: u64) -> DbResult<usize> {
        if fd < 0 {
            return Err(DbError::InvalidState("socket registered without an fd"));
        }
        let mask = mask & WaitEventMask::SOCKET_BITS;
        if mask.is_empty() {
            return Err(DbError::InvalidState("socket registered with no direction"));
        }
        let pos = self.push(mask, fd, tag)?;
        self.backend.add(pos, fd, socket_interest(mask))?;
        Ok(pos)
    }

    /// Changes the watched directions of a previously added socket.
    pub fn modify_socket(&mut self, pos: usize, mask: WaitEventMask) -> DbResult {
        let mask = mask & WaitEventMask::SOCKET_BITS;
        let reg = self
            .events
            .get_mut(pos)
            .ok_or(DbError::InvalidState("no event at this position"))?;
        if !reg.mask.intersects(WaitEventMask::SOCKET_BITS) {
            return Err(DbError::InvalidState("position is not a socket event"));
        }
        if reg.mask == mask {
            return Ok(());
        }
        reg.mask = mask;
        let fd = reg.fd;
        self.backend.modify(pos, fd, socket_interest(mask))
    }

    /// Blocks until something fires or `timeout` elapses.
    ///
    /// Returns the number of events stored in `out`; zero means timeout.
    /// A pending interrupt raised through `dbsignal` aborts the wait with
    /// [`DbError::Interrupted`] so the caller can service it.
    pub fn wait(&mut self, timeout: Option<Duration>, out: &mut [WaitEvent]) -> DbResult<usize> {
        transport::ensure_current()?;
        if out.is_empty() {
            return Err(DbError::InvalidState("wait needs room for at least one event"));
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        // The wake paths only write the self-pipe byte while this flag is
        // up, so it has to cover the whole arm/recheck/poll sequence, not
        // just the syscall. A set landing between the recheck and the poll
        // must still produce a byte.
        transport::set_waiting(true);
        let result = self.wait_inner(deadline, out);
        transport::set_waiting(false);
        result
    }

    fn wait_inner(&mut self, deadline: Option<Instant>, out: &mut [WaitEvent]) -> DbResult<usize> {
        loop {
            if dbsignal::interrupt_pending() {
                return Err(DbError::Interrupted);
            }

            // Latch fast path: already set, no need to enter the kernel.
            if let (Some(latch), Some(pos)) = (self.latch, self.latch_pos) {
                if latch.is_set() {
                    out[0] = self.latch_event(pos);
                    return Ok(1);
                }
                // Arm the sleep flag, then recheck: a setter that misses
                // the flag must have stored is_set before our recheck, a
                // setter that sees it will send a wake. Either way the set
                // cannot be lost.
                latch.arm_sleep();
                if latch.is_set() {
                    latch.disarm_sleep();
                    out[0] = self.latch_event(pos);
                    return Ok(1);
                }
            }

            let timeout_ms = match deadline {
                None => -1,
                Some(d) => remaining_ms(d),
            };

            let status = self.backend.poll(timeout_ms, &mut self.ready);
            if let Some(latch) = self.latch {
                latch.disarm_sleep();
            }
            let status = status?;

            match status {
                PollStatus::Interrupted => continue,
                PollStatus::Timeout => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(0);
                    }
                    // Kernel rounded the wait short; go around again.
                    continue;
                }
                PollStatus::Ready(n) => {
                    let reported = self.collect(n, out)?;
                    if reported > 0 {
                        return Ok(reported);
                    }
                    // Everything was spurious (stale pipe byte, supervisor
                    // still alive on re-probe).
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(0);
                    }
                }
            }
        }
    }

    fn latch_event(&self, pos: usize) -> WaitEvent {
        WaitEvent {
            pos,
            events: WaitEventMask::LATCH_SET,
            fd: self.events[pos].fd,
            tag: self.events[pos].tag,
        }
    }

    fn collect(&mut self, n: usize, out: &mut [WaitEvent]) -> DbResult<usize> {
        // A set latch outranks everything else that came ready in the
        // same poll: it is reported alone and the other sources are left
        // for the next wait.
        if let (Some(latch), Some(pos)) = (self.latch, self.latch_pos) {
            if latch.is_set() {
                transport::drain();
                out[0] = self.latch_event(pos);
                return Ok(1);
            }
        }

        let mut reported = 0;
        for i in 0..n {
            if reported >= out.len() {
                break;
            }
            let hit = self.ready[i];
            let reg = &self.events[hit.pos];

            if Some(hit.pos) == self.latch_pos {
                // Stale pipe byte from before the last reset; the latch
                // itself was checked above and is not set.
                transport::drain();
                continue;
            }

            if Some(hit.pos) == self.death_pos {
                // Readiness on the liveness pipe can be stale; trust only
                // the read probe.
                if parent::supervisor_alive() {
                    continue;
                }
                if self.exit_on_death {
                    error!("supervisor exited, terminating");
                    unsafe { libc::_exit(1) };
                }
                out[reported] = WaitEvent {
                    pos: hit.pos,
                    events: WaitEventMask::SUPERVISOR_DEATH,
                    fd: reg.fd,
                    tag: reg.tag,
                };
                reported += 1;
                continue;
            }

            let mut fired = WaitEventMask::empty();
            if hit.readable && reg.mask.contains(WaitEventMask::SOCKET_READABLE) {
                fired |= WaitEventMask::SOCKET_READABLE;
            }
            if hit.writeable && reg.mask.contains(WaitEventMask::SOCKET_WRITEABLE) {
                fired |= WaitEventMask::SOCKET_WRITEABLE;
            }
            if hit.closed {
                // EOF is folded into the requested directions so callers
                // that only asked to read or write still notice it.
                fired |= reg.mask
                    & (WaitEventMask::SOCKET_READABLE
                        | WaitEventMask::SOCKET_WRITEABLE
                        | WaitEventMask::SOCKET_CLOSED);
            }
            if fired.is_empty() {
                continue;
            }
            out[reported] = WaitEvent {
                pos: hit.pos,
                events: fired,
                fd: reg.fd,
                tag: reg.tag,
            };
            reported += 1;
        }
        Ok(reported)
    }
}

fn socket_interest(mask: WaitEventMask) -> Interest {
    Interest {
        // CLOSED-only watches still need a read-side registration for the
        // kernel to report the hangup.
        read: mask.intersects(WaitEventMask::SOCKET_READABLE | WaitEventMask::SOCKET_CLOSED),
        write: mask.contains(WaitEventMask::SOCKET_WRITEABLE),
    }
}

fn remaining_ms(deadline: Instant) -> i32 {
    let now = Instant::now();
    if now >= deadline {
        return 0;
    }
    let remaining = deadline - now;
    let ms = remaining.as_millis();
    // Round up so we never wake just short of the deadline and spin.
    let ms = if Duration::from_millis(ms as u64) < remaining {
        ms + 1
    } else {
        ms
    };
    ms.min(i32::MAX as u128) as i32
}

/// Waits on a single latch, optionally watching supervisor death and a
/// timeout. Returns the mask of what fired; `TIMEOUT` when nothing did.
pub fn wait_latch(
    latch: &'static Latch,
    mask: WaitEventMask,
    timeout: Option<Duration>,
) -> DbResult<WaitEventMask> {
    let mut set = WaitEventSet::new(BackendPreference::default(), 2)?;
    if mask.contains(WaitEventMask::LATCH_SET) {
        set.add_latch(latch, 0)?;
    }
    if mask.contains(WaitEventMask::EXIT_ON_SUPERVISOR_DEATH) {
        set.add_supervisor_death(true, 0)?;
    } else if mask.contains(WaitEventMask::SUPERVISOR_DEATH) {
        set.add_supervisor_death(false, 0)?;
    }

    let mut out = [WaitEvent::empty(); 2];
    let n = set.wait(timeout, &mut out)?;
    if n == 0 {
        return Ok(WaitEventMask::TIMEOUT);
    }
    let mut fired = WaitEventMask::empty();
    for ev in &out[..n] {
        fired |= ev.events;
    }
    Ok(fired)
}
