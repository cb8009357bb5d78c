// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Linux epoll readiness backend. The registered event's set position
//! rides in `epoll_event.u64`, so the kernel hands it back with each
//! report.

use dberr::{DbError, DbResult};

use super::{Interest, PollStatus, Readiness};

pub(crate) struct EpollBackend {
    epfd: i32,
    events: Vec<libc::epoll_event>,
}

fn event_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.read {
        bits |= libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32;
    }
    if interest.write {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl EpollBackend {
    pub fn new(capacity: usize) -> DbResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(DbError::last_os());
        }
        Ok(EpollBackend {
            epfd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
        })
    }

    fn ctl(&self, op: i32, fd: i32, pos: usize, interest: Interest) -> DbResult {
        let mut ev = libc::epoll_event {
            events: event_bits(interest),
            u64: pos as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            // ENOMEM/ENOSPC are resource pressure the caller can react to;
            // anything else here is a bookkeeping bug.
            match dberr::errno() {
                libc::ENOMEM | libc::ENOSPC => Err(DbError::last_os()),
                _ => dberr::fatal("epoll_ctl() failed"),
            }
        } else {
            Ok(())
        }
    }

    pub fn add(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        self.ctl(libc::EPOLL_CTL_ADD, fd, pos, interest)
    }

    pub fn modify(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        self.ctl(libc::EPOLL_CTL_MOD, fd, pos, interest)
    }

    pub fn poll(&mut self, timeout_ms: i32, out: &mut [Readiness]) -> DbResult<PollStatus> {
        let max = (self.events.len().min(out.len()).max(1)) as i32;
        let rc = unsafe { libc::epoll_wait(self.epfd, self.events.as_mut_ptr(), max, timeout_ms) };
        if rc < 0 {
            return match dberr::errno() {
                libc::EINTR => Ok(PollStatus::Interrupted),
                _ => dberr::fatal("epoll_wait() failed"),
            };
        }
        if rc == 0 {
            return Ok(PollStatus::Timeout);
        }

        let n = rc as usize;
        for (slot, ev) in out.iter_mut().zip(self.events[..n].iter()) {
            let bits = ev.events;
            let closed = bits
                & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32)
                != 0;
            *slot = Readiness {
                pos: ev.u64 as usize,
                readable: bits & libc::EPOLLIN as u32 != 0 || closed,
                writeable: bits & libc::EPOLLOUT as u32 != 0 || closed,
                closed,
            };
        }
        Ok(PollStatus::Ready(n))
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
