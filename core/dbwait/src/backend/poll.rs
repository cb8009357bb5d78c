// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Portable poll(2) readiness backend. The fd array is rebuilt in user
//! space on every registration change and handed to the kernel whole on
//! each wait, so it scales worse than epoll or kqueue but runs anywhere.

use dberr::DbResult;

use super::{Interest, PollStatus, Readiness};

pub(crate) struct PollFdBackend {
    fds: Vec<libc::pollfd>,
    // Set position of fds[i], parallel to `fds`.
    positions: Vec<usize>,
}

fn event_bits(interest: Interest) -> libc::c_short {
    let mut bits: libc::c_short = 0;
    if interest.read {
        bits |= libc::POLLIN;
    }
    if interest.write {
        bits |= libc::POLLOUT;
    }
    bits
}

impl PollFdBackend {
    pub fn new(capacity: usize) -> Self {
        PollFdBackend {
            fds: Vec::with_capacity(capacity),
            positions: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        self.fds.push(libc::pollfd {
            fd,
            events: event_bits(interest),
            revents: 0,
        });
        self.positions.push(pos);
        Ok(())
    }

    pub fn modify(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        for (i, p) in self.positions.iter().enumerate() {
            if *p == pos {
                self.fds[i].fd = fd;
                self.fds[i].events = event_bits(interest);
                return Ok(());
            }
        }
        // An unknown position means the caller and backend disagree about
        // what is registered.
        dberr::fatal("poll backend asked to modify an unregistered event")
    }

    pub fn poll(&mut self, timeout_ms: i32, out: &mut [Readiness]) -> DbResult<PollStatus> {
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return match dberr::errno() {
                libc::EINTR => Ok(PollStatus::Interrupted),
                _ => dberr::fatal("poll() failed"),
            };
        }
        if rc == 0 {
            return Ok(PollStatus::Timeout);
        }

        let mut n = 0;
        for (i, pfd) in self.fds.iter().enumerate() {
            if pfd.revents == 0 {
                continue;
            }
            if n >= out.len() {
                break;
            }
            let closed = pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
            out[n] = Readiness {
                pos: self.positions[i],
                readable: pfd.revents & libc::POLLIN != 0 || closed,
                writeable: pfd.revents & libc::POLLOUT != 0 || closed,
                closed,
            };
            n += 1;
        }
        Ok(PollStatus::Ready(n))
    }
}
