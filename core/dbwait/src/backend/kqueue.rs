// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! BSD kqueue readiness backend. Read and write interest are separate
//! filter nodes in the kernel queue; the set position travels in `udata`.

use dberr::{DbError, DbResult};

use super::{Interest, PollStatus, Readiness};

pub(crate) struct KqueueBackend {
    kq: i32,
    events: Vec<libc::kevent>,
}

fn kev(ident: usize, filter: i16, flags: u16, pos: usize) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: pos as *mut libc::c_void,
    }
}

impl KqueueBackend {
    pub fn new(capacity: usize) -> DbResult<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(DbError::last_os());
        }
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(KqueueBackend {
            kq,
            events: vec![kev(0, 0, 0, 0); capacity.max(1)],
        })
    }

    fn apply(&self, changes: &[libc::kevent]) -> DbResult {
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                core::ptr::null_mut(),
                0,
                core::ptr::null(),
            )
        };
        if rc < 0 {
            match dberr::errno() {
                libc::ENOMEM => Err(DbError::last_os()),
                _ => dberr::fatal("kevent() change list failed"),
            }
        } else {
            Ok(())
        }
    }

    pub fn add(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        let mut changes = Vec::with_capacity(2);
        if interest.read {
            changes.push(kev(fd as usize, libc::EVFILT_READ, libc::EV_ADD, pos));
        }
        if interest.write {
            changes.push(kev(fd as usize, libc::EVFILT_WRITE, libc::EV_ADD, pos));
        }
        self.apply(&changes)
    }

    pub fn modify(&mut self, pos: usize, fd: i32, interest: Interest) -> DbResult {
        // EV_ADD on an existing node updates it; the unwanted direction is
        // deleted and ENOENT from deleting an absent node is fine, so the
        // two directions go down in separate change lists.
        let read_flags = if interest.read { libc::EV_ADD } else { libc::EV_DELETE };
        let write_flags = if interest.write { libc::EV_ADD } else { libc::EV_DELETE };
        for (filter, flags, wanted) in [
            (libc::EVFILT_READ, read_flags, interest.read),
            (libc::EVFILT_WRITE, write_flags, interest.write),
        ] {
            let change = [kev(fd as usize, filter, flags, pos)];
            let rc = unsafe {
                libc::kevent(
                    self.kq,
                    change.as_ptr(),
                    1,
                    core::ptr::null_mut(),
                    0,
                    core::ptr::null(),
                )
            };
            if rc < 0 && (wanted || dberr::errno() != libc::ENOENT) {
                dberr::fatal("kevent() change list failed");
            }
        }
        Ok(())
    }

    /// Registers a signal filter node; delivery of `signo` then surfaces
    /// as a readable report at `pos` without any fd.
    pub fn add_signal(&mut self, pos: usize, signo: i32) -> DbResult {
        self.apply(&[kev(signo as usize, libc::EVFILT_SIGNAL, libc::EV_ADD, pos)])
    }

    pub fn poll(&mut self, timeout_ms: i32, out: &mut [Readiness]) -> DbResult<PollStatus> {
        let ts;
        let ts_ptr = if timeout_ms < 0 {
            core::ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: (timeout_ms % 1000) as libc::c_long * 1_000_000,
            };
            &ts as *const libc::timespec
        };

        let max = self.events.len().min(out.len()).max(1) as libc::c_int;
        let rc = unsafe {
            libc::kevent(
                self.kq,
                core::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                max,
                ts_ptr,
            )
        };
        if rc < 0 {
            return match dberr::errno() {
                libc::EINTR => Ok(PollStatus::Interrupted),
                _ => dberr::fatal("kevent() wait failed"),
            };
        }
        if rc == 0 {
            return Ok(PollStatus::Timeout);
        }

        let n = rc as usize;
        for (slot, ev) in out.iter_mut().zip(self.events[..n].iter()) {
            let closed = ev.flags & libc::EV_EOF != 0 || ev.flags & libc::EV_ERROR != 0;
            *slot = Readiness {
                pos: ev.udata as usize,
                readable: ev.filter == libc::EVFILT_READ
                    || ev.filter == libc::EVFILT_SIGNAL
                    || closed,
                writeable: ev.filter == libc::EVFILT_WRITE || closed,
                closed,
            };
        }
        Ok(PollStatus::Ready(n))
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
