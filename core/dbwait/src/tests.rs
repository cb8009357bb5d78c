// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

#![cfg(test)]

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use dbconfig::BackendPreference;
use dberr::DbError;

use crate::latch::Latch;
use crate::waitset::{WaitEvent, WaitEventMask, WaitEventSet, wait_latch};

// The wakeup transport is process-global, so tests that block on it must
// not overlap with each other.
static WAIT_LOCK: Mutex<()> = Mutex::new(());

fn fresh_latch() -> &'static Latch {
    let latch: &'static Latch = Box::leak(Box::new(Latch::new()));
    latch.own().unwrap();
    latch
}

fn make_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn close_pair(r: i32, w: i32) {
    unsafe {
        libc::close(r);
        libc::close(w);
    }
}

// ========== latch state machine ==========

#[test]
fn latch_set_and_reset() {
    let latch = fresh_latch();
    assert!(!latch.is_set());
    latch.set();
    assert!(latch.is_set());
    // Setting twice is idempotent.
    latch.set();
    assert!(latch.is_set());
    latch.reset().unwrap();
    assert!(!latch.is_set());
}

#[test]
fn latch_double_own_refused() {
    let latch = fresh_latch();
    assert!(matches!(latch.own(), Err(DbError::InvalidState(_))));
    latch.disown().unwrap();
    latch.own().unwrap();
}

#[test]
fn latch_reset_requires_ownership() {
    let latch: &'static Latch = Box::leak(Box::new(Latch::new()));
    latch.set();
    assert!(matches!(latch.reset(), Err(DbError::InvalidState(_))));
}

#[test]
fn latch_set_before_own_is_kept() {
    let latch: &'static Latch = Box::leak(Box::new(Latch::new()));
    latch.set();
    latch.own().unwrap();
    assert!(latch.is_set());
}

// ========== wait_latch ==========

#[test]
fn wait_latch_pre_set_returns_immediately() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    latch.set();
    let fired = wait_latch(
        latch,
        WaitEventMask::LATCH_SET,
        Some(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(fired, WaitEventMask::LATCH_SET);
}

#[test]
fn wait_latch_times_out() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    let start = Instant::now();
    let fired = wait_latch(
        latch,
        WaitEventMask::LATCH_SET,
        Some(Duration::from_millis(50)),
    )
    .unwrap();
    assert_eq!(fired, WaitEventMask::TIMEOUT);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn wait_latch_woken_by_other_thread() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        latch.set();
    });
    let fired = wait_latch(
        latch,
        WaitEventMask::LATCH_SET,
        Some(Duration::from_secs(10)),
    )
    .unwrap();
    assert_eq!(fired, WaitEventMask::LATCH_SET);
    setter.join().unwrap();
}

#[test]
fn wake_survives_set_reset_set_between_waits() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    for _ in 0..3 {
        latch.set();
        let fired = wait_latch(
            latch,
            WaitEventMask::LATCH_SET,
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(fired, WaitEventMask::LATCH_SET);
        latch.reset().unwrap();
    }
}

#[test]
fn set_between_recheck_and_poll_writes_the_wake_byte() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();

    // Replay the ordering inside wait(): the waiting flag goes up first,
    // then the sleep flag is armed and the latch rechecked. A set landing
    // after the recheck must leave a byte in the pipe, or the poll below
    // sleeps through its timeout with the latch already set.
    crate::transport::set_waiting(true);
    latch.arm_sleep();
    assert!(!latch.is_set());
    latch.set();

    let fd = crate::transport::latch_fd();
    assert!(fd >= 0);
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 300) };

    latch.disarm_sleep();
    crate::transport::set_waiting(false);
    crate::transport::drain();
    latch.reset().unwrap();
    assert_eq!(rc, 1);
}

// ========== wait-event sets ==========

#[test]
fn socket_readable_reported() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (r, w) = make_pipe();
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    let pos = set.add_socket(r, WaitEventMask::SOCKET_READABLE, 0).unwrap();

    unsafe {
        libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
    }
    let mut out = [WaitEvent::empty(); 1];
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].pos, pos);
    assert!(out[0].events.contains(WaitEventMask::SOCKET_READABLE));
    close_pair(r, w);
}

#[test]
fn peer_close_folds_into_requested_direction() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (r, w) = make_pipe();
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    set.add_socket(r, WaitEventMask::SOCKET_READABLE, 0).unwrap();

    unsafe {
        libc::close(w);
    }
    let mut out = [WaitEvent::empty(); 1];
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert!(out[0].events.contains(WaitEventMask::SOCKET_READABLE));
    unsafe {
        libc::close(r);
    }
}

#[test]
fn latch_and_socket_in_one_set() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    let (r, w) = make_pipe();
    let mut set = WaitEventSet::new(BackendPreference::default(), 2).unwrap();
    let latch_pos = set.add_latch(latch, 0).unwrap();
    set.add_socket(r, WaitEventMask::SOCKET_READABLE, 0).unwrap();

    latch.set();
    let mut out = [WaitEvent::empty(); 2];
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].pos, latch_pos);
    assert_eq!(out[0].events, WaitEventMask::LATCH_SET);
    close_pair(r, w);
}

#[test]
fn set_latch_suppresses_ready_sockets() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    let (r, w) = make_pipe();
    let mut set = WaitEventSet::new(BackendPreference::default(), 2).unwrap();
    let latch_pos = set.add_latch(latch, 0).unwrap();
    let sock_pos = set.add_socket(r, WaitEventMask::SOCKET_READABLE, 0).unwrap();

    // Both sources are ready; the latch must come back alone.
    unsafe {
        libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
    }
    latch.set();
    let mut out = [WaitEvent::empty(); 2];
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].pos, latch_pos);
    assert_eq!(out[0].events, WaitEventMask::LATCH_SET);

    // The socket was only deferred, not dropped.
    latch.reset().unwrap();
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].pos, sock_pos);
    assert!(out[0].events.contains(WaitEventMask::SOCKET_READABLE));
    close_pair(r, w);
}

#[test]
fn registration_tag_travels_back() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (r, w) = make_pipe();
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    set.add_socket(r, WaitEventMask::SOCKET_READABLE, 0xBEEF).unwrap();

    unsafe {
        libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
    }
    let mut out = [WaitEvent::empty(); 1];
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].tag, 0xBEEF);
    close_pair(r, w);
}

#[test]
fn socket_without_fd_refused() {
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    assert!(matches!(
        set.add_socket(-1, WaitEventMask::SOCKET_READABLE, 0),
        Err(DbError::InvalidState(_))
    ));
}

#[test]
fn modify_socket_switches_direction() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (r, w) = make_pipe();
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    let pos = set.add_socket(w, WaitEventMask::SOCKET_WRITEABLE, 0).unwrap();

    // An empty pipe is writeable right away.
    let mut out = [WaitEvent::empty(); 1];
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert!(out[0].events.contains(WaitEventMask::SOCKET_WRITEABLE));

    // Dropping write interest leaves nothing to fire, so the wait must
    // run to its timeout even though the pipe stays writeable.
    set.modify_socket(pos, WaitEventMask::SOCKET_CLOSED).unwrap();
    let n = set.wait(Some(Duration::from_millis(50)), &mut out).unwrap();
    assert_eq!(n, 0);
    close_pair(r, w);
}

#[test]
fn capacity_is_enforced() {
    let (r, w) = make_pipe();
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    set.add_socket(r, WaitEventMask::SOCKET_READABLE, 0).unwrap();
    assert!(matches!(
        set.add_socket(w, WaitEventMask::SOCKET_WRITEABLE, 0),
        Err(DbError::CapacityExceeded)
    ));
    close_pair(r, w);
}

#[test]
fn unowned_latch_rejected_by_set() {
    let latch: &'static Latch = Box::leak(Box::new(Latch::new()));
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    assert!(matches!(
        set.add_latch(latch, 0),
        Err(DbError::InvalidState(_))
    ));
}

#[test]
fn death_watch_requires_liveness_pipe() {
    // No supervisor pipe is registered in the test process.
    if crate::parent::liveness_fd() >= 0 {
        return;
    }
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    assert!(matches!(
        set.add_supervisor_death(false, 0),
        Err(DbError::InvalidState(_))
    ));
}

#[test]
fn pending_interrupt_aborts_wait() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    let mut set = WaitEventSet::new(BackendPreference::default(), 1).unwrap();
    set.add_latch(latch, 0).unwrap();

    dbsignal::raise_interrupt();
    let mut out = [WaitEvent::empty(); 1];
    let got = set.wait(Some(Duration::from_secs(5)), &mut out);
    dbsignal::clear_interrupt();
    assert!(matches!(got, Err(DbError::Interrupted)));
}

#[test]
fn poll_backend_explicitly_selectable() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let latch = fresh_latch();
    latch.set();
    let mut set = WaitEventSet::new(BackendPreference::Poll, 1).unwrap();
    set.add_latch(latch, 0).unwrap();
    let mut out = [WaitEvent::empty(); 1];
    let n = set.wait(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].events, WaitEventMask::LATCH_SET);
}
