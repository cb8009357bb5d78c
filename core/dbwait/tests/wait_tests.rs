// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Cross-process latch and liveness behaviour, exercised with real forks.

use std::sync::Mutex;
use std::time::Duration;

use dbshm::SharedRegion;
use dbsignal::SignalSlots;
use dbwait::{
    Latch, SharedLatchTable, WaitEvent, WaitEventMask, WaitEventSet, set_supervisor_pipe,
    supervisor_alive, wait_latch,
};

// Waits and the signal plumbing are process-global; run one scenario at a
// time.
static SCENARIO_LOCK: Mutex<()> = Mutex::new(());

fn wait_for_child(pid: i32) {
    let mut status = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
}

#[test]
fn child_process_sets_parent_latch() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    dbsignal::install_handler().unwrap();

    let slots = SharedRegion::<SignalSlots>::create().unwrap().leak();
    let latches = SharedRegion::<SharedLatchTable>::create().unwrap().leak();

    dbsignal::attach(slots, 0).unwrap();
    let latch: &'static Latch = latches.latch(0);
    latch.own().unwrap();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        // Child: give the parent time to block, then fire its latch.
        unsafe {
            libc::usleep(50_000);
        }
        latches.latch(0).set();
        unsafe { libc::_exit(0) };
    }

    let fired = wait_latch(
        latch,
        WaitEventMask::LATCH_SET,
        Some(Duration::from_secs(10)),
    )
    .unwrap();
    assert_eq!(fired, WaitEventMask::LATCH_SET);
    wait_for_child(pid);

    latch.reset().unwrap();
    latch.disown().unwrap();
    dbsignal::detach();
}

#[test]
fn supervisor_exit_surfaces_as_event() {
    let _guard = SCENARIO_LOCK.lock().unwrap();

    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_end, write_end) = (fds[0], fds[1]);
    unsafe {
        libc::fcntl(read_end, libc::F_SETFL, libc::O_NONBLOCK);
    }

    // The child plays supervisor: it holds the write end open for a
    // moment, then exits, which closes it.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        unsafe {
            libc::close(read_end);
            libc::usleep(80_000);
            libc::_exit(0);
        }
    }
    unsafe {
        libc::close(write_end);
    }
    set_supervisor_pipe(read_end, pid);
    assert!(supervisor_alive());

    let mut set = WaitEventSet::new(Default::default(), 1).unwrap();
    set.add_supervisor_death(false, 0).unwrap();
    let mut out = [WaitEvent::empty(); 1];
    let n = set.wait(Some(Duration::from_secs(10)), &mut out).unwrap();
    assert_eq!(n, 1);
    assert_eq!(out[0].events, WaitEventMask::SUPERVISOR_DEATH);
    assert!(!supervisor_alive());
    wait_for_child(pid);
}

#[test]
fn exit_on_death_terminates_waiter_in_place() {
    let _guard = SCENARIO_LOCK.lock().unwrap();

    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_end, write_end) = (fds[0], fds[1]);
    unsafe {
        libc::fcntl(read_end, libc::F_SETFL, libc::O_NONBLOCK);
    }
    let my_pid = unsafe { libc::getpid() };

    // The child is the waiter this time; this process plays supervisor
    // and closes the write end while the child is blocked.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        unsafe {
            libc::close(write_end);
        }
        set_supervisor_pipe(read_end, my_pid);
        let mut set = WaitEventSet::new(Default::default(), 1).unwrap();
        set.add_supervisor_death(true, 0).unwrap();
        let mut out = [WaitEvent::empty(); 1];
        // Death must terminate the process from inside wait; reaching
        // the line after it means the flag was ignored.
        let _ = set.wait(Some(Duration::from_secs(10)), &mut out);
        unsafe { libc::_exit(0) };
    }
    unsafe {
        libc::close(read_end);
        libc::usleep(80_000);
        libc::close(write_end);
    }

    let mut status = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 1);
}

#[test]
fn latch_wake_beats_slow_timeout() {
    let _guard = SCENARIO_LOCK.lock().unwrap();
    dbsignal::install_handler().unwrap();

    let slots = SharedRegion::<SignalSlots>::create().unwrap().leak();
    let latches = SharedRegion::<SharedLatchTable>::create().unwrap().leak();
    dbsignal::attach(slots, 1).unwrap();
    let latch: &'static Latch = latches.latch(1);
    latch.own().unwrap();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        unsafe {
            libc::usleep(30_000);
        }
        latches.latch(1).set();
        unsafe { libc::_exit(0) };
    }

    let started = std::time::Instant::now();
    let fired = wait_latch(
        latch,
        WaitEventMask::LATCH_SET,
        Some(Duration::from_secs(30)),
    )
    .unwrap();
    assert_eq!(fired, WaitEventMask::LATCH_SET);
    // The wake must arrive via the transport, not the timeout.
    assert!(started.elapsed() < Duration::from_secs(10));
    wait_for_child(pid);

    latch.reset().unwrap();
    latch.disown().unwrap();
    dbsignal::detach();
}
