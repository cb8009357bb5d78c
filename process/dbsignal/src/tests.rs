// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Unit tests for dbsignal

#![cfg(test)]

use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dberr::DbError;
use dbshm::SharedRegion;

use crate::{
    SignalReason, SignalSlots, attach, clear_interrupt, install_handler, interrupt_pending,
    raise_interrupt, send, set_handler,
};

static CATCHUP_HITS: AtomicUsize = AtomicUsize::new(0);

fn catchup_handler() {
    CATCHUP_HITS.fetch_add(1, Ordering::SeqCst);
}

fn my_pid() -> i32 {
    unsafe { libc::getpid() }
}

// The per-process dispatch state is global, so exercise the whole protocol
// in one test rather than fighting over it from several.
#[test]
fn test_send_to_self_dispatches() {
    let slots: &'static SignalSlots = SharedRegion::<SignalSlots>::create().unwrap().leak();

    install_handler().unwrap();
    attach(slots, 3).unwrap();
    set_handler(SignalReason::Catchup, catchup_handler);

    // Unknown pid: flag cannot be stored anywhere.
    assert_eq!(
        send(999_999, SignalReason::Catchup, None),
        Err(DbError::InvalidState("no signal slot for pid"))
    );

    // Stale hint falls back to the scan and still lands.
    send(my_pid(), SignalReason::Catchup, Some(0)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while CATCHUP_HITS.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "signal never dispatched");
        std::thread::sleep(Duration::from_millis(1));
    }

    // Duplicate attach of a claimed slot is refused.
    assert_eq!(
        attach(slots, 3),
        Err(DbError::InvalidState("signal slot already claimed"))
    );
}

#[test]
fn test_interrupt_bit() {
    clear_interrupt();
    assert!(!interrupt_pending());
    raise_interrupt();
    assert!(interrupt_pending());
    clear_interrupt();
    assert!(!interrupt_pending());
}
