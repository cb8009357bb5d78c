// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Unit tests for dbshm

#![cfg(test)]

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{SharedRegion, ShmSafe};

#[repr(C)]
struct Counter {
    value: AtomicU64,
}

unsafe impl ShmSafe for Counter {}

#[test]
fn test_region_zero_initialised() {
    let region = SharedRegion::<Counter>::create().unwrap();
    assert_eq!(region.value.load(Ordering::Relaxed), 0);
}

#[test]
fn test_region_trailing_bytes() {
    let region = SharedRegion::<Counter>::create_with_trailing(4096).unwrap();
    assert_eq!(region.trailing_len(), 4096);

    unsafe {
        let ring = region.trailing_ptr();
        ring.write(0xAB);
        assert_eq!(ring.read(), 0xAB);
    }
}

#[test]
fn test_leak_gives_static() {
    let region = SharedRegion::<Counter>::create().unwrap();
    let counter: &'static Counter = region.leak();
    counter.value.store(42, Ordering::Relaxed);
    assert_eq!(counter.value.load(Ordering::Relaxed), 42);
}

#[test]
fn test_region_visible_across_fork() {
    let region = SharedRegion::<Counter>::create().unwrap();

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        // Child: bump the counter and exit without running atexit hooks.
        region.value.store(7, Ordering::SeqCst);
        unsafe { libc::_exit(0) };
    }

    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(region.value.load(Ordering::SeqCst), 7);
}
