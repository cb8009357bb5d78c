// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Unit tests for dberr

#![cfg(test)]

use crate::{DbError, errno, set_errno};

#[test]
fn test_display() {
    assert_eq!(DbError::CapacityExceeded.to_string(), "capacity exceeded");
    assert_eq!(
        DbError::InvalidState("latch already owned").to_string(),
        "invalid state: latch already owned"
    );
    assert_eq!(DbError::Sys(libc::EBADF).to_string(), format!("syscall failed: errno {}", libc::EBADF));
}

#[test]
fn test_errno_roundtrip() {
    set_errno(libc::EAGAIN);
    assert_eq!(errno(), libc::EAGAIN);

    set_errno(0);
    assert_eq!(errno(), 0);
}

#[test]
fn test_last_os() {
    set_errno(libc::ESRCH);
    assert_eq!(DbError::last_os(), DbError::Sys(libc::ESRCH));
}
