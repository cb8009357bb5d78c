// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Unit tests for dbconfig

#![cfg(test)]

use core::str::FromStr;

use dberr::DbError;

use crate::{BackendPreference, CoreConfig};

#[test]
fn test_backend_preference_parse() {
    assert_eq!(
        BackendPreference::from_str("auto").unwrap(),
        BackendPreference::Auto
    );
    assert_eq!(
        BackendPreference::from_str("epoll").unwrap(),
        BackendPreference::Epoll
    );
    assert_eq!(
        BackendPreference::from_str("poll").unwrap(),
        BackendPreference::Poll
    );
    assert!(BackendPreference::from_str("select").is_err());
}

#[test]
fn test_backend_preference_display() {
    assert_eq!(BackendPreference::Kqueue.to_string(), "kqueue");
}

#[test]
fn test_default_config_is_valid() {
    assert!(CoreConfig::default().validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_slots() {
    let cfg = CoreConfig {
        max_worker_processes: 0,
        ..Default::default()
    };
    assert_eq!(
        cfg.validate(),
        Err(DbError::InvalidState("max_worker_processes must be > 0"))
    );
}

#[test]
fn test_validate_rejects_parallel_overflow() {
    let cfg = CoreConfig {
        max_worker_processes: 4,
        max_parallel_workers: 5,
        ..Default::default()
    };
    assert!(cfg.validate().is_err());
}
