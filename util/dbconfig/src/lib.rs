// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Startup configuration recognised by the x-dbcore IPC crates.
//!
//! All values are fixed at startup; nothing here is reloadable.

use dberr::{DbError, DbResult};
use strum::{Display, EnumString};

mod tests;

/// Preference for the wait-event-set readiness backend.
///
/// `Auto` picks the most modern primitive the platform supports: epoll on
/// Linux, kqueue on the BSDs and macOS, poll elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BackendPreference {
    #[default]
    Auto,
    Epoll,
    Kqueue,
    Poll,
}

/// Configuration shared by the worker table and the wait machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Background-worker slot-table size. Exceeding it at registration
    /// returns [`DbError::CapacityExceeded`].
    pub max_worker_processes: u32,
    /// Soft cap on concurrently-active parallel-class workers.
    pub max_parallel_workers: u32,
    /// Readiness-backend override; `Auto` unless testing requires otherwise.
    pub wait_backend: BackendPreference,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_worker_processes: 8,
            max_parallel_workers: 8,
            wait_backend: BackendPreference::Auto,
        }
    }
}

impl CoreConfig {
    /// Checks internal consistency; call once at startup.
    pub fn validate(&self) -> DbResult {
        if self.max_worker_processes == 0 {
            return Err(DbError::InvalidState("max_worker_processes must be > 0"));
        }
        if self.max_parallel_workers > self.max_worker_processes {
            return Err(DbError::InvalidState(
                "max_parallel_workers exceeds max_worker_processes",
            ));
        }
        Ok(())
    }
}
