// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The latch: a one-bit, level-triggered wakeup primitive.
//!
//! A latch stays set until explicitly reset, so a wake delivered before the
//! sleeper blocks is never lost. Shared latches live in a
//! [`SharedLatchTable`] inside a shared mapping and are addressed by
//! process number; any process may set them, only the owner may wait on or
//! reset them.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering, fence};

use dberr::{DbError, DbResult};
use dbshm::ShmSafe;

use crate::{Pid, transport};

/// Capacity of the shared latch table. Slots are assigned by process
/// number at attach time and never recycled while the slot owner lives.
pub const MAX_PROCS: usize = 256;

/// One latch. All fields are atomics so the struct can sit in shared
/// memory and be poked from signal handlers.
#[repr(C)]
pub struct Latch {
    is_set: AtomicBool,
    // Armed by the owner just before it blocks; tells setters a wakeup
    // send may be needed.
    maybe_sleeping: AtomicBool,
    owner_pid: AtomicI32,
}

impl Latch {
    pub const fn new() -> Self {
        Latch {
            is_set: AtomicBool::new(false),
            maybe_sleeping: AtomicBool::new(false),
            owner_pid: AtomicI32::new(0),
        }
    }

    fn my_pid() -> Pid {
        unsafe { libc::getpid() }
    }

    /// Claims ownership for the calling process. The wakeup transport must
    /// already be initialized, otherwise a concurrent `set` from another
    /// process would have nothing to kick.
    pub fn own(&self) -> DbResult {
        transport::ensure_current()?;
        let me = Self::my_pid();
        match self
            .owner_pid
            .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(cur) if cur == me => Err(DbError::InvalidState("latch already owned by us")),
            Err(_) => Err(DbError::InvalidState("latch owned by another process")),
        }
    }

    /// Releases ownership. Callers must not be waiting on the latch.
    pub fn disown(&self) -> DbResult {
        let me = Self::my_pid();
        match self
            .owner_pid
            .compare_exchange(me, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(_) => Err(DbError::InvalidState("latch not owned by this process")),
        }
    }

    pub fn owner(&self) -> Pid {
        self.owner_pid.load(Ordering::Acquire)
    }

    pub fn is_owned_by_me(&self) -> bool {
        self.owner() == Self::my_pid()
    }

    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    /// Sets the latch and wakes the owner if it might be sleeping.
    ///
    /// Safe to call from any process and from signal handlers. The fence
    /// pairing with [`WaitEventSet`](crate::WaitEventSet)'s arm sequence
    /// guarantees that either we observe `maybe_sleeping` and send a wake,
    /// or the waiter observes `is_set` on its pre-sleep recheck; a wake can
    /// never fall between the cracks.
    pub fn set(&self) {
        // The barrier orders the caller's prior stores (the work the owner
        // will look for) before our is_set load and store.
        fence(Ordering::SeqCst);
        if self.is_set.load(Ordering::Relaxed) {
            return;
        }
        self.is_set.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        if !self.maybe_sleeping.load(Ordering::Relaxed) {
            return;
        }
        let owner = self.owner_pid.load(Ordering::Relaxed);
        if owner == 0 {
            // Set-before-own is legal; the owner will see is_set when it
            // first waits.
        } else if owner == Self::my_pid() {
            transport::wake_local();
        } else {
            transport::wake_remote(owner);
        }
    }

    /// Clears the latch. Only the owner may reset.
    ///
    /// The barrier afterwards orders the clear before the owner's
    /// subsequent re-examination of shared state: work published by a
    /// concurrent `set` racing with this reset is either seen by that
    /// examination or leaves the latch set again.
    pub fn reset(&self) -> DbResult {
        if !self.is_owned_by_me() {
            return Err(DbError::InvalidState("reset of latch we do not own"));
        }
        self.is_set.store(false, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn arm_sleep(&self) {
        self.maybe_sleeping.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    pub(crate) fn disarm_sleep(&self) {
        self.maybe_sleeping.store(false, Ordering::Relaxed);
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed table of shared latches, one per process slot. Lives in a shared
/// mapping created by the supervisor before any fork.
#[repr(C)]
pub struct SharedLatchTable {
    latches: [Latch; MAX_PROCS],
}

// repr(C), atomics only, all-zero bytes are the unowned/unset state.
unsafe impl ShmSafe for SharedLatchTable {}

impl SharedLatchTable {
    /// Latch for the given process number. Panics on out-of-range input,
    /// which indicates slot accounting corruption.
    pub fn latch(&self, proc_number: usize) -> &Latch {
        &self.latches[proc_number]
    }
}
