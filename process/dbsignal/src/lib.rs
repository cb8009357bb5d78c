// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Multiplexed user-signal delivery between x-dbcore processes.
//!
//! One real OS signal (`SIGUSR1`) carries every cross-process request. The
//! sender stores a per-reason flag in the target's shared slot and then
//! signals the pid; the target's handler scans its own flags and runs the
//! registered callback for each one that is set.
//!
//! A pid may be recycled between the flag store and the `kill`, so every
//! reason handler must be idempotent and harmless when invoked spuriously.
//!
//! Everything reachable from [`dispatch`] runs in signal-handler context:
//! no allocation, no locks, no logging, only atomics and syscalls.

#[macro_use]
extern crate log;

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use dberr::{DbError, DbResult};
use dbshm::ShmSafe;
use strum::{EnumCount, FromRepr};

mod tests;

/// A process id. `0` marks a free signal slot.
pub type Pid = i32;

/// Number of slots in the shared signal table; one per potential process.
pub const MAX_SIGNAL_SLOTS: usize = 128;

/// Reasons multiplexed onto the single user-defined signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, EnumCount)]
#[repr(usize)]
pub enum SignalReason {
    /// Cancel the current operation; sets the interrupts-pending bit.
    CancelRequest,
    /// Catch up with shared cache invalidations.
    Catchup,
    /// A parallel worker sent a message on a shared queue.
    ParallelMessage,
    /// Background-worker state changed (started or stopped).
    WorkerStateChange,
    /// Recovery conflicts, one reason per conflict class.
    RecoveryConflictDatabase,
    RecoveryConflictLock,
    RecoveryConflictSnapshot,
    RecoveryConflictBufferPin,
    RecoveryConflictStartupDeadlock,
    /// Pure latch wake with no other payload.
    LatchWake,
}

const NUM_REASONS: usize = SignalReason::COUNT;

/// One process's reason flags.
///
/// `pid` is claimed with a compare-exchange at process startup. Wakers only
/// ever *set* flags; only the owning process clears them.
#[repr(C)]
pub struct SignalSlot {
    pid: AtomicI32,
    flags: [AtomicBool; NUM_REASONS],
}

/// The shared signal table. Created by the supervisor before any fork.
#[repr(C)]
pub struct SignalSlots {
    slots: [SignalSlot; MAX_SIGNAL_SLOTS],
}

unsafe impl ShmSafe for SignalSlots {}

impl SignalSlots {
    fn slot(&self, index: usize) -> &SignalSlot {
        &self.slots[index]
    }
}

// Per-process dispatch state. Raw statics (not OnceCell) because the
// signal handler reads them.
static SLOTS: AtomicUsize = AtomicUsize::new(0);
static MY_SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);
static HANDLERS: [AtomicUsize; NUM_REASONS] = [const { AtomicUsize::new(0) }; NUM_REASONS];
static WAKE_HOOK: AtomicUsize = AtomicUsize::new(0);
static INTERRUPT_PENDING: AtomicBool = AtomicBool::new(false);

fn my_pid() -> Pid {
    unsafe { libc::getpid() }
}

/// Claims `index` in the shared table for the calling process.
///
/// Stale flags from a previous tenant of the slot are cleared first; the
/// idempotence rule for handlers makes any racing set harmless.
pub fn attach(slots: &'static SignalSlots, index: usize) -> DbResult {
    if index >= MAX_SIGNAL_SLOTS {
        return Err(DbError::CapacityExceeded);
    }
    let slot = slots.slot(index);
    for flag in &slot.flags {
        flag.store(false, Ordering::Relaxed);
    }
    if slot
        .pid
        .compare_exchange(0, my_pid(), Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(DbError::InvalidState("signal slot already claimed"));
    }

    SLOTS.store(slots as *const SignalSlots as usize, Ordering::Release);
    MY_SLOT.store(index, Ordering::Release);
    debug!("attached to signal slot {index}");
    Ok(())
}

/// Releases the calling process's slot.
pub fn detach() {
    let index = MY_SLOT.swap(usize::MAX, Ordering::AcqRel);
    if index == usize::MAX {
        return;
    }
    if let Some(slots) = shared_slots() {
        slots.slot(index).pid.store(0, Ordering::Release);
    }
}

fn shared_slots() -> Option<&'static SignalSlots> {
    let p = SLOTS.load(Ordering::Acquire);
    if p == 0 {
        None
    } else {
        Some(unsafe { &*(p as *const SignalSlots) })
    }
}

/// Stores `reason` in the target's slot and signals the pid.
///
/// `slot_hint` short-circuits the table scan when the caller already knows
/// the target's slot index (worker handles carry it).
pub fn send(pid: Pid, reason: SignalReason, slot_hint: Option<usize>) -> DbResult {
    let slots = shared_slots().ok_or(DbError::InvalidState("signal table not attached"))?;

    let index = match slot_hint {
        Some(i) if i < MAX_SIGNAL_SLOTS && slots.slot(i).pid.load(Ordering::Acquire) == pid => i,
        _ => {
            // Hint missing or stale; fall back to scanning by pid.
            (0..MAX_SIGNAL_SLOTS)
                .find(|&i| slots.slot(i).pid.load(Ordering::Acquire) == pid)
                .ok_or(DbError::InvalidState("no signal slot for pid"))?
        }
    };

    slots.slot(index).flags[reason as usize].store(true, Ordering::Release);

    // The pid may have been recycled since the scan; the standard handlers
    // tolerate spurious delivery, so just report the kernel's verdict.
    if unsafe { libc::kill(pid, libc::SIGUSR1) } != 0 {
        return Err(DbError::last_os());
    }
    Ok(())
}

/// Sends a bare `SIGUSR1` with no reason flag, waking any latch wait in the
/// target. A dead pid is silently ignored.
pub fn kick(pid: Pid) {
    unsafe {
        libc::kill(pid, libc::SIGUSR1);
    }
}

/// Registers the callback for one reason. Callbacks run in signal-handler
/// context and must restrict themselves to the async-signal-safe subset.
pub fn set_handler(reason: SignalReason, handler: fn()) {
    HANDLERS[reason as usize].store(handler as usize, Ordering::Release);
}

/// Registers the latch wakeup hook run on *every* delivery, reasons or not.
pub fn set_wake_hook(hook: fn()) {
    WAKE_HOOK.store(hook as usize, Ordering::Release);
}

/// Scans this process's reason flags and runs the registered callbacks.
///
/// Only the owning process clears flags; wakers only set them.
pub fn dispatch() {
    let index = MY_SLOT.load(Ordering::Acquire);
    let Some(slots) = shared_slots() else { return };
    if index == usize::MAX {
        return;
    }
    let slot = slots.slot(index);

    for i in 0..NUM_REASONS {
        if slot.flags[i].swap(false, Ordering::AcqRel) {
            let f = HANDLERS[i].load(Ordering::Acquire);
            if f != 0 {
                let f: fn() = unsafe { core::mem::transmute(f) };
                f();
            }
        }
    }
}

extern "C" fn sigusr1_handler(_signo: libc::c_int) {
    let saved_errno = dberr::errno();

    dispatch();

    let hook = WAKE_HOOK.load(Ordering::Acquire);
    if hook != 0 {
        let hook: fn() = unsafe { core::mem::transmute(hook) };
        hook();
    }

    dberr::set_errno(saved_errno);
}

/// Installs the shared `SIGUSR1` handler for this process.
pub fn install_handler() -> DbResult {
    unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = sigusr1_handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &sa, core::ptr::null_mut()) != 0 {
            return Err(DbError::last_os());
        }
    }
    Ok(())
}

/// Marks a cancellation request as pending. Safe from signal handlers.
pub fn raise_interrupt() {
    INTERRUPT_PENDING.store(true, Ordering::Release);
}

/// True if a cancellation request is pending. Blocking waits consult this
/// once per loop iteration.
pub fn interrupt_pending() -> bool {
    INTERRUPT_PENDING.load(Ordering::Acquire)
}

/// Clears the pending bit; called by the caller's interrupt handler.
pub fn clear_interrupt() {
    INTERRUPT_PENDING.store(false, Ordering::Release);
}

/// The standard handler for [`SignalReason::CancelRequest`].
pub fn cancel_request_handler() {
    raise_interrupt();
}
