// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The background-worker slot table.
//!
//! Registration requests live in a fixed array of slots in shared memory.
//! Any backend may file a request; the supervisor picks pending slots up,
//! forks the worker, and reports state transitions back through the slot.
//! Requesters track their worker through a generation-stamped
//! [`WorkerHandle`], which stays valid (and reports `Stopped`) after the
//! slot has been recycled.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use dbconfig::CoreConfig;
use dberr::{DbError, DbResult};
use dbshm::ShmSafe;
use dbsignal::Pid;
use dbspin::RawSpin;
use dbwait::{Latch, SharedLatchTable, WaitEventMask, under_supervisor, wait_latch};
use log::debug;
use strum::FromRepr;


/// Capacity of the slot array. `max_worker_processes` may be configured
/// lower but never higher.
pub const MAX_WORKER_SLOTS: usize = 64;

pub const WORKER_NAME_LEN: usize = 96;
pub const WORKER_LIBRARY_LEN: usize = 128;
pub const WORKER_FUNCTION_LEN: usize = 96;
pub const WORKER_EXTRA_LEN: usize = 128;

/// When the supervisor is allowed to launch the worker.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum StartPhase {
    #[default]
    SupervisorStart,
    ConsistentState,
    RecoveryFinished,
}

/// What the supervisor does when the worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// One-shot: the slot is freed however the worker exits.
    #[default]
    Never,
    /// Relaunch after the given delay, but only if the worker crashed.
    OnCrash(Duration),
    /// Relaunch after every exit, clean or not.
    Always,
}

const RESTART_NEVER: i32 = 0;
const RESTART_ON_CRASH: i32 = 1;
const RESTART_ALWAYS: i32 = 2;

const FLAG_PARALLEL: u32 = 1 << 0;

/// A worker registration request. Fixed-size byte fields keep the struct
/// plain shared memory; strings longer than the field are rejected at
/// build time rather than truncated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WorkerDescriptor {
    name: [u8; WORKER_NAME_LEN],
    name_len: u32,
    library: [u8; WORKER_LIBRARY_LEN],
    library_len: u32,
    function: [u8; WORKER_FUNCTION_LEN],
    function_len: u32,
    extra: [u8; WORKER_EXTRA_LEN],
    extra_len: u32,
    flags: u32,
    start_phase: i32,
    restart_kind: i32,
    restart_secs: u32,
    /// Opaque argument handed to the worker entry point.
    pub main_arg: u64,
    notify_pid: Pid,
    notify_proc: i32,
}

impl WorkerDescriptor {
    /// `name` labels the worker in logs; `library` and `function` name the
    /// entry point the launched process resolves and runs.
    pub fn new(name: &str, library: &str, function: &str) -> DbResult<Self> {
        if name.len() > WORKER_NAME_LEN
            || library.len() > WORKER_LIBRARY_LEN
            || function.len() > WORKER_FUNCTION_LEN
        {
            return Err(DbError::CapacityExceeded);
        }
        let mut desc = WorkerDescriptor {
            name: [0; WORKER_NAME_LEN],
            name_len: name.len() as u32,
            library: [0; WORKER_LIBRARY_LEN],
            library_len: library.len() as u32,
            function: [0; WORKER_FUNCTION_LEN],
            function_len: function.len() as u32,
            extra: [0; WORKER_EXTRA_LEN],
            extra_len: 0,
            flags: 0,
            start_phase: StartPhase::default() as i32,
            restart_kind: RESTART_NEVER,
            restart_secs: 0,
            main_arg: 0,
            notify_pid: 0,
            notify_proc: -1,
        };
        desc.name[..name.len()].copy_from_slice(name.as_bytes());
        desc.library[..library.len()].copy_from_slice(library.as_bytes());
        desc.function[..function.len()].copy_from_slice(function.as_bytes());
        Ok(desc)
    }

    pub fn start_phase(mut self, phase: StartPhase) -> Self {
        self.start_phase = phase as i32;
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        match policy {
            RestartPolicy::Never => {
                self.restart_kind = RESTART_NEVER;
                self.restart_secs = 0;
            }
            RestartPolicy::OnCrash(d) => {
                self.restart_kind = RESTART_ON_CRASH;
                self.restart_secs = d.as_secs().min(u32::MAX as u64) as u32;
            }
            RestartPolicy::Always => {
                self.restart_kind = RESTART_ALWAYS;
                self.restart_secs = 0;
            }
        }
        self
    }

    /// Opaque payload the worker reads back at startup.
    pub fn extra(mut self, payload: &[u8]) -> DbResult<Self> {
        if payload.len() > WORKER_EXTRA_LEN {
            return Err(DbError::CapacityExceeded);
        }
        self.extra[..payload.len()].copy_from_slice(payload);
        self.extra_len = payload.len() as u32;
        Ok(self)
    }

    /// Counts the worker against the parallel-worker budget.
    pub fn parallel(mut self) -> Self {
        self.flags |= FLAG_PARALLEL;
        self
    }

    /// Process to wake when the worker starts or stops. `proc_number`
    /// indexes the shared latch table.
    pub fn notify(mut self, pid: Pid, proc_number: usize) -> Self {
        self.notify_pid = pid;
        self.notify_proc = proc_number as i32;
        self
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }

    pub fn library(&self) -> &str {
        core::str::from_utf8(&self.library[..self.library_len as usize]).unwrap_or("")
    }

    pub fn function(&self) -> &str {
        core::str::from_utf8(&self.function[..self.function_len as usize]).unwrap_or("")
    }

    pub fn extra_bytes(&self) -> &[u8] {
        &self.extra[..self.extra_len as usize]
    }

    pub fn phase(&self) -> StartPhase {
        StartPhase::from_repr(self.start_phase).unwrap_or_default()
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        match self.restart_kind {
            RESTART_ON_CRASH => RestartPolicy::OnCrash(Duration::from_secs(self.restart_secs as u64)),
            RESTART_ALWAYS => RestartPolicy::Always,
            _ => RestartPolicy::Never,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.flags & FLAG_PARALLEL != 0
    }
}

// Worker pid states, kept in WorkerSlot::pid: -1 not yet started, 0 dead,
// anything positive is the live pid.
const PID_INVALID: i32 = -1;
const PID_DEAD: i32 = 0;

#[repr(C)]
struct WorkerSlot {
    in_use: AtomicBool,
    // Supervisor has picked the slot up for launch.
    claimed: AtomicBool,
    terminate: AtomicBool,
    // Supervisor has already sent the termination signal.
    stop_signalled: AtomicBool,
    pid: AtomicI32,
    generation: AtomicU64,
    // Written only under WorkerTable::lock.
    descriptor: UnsafeCell<WorkerDescriptor>,
}

/// Where a worker is in its lifecycle, as seen by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Registered; the supervisor has not launched it yet.
    NotYetStarted,
    Running(Pid),
    /// Exited, never launched and unregistered, or the slot was recycled.
    Stopped,
    /// The supervisor itself is gone; no launch will ever happen.
    SupervisorDied,
}

/// Ticket for one registration. Remains safe to query forever: a recycled
/// slot is detected through the generation stamp.
#[derive(Debug, Clone, Copy)]
pub struct WorkerHandle {
    slot: usize,
    generation: u64,
}

impl WorkerHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// The shared slot table. Created by the supervisor before any fork.
#[repr(C)]
pub struct WorkerTable {
    lock: RawSpin,
    max_slots: AtomicU32,
    max_parallel: AtomicU32,
    supervisor_pid: AtomicI32,
    parallel_register_count: AtomicU64,
    parallel_terminate_count: AtomicU64,
    slots: [WorkerSlot; MAX_WORKER_SLOTS],
}

// The descriptor cells are only touched while holding `lock`; everything
// else is atomic.
unsafe impl Sync for WorkerTable {}
unsafe impl ShmSafe for WorkerTable {}

impl WorkerTable {
    /// Stamps limits and the supervisor identity into a freshly mapped
    /// table. Runs once, in the supervisor, before workers exist.
    pub fn setup(&self, config: &CoreConfig, supervisor: Pid) -> DbResult {
        if config.max_worker_processes as usize > MAX_WORKER_SLOTS {
            return Err(DbError::CapacityExceeded);
        }
        self.max_slots
            .store(config.max_worker_processes, Ordering::Release);
        self.max_parallel
            .store(config.max_parallel_workers, Ordering::Release);
        self.supervisor_pid.store(supervisor, Ordering::Release);
        Ok(())
    }

    fn parallel_in_flight(&self) -> u64 {
        let registered = self.parallel_register_count.load(Ordering::Acquire);
        let terminated = self.parallel_terminate_count.load(Ordering::Acquire);
        registered.saturating_sub(terminated)
    }

    /// Files a registration request and pokes the supervisor.
    pub fn register(&self, desc: &WorkerDescriptor) -> DbResult<WorkerHandle> {
        let limit = self.max_slots.load(Ordering::Acquire) as usize;
        let max_parallel = self.max_parallel.load(Ordering::Acquire) as u64;

        // Budget check and count bump stay inside the lock, so two
        // registrants cannot both squeeze through the last parallel slot.
        self.lock.lock();
        if desc.is_parallel() && self.parallel_in_flight() >= max_parallel {
            self.lock.unlock();
            return Err(DbError::CapacityExceeded);
        }
        let mut found = None;
        for (i, slot) in self.slots[..limit].iter().enumerate() {
            if !slot.in_use.load(Ordering::Relaxed) {
                let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
                unsafe {
                    *slot.descriptor.get() = *desc;
                }
                slot.claimed.store(false, Ordering::Relaxed);
                slot.terminate.store(false, Ordering::Relaxed);
                slot.stop_signalled.store(false, Ordering::Relaxed);
                slot.pid.store(PID_INVALID, Ordering::Relaxed);
                slot.in_use.store(true, Ordering::Release);
                if desc.is_parallel() {
                    self.parallel_register_count.fetch_add(1, Ordering::AcqRel);
                }
                found = Some((i, generation));
                break;
            }
        }
        self.lock.unlock();

        let Some((slot, generation)) = found else {
            return Err(DbError::CapacityExceeded);
        };
        debug!("registered worker '{}' in slot {slot}", desc.name());

        let supervisor = self.supervisor_pid.load(Ordering::Acquire);
        if supervisor > 0 && supervisor != unsafe { libc::getpid() } {
            dbsignal::kick(supervisor);
        }
        Ok(WorkerHandle { slot, generation })
    }

    /// Asks for the worker to be stopped. Running workers surface through
    /// [`take_terminations`](Self::take_terminations) for the supervisor
    /// to signal; not-yet-started ones are unregistered by
    /// [`sweep_terminated`](Self::sweep_terminated).
    pub fn terminate(&self, handle: &WorkerHandle) {
        let slot = &self.slots[handle.slot];
        if slot.generation.load(Ordering::Acquire) != handle.generation
            || !slot.in_use.load(Ordering::Acquire)
        {
            return;
        }
        slot.terminate.store(true, Ordering::Release);
        let supervisor = self.supervisor_pid.load(Ordering::Acquire);
        if supervisor > 0 && supervisor != unsafe { libc::getpid() } {
            dbsignal::kick(supervisor);
        }
    }

    pub fn status(&self, handle: &WorkerHandle) -> WorkerStatus {
        let supervisor = self.supervisor_pid.load(Ordering::Acquire);
        if supervisor > 0 && unsafe { libc::kill(supervisor, 0) } != 0 {
            return WorkerStatus::SupervisorDied;
        }
        let slot = &self.slots[handle.slot];
        if slot.generation.load(Ordering::Acquire) != handle.generation
            || !slot.in_use.load(Ordering::Acquire)
        {
            return WorkerStatus::Stopped;
        }
        match slot.pid.load(Ordering::Acquire) {
            PID_INVALID => WorkerStatus::NotYetStarted,
            PID_DEAD => WorkerStatus::Stopped,
            pid => WorkerStatus::Running(pid),
        }
    }

    /// Blocks until the worker has started (or is known never to start).
    /// The caller passes its own latch, which state-change notifications
    /// set.
    pub fn wait_for_startup(
        &self,
        handle: &WorkerHandle,
        latch: &'static Latch,
    ) -> DbResult<WorkerStatus> {
        self.wait_until(handle, latch, |status| {
            !matches!(status, WorkerStatus::NotYetStarted)
        })
    }

    /// Blocks until the worker has stopped.
    pub fn wait_for_shutdown(
        &self,
        handle: &WorkerHandle,
        latch: &'static Latch,
    ) -> DbResult<WorkerStatus> {
        self.wait_until(handle, latch, |status| {
            matches!(status, WorkerStatus::Stopped)
        })
    }

    fn wait_until(
        &self,
        handle: &WorkerHandle,
        latch: &'static Latch,
        done: impl Fn(WorkerStatus) -> bool,
    ) -> DbResult<WorkerStatus> {
        loop {
            let status = self.status(handle);
            if status == WorkerStatus::SupervisorDied {
                return Err(DbError::SupervisorDied);
            }
            if done(status) {
                return Ok(status);
            }
            // Without a liveness pipe the death check above only runs when
            // we wake, so fall back to a periodic poll.
            let (mask, timeout) = if under_supervisor() {
                (
                    WaitEventMask::LATCH_SET | WaitEventMask::SUPERVISOR_DEATH,
                    None,
                )
            } else {
                (WaitEventMask::LATCH_SET, Some(Duration::from_millis(100)))
            };
            let fired = wait_latch(latch, mask, timeout)?;
            if fired.contains(WaitEventMask::SUPERVISOR_DEATH) {
                return Err(DbError::SupervisorDied);
            }
            if fired.contains(WaitEventMask::LATCH_SET) {
                latch.reset()?;
            }
        }
    }

    // ----- supervisor side -----

    /// Picks up the next registration awaiting launch and marks it
    /// claimed. Returns the slot index and a copy of its descriptor.
    pub fn take_pending(&self) -> Option<(usize, WorkerDescriptor)> {
        let limit = self.max_slots.load(Ordering::Acquire) as usize;
        self.lock.lock();
        let mut found = None;
        for (i, slot) in self.slots[..limit].iter().enumerate() {
            if slot.in_use.load(Ordering::Relaxed)
                && !slot.claimed.load(Ordering::Relaxed)
                && !slot.terminate.load(Ordering::Relaxed)
                && slot.pid.load(Ordering::Relaxed) == PID_INVALID
            {
                slot.claimed.store(true, Ordering::Relaxed);
                found = Some((i, unsafe { *slot.descriptor.get() }));
                break;
            }
        }
        self.lock.unlock();
        found
    }

    /// Running workers whose termination has been requested and not yet
    /// signalled. The supervisor sends each pid its termination signal;
    /// the cycle completes when the exit comes back through
    /// [`report_stopped`](Self::report_stopped), which unregisters the
    /// slot regardless of restart policy.
    pub fn take_terminations(&self) -> Vec<(usize, Pid)> {
        let limit = self.max_slots.load(Ordering::Acquire) as usize;
        let mut due = Vec::new();
        for i in 0..limit {
            let slot = &self.slots[i];
            if slot.in_use.load(Ordering::Acquire)
                && slot.terminate.load(Ordering::Acquire)
                && !slot.stop_signalled.load(Ordering::Acquire)
            {
                let pid = slot.pid.load(Ordering::Acquire);
                if pid > 0 {
                    slot.stop_signalled.store(true, Ordering::Release);
                    due.push((i, pid));
                }
            }
        }
        due
    }

    /// Unregisters slots whose worker was terminated before launch.
    /// Returns how many were dropped.
    pub fn sweep_terminated(&self, latches: &SharedLatchTable) -> usize {
        let limit = self.max_slots.load(Ordering::Acquire) as usize;
        let mut dropped = 0;
        for i in 0..limit {
            let slot = &self.slots[i];
            if slot.in_use.load(Ordering::Acquire)
                && slot.terminate.load(Ordering::Acquire)
                && slot.pid.load(Ordering::Acquire) == PID_INVALID
            {
                self.free_slot(i, latches);
                dropped += 1;
            }
        }
        dropped
    }

    /// Records a successful launch and wakes the registrant.
    pub fn report_started(&self, slot_index: usize, pid: Pid, latches: &SharedLatchTable) {
        let slot = &self.slots[slot_index];
        slot.pid.store(pid, Ordering::Release);
        self.notify(slot, latches);
    }

    /// Records worker exit. Depending on policy the slot returns to the
    /// pending state or is unregistered; the return value is the delay
    /// before a due relaunch.
    pub fn report_stopped(
        &self,
        slot_index: usize,
        crashed: bool,
        latches: &SharedLatchTable,
    ) -> Option<Duration> {
        let slot = &self.slots[slot_index];
        let (policy, terminated) = {
            self.lock.lock();
            let desc = unsafe { &*slot.descriptor.get() };
            let out = (
                desc.restart_policy(),
                slot.terminate.load(Ordering::Relaxed),
            );
            self.lock.unlock();
            out
        };
        let relaunch = match policy {
            RestartPolicy::Never => None,
            RestartPolicy::OnCrash(delay) if crashed => Some(delay),
            RestartPolicy::OnCrash(_) => None,
            RestartPolicy::Always => Some(Duration::ZERO),
        };
        match relaunch {
            Some(delay) if !terminated => {
                slot.claimed.store(false, Ordering::Relaxed);
                slot.pid.store(PID_INVALID, Ordering::Release);
                self.notify(slot, latches);
                Some(delay)
            }
            _ => {
                self.free_slot(slot_index, latches);
                None
            }
        }
    }

    fn free_slot(&self, slot_index: usize, latches: &SharedLatchTable) {
        let slot = &self.slots[slot_index];
        let parallel = {
            self.lock.lock();
            let parallel = unsafe { &*slot.descriptor.get() }.is_parallel();
            slot.pid.store(PID_DEAD, Ordering::Relaxed);
            slot.in_use.store(false, Ordering::Release);
            self.lock.unlock();
            parallel
        };
        if parallel {
            self.parallel_terminate_count.fetch_add(1, Ordering::AcqRel);
        }
        self.notify(slot, latches);
    }

    fn notify(&self, slot: &WorkerSlot, latches: &SharedLatchTable) {
        let (pid, proc_number) = {
            self.lock.lock();
            let desc = unsafe { &*slot.descriptor.get() };
            let out = (desc.notify_pid, desc.notify_proc);
            self.lock.unlock();
            out
        };
        if pid > 0 && proc_number >= 0 {
            latches.latch(proc_number as usize).set();
        }
    }
}
