// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Registry of processes blocked until a replay position reaches a target.
//!
//! Waiters park one pre-allocated entry per process number in a shared
//! min-heap keyed by target LSN. The waker compares each new position
//! against an atomic cached minimum, so the common no-waiters case costs
//! one load; when waiters are due it pops them under the registry lock and
//! sets their latches outside it.

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dberr::{DbError, DbResult};
use dbshm::ShmSafe;
use dbspin::SpinMutex;
use dbwait::{MAX_PROCS, SharedLatchTable, WaitEventMask, under_supervisor, wait_latch};
use log::trace;


/// No waiter registered.
const NO_MINIMUM: u64 = u64::MAX;

/// Where the current replay position comes from. Implemented by whatever
/// component applies the stream; re-read on every wake so waiters follow
/// live state.
pub trait LsnSource {
    fn current_lsn(&self) -> u64;
    /// False once this process stops replaying; waiting is then pointless.
    fn in_replay(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsnWaitResult {
    /// The position reached the target.
    Success,
    Timeout,
    /// Replay ended (or never ran) below the target.
    NotInReplay,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct WaitEntry {
    target: u64,
    heap_index: u32,
    in_heap: bool,
}

#[repr(C)]
struct RegistryInner {
    entries: [WaitEntry; MAX_PROCS],
    // Heap of process numbers, ordered by entry target ascending.
    heap: [u32; MAX_PROCS],
    heap_len: u32,
}

impl RegistryInner {
    fn less(&self, a: usize, b: usize) -> bool {
        self.entries[self.heap[a] as usize].target < self.entries[self.heap[b] as usize].target
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.entries[self.heap[a] as usize].heap_index = a as u32;
        self.entries[self.heap[b] as usize].heap_index = b as u32;
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap_len as usize;
        loop {
            let mut smallest = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < len && self.less(child, smallest) {
                    smallest = child;
                }
            }
            if smallest == i {
                break;
            }
            self.swap_nodes(i, smallest);
            i = smallest;
        }
    }

    fn insert(&mut self, proc_number: usize, target: u64) {
        let i = self.heap_len as usize;
        self.entries[proc_number] = WaitEntry {
            target,
            heap_index: i as u32,
            in_heap: true,
        };
        self.heap[i] = proc_number as u32;
        self.heap_len += 1;
        self.sift_up(i);
    }

    // Idempotent: the waker may have already popped this entry.
    fn remove(&mut self, proc_number: usize) {
        if !self.entries[proc_number].in_heap {
            return;
        }
        let i = self.entries[proc_number].heap_index as usize;
        self.entries[proc_number].in_heap = false;
        self.heap_len -= 1;
        let last = self.heap_len as usize;
        if i != last {
            self.heap[i] = self.heap[last];
            self.entries[self.heap[i] as usize].heap_index = i as u32;
            self.sift_down(i);
            self.sift_up(i);
        }
    }

    fn pop_min(&mut self) -> usize {
        let proc_number = self.heap[0] as usize;
        self.remove(proc_number);
        proc_number
    }

    fn min_target(&self) -> u64 {
        if self.heap_len == 0 {
            NO_MINIMUM
        } else {
            self.entries[self.heap[0] as usize].target
        }
    }
}

/// The shared registry. One instance lives in a shared mapping; latches
/// are addressed through the shared latch table, never by pointer.
#[repr(C)]
pub struct LsnWaiterRegistry {
    inner: SpinMutex<RegistryInner>,
    min_waited: AtomicU64,
}

unsafe impl ShmSafe for LsnWaiterRegistry {}

impl LsnWaiterRegistry {
    /// Stamps the empty-registry sentinel. Runs once after mapping, before
    /// any waiter.
    pub fn setup(&self) {
        self.min_waited.store(NO_MINIMUM, Ordering::Release);
    }

    /// Smallest target any process currently waits for; `u64::MAX` when
    /// nobody waits.
    pub fn min_waited(&self) -> u64 {
        self.min_waited.load(Ordering::Acquire)
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().heap_len as usize
    }

    /// Blocks the calling process until `source` reports a position at or
    /// past `target`.
    ///
    /// The caller must own `latches.latch(proc_number)` and have no other
    /// wait in flight. Supervisor death surfaces as
    /// [`DbError::SupervisorDied`]; the entry is deregistered on every
    /// exit path.
    pub fn wait_for_lsn(
        &self,
        source: &dyn LsnSource,
        latches: &'static SharedLatchTable,
        proc_number: usize,
        target: u64,
        timeout: Option<Duration>,
    ) -> DbResult<LsnWaitResult> {
        if source.current_lsn() >= target {
            return Ok(LsnWaitResult::Success);
        }
        if !source.in_replay() {
            // Replay may have finished between the two checks.
            if source.current_lsn() >= target {
                return Ok(LsnWaitResult::Success);
            }
            return Ok(LsnWaitResult::NotInReplay);
        }

        let latch = latches.latch(proc_number);
        if !latch.is_owned_by_me() {
            return Err(DbError::InvalidState("LSN wait on a latch we do not own"));
        }

        {
            let mut inner = self.inner.lock();
            if inner.entries[proc_number].in_heap {
                return Err(DbError::InvalidState("process is already waiting on an LSN"));
            }
            inner.insert(proc_number, target);
            self.min_waited.store(inner.min_target(), Ordering::Release);
        }
        trace!("waiting for LSN {target} as proc {proc_number}");

        let deadline = timeout.map(|t| Instant::now() + t);
        let result = loop {
            if source.current_lsn() >= target {
                break Ok(LsnWaitResult::Success);
            }
            if !source.in_replay() {
                break Ok(LsnWaitResult::NotInReplay);
            }
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        break Ok(LsnWaitResult::Timeout);
                    }
                    Some(d - now)
                }
            };
            let mask = if under_supervisor() {
                WaitEventMask::LATCH_SET | WaitEventMask::SUPERVISOR_DEATH
            } else {
                WaitEventMask::LATCH_SET
            };
            let fired = match wait_latch(latch, mask, remaining) {
                Ok(fired) => fired,
                Err(e) => break Err(e),
            };
            if fired.contains(WaitEventMask::SUPERVISOR_DEATH) {
                break Err(DbError::SupervisorDied);
            }
            if fired.contains(WaitEventMask::LATCH_SET) {
                if let Err(e) = latch.reset() {
                    break Err(e);
                }
            }
        };

        let mut inner = self.inner.lock();
        inner.remove(proc_number);
        self.min_waited.store(inner.min_target(), Ordering::Release);
        drop(inner);
        result
    }

    /// Reports a new replay position and wakes every waiter it satisfies.
    ///
    /// Latch fan-out happens after the lock is released; setting a latch
    /// whose process already left the heap is harmless because latch slots
    /// are never freed.
    pub fn advance(&self, latches: &SharedLatchTable, new_lsn: u64) {
        if new_lsn < self.min_waited.load(Ordering::Acquire) {
            return;
        }
        let mut due: Vec<usize> = Vec::new();
        {
            let mut inner = self.inner.lock();
            while inner.heap_len > 0 && inner.min_target() <= new_lsn {
                due.push(inner.pop_min());
            }
            self.min_waited.store(inner.min_target(), Ordering::Release);
        }
        for proc_number in due {
            latches.latch(proc_number).set();
        }
    }
}
