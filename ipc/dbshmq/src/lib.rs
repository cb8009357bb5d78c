// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Single-producer, single-consumer message queue over a shared byte ring.
//!
//! The data plane runs without locks: two monotone 64-bit counters
//! (`bytes_written`, `bytes_read`) plus acquire/release ordering coordinate
//! producer and consumer. A spin mutex guards only the one-time assignment
//! of the peer identities and the detach flags. Blocking goes through the
//! parties' own latches; counter publication batches up to a quarter ring
//! to keep the shared cache line quiet.

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dberr::{DbError, DbResult};
use dbshm::{ShmSafe, SharedRegion};
use dbsignal::Pid;
use dbspin::SpinMutex;
use dbwait::{Latch, SharedLatchTable, WaitEventMask, under_supervisor, wait_latch};
use log::trace;

mod tests;

/// Size of the per-message length word. Messages are padded to this
/// alignment and the ring size is a multiple of it, so the length word
/// never straddles the ring edge.
const LENGTH_WORD: usize = 8;

fn align_up(n: u64) -> u64 {
    (n + LENGTH_WORD as u64 - 1) & !(LENGTH_WORD as u64 - 1)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MqPeers {
    sender_pid: Pid,
    sender_proc: i32,
    receiver_pid: Pid,
    receiver_proc: i32,
    sender_detached: bool,
    receiver_detached: bool,
}

/// Queue header; the ring bytes live in the same mapping right behind it.
#[repr(C)]
pub struct ShmQueue {
    peers: SpinMutex<MqPeers>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    ring_size: AtomicU64,
    max_message: AtomicU64,
}

unsafe impl ShmSafe for ShmQueue {}

/// A created queue: header reference plus the ring location. `Copy`, so
/// the supervisor can hand it to both sides before forking; the mapping is
/// inherited at the same address.
#[derive(Clone, Copy)]
pub struct Queue {
    header: &'static ShmQueue,
    ring: *mut u8,
}

unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    /// Maps a queue with `ring_size` data bytes. The size must be a
    /// positive multiple of the length word. `max_message` bounds a single
    /// message and is enforced independently by both sides.
    pub fn create(ring_size: usize, max_message: usize) -> DbResult<Queue> {
        if ring_size == 0 || ring_size % LENGTH_WORD != 0 {
            return Err(DbError::InvalidState(
                "ring size must be a positive multiple of 8",
            ));
        }
        let region = SharedRegion::<ShmQueue>::create_with_trailing(ring_size)?;
        let ring = region.trailing_ptr();
        let header = region.leak();
        header.ring_size.store(ring_size as u64, Ordering::Release);
        header.max_message.store(max_message as u64, Ordering::Release);
        Ok(Queue { header, ring })
    }

    fn ring_size(&self) -> u64 {
        self.header.ring_size.load(Ordering::Acquire)
    }

    fn max_message(&self) -> u64 {
        self.header.max_message.load(Ordering::Acquire)
    }

    fn peers(&self) -> MqPeers {
        *self.header.peers.lock()
    }

    /// Claims the sending side for the calling process. One shot; the
    /// identity never changes afterwards.
    pub fn attach_sender(
        self,
        latches: &'static SharedLatchTable,
        proc_number: usize,
    ) -> DbResult<Sender> {
        {
            let mut peers = self.header.peers.lock();
            if peers.sender_pid != 0 {
                return Err(DbError::InvalidState("queue already has a sender"));
            }
            peers.sender_pid = unsafe { libc::getpid() };
            peers.sender_proc = proc_number as i32;
        }
        Ok(Sender {
            queue: self,
            latches,
            my_proc: proc_number,
            local_written: 0,
            unpublished: 0,
            partial: 0,
            on_detach: None,
        })
    }

    /// Claims the receiving side for the calling process.
    pub fn attach_receiver(
        self,
        latches: &'static SharedLatchTable,
        proc_number: usize,
    ) -> DbResult<Receiver> {
        {
            let mut peers = self.header.peers.lock();
            if peers.receiver_pid != 0 {
                return Err(DbError::InvalidState("queue already has a receiver"));
            }
            peers.receiver_pid = unsafe { libc::getpid() };
            peers.receiver_proc = proc_number as i32;
        }
        Ok(Receiver {
            queue: self,
            latches,
            my_proc: proc_number,
            local_read: 0,
            unpublished: 0,
            word_scratch: [0; LENGTH_WORD],
            word_have: 0,
            msg_len: 0,
            have_length: false,
            scratch: Vec::new(),
            scratch_have: 0,
            on_detach: None,
        })
    }

    // Latch-table index of the counterparty, if it has attached.
    fn peer_proc(&self, sender_side: bool) -> Option<usize> {
        let peers = self.peers();
        let (pid, proc_number) = if sender_side {
            (peers.receiver_pid, peers.receiver_proc)
        } else {
            (peers.sender_pid, peers.sender_proc)
        };
        (pid != 0 && proc_number >= 0).then_some(proc_number as usize)
    }
}

// Blocks on the caller's own latch until the peer pokes it.
fn block_on(latches: &'static SharedLatchTable, proc_number: usize) -> DbResult {
    let latch: &'static Latch = latches.latch(proc_number);
    let (mask, timeout) = if under_supervisor() {
        (
            WaitEventMask::LATCH_SET | WaitEventMask::SUPERVISOR_DEATH,
            None,
        )
    } else {
        // No liveness pipe: a periodic poll stands in for the death watch.
        (WaitEventMask::LATCH_SET, Some(Duration::from_millis(100)))
    };
    let fired = wait_latch(latch, mask, timeout)?;
    if fired.contains(WaitEventMask::SUPERVISOR_DEATH) {
        return Err(DbError::SupervisorDied);
    }
    if fired.contains(WaitEventMask::LATCH_SET) {
        latch.reset()?;
    }
    Ok(())
}

// Copies out of the logical stream (length word, then the iovec pieces)
// starting at `from`, into at most `max` contiguous destination bytes.
fn copy_stream(
    word: &[u8; LENGTH_WORD],
    iov: &[&[u8]],
    from: usize,
    dest: *mut u8,
    max: usize,
) -> usize {
    let mut skip = from;
    let mut copied = 0;
    for seg in core::iter::once(&word[..]).chain(iov.iter().copied()) {
        if copied == max {
            break;
        }
        if skip >= seg.len() {
            skip -= seg.len();
            continue;
        }
        let n = (seg.len() - skip).min(max - copied);
        unsafe {
            core::ptr::copy_nonoverlapping(seg.as_ptr().add(skip), dest.add(copied), n);
        }
        copied += n;
        skip = 0;
    }
    copied
}

/// The producing end. Exactly one process drives it.
pub struct Sender {
    queue: Queue,
    latches: &'static SharedLatchTable,
    my_proc: usize,
    // True write head: shared bytes_written plus everything not yet
    // published.
    local_written: u64,
    unpublished: u64,
    // Bytes of the in-flight message already in the ring, for nowait
    // resume.
    partial: u64,
    on_detach: Option<Box<dyn FnOnce() + Send>>,
}

unsafe impl Send for Sender {}

impl Sender {
    /// Callback run when this side detaches, however that happens.
    pub fn set_on_detach(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.on_detach = Some(callback);
    }

    pub fn send(&mut self, data: &[u8], nowait: bool) -> DbResult {
        self.send_v(&[data], nowait)
    }

    /// Gather-sends the concatenation of `iov` as one message.
    ///
    /// With `nowait`, a full ring returns [`DbError::WouldBlock`] and
    /// keeps the partial-send state; the retry must present the same
    /// message.
    pub fn send_v(&mut self, iov: &[&[u8]], nowait: bool) -> DbResult {
        let total: usize = iov.iter().map(|s| s.len()).sum();
        if total as u64 > self.queue.max_message() {
            return Err(DbError::CapacityExceeded);
        }
        let word = (total as u64).to_ne_bytes();
        let ring_size = self.queue.ring_size();
        let whole = LENGTH_WORD as u64 + total as u64;

        while self.partial < whole {
            if self.queue.peers().receiver_detached {
                return Err(DbError::Detached);
            }
            let read = self.queue.header.bytes_read.load(Ordering::Acquire);
            let available = ring_size - (self.local_written - read);
            if available == 0 {
                // Everything staged must be visible before we sleep,
                // otherwise the receiver has nothing to drain.
                self.publish(true);
                if nowait {
                    return Err(DbError::WouldBlock);
                }
                block_on(self.latches, self.my_proc)?;
                continue;
            }
            let offset = (self.local_written % ring_size) as usize;
            let contiguous = (available as usize).min(ring_size as usize - offset);
            let n = copy_stream(
                &word,
                iov,
                self.partial as usize,
                unsafe { self.queue.ring.add(offset) },
                contiguous.min((whole - self.partial) as usize),
            );
            self.partial += n as u64;
            self.local_written += n as u64;
            self.unpublished += n as u64;
            if self.unpublished > ring_size / 4 {
                self.publish(false);
            }
        }

        // Skip the alignment padding without writing it.
        let padding = align_up(whole) - whole;
        self.local_written += padding;
        self.unpublished += padding;
        self.partial = 0;
        self.publish(true);
        trace!("sent {total}-byte message");
        Ok(())
    }

    fn publish(&mut self, flush: bool) {
        if self.unpublished == 0 {
            return;
        }
        if !flush && self.unpublished <= self.queue.ring_size() / 4 {
            return;
        }
        self.queue
            .header
            .bytes_written
            .fetch_add(self.unpublished, Ordering::AcqRel);
        self.unpublished = 0;
        if let Some(proc_number) = self.queue.peer_proc(true) {
            self.latches.latch(proc_number).set();
        }
    }

    /// Announces that no more messages will come and wakes the receiver.
    pub fn detach(&mut self) {
        self.publish(true);
        {
            let mut peers = self.queue.header.peers.lock();
            if peers.sender_detached {
                return;
            }
            peers.sender_detached = true;
        }
        if let Some(proc_number) = self.queue.peer_proc(true) {
            self.latches.latch(proc_number).set();
        }
        if let Some(callback) = self.on_detach.take() {
            callback();
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.detach();
    }
}

/// The consuming end.
pub struct Receiver {
    queue: Queue,
    latches: &'static SharedLatchTable,
    my_proc: usize,
    // True read tail: shared bytes_read plus everything not yet published.
    local_read: u64,
    unpublished: u64,
    word_scratch: [u8; LENGTH_WORD],
    word_have: usize,
    msg_len: u64,
    have_length: bool,
    // Reassembly buffer for messages that wrap the ring edge.
    scratch: Vec<u8>,
    scratch_have: usize,
    on_detach: Option<Box<dyn FnOnce() + Send>>,
}

unsafe impl Send for Receiver {}

impl Receiver {
    /// Callback run when this side detaches, however that happens.
    pub fn set_on_detach(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.on_detach = Some(callback);
    }

    /// Receives one message. The returned slice points into the ring when
    /// the message does not wrap (zero copy) and stays valid until the
    /// next call on this receiver.
    ///
    /// Returns [`DbError::Detached`] once the sender has detached *and*
    /// every in-flight byte has been drained; [`DbError::WouldBlock`] in
    /// `nowait` mode when the next message is not complete yet.
    pub fn recv(&mut self, nowait: bool) -> DbResult<&[u8]> {
        // Consumption of the previous zero-copy message becomes visible
        // now that its borrow has ended.
        self.publish(false);
        let ring_size = self.queue.ring_size();

        while !self.have_length {
            let (offset, chunk) = self.wait_chunk(nowait)?;
            let n = chunk.min(LENGTH_WORD - self.word_have);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.queue.ring.add(offset),
                    self.word_scratch.as_mut_ptr().add(self.word_have),
                    n,
                );
            }
            self.word_have += n;
            self.consumed(n);
            if self.word_have == LENGTH_WORD {
                self.msg_len = u64::from_ne_bytes(self.word_scratch);
                if self.msg_len > self.queue.max_message() {
                    return Err(DbError::InvalidState("message exceeds queue maximum"));
                }
                self.have_length = true;
                self.scratch_have = 0;
            }
        }

        let len = self.msg_len as usize;
        let advance = align_up(LENGTH_WORD as u64 + len as u64) - LENGTH_WORD as u64;

        // Zero-copy path: the payload does not wrap, and deferring its
        // consumption until the next call stays below the publish
        // threshold, so holding the borrow cannot starve the sender.
        // Waits for the padding too: it only becomes visible with the
        // sender's message-end flush, and advancing past unpublished
        // bytes would push local_read beyond bytes_written.
        let offset = (self.local_read % ring_size) as usize;
        if self.scratch_have == 0
            && offset + len <= ring_size as usize
            && self.unpublished + advance <= ring_size / 4
        {
            loop {
                let available = self.queue.header.bytes_written.load(Ordering::Acquire)
                    - self.local_read;
                if available >= advance {
                    break;
                }
                if self.queue.peers().sender_detached {
                    // The detach flag may have been raised after the final
                    // publish; trust the counter over the flag.
                    let available = self.queue.header.bytes_written.load(Ordering::Acquire)
                        - self.local_read;
                    if available < advance {
                        return Err(DbError::Detached);
                    }
                    break;
                }
                self.publish(true);
                if nowait {
                    return Err(DbError::WouldBlock);
                }
                block_on(self.latches, self.my_proc)?;
            }
            let slice =
                unsafe { core::slice::from_raw_parts(self.queue.ring.add(offset) as *const u8, len) };
            // Count the payload and padding consumed, but leave the
            // publish for the next call so the borrow stays sound.
            self.local_read += advance;
            self.unpublished += advance;
            self.have_length = false;
            self.word_have = 0;
            return Ok(slice);
        }

        // Wrapped message: reassemble through the scratch buffer.
        if self.scratch_have == 0 {
            self.scratch.clear();
            self.scratch.resize(len, 0);
        }
        while self.scratch_have < len {
            let (offset, chunk) = self.wait_chunk(nowait)?;
            let n = chunk.min(len - self.scratch_have);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.queue.ring.add(offset),
                    self.scratch.as_mut_ptr().add(self.scratch_have),
                    n,
                );
            }
            self.scratch_have += n;
            self.consumed(n);
        }
        // The padding trails the payload and is only covered by the
        // sender's message-end flush; consume it as it gets published.
        // Resumable under nowait: the remaining padding is recomputed
        // from the read position's alignment.
        while self.local_read % LENGTH_WORD as u64 != 0 {
            let pad = LENGTH_WORD as u64 - self.local_read % LENGTH_WORD as u64;
            let (_, chunk) = self.wait_chunk(nowait)?;
            let n = (chunk as u64).min(pad);
            self.local_read += n;
            self.unpublished += n;
        }
        self.have_length = false;
        self.word_have = 0;
        self.scratch_have = 0;
        self.publish(false);
        Ok(&self.scratch[..len])
    }

    // Waits until at least one byte is readable and returns the offset and
    // length of the contiguous run. Does not consume.
    fn wait_chunk(&mut self, nowait: bool) -> DbResult<(usize, usize)> {
        let ring_size = self.queue.ring_size();
        loop {
            let available =
                self.queue.header.bytes_written.load(Ordering::Acquire) - self.local_read;
            if available > 0 {
                let offset = (self.local_read % ring_size) as usize;
                let contiguous = (available as usize).min(ring_size as usize - offset);
                return Ok((offset, contiguous));
            }
            if self.queue.peers().sender_detached {
                // Recheck: the final bytes may have been published just
                // before the flag went up.
                let available =
                    self.queue.header.bytes_written.load(Ordering::Acquire) - self.local_read;
                if available == 0 {
                    return Err(DbError::Detached);
                }
                continue;
            }
            // Let the sender reuse whatever we already consumed before we
            // sleep on it.
            self.publish(true);
            if nowait {
                return Err(DbError::WouldBlock);
            }
            block_on(self.latches, self.my_proc)?;
        }
    }

    fn consumed(&mut self, n: usize) {
        self.local_read += n as u64;
        self.unpublished += n as u64;
        if self.unpublished > self.queue.ring_size() / 4 {
            self.publish(false);
        }
    }

    fn publish(&mut self, flush: bool) {
        if self.unpublished == 0 {
            return;
        }
        if !flush && self.unpublished <= self.queue.ring_size() / 4 {
            return;
        }
        self.queue
            .header
            .bytes_read
            .fetch_add(self.unpublished, Ordering::AcqRel);
        self.unpublished = 0;
        if let Some(proc_number) = self.queue.peer_proc(false) {
            self.latches.latch(proc_number).set();
        }
    }

    /// Walks away from the queue; the sender sees `Detached` on its next
    /// send.
    pub fn detach(&mut self) {
        self.publish(true);
        {
            let mut peers = self.queue.header.peers.lock();
            if peers.receiver_detached {
                return;
            }
            peers.receiver_detached = true;
        }
        if let Some(proc_number) = self.queue.peer_proc(false) {
            self.latches.latch(proc_number).set();
        }
        if let Some(callback) = self.on_detach.take() {
            callback();
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.detach();
    }
}
