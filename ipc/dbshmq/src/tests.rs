// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

#![cfg(test)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dberr::DbError;
use dbshm::SharedRegion;
use dbwait::SharedLatchTable;

use crate::{LENGTH_WORD, Queue};

// Blocking queue operations ride the process-global wakeup transport; one
// scenario at a time.
static WAIT_LOCK: Mutex<()> = Mutex::new(());

fn latch_table() -> &'static SharedLatchTable {
    SharedRegion::<SharedLatchTable>::create().unwrap().leak()
}

fn pair(ring_size: usize, max_message: usize) -> (crate::Sender, crate::Receiver) {
    let lt = latch_table();
    lt.latch(0).own().unwrap();
    lt.latch(1).own().unwrap();
    let queue = Queue::create(ring_size, max_message).unwrap();
    let sender = queue.attach_sender(lt, 0).unwrap();
    let receiver = queue.attach_receiver(lt, 1).unwrap();
    (sender, receiver)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

// ========== framing ==========

#[test]
fn small_message_round_trip() {
    let (mut tx, mut rx) = pair(4096, 1024);
    tx.send(b"hello queue", false).unwrap();
    assert_eq!(rx.recv(false).unwrap(), b"hello queue");
}

#[test]
fn empty_message_is_legal() {
    let (mut tx, mut rx) = pair(4096, 1024);
    tx.send(b"", false).unwrap();
    assert_eq!(rx.recv(false).unwrap(), b"");
}

#[test]
fn unaligned_lengths_preserve_framing() {
    let (mut tx, mut rx) = pair(4096, 1024);
    for len in [1usize, 7, 8, 9, 63, 64, 65] {
        tx.send(&pattern(len, len as u8), false).unwrap();
    }
    for len in [1usize, 7, 8, 9, 63, 64, 65] {
        assert_eq!(rx.recv(false).unwrap(), &pattern(len, len as u8)[..]);
    }
}

#[test]
fn message_filling_whole_ring_round_trips() {
    // Length word plus payload is exactly the ring; the sender has to
    // publish everything in one go.
    let (mut tx, mut rx) = pair(256, 248);
    let body = pattern(248, 3);
    tx.send(&body, true).unwrap();
    assert_eq!(rx.recv(false).unwrap(), &body[..]);
}

#[test]
fn payload_published_ahead_of_padding() {
    let lt = latch_table();
    lt.latch(1).own().unwrap();
    let queue = Queue::create(64, 32).unwrap();
    let body = pattern(21, 9);

    // Stage the frame by hand: word and payload visible, the three
    // padding bytes held back, the state an in-flight quarter-ring
    // publish leaves behind.
    unsafe {
        core::ptr::copy_nonoverlapping(
            (body.len() as u64).to_ne_bytes().as_ptr(),
            queue.ring,
            LENGTH_WORD,
        );
        core::ptr::copy_nonoverlapping(body.as_ptr(), queue.ring.add(LENGTH_WORD), body.len());
    }
    queue
        .header
        .bytes_written
        .store((LENGTH_WORD + body.len()) as u64, Ordering::Release);

    // The receiver must not step past what has been published.
    let mut rx = queue.attach_receiver(lt, 1).unwrap();
    assert!(matches!(rx.recv(true), Err(DbError::WouldBlock)));

    // The message-end flush lands; the retry completes cleanly.
    queue.header.bytes_written.store(32, Ordering::Release);
    assert_eq!(rx.recv(true).unwrap(), &body[..]);
}

#[test]
fn gather_send_concatenates() {
    let (mut tx, mut rx) = pair(4096, 1024);
    tx.send_v(&[b"head:", b"body:", b"tail"], false).unwrap();
    assert_eq!(rx.recv(false).unwrap(), b"head:body:tail");
}

#[test]
fn oversized_message_rejected() {
    let (mut tx, _rx) = pair(4096, 16);
    assert!(matches!(
        tx.send(&[0u8; 17], false),
        Err(DbError::CapacityExceeded)
    ));
}

#[test]
fn wrapping_message_reassembled() {
    // Ring much smaller than the message stream so the second message
    // wraps the edge.
    let _guard = WAIT_LOCK.lock().unwrap();
    let (mut tx, mut rx) = pair(256, 1024);
    let a = pattern(100, 1);
    let b = pattern(180, 2);
    let rx_thread = thread::spawn(move || {
        // Blocking sends interleave with these receives.
        let first = rx.recv(false).unwrap().to_vec();
        let second = rx.recv(false).unwrap().to_vec();
        (first, second)
    });
    tx.send(&a, false).unwrap();
    tx.send(&b, false).unwrap();
    let (first, second) = rx_thread.join().unwrap();
    assert_eq!(first, a);
    assert_eq!(second, b);
}

// ========== blocking and nowait ==========

#[test]
fn receiver_blocks_until_data_arrives() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (mut tx, mut rx) = pair(4096, 1024);
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        tx.send(b"late", false).unwrap();
        tx
    });
    assert_eq!(rx.recv(false).unwrap(), b"late");
    sender.join().unwrap();
}

#[test]
fn nowait_recv_on_empty_queue() {
    let (_tx, mut rx) = pair(4096, 1024);
    assert!(matches!(rx.recv(true), Err(DbError::WouldBlock)));
}

#[test]
fn ring_fill_and_drain() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (mut tx, mut rx) = pair(64 * 1024, 32 * 1024);
    let payloads: Vec<Vec<u8>> = (0..4).map(|i| pattern(20 * 1024, i as u8)).collect();

    // Three 20KiB messages fit; the fourth hits a full ring.
    tx.send(&payloads[0], true).unwrap();
    tx.send(&payloads[1], true).unwrap();
    tx.send(&payloads[2], true).unwrap();
    assert!(matches!(
        tx.send(&payloads[3], true),
        Err(DbError::WouldBlock)
    ));

    // One receive frees enough space for the preserved partial send to
    // finish.
    assert_eq!(rx.recv(false).unwrap(), &payloads[0][..]);
    tx.send(&payloads[3], true).unwrap();

    for expected in &payloads[1..] {
        assert_eq!(rx.recv(false).unwrap(), &expected[..]);
    }
}

#[test]
fn sender_blocks_until_space_frees() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (mut tx, mut rx) = pair(256, 512);
    let big = pattern(400, 9);
    let big_clone = big.clone();
    let sender = thread::spawn(move || {
        // Cannot fit at once; completes as the receiver drains.
        tx.send(&big_clone, false).unwrap();
        tx
    });
    assert_eq!(rx.recv(false).unwrap(), big);
    sender.join().unwrap();
}

// ========== detach ==========

#[test]
fn receiver_drains_then_sees_detached() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (mut tx, mut rx) = pair(4096, 1024);
    tx.send(b"parting gift", false).unwrap();
    tx.detach();
    assert_eq!(rx.recv(false).unwrap(), b"parting gift");
    assert!(matches!(rx.recv(false), Err(DbError::Detached)));
}

#[test]
fn send_to_detached_receiver_fails() {
    let (mut tx, mut rx) = pair(4096, 1024);
    rx.detach();
    assert!(matches!(
        tx.send(b"nobody home", false),
        Err(DbError::Detached)
    ));
}

#[test]
fn detach_unblocks_waiting_receiver() {
    let _guard = WAIT_LOCK.lock().unwrap();
    let (mut tx, mut rx) = pair(4096, 1024);
    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        tx.detach();
    });
    assert!(matches!(rx.recv(false), Err(DbError::Detached)));
    closer.join().unwrap();
}

#[test]
fn on_detach_callback_runs_once() {
    let (mut tx, _rx) = pair(4096, 1024);
    let ran = Arc::new(AtomicBool::new(false));
    let ran_clone = Arc::clone(&ran);
    tx.set_on_detach(Box::new(move || {
        ran_clone.store(true, Ordering::Release);
    }));
    tx.detach();
    tx.detach();
    assert!(ran.load(Ordering::Acquire));
}

#[test]
fn second_sender_attach_refused() {
    let lt = latch_table();
    let queue = Queue::create(4096, 1024).unwrap();
    let _tx = queue.attach_sender(lt, 0).unwrap();
    assert!(matches!(
        queue.attach_sender(lt, 2),
        Err(DbError::InvalidState(_))
    ));
}
