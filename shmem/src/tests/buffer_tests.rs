use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use super::TestBuffer;
use crate::core::{name, Header, HEADER_SIZE, LEN_PREFIX, MAX_PAYLOAD_SIZE};
use crate::lock::{NamedLock, RobustMutex};

fn header(t: &TestBuffer) -> Header {
    Header::load(t.buffer.region.as_ref().unwrap()).unwrap()
}

#[test]
fn hello_round_trip() {
    let t = TestBuffer::with_capacity(crate::core::DEFAULT_CAPACITY);
    let buffer = &t.buffer;
    assert!(buffer.try_enqueue(b"hello"));

    let stats = buffer.get_stats();
    assert!(stats.available);
    assert_eq!(stats.message_count, 1);
    assert_eq!(stats.capacity_mb, 50);

    assert_eq!(buffer.try_dequeue(), Some(b"hello".to_vec()));
    assert_eq!(buffer.try_dequeue(), None);
    assert_eq!(buffer.get_stats().message_count, 0);
}

#[test]
fn third_record_does_not_fit_in_100_bytes() {
    let t = TestBuffer::with_capacity(HEADER_SIZE + 100);
    let payload = [7u8; 40];
    assert!(t.buffer.try_enqueue(&payload));
    assert!(t.buffer.try_enqueue(&payload));
    assert!(!t.buffer.try_enqueue(&payload));

    let stats = t.buffer.get_stats();
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.available_space, 100 - 2 * (LEN_PREFIX as u64 + 40));
}

#[test]
fn oversize_payload_leaves_header_untouched() {
    let t = TestBuffer::with_capacity(256 * 1024);
    assert!(t.buffer.try_enqueue(b"first"));
    let before = header(&t);

    assert!(!t.buffer.try_enqueue(&vec![0u8; MAX_PAYLOAD_SIZE + 1]));
    assert_eq!(header(&t), before);
}

#[test]
fn empty_and_maximum_payloads_round_trip() {
    let t = TestBuffer::with_capacity(HEADER_SIZE + LEN_PREFIX + MAX_PAYLOAD_SIZE + 100);
    let big: Vec<u8> = (0..MAX_PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect();

    assert!(t.buffer.try_enqueue(&big));
    assert_eq!(t.buffer.try_dequeue(), Some(big));

    assert!(t.buffer.try_enqueue(b""));
    assert_eq!(t.buffer.try_dequeue(), Some(Vec::new()));
    assert_eq!(t.buffer.try_dequeue(), None);
}

#[test]
fn records_come_out_in_fifo_order() {
    let t = TestBuffer::with_capacity(64 * 1024);
    let sent: Vec<Vec<u8>> = (0..200).map(|i| format!("record-{}", i).into_bytes()).collect();
    for p in &sent {
        assert!(t.buffer.try_enqueue(p));
    }
    let received: Vec<Vec<u8>> = (0..sent.len()).filter_map(|_| t.buffer.try_dequeue()).collect();
    assert_eq!(received, sent);
}

#[test]
fn batch_dequeue_stops_at_max_and_at_empty() {
    let t = TestBuffer::with_capacity(4096);
    for i in 0..5u8 {
        assert!(t.buffer.try_enqueue(&[i]));
    }
    assert_eq!(t.buffer.try_dequeue_batch(3), vec![vec![0], vec![1], vec![2]]);
    assert_eq!(t.buffer.try_dequeue_batch(10), vec![vec![3], vec![4]]);
    assert!(t.buffer.try_dequeue_batch(10).is_empty());
    assert!(t.buffer.try_dequeue_batch(0).is_empty());
}

#[test]
fn enqueue_until_full_then_space_is_insufficient() {
    let t = TestBuffer::with_capacity(HEADER_SIZE + 1000);
    let payload = [1u8; 37];
    let mut accepted = 0;
    while t.buffer.try_enqueue(&payload) {
        accepted += 1;
    }
    let stats = t.buffer.get_stats();
    assert_eq!(stats.message_count, accepted);
    assert!(stats.available_space < (LEN_PREFIX + payload.len()) as u64);
}

#[test]
fn handles_on_the_same_name_share_the_queue() {
    let t = TestBuffer::with_capacity(4096);
    let other = t.reopen();
    assert_eq!(other.capacity(), 4096);
    assert!(t.buffer.try_enqueue(b"from one handle"));
    assert_eq!(other.try_dequeue(), Some(b"from one handle".to_vec()));
    assert_eq!(t.buffer.get_stats().message_count, 0);
}

#[test]
fn dequeue_on_empty_buffer_is_none() {
    let t = TestBuffer::with_capacity(4096);
    assert_eq!(t.buffer.try_dequeue(), None);
    let stats = t.buffer.get_stats();
    assert!(stats.available);
    assert_eq!(stats.available_space, 4096 - HEADER_SIZE as u64);
}

#[test]
fn stats_are_unavailable_while_lock_is_held_elsewhere() {
    let t = TestBuffer::with_capacity(4096);
    let lock_id = name::os_id(&name::normalize(&t.name, name::LOCK_PREFIX).unwrap());
    let (held_tx, held_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let holder = thread::spawn(move || {
        let lock = RobustMutex::open_or_create(&lock_id).unwrap();
        assert!(lock.try_acquire(Duration::from_secs(1)));
        held_tx.send(()).unwrap();
        done_rx.recv().unwrap();
        lock.release();
    });
    held_rx.recv().unwrap();

    let started = Instant::now();
    let stats = t.buffer.get_stats();
    assert!(!stats.available);
    assert_eq!(stats.message_count, 0);
    assert!(started.elapsed() < Duration::from_millis(900));

    done_tx.send(()).unwrap();
    holder.join().unwrap();
    assert!(t.buffer.get_stats().available);
}

#[test]
fn operations_recover_after_holder_dies_with_the_lock() {
    let t = TestBuffer::with_capacity(4096);
    assert!(t.buffer.try_enqueue(b"before"));

    let lock_id = name::os_id(&name::normalize(&t.name, name::LOCK_PREFIX).unwrap());
    thread::spawn(move || {
        let lock = RobustMutex::open_or_create(&lock_id).unwrap();
        assert!(lock.try_acquire(Duration::from_secs(1)));
        // Leaked so the mutex is still mapped when the thread exits holding it.
        std::mem::forget(lock);
    })
    .join()
    .unwrap();

    let started = Instant::now();
    assert!(t.buffer.try_enqueue(b"after"));
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(t.buffer.try_dequeue(), Some(b"before".to_vec()));
    assert_eq!(t.buffer.try_dequeue(), Some(b"after".to_vec()));
}

#[test]
fn producer_and_consumer_threads_keep_order_and_count() {
    const COUNT: usize = 5_000;
    let t = TestBuffer::with_capacity(2048);
    let producer_handle = t.reopen();

    let producer = thread::spawn(move || {
        for i in 0..COUNT {
            let payload = format!("{:06}:{}", i, "x".repeat(i % 50));
            while !producer_handle.try_enqueue(payload.as_bytes()) {
                thread::yield_now();
            }
        }
    });

    let deadline = Instant::now() + Duration::from_secs(60);
    let mut next = 0;
    while next < COUNT {
        assert!(Instant::now() < deadline, "consumer stalled at {}", next);
        match t.buffer.try_dequeue() {
            Some(payload) => {
                let expected = format!("{:06}:{}", next, "x".repeat(next % 50));
                assert_eq!(payload, expected.into_bytes());
                next += 1;
            }
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();

    let h = header(&t);
    assert_eq!(h.message_count, 0);
    assert_eq!(h.write_pos, h.read_pos);
}
