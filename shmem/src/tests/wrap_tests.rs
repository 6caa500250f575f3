use std::collections::VecDeque;

use super::TestBuffer;
use crate::core::{Header, HEADER_SIZE, LEN_PREFIX, OFFSET_MESSAGE_COUNT, OFFSET_READ_POS, WRAP_MARKER};

const CAP: usize = HEADER_SIZE + 100;

fn header(t: &TestBuffer) -> Header {
    Header::load(t.buffer.region.as_ref().unwrap()).unwrap()
}

fn record_at(t: &TestBuffer, pos: usize) -> Vec<u8> {
    let region = t.buffer.region.as_ref().unwrap();
    let len = region.read_u16(pos).unwrap() as usize;
    let mut out = vec![0u8; len];
    region.read_into(pos + LEN_PREFIX, &mut out).unwrap();
    out
}

#[test]
fn record_that_does_not_fit_the_tail_moves_to_the_head_behind_a_marker() {
    let t = TestBuffer::with_capacity(CAP);
    assert!(t.buffer.try_enqueue(&[1u8; 40]));
    assert!(t.buffer.try_enqueue(&[2u8; 40]));
    assert_eq!(t.buffer.try_dequeue(), Some(vec![1u8; 40]));
    // 16 bytes of tail left, 42 free at the head.
    assert_eq!(header(&t).write_pos, CAP - 16);

    let third = [3u8; 20];
    assert!(t.buffer.try_enqueue(&third));

    let region = t.buffer.region.as_ref().unwrap();
    assert_eq!(region.read_u16(CAP - 16).unwrap(), WRAP_MARKER);
    assert_eq!(record_at(&t, HEADER_SIZE), third.to_vec());
    assert_eq!(header(&t).write_pos, HEADER_SIZE + LEN_PREFIX + third.len());

    assert_eq!(t.buffer.try_dequeue(), Some(vec![2u8; 40]));
    assert_eq!(t.buffer.try_dequeue(), Some(third.to_vec()));
    let h = header(&t);
    assert_eq!(h.message_count, 0);
    assert_eq!(h.read_pos, h.write_pos);
}

#[test]
fn one_byte_tail_wraps_without_a_marker() {
    let t = TestBuffer::with_capacity(CAP);
    assert!(t.buffer.try_enqueue(&[9u8; 97]));
    assert_eq!(t.buffer.try_dequeue(), Some(vec![9u8; 97]));
    assert_eq!(header(&t).write_pos, CAP - 1);

    assert!(t.buffer.try_enqueue(b"0123456789"));
    assert_eq!(record_at(&t, HEADER_SIZE), b"0123456789".to_vec());
    assert_eq!(t.buffer.try_dequeue(), Some(b"0123456789".to_vec()));
    assert_eq!(header(&t).read_pos, HEADER_SIZE + 12);
}

#[test]
fn record_that_would_straddle_is_rejected_when_head_is_occupied() {
    let t = TestBuffer::with_capacity(CAP);
    assert!(t.buffer.try_enqueue(&[1u8; 8]));
    assert!(t.buffer.try_enqueue(&[2u8; 68]));
    assert_eq!(t.buffer.try_dequeue(), Some(vec![1u8; 8]));
    // 20 free at the tail, 10 free at the head: 30 in total.
    assert_eq!(t.buffer.get_stats().available_space, 30);

    assert!(!t.buffer.try_enqueue(&[3u8; 20]));
    assert_eq!(header(&t).message_count, 1);
    assert!(t.buffer.try_enqueue(&[4u8; 18]));
    assert_eq!(t.buffer.try_dequeue(), Some(vec![2u8; 68]));
    assert_eq!(t.buffer.try_dequeue(), Some(vec![4u8; 18]));
}

#[test]
fn unreadable_record_is_reported_as_empty_and_left_in_place() {
    let t = TestBuffer::with_capacity(CAP);
    assert!(t.buffer.try_enqueue(b"ok"));
    let region = t.buffer.region.as_ref().unwrap();
    // A length that cannot fit anywhere in the data region.
    region.write_u16(HEADER_SIZE, 500).unwrap();

    assert_eq!(t.buffer.try_dequeue(), None);
    assert_eq!(region.read_i64(OFFSET_MESSAGE_COUNT).unwrap(), 1);
    assert_eq!(region.read_i64(OFFSET_READ_POS).unwrap(), HEADER_SIZE as i64);
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn churn_keeps_fifo_and_message_count() {
    let t = TestBuffer::with_capacity(HEADER_SIZE + 333);
    let mut model: VecDeque<Vec<u8>> = VecDeque::new();
    let mut rng = Lcg(42);
    let mut wraps = 0;
    let mut last_write_pos = header(&t).write_pos;

    for step in 0..20_000u64 {
        if rng.next() % 3 != 0 {
            let len = (rng.next() % 90) as usize;
            let payload: Vec<u8> = (0..len).map(|i| (step as usize + i) as u8).collect();
            if t.buffer.try_enqueue(&payload) {
                model.push_back(payload);
            }
        } else {
            assert_eq!(t.buffer.try_dequeue(), model.pop_front());
        }

        let h = header(&t);
        assert_eq!(h.message_count, model.len() as u64);
        if h.write_pos < last_write_pos {
            wraps += 1;
        }
        last_write_pos = h.write_pos;
    }
    assert!(wraps > 100, "only {} wraps", wraps);

    while let Some(expected) = model.pop_front() {
        assert_eq!(t.buffer.try_dequeue(), Some(expected));
    }
    assert_eq!(t.buffer.try_dequeue(), None);
}
