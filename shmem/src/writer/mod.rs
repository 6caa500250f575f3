use tracing::{trace, warn};

use super::core::*;
use super::errors::Result;
use super::lock::OPERATION_TIMEOUT;

/// Where a record of a given size goes, if anywhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Placement {
    Reject,
    Write {
        /// Position of the wrap marker to emit, when the tail has room for one.
        marker_at: Option<usize>,
        /// Start of the record's length prefix.
        target: usize,
        /// `write_pos` after the record.
        next_write_pos: usize,
    },
}

/// Decides where a payload of `payload_len` bytes can be placed. Records are never
/// split across the end of the data region.
pub(crate) fn place(header: &Header, capacity: usize, payload_len: usize) -> Placement {
    let Header { write_pos, read_pos, .. } = *header;
    let space_needed = LEN_PREFIX + payload_len;
    let total_avail = available_space(header, capacity);
    if space_needed > total_avail {
        return Placement::Reject;
    }

    // Only the segment running to the end of the mapping can need a wrap.
    let tail_space = if write_pos >= read_pos { capacity - write_pos } else { read_pos - write_pos };
    let need_wrap = write_pos >= read_pos && space_needed > tail_space;
    let can_write_marker = need_wrap && capacity - write_pos >= LEN_PREFIX;
    if can_write_marker && space_needed + LEN_PREFIX > total_avail {
        return Placement::Reject;
    }

    let target = if need_wrap { HEADER_SIZE } else { write_pos };
    let contiguous = if target >= read_pos { capacity - target } else { read_pos - target };
    if space_needed > contiguous {
        return Placement::Reject;
    }

    let mut next_write_pos = target + space_needed;
    if next_write_pos >= capacity {
        next_write_pos = HEADER_SIZE;
    }
    Placement::Write {
        marker_at: if can_write_marker { Some(write_pos) } else { None },
        target,
        next_write_pos,
    }
}

impl RingBuffer {
    /// Appends one record. `false` means the payload is too large, there is no room
    /// for it right now, or the lock could not be taken within a second.
    pub fn try_enqueue(&self, payload: &[u8]) -> bool {
        if payload.len() > MAX_PAYLOAD_SIZE {
            trace!(buffer = %self.name(), len = payload.len(), "payload too large");
            return false;
        }
        let capacity = self.capacity();
        match self.locked(OPERATION_TIMEOUT, |region| write_record(region, capacity, payload)) {
            Some(Ok(written)) => written,
            Some(Err(e)) => {
                warn!(buffer = %self.name(), "enqueue failed: {}", e);
                false
            }
            None => false,
        }
    }
}

fn write_record(region: &MappedRegion, capacity: usize, payload: &[u8]) -> Result<bool> {
    let mut header = Header::load(region)?;
    let (marker_at, target, next_write_pos) = match place(&header, capacity, payload.len()) {
        Placement::Reject => return Ok(false),
        Placement::Write { marker_at, target, next_write_pos } => (marker_at, target, next_write_pos),
    };

    if let Some(at) = marker_at {
        region.write_u16(at, WRAP_MARKER)?;
    }
    region.write_u16(target, payload.len() as u16)?;
    // A record never straddles the end of the region, so one copy covers the payload.
    region.write_from(target + LEN_PREFIX, payload)?;

    header.write_pos = next_write_pos;
    header.message_count += 1;
    header.store(region)?;
    region.flush();
    Ok(true)
}
