use tracing::warn;

use super::core::*;
use super::errors::Result;
use super::lock::OPERATION_TIMEOUT;

/// Length prefix peeked at `pos`, or `None` when not even a prefix fits there.
fn peek_len(region: &MappedRegion, capacity: usize, pos: usize) -> Result<Option<u16>> {
    if capacity - pos < LEN_PREFIX {
        return Ok(None);
    }
    region.read_u16(pos).map(Some)
}

/// `0xFFFF` is both the wrap marker and the length of a maximum-size payload. A marker
/// is only ever written where the tail cannot hold a maximum-size record, so a value
/// of `0xFFFF` with room for a full record behind it is a real length.
#[inline]
fn is_wrap_marker(value: u16, capacity: usize, pos: usize) -> bool {
    value == WRAP_MARKER && capacity - pos < LEN_PREFIX + MAX_PAYLOAD_SIZE
}

/// Finds the start of the next record and its length. `None` means the region does
/// not hold a readable record where one should be.
fn locate(region: &MappedRegion, capacity: usize, read_pos: usize) -> Result<Option<(usize, usize)>> {
    let mut pos = read_pos;
    // Writer wrapped without a marker: not even a length prefix fits in the tail.
    if capacity - pos < LEN_PREFIX {
        pos = HEADER_SIZE;
    }
    let mut len = match peek_len(region, capacity, pos)? {
        Some(len) => len,
        None => return Ok(None),
    };
    if is_wrap_marker(len, capacity, pos) {
        pos = HEADER_SIZE;
        len = match peek_len(region, capacity, pos)? {
            Some(len) => len,
            None => return Ok(None),
        };
    }
    // The payload does not fit before the end: the writer must have wrapped here
    // without leaving a marker.
    if capacity - (pos + LEN_PREFIX) < len as usize {
        if pos == HEADER_SIZE {
            return Ok(None);
        }
        pos = HEADER_SIZE;
        len = match peek_len(region, capacity, pos)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if capacity - (pos + LEN_PREFIX) < len as usize {
            return Ok(None);
        }
    }
    Ok(Some((pos, len as usize)))
}

fn read_record(region: &MappedRegion, capacity: usize) -> Result<Option<Vec<u8>>> {
    let mut header = Header::load(region)?;
    if header.message_count == 0 {
        return Ok(None);
    }
    let (pos, len) = match locate(region, capacity, header.read_pos)? {
        Some(found) => found,
        None => {
            // Left as is: the count is not decremented and nothing is reset.
            warn!(read_pos = header.read_pos, count = header.message_count, "no readable record at read position");
            return Ok(None);
        }
    };

    let mut payload = vec![0u8; len];
    region.read_into(pos + LEN_PREFIX, &mut payload)?;

    let mut next_read_pos = pos + LEN_PREFIX + len;
    if next_read_pos >= capacity {
        next_read_pos = HEADER_SIZE;
    }
    header.read_pos = next_read_pos;
    header.message_count -= 1;
    header.store(region)?;
    region.flush();
    Ok(Some(payload))
}

impl RingBuffer {
    /// Removes the oldest record. `None` when the buffer is empty, the lock could not
    /// be taken within a second, or no valid record could be found.
    pub fn try_dequeue(&self) -> Option<Vec<u8>> {
        let capacity = self.capacity();
        match self.locked(OPERATION_TIMEOUT, |region| read_record(region, capacity))? {
            Ok(payload) => payload,
            Err(e) => {
                warn!(buffer = %self.name(), "dequeue failed: {}", e);
                None
            }
        }
    }

    /// Dequeues up to `max_count` records, stopping at the first miss. Each record is
    /// taken under its own lock acquisition.
    pub fn try_dequeue_batch(&self, max_count: usize) -> Vec<Vec<u8>> {
        let mut results = Vec::with_capacity(max_count.min(1024));
        while results.len() < max_count {
            match self.try_dequeue() {
                Some(payload) => results.push(payload),
                None => break,
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_length_is_a_length_when_a_full_record_fits() {
        let capacity = HEADER_SIZE + LEN_PREFIX + MAX_PAYLOAD_SIZE + 10;
        assert!(!is_wrap_marker(WRAP_MARKER, capacity, HEADER_SIZE));
        assert!(is_wrap_marker(WRAP_MARKER, capacity, HEADER_SIZE + 20));
        assert!(!is_wrap_marker(100, capacity, HEADER_SIZE + 20));
    }
}
