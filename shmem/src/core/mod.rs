use std::ptr;
use std::time::Duration;

use serde_derive::Serialize;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, info, warn};

use crate::errors::{QueueError, Result};
use crate::lock::{LockGuard, NamedLock, RobustMutex, OPEN_TIMEOUT, STATS_TIMEOUT};

pub mod name;

/// Size of the header at the start of the mapping.
pub const HEADER_SIZE: usize = 32;
/// Length value that tells the reader to continue at `HEADER_SIZE`.
pub const WRAP_MARKER: u16 = u16::MAX;
/// Largest payload a single record can carry (u16 length prefix).
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;
/// Size of a record's length prefix.
pub const LEN_PREFIX: usize = 2;
pub const DEFAULT_CAPACITY_MB: usize = 50;
pub const DEFAULT_CAPACITY: usize = DEFAULT_CAPACITY_MB * 1024 * 1024;

pub const OFFSET_WRITE_POS: usize = 0;
pub const OFFSET_READ_POS: usize = 8;
pub const OFFSET_MESSAGE_COUNT: usize = 16;
pub const OFFSET_HEADER_SIZE: usize = 24;
pub const OFFSET_CAPACITY: usize = 28;

/// A shared-memory mapping with bounds-checked little-endian accessors.
pub struct MappedRegion {
    shmem: Shmem,
}

impl MappedRegion {
    fn create(os_id: &str, capacity: usize) -> std::result::Result<MappedRegion, ShmemError> {
        let mut shmem = ShmemConf::new().size(capacity).os_id(os_id).create()?;
        shmem.set_owner(false);
        Ok(MappedRegion { shmem })
    }

    /// `Ok(None)` when no object of that name exists.
    fn open(os_id: &str) -> Result<Option<MappedRegion>> {
        match ShmemConf::new().os_id(os_id).open() {
            Ok(shmem) => Ok(Some(MappedRegion { shmem })),
            Err(ShmemError::MapOpenFailed(code)) if code as i32 == libc::ENOENT => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(QueueError::OutOfBounds { offset, len, capacity: self.len() }),
        }
    }

    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.shmem.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    pub fn write_from(&self, offset: usize, buf: &[u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.shmem.as_ptr().add(offset), buf.len());
        }
        Ok(())
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_into(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn write_u16(&self, offset: usize, value: u16) -> Result<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    pub fn read_i32(&self, offset: usize) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_into(offset, &mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn write_i32(&self, offset: usize, value: i32) -> Result<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    pub fn read_i64(&self, offset: usize) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_into(offset, &mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    pub fn write_i64(&self, offset: usize, value: i64) -> Result<()> {
        self.write_from(offset, &value.to_le_bytes())
    }

    /// Schedules write-back of the mapping.
    pub fn flush(&self) {
        let rc = unsafe {
            libc::msync(self.shmem.as_ptr() as *mut libc::c_void, self.len(), libc::MS_ASYNC)
        };
        if rc != 0 {
            debug!(os_id = self.shmem.get_os_id(), "msync failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Cursor and counter fields of the header, as one snapshot.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub write_pos: usize,
    pub read_pos: usize,
    pub message_count: u64,
}

impl Header {
    /// Reads the header and checks that both cursors lie in the data region.
    pub fn load(region: &MappedRegion) -> Result<Header> {
        let capacity = region.len();
        let cursor = |offset: usize| -> Result<usize> {
            let raw = region.read_i64(offset)?;
            match usize::try_from(raw) {
                Ok(pos) if (HEADER_SIZE..capacity).contains(&pos) => Ok(pos),
                _ => Err(QueueError::OutOfBounds { offset: raw.max(0) as usize, len: 0, capacity }),
            }
        };
        let write_pos = cursor(OFFSET_WRITE_POS)?;
        let read_pos = cursor(OFFSET_READ_POS)?;
        let message_count = region.read_i64(OFFSET_MESSAGE_COUNT)?.max(0) as u64;
        Ok(Header { write_pos, read_pos, message_count })
    }

    pub fn store(&self, region: &MappedRegion) -> Result<()> {
        region.write_i64(OFFSET_WRITE_POS, self.write_pos as i64)?;
        region.write_i64(OFFSET_READ_POS, self.read_pos as i64)?;
        region.write_i64(OFFSET_MESSAGE_COUNT, self.message_count as i64)
    }
}

/// Free bytes in the data region. Equal cursors mean empty or full, which only the
/// message count can tell apart.
#[inline]
pub fn available_space(header: &Header, capacity: usize) -> usize {
    let data_size = capacity - HEADER_SIZE;
    let Header { write_pos, read_pos, message_count } = *header;
    if write_pos == read_pos {
        if message_count == 0 {
            data_size
        } else {
            0
        }
    } else if write_pos > read_pos {
        data_size - (write_pos - read_pos)
    } else {
        read_pos - write_pos
    }
}

/// Snapshot returned by [`RingBuffer::get_stats`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// `false` when the lock could not be taken quickly; other fields are then zero.
    pub available: bool,
    pub message_count: u64,
    pub available_space: u64,
    pub capacity_mb: u32,
    pub capacity_bytes: u64,
}

/// Fixed-capacity circular message queue over a named shared-memory object.
///
/// Layout of the mapping:
///
/// ```text
/// [0..8)   write_pos     i64
/// [8..16)  read_pos      i64
/// [16..24) message_count i64
/// [24..28) header_size   i32
/// [28..32) capacity      i32
/// [32..capacity)         records: [u16 len][payload] or [u16 0xFFFF] wrap marker
/// ```
pub struct RingBuffer {
    name: String,
    capacity: usize,
    pub(crate) region: Option<MappedRegion>,
    pub(crate) lock: Option<Box<dyn NamedLock>>,
}

// All access to the region happens under the cross-process lock.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Opens the buffer called `name`, creating it with the default capacity if it
    /// does not exist yet.
    pub fn open_or_create(name: &str) -> Result<RingBuffer> {
        Self::open_or_create_with_capacity(name, DEFAULT_CAPACITY)
    }

    /// Like [`open_or_create`](Self::open_or_create). `capacity` is only used when the
    /// buffer gets created; an existing buffer keeps the size it has.
    pub fn open_or_create_with_capacity(name: &str, capacity: usize) -> Result<RingBuffer> {
        if capacity <= HEADER_SIZE + LEN_PREFIX || capacity > i32::MAX as usize {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        let mapping_id = name::os_id(&name::normalize(name, name::MAPPING_PREFIX)?);
        let lock_id = name::os_id(&name::normalize(name, name::LOCK_PREFIX)?);

        let lock: Box<dyn NamedLock> = Box::new(RobustMutex::open_or_create(&lock_id)?);
        // Held across open/create so nobody sees a header that is not initialised yet.
        let region = {
            let _guard =
                LockGuard::acquire(lock.as_ref(), OPEN_TIMEOUT).ok_or(QueueError::LockTimeout)?;
            Self::open_or_create_region(&mapping_id, capacity)?
        };
        let capacity = region.len();
        Ok(RingBuffer {
            name: name.to_string(),
            capacity,
            region: Some(region),
            lock: Some(lock),
        })
    }

    fn open_or_create_region(mapping_id: &str, capacity: usize) -> Result<MappedRegion> {
        if let Some(region) = MappedRegion::open(mapping_id)? {
            info!(mapping = mapping_id, size = region.len(), "opened existing buffer");
            Self::validate(&region)?;
            return Ok(region);
        }
        match MappedRegion::create(mapping_id, capacity) {
            Ok(region) => {
                info!(mapping = mapping_id, capacity, "created buffer");
                Self::init_header(&region)?;
                Ok(region)
            }
            // Created by someone that did not go through the lock.
            Err(ShmemError::MappingIdExists) => match MappedRegion::open(mapping_id)? {
                Some(region) => {
                    Self::validate(&region)?;
                    Ok(region)
                }
                None => Err(ShmemError::MappingIdExists.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn init_header(region: &MappedRegion) -> Result<()> {
        Header { write_pos: HEADER_SIZE, read_pos: HEADER_SIZE, message_count: 0 }.store(region)?;
        region.write_i32(OFFSET_HEADER_SIZE, HEADER_SIZE as i32)?;
        region.write_i32(OFFSET_CAPACITY, region.len() as i32)?;
        region.flush();
        Ok(())
    }

    fn validate(region: &MappedRegion) -> Result<()> {
        let actual_capacity = region.len();
        let (stored_header_size, stored_capacity) = if actual_capacity >= HEADER_SIZE {
            (region.read_i32(OFFSET_HEADER_SIZE)?, region.read_i32(OFFSET_CAPACITY)?)
        } else {
            (0, 0)
        };
        if stored_header_size != HEADER_SIZE as i32
            || stored_capacity < 0
            || stored_capacity as usize != actual_capacity
        {
            return Err(QueueError::IncompatibleLayout {
                stored_header_size,
                expected_header_size: HEADER_SIZE as i32,
                stored_capacity,
                actual_capacity,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total mapping size in bytes, header included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_disposed(&self) -> bool {
        self.region.is_none()
    }

    /// Runs `f` with the lock held. `None` if the lock could not be taken in time or
    /// the buffer has been disposed.
    pub(crate) fn locked<R, F>(&self, timeout: Duration, f: F) -> Option<Result<R>>
    where
        F: FnOnce(&MappedRegion) -> Result<R>,
    {
        let (region, lock) = match (&self.region, &self.lock) {
            (Some(region), Some(lock)) => (region, lock),
            _ => return None,
        };
        let _guard = LockGuard::acquire(lock.as_ref(), timeout)?;
        Some(f(region))
    }

    /// Best-effort read of the header counters.
    pub fn get_stats(&self) -> QueueStats {
        let capacity = self.capacity;
        match self.locked(STATS_TIMEOUT, |region| Header::load(region)) {
            Some(Ok(header)) => QueueStats {
                available: true,
                message_count: header.message_count,
                available_space: available_space(&header, capacity) as u64,
                capacity_mb: (capacity / (1024 * 1024)) as u32,
                capacity_bytes: capacity as u64,
            },
            Some(Err(e)) => {
                warn!(buffer = %self.name, "cannot read header: {}", e);
                QueueStats::default()
            }
            None => QueueStats::default(),
        }
    }

    /// Releases the lock handle and unmaps the region. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.lock.take().is_some() | self.region.take().is_some() {
            debug!(buffer = %self.name, "disposed");
        }
    }

    /// Deletes the shared objects behind `name`. Processes that still have the buffer
    /// open keep working on their mapping; later openers start from an empty buffer.
    pub fn remove(name: &str) -> Result<()> {
        let mapping_id = name::os_id(&name::normalize(name, name::MAPPING_PREFIX)?);
        let lock_id = name::os_id(&name::normalize(name, name::LOCK_PREFIX)?);
        match ShmemConf::new().os_id(&mapping_id).open() {
            Ok(mut shmem) => {
                shmem.set_owner(true);
            }
            Err(ShmemError::MapOpenFailed(_)) => {}
            Err(e) => return Err(e.into()),
        }
        RobustMutex::remove(&lock_id)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}
