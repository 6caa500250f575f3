use std::io;

use thiserror::Error;

// Only structural failures end up here. Contention, a full buffer or an empty buffer
// are reported through booleans and empty results.

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid buffer name: {0:?}")]
    InvalidName(String),

    #[error(
        "Mapped region header does not match expected layout \
         (stored header size {stored_header_size}, expected {expected_header_size}; \
         stored capacity {stored_capacity}, mapping size {actual_capacity})"
    )]
    IncompatibleLayout {
        stored_header_size: i32,
        expected_header_size: i32,
        stored_capacity: i32,
        actual_capacity: usize,
    },

    #[error("Invalid capacity: {0} bytes")]
    InvalidCapacity(usize),

    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Timed out waiting for the buffer lock")]
    LockTimeout,

    #[error("Access out of bounds: offset {offset}, len {len}, capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Sink error: {0}")]
    Sink(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
