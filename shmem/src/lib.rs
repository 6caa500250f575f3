//! Cross-process log handoff over a memory-mapped circular queue.
//!
//! Producers append length-prefixed records to a fixed-capacity ring buffer in a named
//! POSIX shared-memory object; a consumer in another process drains it and hands the
//! entries to a downstream sink. Every header mutation happens under a robust
//! process-shared mutex, so a producer that dies mid-operation cannot wedge the queue.

#[cfg(not(target_os = "linux"))]
compile_error!("mmlog-shmem needs robust process-shared pthread mutexes and only builds on Linux");

pub mod core;
pub mod errors;
pub mod event;
pub mod forwarder;
pub mod lock;
pub mod logging;
pub mod monitor;
pub mod queue;
pub mod reader;
pub mod shutdown;
pub mod sink;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{QueueStats, RingBuffer, DEFAULT_CAPACITY, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use crate::errors::{QueueError, Result};
pub use crate::event::{Level, LogEvent, TemplateToken};
pub use crate::queue::{JsonSerializer, MessagePackSerializer, PayloadFormat, Serializer, TypedQueue};
pub use crate::shutdown::Shutdown;
pub use crate::sink::QueueLayer;
