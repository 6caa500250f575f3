use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::core::{QueueStats, RingBuffer, MAX_PAYLOAD_SIZE};
use super::errors::Result;

/// Turns entries into payloads and back.
pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize>(&self, entry: &T) -> Result<Vec<u8>>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Compact JSON via `serde_json`.
#[derive(Debug, Default, Copy, Clone)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, entry: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(entry)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// MessagePack via `rmp_serde`. Structs are written as maps so optional fields can be
/// skipped and values like `serde_json::Value` still decode.
#[derive(Debug, Default, Copy, Clone)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn serialize<T: Serialize>(&self, entry: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(entry)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Payload format picked in configuration. Producers and consumers of one buffer must
/// agree on it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl Serializer for PayloadFormat {
    fn serialize<T: Serialize>(&self, entry: &T) -> Result<Vec<u8>> {
        match self {
            PayloadFormat::Json => JsonSerializer.serialize(entry),
            PayloadFormat::MessagePack => MessagePackSerializer.serialize(entry),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadFormat::Json => JsonSerializer.deserialize(bytes),
            PayloadFormat::MessagePack => MessagePackSerializer.deserialize(bytes),
        }
    }
}

/// Typed view over a [`RingBuffer`].
pub struct TypedQueue<T, S = JsonSerializer> {
    buffer: RingBuffer,
    serializer: S,
    _entry: PhantomData<fn(T) -> T>,
}

impl<T> TypedQueue<T, JsonSerializer>
where
    T: Serialize + DeserializeOwned,
{
    pub fn open_or_create(name: &str) -> Result<Self> {
        Ok(Self::new(RingBuffer::open_or_create(name)?, JsonSerializer))
    }
}

impl<T, S> TypedQueue<T, S>
where
    T: Serialize + DeserializeOwned,
    S: Serializer,
{
    pub fn new(buffer: RingBuffer, serializer: S) -> Self {
        TypedQueue { buffer, serializer, _entry: PhantomData }
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    /// `Ok(false)` when the serialized entry is larger than a record can hold or the
    /// buffer refused it. Serializer failures are errors.
    pub fn try_enqueue(&self, entry: &T) -> Result<bool> {
        let payload = self.serializer.serialize(entry)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Ok(false);
        }
        Ok(self.buffer.try_enqueue(&payload))
    }

    /// `Ok(None)` when nothing is available. A record that fails to deserialize has
    /// already been consumed and is reported as an error.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
        match self.buffer.try_dequeue() {
            Some(payload) => self.serializer.deserialize(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Dequeues up to `max_count` entries in order. Records that cannot be decoded are
    /// logged and skipped but still count towards `max_count`.
    pub fn try_dequeue_batch(&self, max_count: usize) -> Vec<T> {
        let mut results = Vec::with_capacity(max_count.min(1024));
        for _ in 0..max_count {
            match self.try_dequeue() {
                Ok(Some(entry)) => results.push(entry),
                Ok(None) => break,
                Err(e) => warn!(buffer = %self.buffer.name(), "dropping undecodable record: {}", e),
            }
        }
        results
    }

    pub fn get_stats(&self) -> QueueStats {
        self.buffer.get_stats()
    }

    pub fn dispose(&mut self) {
        self.buffer.dispose();
    }
}
