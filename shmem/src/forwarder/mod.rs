use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errors::{QueueError, Result};
use crate::event::LogEvent;
use crate::queue::{JsonSerializer, Serializer, TypedQueue};
use crate::shutdown::Shutdown;

mod sqlite;

pub use sqlite::SqliteSink;

/// Downstream store for dequeued events.
pub trait Sink {
    fn create_schema(&self) -> Result<()>;
    fn add_batch(&self, events: &[LogEvent]) -> Result<()>;
    fn test_connection(&self) -> bool;
}

/// Keeps events in memory. Can be told to fail a number of upcoming batches.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
    failures: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    /// Makes the next `n` calls to `add_batch` fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Sink for MemorySink {
    fn create_schema(&self) -> Result<()> {
        Ok(())
    }

    fn add_batch(&self, events: &[LogEvent]) -> Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "memory sink told to fail",
            )));
        }
        self.events.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(events);
        Ok(())
    }

    fn test_connection(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Most events taken off the queue per iteration.
    pub batch_size: usize,
    /// Pause between iterations that did not fill a batch.
    pub poll_interval_ms: u64,
    /// Extra attempts after a failed sink write.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            batch_size: 100,
            poll_interval_ms: 10,
            max_retries: 3,
            retry_delay_ms: 2000,
        }
    }
}

/// Writes batches to a [`Sink`], retrying failed writes.
pub struct Forwarder<K> {
    sink: K,
    max_retries: u32,
    retry_delay: Duration,
}

impl<K: Sink> Forwarder<K> {
    pub fn new(sink: K, config: &ForwarderConfig) -> Self {
        Forwarder {
            sink,
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn test_connection(&self) -> bool {
        self.sink.test_connection()
    }

    /// `true` once the sink accepted the batch. After the last retry fails the batch is
    /// logged and dropped. A shutdown request cuts the retries short.
    pub fn forward_batch(&self, events: &[LogEvent], shutdown: &Shutdown) -> bool {
        if events.is_empty() {
            return true;
        }
        let mut attempt = 0;
        loop {
            match self.sink.add_batch(events) {
                Ok(()) => return true,
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, max_retries = self.max_retries, "sink write failed, retrying: {}", e);
                    if !shutdown.sleep(self.retry_delay) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(attempt, "sink write failed: {}", e);
                    break;
                }
            }
        }
        error!(events = events.len(), "dropping batch after failed sink writes");
        false
    }
}

/// What a [`ShippingClient`] did so far.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct ShippingStats {
    pub forwarded: u64,
    pub dropped: u64,
}

/// Moves events from a queue to a [`Forwarder`].
pub struct ShippingClient<K, S = JsonSerializer> {
    queue: TypedQueue<LogEvent, S>,
    forwarder: Forwarder<K>,
    batch_size: usize,
    poll_interval: Duration,
    stats: ShippingStats,
}

impl<K: Sink, S: Serializer> ShippingClient<K, S> {
    pub fn new(queue: TypedQueue<LogEvent, S>, forwarder: Forwarder<K>, config: &ForwarderConfig) -> Self {
        ShippingClient {
            queue,
            forwarder,
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stats: ShippingStats::default(),
        }
    }

    pub fn forwarder(&self) -> &Forwarder<K> {
        &self.forwarder
    }

    pub fn stats(&self) -> ShippingStats {
        self.stats
    }

    /// Forwards at most one batch. Returns how many events were dequeued.
    pub fn ship_once(&mut self, shutdown: &Shutdown) -> usize {
        let batch = self.queue.try_dequeue_batch(self.batch_size);
        if batch.is_empty() {
            return 0;
        }
        if self.forwarder.forward_batch(&batch, shutdown) {
            self.stats.forwarded += batch.len() as u64;
            debug!(events = batch.len(), "forwarded batch");
        } else {
            self.stats.dropped += batch.len() as u64;
        }
        batch.len()
    }

    /// Ships until `shutdown` is requested.
    pub fn run(&mut self, shutdown: &Shutdown) -> ShippingStats {
        info!(buffer = %self.queue.buffer().name(), "shipping client started");
        while !shutdown.is_requested() {
            let shipped = self.ship_once(shutdown);
            if shipped < self.batch_size && !shutdown.sleep(self.poll_interval) {
                break;
            }
        }
        info!(
            buffer = %self.queue.buffer().name(),
            forwarded = self.stats.forwarded,
            dropped = self.stats.dropped,
            "shipping client stopped"
        );
        self.stats
    }
}
