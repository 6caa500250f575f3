//! Producer side: a `tracing` layer that turns every event it sees into a queued
//! [`LogEvent`].

use std::cell::Cell;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{debug, Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::event::{Level, LogEvent};
use crate::queue::{JsonSerializer, Serializer, TypedQueue};

const MESSAGE_FIELD: &str = "message";
const SOURCE_CONTEXT: &str = "SourceContext";

thread_local! {
    // Set while this thread is enqueuing, so events logged on the way are not fed back.
    static EMITTING: Cell<bool> = Cell::new(false);
}

struct Reentry;

impl Reentry {
    fn enter() -> Option<Reentry> {
        let entered = EMITTING.try_with(|busy| !busy.replace(true)).unwrap_or(false);
        entered.then(|| Reentry)
    }

    fn active() -> bool {
        EMITTING.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for Reentry {
    fn drop(&mut self) {
        let _ = EMITTING.try_with(|busy| busy.set(false));
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Level {
        if level == tracing::Level::ERROR {
            Level::Error
        } else if level == tracing::Level::WARN {
            Level::Warning
        } else if level == tracing::Level::INFO {
            Level::Information
        } else if level == tracing::Level::DEBUG {
            Level::Debug
        } else {
            Level::Verbose
        }
    }
}

/// Writes events at or above a minimum level into a [`TypedQueue`].
///
/// Enqueueing never fails the caller. An event that cannot be queued (full buffer,
/// oversize entry, busy lock, serializer error) is counted, logged at `debug` and
/// dropped.
pub struct QueueLayer<F = JsonSerializer> {
    queue: TypedQueue<LogEvent, F>,
    minimum_level: Level,
    dropped: Arc<AtomicU64>,
}

impl<F: Serializer> QueueLayer<F> {
    /// Queues `Information` and above.
    pub fn new(queue: TypedQueue<LogEvent, F>) -> Self {
        QueueLayer { queue, minimum_level: Level::Information, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn with_minimum_level(mut self, minimum_level: Level) -> Self {
        self.minimum_level = minimum_level;
        self
    }

    pub fn minimum_level(&self) -> Level {
        self.minimum_level
    }

    pub fn queue(&self) -> &TypedQueue<LogEvent, F> {
        &self.queue
    }

    /// Counter of events that passed the level check but were not queued. Stays valid
    /// after the layer has been moved into a subscriber.
    pub fn dropped_events(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Queues `event` unless it is below the minimum level. `true` when it was queued.
    pub fn emit(&self, event: &LogEvent) -> bool {
        if event.level < self.minimum_level {
            return false;
        }
        let _guard = match Reentry::enter() {
            Some(guard) => guard,
            None => return false,
        };
        let queued = match self.queue.try_enqueue(event) {
            Ok(true) => true,
            Ok(false) => {
                debug!(buffer = %self.queue.buffer().name(), level = %event.level, "log event not queued");
                false
            }
            Err(e) => {
                debug!(buffer = %self.queue.buffer().name(), "log event not queued: {}", e);
                false
            }
        };
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }
}

impl<S, F> Layer<S> for QueueLayer<F>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    F: Serializer + 'static,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = Level::from(*event.metadata().level());
        if level < self.minimum_level || Reentry::active() {
            return;
        }
        self.emit(&to_log_event(event, level, &ctx));
    }
}

/// Maps an event's fields onto a [`LogEvent`]. The `message` field becomes the
/// template, everything else a property. The outermost span id is the trace id and the
/// innermost the span id.
fn to_log_event<S>(event: &Event<'_>, level: Level, ctx: &Context<'_, S>) -> LogEvent
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let mut fields = Fields::default();
    event.record(&mut fields);

    let mut log_event = LogEvent::new(level, fields.message.as_deref().unwrap_or_default());
    log_event.properties = fields.properties;
    log_event
        .properties
        .insert(SOURCE_CONTEXT.to_string(), Value::from(event.metadata().target()));
    log_event.exception = fields.exception;

    if let Some(scope) = ctx.event_scope(event) {
        let mut spans = scope.from_root();
        if let Some(root) = spans.next() {
            let trace_id = root.id();
            let span_id = spans.last().map(|leaf| leaf.id()).unwrap_or_else(|| trace_id.clone());
            log_event = log_event.with_trace(
                format!("{:016x}", trace_id.into_u64()),
                format!("{:016x}", span_id.into_u64()),
            );
        }
    }
    log_event
}

#[derive(Default)]
struct Fields {
    message: Option<String>,
    properties: BTreeMap<String, Value>,
    exception: Option<String>,
}

impl Fields {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == MESSAGE_FIELD {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.properties.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for Fields {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        let mut chain = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        self.put(field, Value::from(value.to_string()));
        self.exception = Some(chain);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::from(format!("{:?}", value)));
    }
}
