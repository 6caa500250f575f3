use std::error::Error;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::info;

use mmlog_shmem::{logging, Level, LogEvent, PayloadFormat, QueueLayer, RingBuffer, Shutdown, TypedQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mmlog-writer.toml")]
    config: String,
    /// Overrides the configured number of messages.
    #[clap(short = 'n', long = "messages")]
    messages: Option<u64>,
    /// Overrides the configured buffer name.
    #[clap(long = "name")]
    name: Option<String>,
    /// Emits `tracing` events through the queue layer instead of enqueueing directly.
    #[clap(long = "via-tracing")]
    via_tracing: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct WriterBenchConfig {
    buffer_name: String,
    format: PayloadFormat,
    /// Only used when the buffer does not exist yet.
    capacity_mb: usize,
    messages: u64,
    /// Back-off while the buffer is full.
    retry_delay_ms: u64,
    via_tracing: bool,
}

impl Default for WriterBenchConfig {
    fn default() -> Self {
        WriterBenchConfig {
            buffer_name: "mmlog".to_string(),
            format: PayloadFormat::default(),
            capacity_mb: 50,
            messages: 1_000_000,
            retry_delay_ms: 1,
            via_tracing: false,
        }
    }
}

/// Target of the generated events, kept off the console.
const EVENT_TARGET: &str = "bench_events";

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let mut cfg: WriterBenchConfig = confy::load_path(&opts.config)?;
    if let Some(messages) = opts.messages {
        cfg.messages = messages;
    }
    if let Some(name) = opts.name {
        cfg.buffer_name = name;
    }
    cfg.via_tracing |= opts.via_tracing;

    let buffer = RingBuffer::open_or_create_with_capacity(&cfg.buffer_name, cfg.capacity_mb * 1024 * 1024)?;
    let queue = TypedQueue::new(buffer, cfg.format);
    let shutdown = Shutdown::new();
    if cfg.via_tracing {
        let layer = QueueLayer::new(queue);
        let dropped = layer.dropped_events();
        logging::init_with_queue(&format!("info,{}=off", EVENT_TARGET), layer);
        shutdown.install_signal_handlers()?;
        run_via_tracing(&cfg, &shutdown, &dropped);
        Ok(())
    } else {
        logging::init("info");
        shutdown.install_signal_handlers()?;
        run(&queue, &cfg, &shutdown)
    }
}

fn run(
    queue: &TypedQueue<LogEvent, PayloadFormat>,
    cfg: &WriterBenchConfig,
    shutdown: &Shutdown,
) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let pid = process::id();
    let retry_delay = Duration::from_millis(cfg.retry_delay_ms);
    let mut written = 0u64;
    let mut full = 0u64;

    'outer: while written < cfg.messages {
        let event = LogEvent::new(Level::Information, "Benchmark message {Seq} from {Pid}")
            .with_property("Seq", written)
            .with_property("Pid", pid);
        while !queue.try_enqueue(&event)? {
            full += 1;
            if !shutdown.sleep(retry_delay) {
                break 'outer;
            }
        }
        written += 1;
        if written % 100_000 == 0 {
            eprint!("\rTotal {} ops", written);
        }
    }

    let duration = start.elapsed();
    let ops = written as f64 / duration.as_secs_f64().max(f64::EPSILON);
    info!(written, full, "writer finished");
    println!(
        "\n{:#?}K messages written/s. Total time: {:#?} ({} retries on a full buffer)",
        (ops / 1000f64) as u64,
        duration,
        full
    );
    Ok(())
}

/// The producer path an application takes: plain `tracing` calls, no retries. Events
/// that do not fit are dropped by the layer.
fn run_via_tracing(cfg: &WriterBenchConfig, shutdown: &Shutdown, dropped: &AtomicU64) {
    let start = Instant::now();
    let pid = process::id();
    let mut emitted = 0u64;
    while emitted < cfg.messages && !shutdown.is_requested() {
        info!(target: EVENT_TARGET, Seq = emitted, Pid = pid, "Benchmark message {{Seq}} from {{Pid}}");
        emitted += 1;
        if emitted % 100_000 == 0 {
            eprint!("\rTotal {} ops", emitted);
        }
    }

    let duration = start.elapsed();
    let ops = emitted as f64 / duration.as_secs_f64().max(f64::EPSILON);
    let dropped = dropped.load(Ordering::Relaxed);
    info!(emitted, dropped, "writer finished");
    println!(
        "\n{:#?}K events emitted/s. Total time: {:#?} ({} dropped on a full buffer)",
        (ops / 1000f64) as u64,
        duration,
        dropped
    );
}
