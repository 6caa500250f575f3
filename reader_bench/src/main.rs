use std::error::Error;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::info;

use mmlog_shmem::{logging, LogEvent, PayloadFormat, RingBuffer, Shutdown, TypedQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mmlog-reader.toml")]
    config: String,
    /// Overrides the configured buffer name.
    #[clap(long = "name")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ReaderBenchConfig {
    buffer_name: String,
    format: PayloadFormat,
    batch_size: usize,
    /// Stop after the queue stayed empty this long.
    idle_timeout_ms: u64,
    poll_interval_ms: u64,
}

impl Default for ReaderBenchConfig {
    fn default() -> Self {
        ReaderBenchConfig {
            buffer_name: "mmlog".to_string(),
            format: PayloadFormat::default(),
            batch_size: 100,
            idle_timeout_ms: 2000,
            poll_interval_ms: 1,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init("info");
    let opts: Opts = Opts::parse();
    let mut cfg: ReaderBenchConfig = confy::load_path(&opts.config)?;
    if let Some(name) = opts.name {
        cfg.buffer_name = name;
    }

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers()?;
    let queue = TypedQueue::new(RingBuffer::open_or_create(&cfg.buffer_name)?, cfg.format);
    run(&queue, &cfg, &shutdown);
    Ok(())
}

fn run(queue: &TypedQueue<LogEvent, PayloadFormat>, cfg: &ReaderBenchConfig, shutdown: &Shutdown) {
    let idle_timeout = Duration::from_millis(cfg.idle_timeout_ms);
    let poll_interval = Duration::from_millis(cfg.poll_interval_ms);
    let mut read = 0u64;
    let mut started: Option<Instant> = None;
    let mut last_read = Instant::now();

    while !shutdown.is_requested() {
        let batch = queue.try_dequeue_batch(cfg.batch_size);
        if batch.is_empty() {
            if last_read.elapsed() >= idle_timeout {
                break;
            }
            shutdown.sleep(poll_interval);
            continue;
        }
        started.get_or_insert_with(Instant::now);
        last_read = Instant::now();
        let before = read;
        read += batch.len() as u64;
        if before / 100_000 != read / 100_000 {
            if let Some(last) = batch.last() {
                eprint!("\rTotal {} ops (current value: {})", read, last.render());
            }
        }
    }

    // Time spent waiting for the first message and the final idle period is not counted.
    let duration = started.map(|s| last_read.duration_since(s)).unwrap_or_default();
    let ops = read as f64 / duration.as_secs_f64().max(f64::EPSILON);
    info!(read, "reader finished");
    println!(
        "\n{:#?}K messages read/s. Total time: {:#?}",
        (ops / 1000f64) as u64,
        duration
    );
}
