use std::error::Error;
use std::thread;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use mmlog_shmem::forwarder::{Forwarder, ForwarderConfig, ShippingClient, Sink, SqliteSink};
use mmlog_shmem::monitor::{MonitorConfig, QueueMonitor};
use mmlog_shmem::{logging, PayloadFormat, RingBuffer, Shutdown, TypedQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "mmlog-forwarder.toml")]
    config: String,
    /// Overrides the configured SQLite database path.
    #[clap(long = "database")]
    database: Option<String>,
    /// Overrides the configured buffer name.
    #[clap(long = "name")]
    name: Option<String>,
    /// Runs without the stats sampler.
    #[clap(long = "no-monitor")]
    no_monitor: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    buffer_name: String,
    database_path: String,
    /// Must match what the producers write.
    format: PayloadFormat,
    forwarder: ForwarderConfig,
    monitor: MonitorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            buffer_name: "mmlog".to_string(),
            database_path: "mmlog.db".to_string(),
            format: PayloadFormat::default(),
            forwarder: ForwarderConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init("info");
    let opts: Opts = Opts::parse();
    let mut cfg: AppConfig = confy::load_path(&opts.config)?;
    if let Some(database) = opts.database {
        cfg.database_path = database;
    }
    if let Some(name) = opts.name {
        cfg.buffer_name = name;
    }

    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers()?;

    let sink = SqliteSink::open(&cfg.database_path)?;
    sink.create_schema()?;
    if !sink.test_connection() {
        warn!(database = %cfg.database_path, "sink connection test failed");
    }

    // The sampler gets its own handle, as any other process would.
    let monitor = if opts.no_monitor {
        None
    } else {
        let buffer = RingBuffer::open_or_create(&cfg.buffer_name)?;
        let monitor_cfg = cfg.monitor.clone();
        let monitor_shutdown = shutdown.clone();
        Some(thread::spawn(move || {
            let mut monitor = QueueMonitor::new(buffer, monitor_cfg);
            monitor.run(&monitor_shutdown);
            monitor.health_report()
        }))
    };

    let queue = TypedQueue::new(RingBuffer::open_or_create(&cfg.buffer_name)?, cfg.format);
    let forwarder = Forwarder::new(sink, &cfg.forwarder);
    let mut client = ShippingClient::new(queue, forwarder, &cfg.forwarder);
    info!(buffer = %cfg.buffer_name, database = %cfg.database_path, format = ?cfg.format, "forwarding");
    let stats = client.run(&shutdown);

    if let Some(handle) = monitor {
        match handle.join() {
            Ok(report) => info!(report = %serde_json::to_string(&report)?, "final buffer health"),
            Err(_) => warn!("monitor thread panicked"),
        }
    }
    println!("forwarded {} events, dropped {}", stats.forwarded, stats.dropped);
    Ok(())
}
