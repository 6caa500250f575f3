use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{QueueStats, RingBuffer};
use crate::queue::{Serializer, TypedQueue};
use crate::shutdown::Shutdown;

/// Samples older than this are dropped from the history.
const HISTORY_WINDOW_SECS: i64 = 60 * 60;
/// Samples summarised by a health report.
const REPORT_WINDOW: usize = 10;
/// Samples averaged for the stalled-consumer check.
const THROUGHPUT_WINDOW: usize = 3;
/// Backlog above which a low throughput means the consumer is stuck.
const STALLED_BACKLOG: u64 = 100;

/// Anything that can report [`QueueStats`].
pub trait StatsSource {
    fn name(&self) -> &str;
    fn get_stats(&self) -> QueueStats;
}

impl StatsSource for RingBuffer {
    fn name(&self) -> &str {
        RingBuffer::name(self)
    }

    fn get_stats(&self) -> QueueStats {
        RingBuffer::get_stats(self)
    }
}

impl<T, S> StatsSource for TypedQueue<T, S>
where
    T: serde::Serialize + DeserializeOwned,
    S: Serializer,
{
    fn name(&self) -> &str {
        self.buffer().name()
    }

    fn get_stats(&self) -> QueueStats {
        TypedQueue::get_stats(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub high_usage_pct: f64,
    pub critical_usage_pct: f64,
    pub max_backlog: u64,
    pub min_throughput: f64,
    pub max_growth_pct_per_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            high_usage_pct: 75.0,
            critical_usage_pct: 90.0,
            max_backlog: 10_000,
            min_throughput: 1.0,
            max_growth_pct_per_min: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub monitoring_interval_secs: u64,
    pub alert_interval_secs: u64,
    pub thresholds: Thresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            monitoring_interval_secs: 30,
            alert_interval_secs: 300,
            thresholds: Thresholds::default(),
        }
    }
}

/// A condition worth telling an operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    HighUsage(f64),
    CriticalUsage(f64),
    LargeBacklog(u64),
    LowThroughput(f64),
    RapidGrowth(f64),
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alert::HighUsage(pct) => write!(f, "High buffer usage: {:.1}%", pct),
            Alert::CriticalUsage(pct) => write!(f, "CRITICAL buffer usage: {:.1}%", pct),
            Alert::LargeBacklog(count) => write!(f, "Large message backlog: {} messages", count),
            Alert::LowThroughput(rate) => {
                write!(f, "Low processing throughput: {:.1} msg/sec (messages accumulating)", rate)
            }
            Alert::RapidGrowth(rate) => write!(f, "Rapid buffer growth: {:.1}% per minute", rate),
        }
    }
}

pub trait AlertSink {
    fn raise(&self, buffer: &str, alert: &Alert);
}

/// Writes each alert as a warning.
#[derive(Debug, Default, Copy, Clone)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, buffer: &str, alert: &Alert) {
        warn!(buffer, "BUFFER ALERT: {}", alert);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub message_count: u64,
    pub available_space: u64,
    pub capacity_bytes: u64,
    /// Net change of the backlog per second since the previous sample.
    pub messages_per_second: f64,
    pub usage_pct: f64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    /// Nothing sampled yet.
    NoData,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Warning => "Warning",
            HealthStatus::Critical => "Critical",
            HealthStatus::NoData => "No Data",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub buffer_name: String,
    pub status: HealthStatus,
    pub current: Option<MetricsSample>,
    pub average_usage: f64,
    pub average_throughput: f64,
    pub peak_usage: f64,
    pub peak_throughput: f64,
    /// Samples in the whole history, not only the summarised ones.
    pub samples: usize,
    pub monitoring_duration: Duration,
}

/// Periodically samples a queue's stats, keeps an hour of history and raises alerts.
pub struct QueueMonitor<Q, A = LogAlertSink> {
    source: Q,
    alerts: A,
    config: MonitorConfig,
    history: VecDeque<MetricsSample>,
    last_alert: Option<DateTime<Utc>>,
    last_message_count: u64,
    last_sample_at: Option<DateTime<Utc>>,
}

impl<Q: StatsSource> QueueMonitor<Q, LogAlertSink> {
    pub fn new(source: Q, config: MonitorConfig) -> Self {
        Self::with_alert_sink(source, config, LogAlertSink)
    }
}

impl<Q: StatsSource, A: AlertSink> QueueMonitor<Q, A> {
    pub fn with_alert_sink(source: Q, config: MonitorConfig, alerts: A) -> Self {
        QueueMonitor {
            source,
            alerts,
            config,
            history: VecDeque::new(),
            last_alert: None,
            last_message_count: 0,
            last_sample_at: None,
        }
    }

    pub fn alert_sink(&self) -> &A {
        &self.alerts
    }

    pub fn history(&self) -> &VecDeque<MetricsSample> {
        &self.history
    }

    /// Samples until `shutdown` is requested.
    pub fn run(&mut self, shutdown: &Shutdown) {
        let interval = Duration::from_secs(self.config.monitoring_interval_secs);
        info!(buffer = %self.source.name(), "starting buffer monitor");
        while !shutdown.is_requested() {
            self.tick();
            if !shutdown.sleep(interval) {
                break;
            }
        }
        info!(buffer = %self.source.name(), "buffer monitor stopped");
    }

    pub fn tick(&mut self) -> Option<MetricsSample> {
        self.collect_at(Utc::now())
    }

    /// Takes one sample as of `now`. `None` when the stats were unavailable; nothing
    /// is recorded then.
    pub fn collect_at(&mut self, now: DateTime<Utc>) -> Option<MetricsSample> {
        let stats = self.source.get_stats();
        if !stats.available {
            warn!(buffer = %self.source.name(), "buffer is not available for metrics collection");
            return None;
        }

        let messages_per_second = match self.last_sample_at {
            Some(last) => {
                let secs = (now - last).num_milliseconds() as f64 / 1000.0;
                if secs > 0.0 {
                    (stats.message_count as f64 - self.last_message_count as f64) / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        let usage_pct = if stats.capacity_bytes == 0 {
            0.0
        } else {
            let used = stats.capacity_bytes.saturating_sub(stats.available_space);
            used as f64 * 100.0 / stats.capacity_bytes as f64
        };
        let sample = MetricsSample {
            timestamp: now,
            message_count: stats.message_count,
            available_space: stats.available_space,
            capacity_bytes: stats.capacity_bytes,
            messages_per_second,
            usage_pct,
        };

        self.history.push_back(sample.clone());
        while let Some(oldest) = self.history.front() {
            if (now - oldest.timestamp).num_seconds() > HISTORY_WINDOW_SECS {
                self.history.pop_front();
            } else {
                break;
            }
        }

        info!(
            buffer = %self.source.name(),
            messages = sample.message_count,
            available = sample.available_space,
            "usage {:.1}%, throughput {:.1} msg/sec",
            sample.usage_pct,
            sample.messages_per_second
        );
        self.check_alerts(&sample, now);

        self.last_message_count = stats.message_count;
        self.last_sample_at = Some(now);
        Some(sample)
    }

    fn check_alerts(&mut self, current: &MetricsSample, now: DateTime<Utc>) {
        if let Some(last) = self.last_alert {
            if (now - last).num_seconds() < self.config.alert_interval_secs as i64 {
                return;
            }
        }
        let t = &self.config.thresholds;
        let mut alerts = Vec::new();

        if current.usage_pct > t.high_usage_pct {
            alerts.push(Alert::HighUsage(current.usage_pct));
        }
        if current.usage_pct > t.critical_usage_pct {
            alerts.push(Alert::CriticalUsage(current.usage_pct));
        }
        if current.message_count > t.max_backlog {
            alerts.push(Alert::LargeBacklog(current.message_count));
        }
        if self.history.len() >= THROUGHPUT_WINDOW {
            let avg = self
                .history
                .iter()
                .rev()
                .take(THROUGHPUT_WINDOW)
                .map(|s| s.messages_per_second)
                .sum::<f64>()
                / THROUGHPUT_WINDOW as f64;
            if current.message_count > STALLED_BACKLOG && avg < t.min_throughput {
                alerts.push(Alert::LowThroughput(avg));
            }
        }
        let growth = self.growth_rate();
        if growth > t.max_growth_pct_per_min {
            alerts.push(Alert::RapidGrowth(growth));
        }

        if !alerts.is_empty() {
            for alert in &alerts {
                self.alerts.raise(self.source.name(), alert);
            }
            self.last_alert = Some(now);
        }
    }

    /// Usage percentage points per minute between the two latest samples.
    fn growth_rate(&self) -> f64 {
        let n = self.history.len();
        if n < 2 {
            return 0.0;
        }
        let (older, newer) = (&self.history[n - 2], &self.history[n - 1]);
        let minutes = (newer.timestamp - older.timestamp).num_milliseconds() as f64 / 60_000.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        (newer.usage_pct - older.usage_pct) / minutes
    }

    fn status_of(&self, current: &MetricsSample) -> HealthStatus {
        let t = &self.config.thresholds;
        if current.usage_pct > t.critical_usage_pct {
            HealthStatus::Critical
        } else if current.usage_pct > t.high_usage_pct || current.message_count > t.max_backlog {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn health_report(&self) -> HealthReport {
        self.health_report_at(Utc::now())
    }

    /// Summary of the most recent samples.
    pub fn health_report_at(&self, now: DateTime<Utc>) -> HealthReport {
        let buffer_name = self.source.name().to_string();
        let current = match self.history.back() {
            Some(current) => current.clone(),
            None => {
                return HealthReport {
                    buffer_name,
                    status: HealthStatus::NoData,
                    current: None,
                    average_usage: 0.0,
                    average_throughput: 0.0,
                    peak_usage: 0.0,
                    peak_throughput: 0.0,
                    samples: 0,
                    monitoring_duration: Duration::ZERO,
                }
            }
        };

        let recent: Vec<&MetricsSample> = self.history.iter().rev().take(REPORT_WINDOW).collect();
        let n = recent.len() as f64;
        let monitoring_duration = self
            .history
            .front()
            .and_then(|first| (now - first.timestamp).to_std().ok())
            .unwrap_or_default();

        HealthReport {
            buffer_name,
            status: self.status_of(&current),
            average_usage: recent.iter().map(|s| s.usage_pct).sum::<f64>() / n,
            average_throughput: recent.iter().map(|s| s.messages_per_second).sum::<f64>() / n,
            peak_usage: recent.iter().map(|s| s.usage_pct).fold(f64::MIN, f64::max),
            peak_throughput: recent.iter().map(|s| s.messages_per_second).fold(f64::MIN, f64::max),
            samples: self.history.len(),
            monitoring_duration,
            current: Some(current),
        }
    }
}
