//! Continuous host utilization sampling.
//!
//! The [`MonitorLoop`] runs as its own task on its own interval and shares no
//! locks with the update machinery, so a slow download or a stalled version
//! server never delays a sample. Each tick:
//!
//! 1. asks the [`Sampler`] for a [`MetricSample`] (a failed read degrades that
//!    field to [`Reading::Unavailable`] instead of failing the sample),
//! 2. evaluates it against the configured [`Thresholds`](health::Thresholds),
//! 3. hands sample and alerts to the [`SampleSink`].
//!
//! Delivering samples anywhere beyond the process (dashboards, storage) is
//! left to sink implementations; [`LogSink`] writes them to the log.

pub mod health;
pub mod system;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::SampleError;
use crate::utils::shutdown::ShutdownListener;
use health::{Alert, Severity, Thresholds};

pub use system::SysinfoSampler;

/// A metric value, or the explicit absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading<T> {
    Available(T),
    Unavailable,
}

impl<T: Copy> Reading<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Self::Available(value) => Some(*value),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// Used and total bytes of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl Capacity {
    pub const fn new(used_bytes: u64, total_bytes: u64) -> Self {
        Self {
            used_bytes,
            total_bytes,
        }
    }

    /// Utilization in percent; 0 for an empty capacity.
    pub fn percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 * 100.0 / self.total_bytes as f64) as f32
    }
}

/// One snapshot of host utilization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Reading<f32>,
    pub memory: Reading<Capacity>,
    pub disk: Reading<Capacity>,
}

impl MetricSample {
    pub fn memory_used_bytes(&self) -> Option<u64> {
        self.memory.value().map(|c| c.used_bytes)
    }

    pub fn disk_used_bytes(&self) -> Option<u64> {
        self.disk.value().map(|c| c.used_bytes)
    }
}

fn degrade<T>(result: Result<T, SampleError>) -> Reading<T> {
    match result {
        Ok(value) => Reading::Available(value),
        Err(e) => {
            warn!(metric = e.metric, error = %e.reason, "Metric unavailable");
            Reading::Unavailable
        }
    }
}

/// Source of host readings.
///
/// Implementations provide the three per-metric reads; [`Sampler::sample`]
/// combines them and never fails as a whole.
pub trait Sampler: Send {
    fn cpu_percent(&mut self) -> Result<f32, SampleError>;

    fn memory(&mut self) -> Result<Capacity, SampleError>;

    fn disk(&mut self) -> Result<Capacity, SampleError>;

    fn sample(&mut self) -> MetricSample {
        MetricSample {
            timestamp: Utc::now(),
            cpu_percent: degrade(self.cpu_percent()),
            memory: degrade(self.memory()),
            disk: degrade(self.disk()),
        }
    }
}

/// Destination for samples and the alerts raised on them.
pub trait SampleSink: Send {
    fn record(&mut self, sample: &MetricSample, alerts: &[Alert]);
}

/// Writes samples at info level and alerts at warn/error level.
#[derive(Debug, Default)]
pub struct LogSink {
    agent_id: String,
}

impl LogSink {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

impl SampleSink for LogSink {
    fn record(&mut self, sample: &MetricSample, alerts: &[Alert]) {
        info!(
            agent_id = %self.agent_id,
            cpu_percent = ?sample.cpu_percent.value(),
            memory_percent = ?sample.memory.value().map(|c| c.percent()),
            memory_used_bytes = ?sample.memory_used_bytes(),
            disk_percent = ?sample.disk.value().map(|c| c.percent()),
            disk_used_bytes = ?sample.disk_used_bytes(),
            health_score = health::health_score(alerts),
            "Host sample"
        );

        for alert in alerts {
            match alert.severity {
                Severity::Critical => error!(agent_id = %self.agent_id, "{alert}"),
                Severity::Warning => warn!(agent_id = %self.agent_id, "{alert}"),
            }
        }
    }
}

/// Forwards samples to a channel; a closed receiver silently drops them.
impl SampleSink for mpsc::UnboundedSender<MetricSample> {
    fn record(&mut self, sample: &MetricSample, _alerts: &[Alert]) {
        let _ = self.send(sample.clone());
    }
}

/// Periodic sampling task.
pub struct MonitorLoop<S, K> {
    sampler: S,
    sink: K,
    interval: Duration,
    thresholds: Thresholds,
    shutdown: ShutdownListener,
}

impl<S: Sampler, K: SampleSink> MonitorLoop<S, K> {
    pub fn new(
        sampler: S,
        sink: K,
        interval: Duration,
        thresholds: Thresholds,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            sampler,
            sink,
            interval,
            thresholds,
            shutdown,
        }
    }

    /// Takes one sample and passes it to the sink.
    pub fn tick(&mut self) -> MetricSample {
        let sample = self.sampler.sample();
        let alerts = health::evaluate(&sample, &self.thresholds);
        self.sink.record(&sample, &alerts);
        sample
    }

    /// Samples until shutdown and returns the number of samples taken.
    ///
    /// The first sample is taken immediately. A tick that falls behind
    /// (a slow sampler, a busy runtime) is delayed rather than bursted.
    pub async fn run(mut self) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();
        let mut taken = 0u64;

        debug!(interval_ms = self.interval.as_millis() as u64, "Monitor loop started");
        loop {
            tokio::select! {
                biased;
                () = shutdown.triggered() => break,
                _ = ticker.tick() => {
                    self.tick();
                    taken += 1;
                }
            }
        }

        info!(samples = taken, "Monitor loop stopped");
        taken
    }
}
