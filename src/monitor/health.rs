//! Threshold alerts and a coarse health score for each sample.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::MetricSample;

/// Warning and critical utilization levels, in percent.
///
/// A reading strictly above a level triggers it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Levels {
    pub warning: f32,
    pub critical: f32,
}

impl Levels {
    pub const fn new(warning: f32, critical: f32) -> Self {
        Self { warning, critical }
    }

    fn classify(&self, percent: f32) -> Option<Severity> {
        if percent > self.critical {
            Some(Severity::Critical)
        } else if percent > self.warning {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    fn is_valid(&self) -> bool {
        (0.0..=100.0).contains(&self.warning)
            && (0.0..=100.0).contains(&self.critical)
            && self.warning <= self.critical
    }
}

/// The `[thresholds]` config table.
///
/// ```toml
/// [thresholds]
/// cpu = { warning = 75, critical = 90 }
/// memory = { warning = 80, critical = 95 }
/// disk = { warning = 85, critical = 95 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_cpu")]
    pub cpu: Levels,
    #[serde(default = "default_memory")]
    pub memory: Levels,
    #[serde(default = "default_disk")]
    pub disk: Levels,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            disk: default_disk(),
        }
    }
}

impl Thresholds {
    /// Name of the first resource whose levels are out of range or inverted.
    pub fn invalid_resource(&self) -> Option<Resource> {
        [(Resource::Cpu, self.cpu), (Resource::Memory, self.memory), (Resource::Disk, self.disk)]
            .into_iter()
            .find(|(_, levels)| !levels.is_valid())
            .map(|(resource, _)| resource)
    }
}

const fn default_cpu() -> Levels {
    Levels::new(75.0, 90.0)
}

const fn default_memory() -> Levels {
    Levels::new(80.0, 95.0)
}

const fn default_disk() -> Levels {
    Levels::new(85.0, 95.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub resource: Resource,
    pub severity: Severity,
    pub percent: f32,
    pub threshold: f32,
}

impl Alert {
    fn penalty(&self) -> u8 {
        match (self.resource, self.severity) {
            (Resource::Cpu, Severity::Critical) => 20,
            (Resource::Cpu, Severity::Warning) => 10,
            (Resource::Memory, Severity::Critical) => 25,
            (Resource::Memory, Severity::Warning) => 15,
            (Resource::Disk, Severity::Critical) => 20,
            (Resource::Disk, Severity::Warning) => 10,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "High",
            Severity::Critical => "Critical",
        };
        write!(
            f,
            "{level} {} usage: {:.1}% (threshold {:.0}%)",
            self.resource, self.percent, self.threshold
        )
    }
}

/// Alerts for every available reading above its thresholds.
///
/// Unavailable readings never alert.
pub fn evaluate(sample: &MetricSample, thresholds: &Thresholds) -> Vec<Alert> {
    let readings = [
        (Resource::Cpu, sample.cpu_percent.value(), thresholds.cpu),
        (Resource::Memory, sample.memory.value().map(|c| c.percent()), thresholds.memory),
        (Resource::Disk, sample.disk.value().map(|c| c.percent()), thresholds.disk),
    ];

    readings
        .into_iter()
        .filter_map(|(resource, percent, levels)| {
            let percent = percent?;
            let severity = levels.classify(percent)?;
            let threshold = match severity {
                Severity::Warning => levels.warning,
                Severity::Critical => levels.critical,
            };
            Some(Alert {
                resource,
                severity,
                percent,
                threshold,
            })
        })
        .collect()
}

/// 100 for a quiet host, reduced by a fixed penalty per alert.
pub fn health_score(alerts: &[Alert]) -> u8 {
    let penalty: u32 = alerts.iter().map(|a| u32::from(a.penalty())).sum();
    100u32.saturating_sub(penalty) as u8
}
