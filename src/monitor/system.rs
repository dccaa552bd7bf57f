//! [`Sampler`] backed by `sysinfo`.

use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use super::{Capacity, Sampler};
use crate::core::SampleError;

/// Reads host utilization through a reusable `sysinfo::System`.
///
/// Disk figures are summed over every mounted disk.
pub struct SysinfoSampler {
    sys: System,
    disks: Disks,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        // Prime CPU usage so the first real sample has a baseline to diff against.
        let mut sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_cpu_usage();

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Host name reported by the operating system, if any.
    pub fn host_name() -> Option<String> {
        System::host_name()
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SysinfoSampler {
    fn cpu_percent(&mut self) -> Result<f32, SampleError> {
        self.sys.refresh_cpu_usage();
        if self.sys.cpus().is_empty() {
            return Err(SampleError::new("cpu", "no CPUs reported"));
        }
        let usage = self.sys.global_cpu_usage();
        if usage.is_finite() {
            Ok(usage.clamp(0.0, 100.0))
        } else {
            Err(SampleError::new("cpu", "usage is not a number"))
        }
    }

    fn memory(&mut self) -> Result<Capacity, SampleError> {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return Err(SampleError::new("memory", "total memory reported as zero"));
        }
        Ok(Capacity::new(self.sys.used_memory(), total))
    }

    fn disk(&mut self) -> Result<Capacity, SampleError> {
        self.disks.refresh();
        if self.disks.list().is_empty() {
            self.disks.refresh_list();
        }

        let (used, total) = self.disks.list().iter().fold((0u64, 0u64), |(used, total), disk| {
            let total_space = disk.total_space();
            let available = disk.available_space();
            (
                used.saturating_add(total_space.saturating_sub(available)),
                total.saturating_add(total_space),
            )
        });

        if total == 0 {
            return Err(SampleError::new("disk", "no mounted disks reported"));
        }
        Ok(Capacity::new(used, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Reading;

    #[test]
    fn test_memory_reading_is_consistent() {
        let mut sampler = SysinfoSampler::new();
        // Some sandboxes hide memory statistics; only check values we get.
        if let Ok(memory) = sampler.memory() {
            assert!(memory.total_bytes > 0);
            assert!(memory.used_bytes <= memory.total_bytes);
        }
    }

    #[test]
    fn test_sample_never_panics() {
        let mut sampler = SysinfoSampler::new();
        let sample = sampler.sample();
        if let Reading::Available(cpu) = sample.cpu_percent {
            assert!((0.0..=100.0).contains(&cpu));
        }
    }
}
