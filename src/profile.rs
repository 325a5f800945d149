//! Host hardware detection.
//!
//! Produces an immutable [`SystemProfile`] snapshot used by the model
//! selector. RAM and CPU topology come from `sysinfo`; GPU presence and
//! per-device VRAM come from `nvidia-smi`, which is treated as optional —
//! a missing or broken tool simply means "no GPU".

use crate::errors::ProbeError;
use serde::{Deserialize, Serialize};
use std::process::Command;
use sysinfo::System;
use tracing::{debug, info};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Immutable snapshot of the host's capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProfile {
    pub gpu_available: bool,
    pub gpu_count: usize,
    /// Total VRAM per device, in device order.
    pub gpu_memory_gb: Vec<u64>,
    pub cpu_cores: usize,
    pub total_ram_gb: u64,
}

impl SystemProfile {
    /// The profile assumed when probing fails: a small CPU-only box.
    pub fn conservative() -> Self {
        Self {
            gpu_available: false,
            gpu_count: 0,
            gpu_memory_gb: Vec::new(),
            cpu_cores: 2,
            total_ram_gb: 8,
        }
    }

    /// Largest single-device VRAM, or 0 without a GPU.
    pub fn max_gpu_memory_gb(&self) -> u64 {
        self.gpu_memory_gb.iter().copied().max().unwrap_or(0)
    }
}

/// Probes the host. Pure query: no side effects beyond running `nvidia-smi`.
#[derive(Debug, Default)]
pub struct HardwareProfiler;

impl HardwareProfiler {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self) -> Result<SystemProfile, ProbeError> {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let total_ram_gb = sys.total_memory() / BYTES_PER_GB;
        if total_ram_gb == 0 {
            return Err(ProbeError::Memory(
                "total memory reported as zero".to_string(),
            ));
        }

        let cpu_cores = sys.cpus().len();
        if cpu_cores == 0 {
            return Err(ProbeError::Cpu("no cpus reported".to_string()));
        }

        let gpu_memory_gb = detect_gpu_memory();
        let profile = SystemProfile {
            gpu_available: !gpu_memory_gb.is_empty(),
            gpu_count: gpu_memory_gb.len(),
            gpu_memory_gb,
            cpu_cores,
            total_ram_gb,
        };

        info!(
            gpus = profile.gpu_count,
            max_vram_gb = profile.max_gpu_memory_gb(),
            cpu_cores = profile.cpu_cores,
            ram_gb = profile.total_ram_gb,
            "Detected system profile"
        );

        Ok(profile)
    }
}

/// Query per-device VRAM via nvidia-smi. Missing tool or bad output means
/// no usable GPU, never an error.
fn detect_gpu_memory() -> Vec<u64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output();

    match output {
        Ok(out) if out.status.success() => {
            parse_gpu_memory_output(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            debug!(status = %out.status, "nvidia-smi exited non-zero, assuming no GPU");
            Vec::new()
        }
        Err(e) => {
            debug!(error = %e, "nvidia-smi not available, assuming no GPU");
            Vec::new()
        }
    }
}

/// Parse `memory.total` csv output (one MiB value per device line).
fn parse_gpu_memory_output(stdout: &str) -> Vec<u64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .map(|mib| mib / 1024)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservative_profile_is_cpu_only() {
        let profile = SystemProfile::conservative();
        assert!(!profile.gpu_available);
        assert_eq!(profile.gpu_count, 0);
        assert_eq!(profile.max_gpu_memory_gb(), 0);
    }

    #[test]
    fn parses_nvidia_smi_memory_lines() {
        let parsed = parse_gpu_memory_output("24576\n16384\n");
        assert_eq!(parsed, vec![24, 16]);
    }

    #[test]
    fn ignores_garbage_lines_in_nvidia_smi_output() {
        let parsed = parse_gpu_memory_output("24576\nNVIDIA-SMI has failed\n");
        assert_eq!(parsed, vec![24]);
    }

    #[test]
    fn max_gpu_memory_picks_largest_device() {
        let profile = SystemProfile {
            gpu_available: true,
            gpu_count: 2,
            gpu_memory_gb: vec![16, 24],
            cpu_cores: 16,
            total_ram_gb: 64,
        };
        assert_eq!(profile.max_gpu_memory_gb(), 24);
    }
}
