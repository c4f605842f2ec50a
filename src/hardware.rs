//! Accelerator and memory detection.
//!
//! Hardware does not change while the daemon runs, so [`detect`] probes once
//! and caches the result for the process lifetime.

use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Overrides GPU detection: `0` means "no GPU", any other value is taken as
/// the accelerator memory in MiB.
pub const GPU_MEMORY_ENV: &str = "FIDX_GPU_MEMORY_MB";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static PROFILE: OnceCell<HardwareProfile> = OnceCell::const_new();

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareProfile {
    pub gpu: Option<GpuInfo>,
    pub cpu_cores: usize,
    /// Total system memory in MiB, when it could be determined.
    pub system_memory_mb: Option<u64>,
}

impl HardwareProfile {
    pub fn cpu_only() -> Self {
        Self {
            gpu: None,
            cpu_cores: cpu_cores(),
            system_memory_mb: system_memory_mb(),
        }
    }

    pub fn gpu_memory_mb(&self) -> u64 {
        self.gpu.as_ref().map(|g| g.memory_mb).unwrap_or(0)
    }
}

/// Detect hardware once per process.
pub async fn detect() -> &'static HardwareProfile {
    PROFILE.get_or_init(probe).await
}

async fn probe() -> HardwareProfile {
    let mut profile = HardwareProfile::cpu_only();

    if let Ok(value) = std::env::var(GPU_MEMORY_ENV) {
        match value.trim().parse::<u64>() {
            Ok(0) => {}
            Ok(mb) => {
                profile.gpu = Some(GpuInfo {
                    name: "override".to_string(),
                    memory_mb: mb,
                })
            }
            Err(_) => tracing::warn!(value = %value, "ignoring invalid {}", GPU_MEMORY_ENV),
        }
    } else {
        profile.gpu = probe_nvidia().await;
    }

    tracing::info!(
        gpu = ?profile.gpu,
        cpu_cores = profile.cpu_cores,
        system_memory_mb = ?profile.system_memory_mb,
        "hardware detected"
    );
    profile
}

async fn probe_nvidia() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => out,
        _ => return None,
    };
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Pick the GPU with the most memory from `nvidia-smi` CSV output.
pub fn parse_nvidia_smi(output: &str) -> Option<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (name, mem) = line.rsplit_once(',')?;
            let memory_mb = mem.trim().parse::<u64>().ok()?;
            Some(GpuInfo {
                name: name.trim().to_string(),
                memory_mb,
            })
        })
        .max_by_key(|g| g.memory_mb)
}

fn cpu_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn system_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&meminfo)
}

fn parse_meminfo(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_largest_gpu() {
        let out = "NVIDIA GeForce RTX 3060, 12288\nNVIDIA A100-SXM4-80GB, 81920\n";
        let gpu = parse_nvidia_smi(out).unwrap();
        assert_eq!(gpu.memory_mb, 81920);
        assert_eq!(gpu.name, "NVIDIA A100-SXM4-80GB");
    }

    #[test]
    fn garbage_means_no_gpu() {
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("No devices were found").is_none());
    }

    #[test]
    fn parses_meminfo() {
        let info = "MemTotal:       16314888 kB\nMemFree:         1000 kB\n";
        assert_eq!(parse_meminfo(info), Some(15932));
    }
}
