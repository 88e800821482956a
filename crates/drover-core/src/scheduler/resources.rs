//! What the machine has to offer: GPUs, CPU cores and free RAM.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// One GPU's memory, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub id: i64,
    pub total_mb: u64,
    pub free_mb: u64,
}

impl GpuInfo {
    pub fn new(id: i64, total_mb: u64, free_mb: u64) -> Self {
        Self {
            id,
            total_mb,
            free_mb: free_mb.min(total_mb),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemResources {
    pub gpus: Vec<GpuInfo>,
    pub cpu_cores: u32,
    pub free_ram_mb: u64,
}

/// `[resources]` config: any field set replaces the probed value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOverrides {
    pub cpu_cores: Option<u32>,
    pub free_ram_mb: Option<u64>,
    pub gpus: Option<Vec<GpuInfo>>,
}

impl SystemResources {
    pub fn with_overrides(mut self, overrides: &ResourceOverrides) -> Self {
        if let Some(cores) = overrides.cpu_cores {
            self.cpu_cores = cores;
        }
        if let Some(ram) = overrides.free_ram_mb {
            self.free_ram_mb = ram;
        }
        if let Some(gpus) = &overrides.gpus {
            self.gpus = gpus
                .iter()
                .map(|g| GpuInfo::new(g.id, g.total_mb, g.free_mb))
                .collect();
        }
        self
    }

    /// Probe the local machine.
    ///
    /// A missing `nvidia-smi` means no GPUs; an unreadable `/proc/meminfo`
    /// means 0 MB free RAM, which plans no runners until overridden.
    pub async fn probe() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        let free_ram_mb = match tokio::fs::read_to_string("/proc/meminfo").await {
            Ok(text) => parse_meminfo_available_mb(&text).unwrap_or(0),
            Err(e) => {
                warn!(error = %e, "could not read /proc/meminfo; assuming no free RAM");
                0
            }
        };

        let gpus = probe_gpus().await;
        debug!(cpu_cores, free_ram_mb, gpus = gpus.len(), "probed system resources");

        Self {
            gpus,
            cpu_cores,
            free_ram_mb,
        }
    }
}

async fn probe_gpus() -> Vec<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(Duration::from_secs(10), output).await {
        Ok(Ok(out)) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
        Ok(Ok(out)) => {
            warn!(status = %out.status, "nvidia-smi failed; assuming no GPUs");
            Vec::new()
        }
        Ok(Err(e)) => {
            debug!(error = %e, "nvidia-smi not available; assuming no GPUs");
            Vec::new()
        }
        Err(_) => {
            warn!("nvidia-smi timed out; assuming no GPUs");
            Vec::new()
        }
    }
}

/// Parse `index, total, free` CSV rows. Malformed rows are skipped.
pub fn parse_nvidia_smi(csv: &str) -> Vec<GpuInfo> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let id = fields.next()?.parse().ok()?;
            let total = fields.next()?.parse().ok()?;
            let free = fields.next()?.parse().ok()?;
            Some(GpuInfo::new(id, total, free))
        })
        .collect()
}

/// `MemAvailable` from `/proc/meminfo`, in MB.
pub fn parse_meminfo_available_mb(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}
