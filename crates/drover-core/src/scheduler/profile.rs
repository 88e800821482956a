//! The fixed runner profile catalog and per-profile capacity.

use std::fmt;

use serde::Serialize;

use drover_db::models::ProfileKind;

use super::resources::SystemResources;

/// A named resource envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunnerProfile {
    pub kind: ProfileKind,
    pub gpu_memory_mb: u64,
    pub cpu_cores: u32,
    pub ram_mb: u64,
}

impl RunnerProfile {
    pub fn needs_gpu(&self) -> bool {
        self.gpu_memory_mb > 0
    }
}

/// Catalog in capability order.
pub const CATALOG: [RunnerProfile; 5] = [
    RunnerProfile {
        kind: ProfileKind::Light,
        gpu_memory_mb: 0,
        cpu_cores: 1,
        ram_mb: 512,
    },
    RunnerProfile {
        kind: ProfileKind::Standard,
        gpu_memory_mb: 0,
        cpu_cores: 2,
        ram_mb: 2048,
    },
    RunnerProfile {
        kind: ProfileKind::GpuLight,
        gpu_memory_mb: 2048,
        cpu_cores: 2,
        ram_mb: 4096,
    },
    RunnerProfile {
        kind: ProfileKind::GpuHeavy,
        gpu_memory_mb: 8192,
        cpu_cores: 4,
        ram_mb: 16384,
    },
    RunnerProfile {
        kind: ProfileKind::GpuMax,
        gpu_memory_mb: 24576,
        cpu_cores: 8,
        ram_mb: 32768,
    },
];

pub fn profile(kind: ProfileKind) -> &'static RunnerProfile {
    match kind {
        ProfileKind::Light => &CATALOG[0],
        ProfileKind::Standard => &CATALOG[1],
        ProfileKind::GpuLight => &CATALOG[2],
        ProfileKind::GpuHeavy => &CATALOG[3],
        ProfileKind::GpuMax => &CATALOG[4],
    }
}

/// The resource dimension that bounds a profile's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitingFactor {
    Gpu,
    Cpu,
    Ram,
}

impl fmt::Display for LimitingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Ram => "ram",
        })
    }
}

/// How many instances of a profile the machine can hold.
///
/// `gpu` is `None` for profiles without a GPU requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub max_instances: u64,
    pub limiting_factor: LimitingFactor,
    pub gpu: Option<u64>,
    pub cpu: u64,
    pub ram: u64,
}

/// Capacity of `profile` against `resources`.
///
/// GPU capacity sums `floor(free / required)` per GPU. Ties between
/// dimensions resolve gpu, then cpu, then ram.
pub fn capacity(profile: &RunnerProfile, resources: &SystemResources) -> Capacity {
    let gpu = profile.needs_gpu().then(|| {
        resources
            .gpus
            .iter()
            .map(|g| g.free_mb / profile.gpu_memory_mb)
            .sum::<u64>()
    });
    let cpu = u64::from(resources.cpu_cores / profile.cpu_cores.max(1));
    let ram = resources.free_ram_mb / profile.ram_mb.max(1);

    let mut max_instances = cpu;
    let mut limiting_factor = LimitingFactor::Cpu;
    if let Some(gpu) = gpu {
        if gpu <= max_instances {
            max_instances = gpu;
            limiting_factor = LimitingFactor::Gpu;
        }
    }
    if ram < max_instances {
        max_instances = ram;
        limiting_factor = LimitingFactor::Ram;
    }

    Capacity {
        max_instances,
        limiting_factor,
        gpu,
        cpu,
        ram,
    }
}
