use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use rand::seq::SliceRandom as _;

use crate::foundation::error::{PipelineError, PipelineResult};

/// Which devices a render may run on.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "GpuSpec", into = "GpuSpec")]
pub enum GpuDevices {
    /// No GPU; the CPU render engine is used.
    Cpu,
    /// Devices `0..n`.
    Count(u32),
    /// An explicit set of device indices.
    List(Vec<u32>),
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum GpuSpec {
    Count(u32),
    List(Vec<u32>),
}

impl From<GpuSpec> for GpuDevices {
    fn from(spec: GpuSpec) -> Self {
        match spec {
            GpuSpec::Count(0) => Self::Cpu,
            GpuSpec::Count(n) => Self::Count(n),
            GpuSpec::List(list) => Self::List(list),
        }
    }
}

impl From<GpuDevices> for GpuSpec {
    fn from(devices: GpuDevices) -> Self {
        match devices {
            GpuDevices::Cpu => Self::Count(0),
            GpuDevices::Count(n) => Self::Count(n),
            GpuDevices::List(list) => Self::List(list),
        }
    }
}

impl std::str::FromStr for GpuDevices {
    type Err = PipelineError;

    /// Accepts a device count (`4`, `0` for CPU) or a comma-separated index list (`0,2,3`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(',') {
            let list = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    p.parse::<u32>().map_err(|_| {
                        PipelineError::validation(format!("invalid gpu device index '{p}'"))
                    })
                })
                .collect::<PipelineResult<Vec<_>>>()?;
            let devices = Self::List(list);
            devices.validate()?;
            return Ok(devices);
        }
        let n = s.parse::<u32>().map_err(|_| {
            PipelineError::validation(format!(
                "gpu devices must be a count or a comma-separated list, got '{s}'"
            ))
        })?;
        Ok(GpuSpec::Count(n).into())
    }
}

impl GpuDevices {
    pub fn validate(&self) -> PipelineResult<()> {
        match self {
            Self::List(list) if list.is_empty() => Err(PipelineError::validation(
                "explicit gpu device list must not be empty",
            )),
            _ => Ok(()),
        }
    }

    pub fn uses_gpu(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Distinct device indices a render may be placed on.
    pub fn candidates(&self) -> Vec<u32> {
        match self {
            Self::Cpu => Vec::new(),
            Self::Count(n) => (0..*n).collect(),
            Self::List(list) => {
                let mut out = list.clone();
                out.sort_unstable();
                out.dedup();
                out
            }
        }
    }

    /// Count visible NVIDIA devices; hosts without the driver tools get [`GpuDevices::Cpu`].
    pub fn detect() -> Self {
        let out = Command::new("nvidia-smi")
            .arg("-L")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        let n = match out {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|l| l.starts_with("GPU "))
                .count() as u32,
            _ => 0,
        };
        GpuSpec::Count(n).into()
    }
}

/// Render engine backend passed to the external renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderEngine {
    Eevee,
    Cycles,
}

impl RenderEngine {
    /// Rasterizing engine on Linux with a GPU, path tracer on macOS or CPU-only Linux.
    pub fn for_host(devices: &GpuDevices) -> PipelineResult<Self> {
        Self::for_platform(std::env::consts::OS, devices)
    }

    pub fn for_platform(os: &str, devices: &GpuDevices) -> PipelineResult<Self> {
        match os {
            "linux" if devices.uses_gpu() => Ok(Self::Eevee),
            "linux" | "macos" => Ok(Self::Cycles),
            other => Err(PipelineError::validation(format!(
                "platform '{other}' is not supported, use Linux or macOS"
            ))),
        }
    }

    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Eevee => "BLENDER_EEVEE",
            Self::Cycles => "CYCLES",
        }
    }
}

/// Cross-process device allocator backed by one lock file per device index.
///
/// A lease holds an exclusive advisory lock on `gpu-<index>.lock`; other processes using the
/// same lease directory skip that device until the lease is dropped.
#[derive(Clone, Debug)]
pub struct GpuPool {
    devices: GpuDevices,
    lease_dir: PathBuf,
    poll: Duration,
}

/// Exclusive hold on one device. Released on drop.
#[derive(Debug)]
pub struct GpuLease {
    index: u32,
    _file: File,
}

impl GpuLease {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl GpuPool {
    pub fn new(devices: GpuDevices, lease_dir: impl Into<PathBuf>) -> Self {
        Self {
            devices,
            lease_dir: lease_dir.into(),
            poll: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn devices(&self) -> &GpuDevices {
        &self.devices
    }

    /// Lease a free device, trying candidates in random order.
    ///
    /// Returns `Ok(None)` for CPU-only pools. Polls until `wait` elapses when every device is
    /// held, then fails with [`PipelineError::Lease`].
    pub fn acquire(&self, wait: Duration) -> PipelineResult<Option<GpuLease>> {
        let mut candidates = self.devices.candidates();
        if candidates.is_empty() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.lease_dir).with_context(|| {
            format!("create gpu lease directory '{}'", self.lease_dir.display())
        })?;

        let deadline = Instant::now() + wait;
        loop {
            candidates.shuffle(&mut rand::rng());
            for &index in &candidates {
                if let Some(lease) = try_lease(&self.lease_dir, index)? {
                    tracing::debug!(gpu = index, "acquired gpu lease");
                    return Ok(Some(lease));
                }
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::lease(format!(
                    "all {} gpu devices stayed busy for {}s",
                    candidates.len(),
                    wait.as_secs()
                )));
            }
            std::thread::sleep(self.poll);
        }
    }
}

fn try_lease(dir: &Path, index: u32) -> PipelineResult<Option<GpuLease>> {
    let path = dir.join(format!("gpu-{index}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .with_context(|| format!("open gpu lease '{}'", path.display()))?;
    match file.try_lock() {
        Ok(()) => Ok(Some(GpuLease { index, _file: file })),
        Err(TryLockError::WouldBlock) => Ok(None),
        Err(TryLockError::Error(e)) => Err(PipelineError::lease(format!(
            "lock '{}': {e}",
            path.display()
        ))),
    }
}
