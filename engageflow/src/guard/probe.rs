//! Host load sampling.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::GuardError;

/// Point-in-time host load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    /// One-minute load average divided by the number of cores.
    pub cpu_load: f64,
    /// Fraction of memory in use, `0.0..=1.0`.
    pub memory_used_ratio: f64,
    /// Tasks holding a slot for the queried task name, if capped.
    #[serde(default)]
    pub in_flight: Option<i64>,
}

impl LoadSnapshot {
    /// Creates a snapshot without slot information.
    #[must_use]
    pub fn new(cpu_load: f64, memory_used_ratio: f64) -> Self {
        Self {
            cpu_load,
            memory_used_ratio,
            in_flight: None,
        }
    }
}

/// Source of load snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LoadProbe: Send + Sync {
    /// Samples current load.
    async fn snapshot(&self) -> Result<LoadSnapshot, GuardError>;
}

/// Probe returning a fixed, replaceable snapshot.
#[derive(Debug, Default)]
pub struct StaticLoadProbe {
    snapshot: Mutex<LoadSnapshot>,
}

impl StaticLoadProbe {
    /// Creates a probe reporting `snapshot`.
    #[must_use]
    pub fn new(snapshot: LoadSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    /// A probe reporting an idle host.
    #[must_use]
    pub fn idle() -> Self {
        Self::default()
    }

    /// Replaces the reported snapshot.
    pub fn set(&self, snapshot: LoadSnapshot) {
        *self.snapshot.lock() = snapshot;
    }
}

#[async_trait]
impl LoadProbe for StaticLoadProbe {
    async fn snapshot(&self) -> Result<LoadSnapshot, GuardError> {
        Ok(*self.snapshot.lock())
    }
}

/// Probe reading `/proc/loadavg` and `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcLoadProbe {
    root: PathBuf,
    cores: usize,
}

impl Default for ProcLoadProbe {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcLoadProbe {
    /// Creates a probe over a procfs mount.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            root: root.into(),
            cores,
        }
    }

    /// Overrides the detected core count.
    #[must_use]
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores.max(1);
        self
    }

    async fn read(&self, name: &str) -> Result<String, GuardError> {
        let path = self.root.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| GuardError(format!("failed to read {}: {e}", path.display())))
    }
}

#[async_trait]
impl LoadProbe for ProcLoadProbe {
    async fn snapshot(&self) -> Result<LoadSnapshot, GuardError> {
        let loadavg = parse_loadavg(&self.read("loadavg").await?)?;
        let memory = parse_meminfo(&self.read("meminfo").await?)?;
        #[allow(clippy::cast_precision_loss)]
        let cpu_load = loadavg / self.cores as f64;
        Ok(LoadSnapshot::new(cpu_load, memory))
    }
}

fn parse_loadavg(content: &str) -> Result<f64, GuardError> {
    content
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| GuardError("malformed loadavg".into()))
}

fn parse_meminfo(content: &str) -> Result<f64, GuardError> {
    let field = |name: &str| {
        content
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse::<f64>().ok())
    };

    let total = field("MemTotal:").ok_or_else(|| GuardError("meminfo missing MemTotal".into()))?;
    let available =
        field("MemAvailable:").ok_or_else(|| GuardError("meminfo missing MemAvailable".into()))?;
    if total <= 0.0 {
        return Err(GuardError("meminfo reports zero memory".into()));
    }
    Ok(((total - available) / total).clamp(0.0, 1.0))
}
