//! Driver configuration

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Default per-task buffer cap
pub const MAX_BUFFERS_PER_TASK: u32 = 6144;

/// NPU configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NpuConfig {
    /// Back buffers with individually tracked pages behind an IOMMU
    pub iommu: bool,
    /// DMA memory pool size
    pub memory_pool_mb: u32,
    /// Maximum memory handles one task may reference
    pub max_buffers_per_task: u32,
    /// Log level for the daemon
    pub log_level: String,
}

impl Default for NpuConfig {
    fn default() -> Self {
        Self {
            iommu: false,
            memory_pool_mb: 256,
            max_buffers_per_task: MAX_BUFFERS_PER_TASK,
            log_level: "info".into(),
        }
    }
}

impl NpuConfig {
    /// Parse a TOML configuration document
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid npu configuration")
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// DMA pool size in bytes
    pub fn memory_pool_bytes(&self) -> u64 {
        u64::from(self.memory_pool_mb) * 1024 * 1024
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
