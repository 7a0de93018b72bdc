//! Engine tunables.

use std::time::Duration;

use serde::Deserialize;

/// One mebibyte.
pub const MEGAB: u64 = 1 << 20;

/// Extra allocation factor covering qcow2 metadata when sizing merges and
/// chain copies.
pub const COW_OVERHEAD: f64 = 1.1;

/// Tunables injected into every engine call through the
/// [`Context`](crate::Context).
///
/// All fields have serving defaults so a zero-config embedding works; a
/// host agent deserializes its own section over them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Extension granularity for thin block volumes, MiB.
    pub volume_utilization_chunk_mb: u64,
    /// VG physical extent size, MiB.
    pub vg_extent_size_mb: u64,
    /// Worker threads per storage-domain I/O pool.
    pub io_threads: usize,
    /// Seconds to wait for a resource lock before giving up.
    pub resource_timeout_sec: u64,
    /// Concurrent `lvm` command cap.
    pub lvm_max_commands: usize,
    /// Retries for read-only `lvm` failures.
    pub lvm_read_only_retries: u32,
    /// Delay between read-only `lvm` retries, milliseconds.
    pub lvm_retry_delay_ms: u64,
    /// qcow2 compat level written for new overlays on v4+ domains.
    pub qcow2_compat: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volume_utilization_chunk_mb: 1024,
            vg_extent_size_mb: 128,
            io_threads: 4,
            resource_timeout_sec: 60,
            lvm_max_commands: 10,
            lvm_read_only_retries: 6,
            lvm_retry_delay_ms: 100,
            qcow2_compat: "1.1".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Extension chunk in bytes.
    pub const fn chunk_size(&self) -> u64 {
        self.volume_utilization_chunk_mb * MEGAB
    }

    /// VG extent size in bytes.
    pub const fn extent_size(&self) -> u64 {
        self.vg_extent_size_mb * MEGAB
    }

    /// Smallest allocation for a thin block volume: eight extents.
    pub const fn min_chunk(&self) -> u64 {
        8 * self.vg_extent_size_mb * MEGAB
    }

    /// Resource lock acquisition timeout.
    pub const fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_sec)
    }

    /// LVM command cache settings derived from this config.
    pub fn lvm_config(&self) -> cowl_lvm::LvmCacheConfig {
        cowl_lvm::LvmCacheConfig {
            max_commands: self.lvm_max_commands,
            read_only_retries: self.lvm_read_only_retries,
            retry_delay: Duration::from_millis(self.lvm_retry_delay_ms),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size(), 1 << 30);
        assert_eq!(config.extent_size(), 128 << 20);
        assert_eq!(config.min_chunk(), 1 << 30);
    }

    #[test]
    fn deserializes_partial_overrides() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"volume_utilization_chunk_mb": 2048}"#).unwrap();
        assert_eq!(config.volume_utilization_chunk_mb, 2048);
        assert_eq!(config.vg_extent_size_mb, 128);
    }
}
