//! Host memory detection for sizing the smoothing phase.

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::types::PipelineError;

/// One gibibyte in bytes.
const GIB: u64 = 1024 * 1024 * 1024;

/// Worker counts for the memory-hungry smoothing phase, keyed by total
/// system memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryTiers {
    /// Hosts with less total memory than this are considered small.
    pub small_ram_bytes: u64,
    /// Smoothing workers on small hosts.
    pub small_ram_workers: usize,
    /// Smoothing workers on everything else.
    pub large_ram_workers: usize,
}

impl MemoryTiers {
    /// Default small-host threshold: 16 GiB.
    pub const DEFAULT_SMALL_RAM_BYTES: u64 = 16 * GIB;
    /// Default smoothing workers below the threshold.
    pub const DEFAULT_SMALL_RAM_WORKERS: usize = 1;
    /// Default smoothing workers at or above the threshold.
    pub const DEFAULT_LARGE_RAM_WORKERS: usize = 3;

    /// Smoothing workers for a host with `total_bytes` of memory.
    #[must_use]
    pub const fn workers_for(&self, total_bytes: u64) -> usize {
        if total_bytes < self.small_ram_bytes {
            self.small_ram_workers
        } else {
            self.large_ram_workers
        }
    }

    /// Reject zero worker counts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if either tier has zero
    /// workers.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.small_ram_workers == 0 || self.large_ram_workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "memory tier worker counts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryTiers {
    fn default() -> Self {
        Self {
            small_ram_bytes: Self::DEFAULT_SMALL_RAM_BYTES,
            small_ram_workers: Self::DEFAULT_SMALL_RAM_WORKERS,
            large_ram_workers: Self::DEFAULT_LARGE_RAM_WORKERS,
        }
    }
}

/// Total physical memory of this host, in bytes.
#[must_use]
pub fn total_memory_bytes() -> u64 {
    let system = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()),
    );
    system.total_memory()
}
