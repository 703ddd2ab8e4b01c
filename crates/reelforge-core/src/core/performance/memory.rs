//! Process Memory Reporting
//!
//! Reports resident/virtual memory of the current process for cache status.

use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Memory usage snapshot of the current process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessMemory {
    /// Resident set size in megabytes
    pub resident_mb: f64,
    /// Virtual memory size in megabytes
    pub virtual_mb: f64,
    /// Resident memory as a percentage of total system memory
    pub percent_of_system: f64,
}

impl ProcessMemory {
    /// Samples the current process. Returns `None` when the platform does not
    /// expose process memory.
    ///
    /// Refreshes only this process and system RAM. Still a blocking syscall
    /// sequence; async callers go through [`ProcessMemory::sample`].
    pub fn current() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        sys.refresh_memory();
        let process = sys.process(pid)?;

        Some(Self::from_bytes(
            process.memory(),
            process.virtual_memory(),
            sys.total_memory(),
        ))
    }

    /// [`ProcessMemory::current`] on the blocking pool
    pub async fn sample() -> Option<Self> {
        tokio::task::spawn_blocking(Self::current)
            .await
            .ok()
            .flatten()
    }

    fn from_bytes(resident: u64, virtual_bytes: u64, system_total: u64) -> Self {
        let percent_of_system = if system_total == 0 {
            0.0
        } else {
            resident as f64 / system_total as f64 * 100.0
        };

        Self {
            resident_mb: resident as f64 / BYTES_PER_MB,
            virtual_mb: virtual_bytes as f64 / BYTES_PER_MB,
            percent_of_system,
        }
    }
}
