//! Batch Statistics
//!
//! Derived reporting data for one scheduling run. Never used for control.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::task::{Disposition, TaskRecord, TaskState};

/// Counts and timings of one scheduling run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatistics {
    /// Distinct tasks after deduplication
    pub total: usize,
    /// Counted toward the budget
    pub succeeded: usize,
    pub failed: usize,
    /// Succeeded but not counted (surplus or duplicate result)
    pub skipped: usize,
    /// Never started
    pub cancelled: usize,
    /// Input entries collapsed by key deduplication
    pub duplicates: usize,
    pub wall_time_ms: u64,
    /// Mean execution time of counted tasks
    pub mean_task_ms: Option<f64>,
    /// Sequential estimate (succeeded x mean) over wall time
    pub speedup: Option<f64>,
    pub accumulated: f64,
    pub target: f64,
}

impl BatchStatistics {
    /// Empty run statistics
    pub fn empty(target: f64) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Derives statistics from final task records
    pub fn from_records(
        records: &[TaskRecord],
        duplicates: usize,
        wall_time_ms: u64,
        accumulated: f64,
        target: f64,
    ) -> Self {
        let mut stats = Self {
            total: records.len(),
            duplicates,
            wall_time_ms,
            accumulated,
            target,
            ..Self::default()
        };

        let mut counted_ms = Vec::new();
        for record in records {
            match (record.state, record.disposition) {
                (TaskState::Succeeded, Some(Disposition::Counted)) => {
                    stats.succeeded += 1;
                    counted_ms.extend(record.duration_ms);
                }
                (TaskState::Succeeded, _) => stats.skipped += 1,
                (TaskState::Failed, _) => stats.failed += 1,
                (TaskState::Cancelled, _) => stats.cancelled += 1,
                // Unreachable once a run has finished
                (TaskState::Pending | TaskState::Running, _) => stats.cancelled += 1,
            }
        }

        if !counted_ms.is_empty() {
            let mean = counted_ms.iter().sum::<u64>() as f64 / counted_ms.len() as f64;
            stats.mean_task_ms = Some(mean);
            if wall_time_ms > 0 {
                stats.speedup = Some(stats.succeeded as f64 * mean / wall_time_ms as f64);
            }
        }

        stats
    }

    /// Logs the end-of-run summary
    pub fn log_summary(&self) {
        info!("==================== ACQUISITION SUMMARY ====================");
        info!("Succeeded:  {}", self.succeeded);
        info!("Failed:     {}", self.failed);
        info!("Skipped:    {} (budget already satisfied)", self.skipped);
        info!("Cancelled:  {}", self.cancelled);
        if self.duplicates > 0 {
            info!("Duplicates: {} (collapsed before scheduling)", self.duplicates);
        }
        info!("Wall time:  {:.1}s", self.wall_time_ms as f64 / 1000.0);
        info!("Total:      {:.1} (target: {:.1})", self.accumulated, self.target);
        if let Some(mean) = self.mean_task_ms {
            info!("Avg task:   {:.1}s", mean / 1000.0);
        }
        if let Some(speedup) = self.speedup {
            info!("Speedup:    {:.1}x over sequential", speedup);
        }
        info!("=============================================================");
    }
}
