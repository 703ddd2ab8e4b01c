//! Acquisition Module
//!
//! Budgeted parallel acquisition of stock clips: task contract, budget,
//! scheduler, statistics, and balanced candidate selection.

pub mod budget;
pub mod scheduler;
pub mod selection;
pub mod stats;
pub mod task;

// Re-export main types
pub use budget::AcquisitionBudget;
pub use scheduler::{
    AcquisitionReport, AcquisitionRequest, AcquisitionScheduler, SchedulerConfig, StopReason,
    SurplusPolicy,
};
pub use selection::{select_balanced, select_balanced_with, CandidateGroup};
pub use stats::BatchStatistics;
pub use task::{
    AcquisitionCandidate, Disposition, TaskExecutor, TaskRecord, TaskResult, TaskState,
};
