//! Acquisition Tasks
//!
//! The contract between the scheduler and whatever actually fetches a
//! candidate. The scheduler only sees keys, weights, and outcomes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{TaskError, TaskKey};

/// A candidate item that can be acquired
pub trait AcquisitionCandidate: Send + 'static {
    /// Deduplication identity (e.g. source URL)
    fn key(&self) -> &str;
}

/// Output of a successful task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult<P> {
    /// Identity the result is counted under
    pub key: TaskKey,
    /// Nominal contribution toward the target (e.g. clip seconds)
    pub weight: f64,
    pub payload: P,
}

impl<P> TaskResult<P> {
    pub fn new(key: impl Into<String>, weight: f64, payload: P) -> Self {
        Self {
            key: key.into(),
            weight,
            payload,
        }
    }
}

/// Runs one candidate to completion
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    type Candidate: AcquisitionCandidate;
    type Payload: Send + Sync + 'static;

    /// Acquires the candidate.
    ///
    /// `cancel` fires once the batch no longer needs results. Executors may
    /// poll it to stop early but are not required to; satisfying the budget
    /// or a caller cancellation never interrupts a started task. The only
    /// interruption is the per-task timeout, which aborts the execution and
    /// records the task as failed.
    async fn execute(
        &self,
        candidate: Self::Candidate,
        cancel: CancellationToken,
    ) -> Result<TaskResult<Self::Payload>, TaskError>;

    /// Releases the side effects of a result the batch did not need
    /// (e.g. deletes a downloaded file). Called only under `SurplusPolicy::Cleanup`.
    async fn discard(&self, result: &TaskResult<Self::Payload>) -> Result<(), TaskError> {
        let _ = result;
        Ok(())
    }
}

/// Task lifecycle. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match self {
            TaskState::Pending => matches!(next, TaskState::Running | TaskState::Cancelled),
            TaskState::Running => matches!(
                next,
                TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
            ),
            _ => false,
        }
    }
}

/// What the scheduler did with a succeeded task's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Added to the budget and returned
    Counted,
    /// Arrived after the budget was satisfied
    Surplus,
    /// Result key was already counted by another task
    DuplicateResult,
}

/// Per-task outcome in a batch report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub key: TaskKey,
    pub state: TaskState,
    pub disposition: Option<Disposition>,
    /// Execution time; absent for tasks that never started
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub(crate) fn pending(key: TaskKey) -> Self {
        Self {
            key,
            state: TaskState::Pending,
            disposition: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Moves to `next`, ignoring illegal transitions
    pub(crate) fn transition(&mut self, next: TaskState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}
