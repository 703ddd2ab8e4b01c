//! Parallel Acquisition Scheduler
//!
//! Runs acquisition tasks on a bounded worker group until a cumulative
//! budget is met. Workers report through a single completion channel; one
//! dispatcher owns the budget and the result list, so bookkeeping never
//! overlaps task execution.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::budget::AcquisitionBudget;
use super::stats::BatchStatistics;
use super::task::{
    AcquisitionCandidate, Disposition, TaskExecutor, TaskRecord, TaskResult, TaskState,
};
use crate::core::performance::{BoundedPool, PoolSlot};
use crate::core::{RunId, TaskError, TaskKey};

// =============================================================================
// Configuration
// =============================================================================

/// What happens to results that succeed after the budget is satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurplusPolicy {
    /// Leave side effects in place; report the keys only
    #[default]
    Keep,
    /// Call the executor's `discard` hook for each surplus result
    Cleanup,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Hard upper bound on concurrently running tasks
    pub max_workers: usize,
    /// Time limit of a single task execution
    pub per_task_timeout: Duration,
    pub surplus_policy: SurplusPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            per_task_timeout: Duration::from_secs(120),
            surplus_policy: SurplusPolicy::Keep,
        }
    }
}

/// Parameters of one run
#[derive(Debug, Clone, Default)]
pub struct AcquisitionRequest {
    /// Cumulative weight to reach
    pub target: f64,
    /// Cap on each task's contribution
    pub ceiling: f64,
    /// Caller-side cancellation; stops tasks that have not started
    pub cancel: Option<CancellationToken>,
    /// Overall time limit, handled like a caller cancellation
    pub deadline: Option<Duration>,
}

impl AcquisitionRequest {
    pub fn new(target: f64, ceiling: f64) -> Self {
        Self {
            target,
            ceiling,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

// =============================================================================
// Report
// =============================================================================

/// Why a run stopped starting new tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every task ran
    Exhausted,
    /// Budget reached
    Satisfied,
    /// Caller cancelled
    Cancelled,
    /// Run deadline passed
    DeadlineExceeded,
}

/// Outcome of one scheduling run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionReport<P> {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    /// Counted results in completion order
    pub results: Vec<TaskResult<P>>,
    /// One record per distinct task, in input order
    pub records: Vec<TaskRecord>,
    /// Keys of results that succeeded but were not needed
    pub surplus: Vec<TaskKey>,
    pub stats: BatchStatistics,
    pub satisfied: bool,
    pub stop_reason: StopReason,
    /// Highest number of tasks observed running at once
    pub peak_concurrent: usize,
}

struct Completion<P> {
    index: usize,
    outcome: Result<TaskResult<P>, TaskError>,
    duration_ms: u64,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Budgeted bounded-parallel task runner
#[derive(Debug, Clone, Default)]
pub struct AcquisitionScheduler {
    config: SchedulerConfig,
}

impl AcquisitionScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs candidates until the budget is met or every task has finished.
    ///
    /// Task failures, timeouts, and panics are recorded per task and never
    /// fail the run. Returns once no task is running.
    pub async fn run<E: TaskExecutor>(
        &self,
        executor: Arc<E>,
        candidates: Vec<E::Candidate>,
        request: AcquisitionRequest,
    ) -> AcquisitionReport<E::Payload> {
        let run_id = Ulid::new().to_string();
        let started_at = Utc::now();
        let started = Instant::now();

        // Deduplicate by key, keeping the first occurrence
        let input_len = candidates.len();
        let mut seen = HashSet::with_capacity(input_len);
        let mut records = Vec::with_capacity(input_len);
        let mut queue = VecDeque::with_capacity(input_len);
        for candidate in candidates {
            let key = candidate.key().to_string();
            if seen.insert(key.clone()) {
                queue.push_back((records.len(), candidate));
                records.push(TaskRecord::pending(key));
            }
        }
        let duplicates = input_len - records.len();

        let mut budget = AcquisitionBudget::new(request.target, request.ceiling);
        let mut report = AcquisitionReport {
            run_id,
            started_at,
            results: Vec::new(),
            records: Vec::new(),
            surplus: Vec::new(),
            stats: BatchStatistics::empty(request.target),
            satisfied: budget.is_satisfied(),
            stop_reason: StopReason::Exhausted,
            peak_concurrent: 0,
        };

        if records.is_empty() {
            debug!(run_id = %report.run_id, "No candidates, nothing to run");
            report.stats.duplicates = duplicates;
            return report;
        }

        if budget.is_satisfied() {
            info!(
                run_id = %report.run_id,
                goal = request.target,
                "Target already satisfied, cancelling {} task(s)",
                records.len()
            );
            cancel_pending(&mut queue, &mut records);
            report.stop_reason = StopReason::Satisfied;
            report.stats = BatchStatistics::from_records(
                &records,
                duplicates,
                started.elapsed().as_millis() as u64,
                0.0,
                request.target,
            );
            report.records = records;
            return report;
        }

        let workers = self.config.max_workers.max(1).min(records.len());
        let pool = BoundedPool::new(workers);
        let run_token = match &request.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion<E::Payload>>();

        info!(
            run_id = %report.run_id,
            goal = request.target,
            ceiling = request.ceiling,
            "Starting acquisition of {} candidate(s) with {} worker(s)",
            records.len(),
            workers
        );

        let deadline_at = request
            .deadline
            .map(|limit| tokio::time::Instant::now() + limit);
        let deadline = async move {
            match deadline_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut counted_keys = HashSet::new();
        let mut surplus_results = Vec::new();
        let mut in_flight = 0usize;
        let mut stopped = false;

        loop {
            if !stopped {
                while !queue.is_empty() {
                    // Stop requests win over free slots, even when a
                    // completion was processed first.
                    if let Some(reason) = stop_requested(&run_token, deadline_at) {
                        stopped = true;
                        report.stop_reason = reason;
                        halt(reason, in_flight, &run_token, &mut queue, &mut records);
                        break;
                    }
                    let Some(slot) = pool.try_reserve() else {
                        break;
                    };
                    let Some((index, candidate)) = queue.pop_front() else {
                        break;
                    };
                    records[index].transition(TaskState::Running);
                    self.spawn_task(
                        executor.clone(),
                        index,
                        candidate,
                        slot,
                        run_token.clone(),
                        tx.clone(),
                    );
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(done) = rx.recv() => {
                    in_flight -= 1;
                    let record = &mut records[done.index];
                    record.duration_ms = Some(done.duration_ms);

                    match done.outcome {
                        Err(err) => {
                            warn!(key = %record.key, "Acquisition task failed: {}", err);
                            record.transition(TaskState::Failed);
                            record.error = Some(err.to_string());
                        }
                        Ok(result) => {
                            record.transition(TaskState::Succeeded);
                            if budget.is_satisfied() {
                                debug!(key = %result.key, "Budget already satisfied, skipping result");
                                record.disposition = Some(Disposition::Surplus);
                                report.surplus.push(result.key.clone());
                                surplus_results.push(result);
                            } else if !counted_keys.insert(result.key.clone()) {
                                debug!(key = %result.key, "Result key already counted");
                                record.disposition = Some(Disposition::DuplicateResult);
                                report.surplus.push(result.key.clone());
                                surplus_results.push(result);
                            } else {
                                record.disposition = Some(Disposition::Counted);
                                let reached = budget.add(result.weight);
                                debug!(
                                    key = %result.key,
                                    accumulated = budget.accumulated,
                                    goal = budget.target,
                                    "Counted result"
                                );
                                report.results.push(result);

                                if reached {
                                    info!(
                                        accumulated = budget.accumulated,
                                        goal = budget.target,
                                        "Target reached, cancelling {} pending task(s)",
                                        queue.len()
                                    );
                                    stopped = true;
                                    report.stop_reason = StopReason::Satisfied;
                                    run_token.cancel();
                                    cancel_pending(&mut queue, &mut records);
                                }
                            }
                        }
                    }
                }
                _ = run_token.cancelled(), if !stopped => {
                    stopped = true;
                    report.stop_reason = StopReason::Cancelled;
                    halt(StopReason::Cancelled, in_flight, &run_token, &mut queue, &mut records);
                }
                _ = &mut deadline, if !stopped => {
                    stopped = true;
                    report.stop_reason = StopReason::DeadlineExceeded;
                    halt(StopReason::DeadlineExceeded, in_flight, &run_token, &mut queue, &mut records);
                }
                else => break,
            }
        }

        // Anything never dispatched is cancelled
        cancel_pending(&mut queue, &mut records);

        if self.config.surplus_policy == SurplusPolicy::Cleanup {
            for result in &surplus_results {
                if let Err(e) = executor.discard(result).await {
                    warn!(key = %result.key, "Failed to discard surplus result: {}", e);
                }
            }
        }

        report.satisfied = budget.is_satisfied();
        report.peak_concurrent = pool.stats().peak_concurrent;
        report.stats = BatchStatistics::from_records(
            &records,
            duplicates,
            started.elapsed().as_millis() as u64,
            budget.accumulated,
            budget.target,
        );
        report.records = records;
        report.stats.log_summary();
        report
    }

    /// Spawns one task. The slot is released before the completion is sent,
    /// so the dispatcher always finds it free again.
    fn spawn_task<E: TaskExecutor>(
        &self,
        executor: Arc<E>,
        index: usize,
        candidate: E::Candidate,
        slot: PoolSlot,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<Completion<E::Payload>>,
    ) {
        let limit = self.config.per_task_timeout;
        let key = candidate.key().to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut handle =
                tokio::spawn(async move { executor.execute(candidate, cancel).await });

            let outcome = match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(TaskError::Panicked(join_err.to_string())),
                Err(_) => {
                    handle.abort();
                    Err(TaskError::TimedOut {
                        key,
                        after_ms: limit.as_millis() as u64,
                    })
                }
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            drop(slot);
            let _ = tx.send(Completion {
                index,
                outcome,
                duration_ms,
            });
        });
    }
}

/// Caller cancellation or a passed deadline, checked before every dispatch
fn stop_requested(
    token: &CancellationToken,
    deadline: Option<tokio::time::Instant>,
) -> Option<StopReason> {
    if token.is_cancelled() {
        Some(StopReason::Cancelled)
    } else if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
        Some(StopReason::DeadlineExceeded)
    } else {
        None
    }
}

/// Stops a run early: running tasks finish, pending ones never start
fn halt<C>(
    reason: StopReason,
    in_flight: usize,
    run_token: &CancellationToken,
    queue: &mut VecDeque<(usize, C)>,
    records: &mut [TaskRecord],
) {
    match reason {
        StopReason::DeadlineExceeded => warn!(
            "Acquisition deadline passed, cancelling {} pending task(s), waiting for {} running",
            queue.len(),
            in_flight
        ),
        _ => info!(
            "Acquisition cancelled by caller, cancelling {} pending task(s), waiting for {} running",
            queue.len(),
            in_flight
        ),
    }
    run_token.cancel();
    cancel_pending(queue, records);
}

fn cancel_pending<C>(queue: &mut VecDeque<(usize, C)>, records: &mut [TaskRecord]) {
    for (index, _) in queue.drain(..) {
        records[index].transition(TaskState::Cancelled);
    }
}

// =============================================================================
// Tests
// =============================================================================
