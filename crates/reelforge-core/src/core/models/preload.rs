//! Preload Orchestrator
//!
//! Warms the resource cache at startup so the first request does not pay
//! for model construction. Every resource is loaded independently; one
//! failure never keeps the others from loading.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::cache::ResourceCache;
use crate::core::performance::BoundedPool;
use crate::core::ResourceName;

/// Outcome of preloading one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status", content = "error")]
pub enum PreloadOutcome {
    Loaded,
    Failed(String),
}

impl PreloadOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, PreloadOutcome::Loaded)
    }
}

/// Result of a preload pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadReport {
    pub outcomes: BTreeMap<ResourceName, PreloadOutcome>,
    pub successful: usize,
    pub total: usize,
    pub elapsed_ms: u64,
}

impl PreloadReport {
    pub fn all_loaded(&self) -> bool {
        self.successful == self.total
    }

    fn record(&mut self, name: ResourceName, outcome: PreloadOutcome) {
        if outcome.is_loaded() {
            self.successful += 1;
        }
        self.outcomes.insert(name, outcome);
    }
}

/// Loads a set of resources into a cache
#[derive(Debug, Clone)]
pub struct Preloader {
    cache: Arc<ResourceCache>,
}

impl Preloader {
    pub fn new(cache: Arc<ResourceCache>) -> Self {
        Self { cache }
    }

    /// Loads every named resource with its default construction key.
    ///
    /// With `parallel`, all loads run at once on a pool sized to the number
    /// of distinct names; otherwise they run one after another. Either way
    /// the pass continues past failures and reports each outcome.
    pub async fn preload(&self, names: &[String], parallel: bool) -> PreloadReport {
        let mut seen = HashSet::new();
        let names: Vec<ResourceName> = names
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect();

        let started = Instant::now();
        let mut report = PreloadReport {
            total: names.len(),
            ..PreloadReport::default()
        };

        if names.is_empty() {
            return report;
        }

        info!(
            "Preloading {} resource(s) ({}): {}",
            names.len(),
            if parallel { "parallel" } else { "sequential" },
            names.join(", ")
        );

        // Sequential mode is a one-slot pool, so a panicking loader is
        // isolated the same way in both modes.
        let width = if parallel { names.len() } else { 1 };
        let jobs = names
            .into_iter()
            .map(|name| {
                let cache = self.cache.clone();
                let job_name = name.clone();
                (name, async move { cache.get_default(&job_name).await })
            })
            .collect();

        for (name, outcome) in BoundedPool::new(width).run_all(jobs).await {
            let outcome = match outcome {
                Ok(Ok(_)) => PreloadOutcome::Loaded,
                Ok(Err(e)) => PreloadOutcome::Failed(e.to_string()),
                Err(panic) => PreloadOutcome::Failed(format!("Loader panicked: {}", panic)),
            };
            log_outcome(&name, &outcome);
            report.record(name, outcome);
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.cache.mark_preloaded();

        info!(
            successful = report.successful,
            total = report.total,
            elapsed_ms = report.elapsed_ms,
            "Preload finished"
        );
        report
    }

    /// Runs `preload` on a background task. Failures are logged only.
    pub fn spawn(&self, names: Vec<String>, parallel: bool) -> JoinHandle<PreloadReport> {
        let preloader = self.clone();
        tokio::spawn(async move {
            let report = preloader.preload(&names, parallel).await;
            if !report.all_loaded() {
                warn!(
                    "Background preload finished with {} failure(s)",
                    report.total - report.successful
                );
            }
            report
        })
    }
}

fn log_outcome(name: &str, outcome: &PreloadOutcome) {
    match outcome {
        PreloadOutcome::Loaded => info!(resource = name, "Preloaded"),
        PreloadOutcome::Failed(e) => error!(resource = name, "Preload failed: {}", e),
    }
}

// =============================================================================
// Tests
// =============================================================================
