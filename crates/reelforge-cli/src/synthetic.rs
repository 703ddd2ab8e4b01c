//! Synthetic loaders and downloaders used by the headless harness.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reelforge_core::core::acquisition::{
    AcquisitionCandidate, CandidateGroup, TaskExecutor, TaskResult,
};
use reelforge_core::core::models::{ModelKind, ResourceHandle, ResourceLoader};
use reelforge_core::core::{Device, LoaderError, TaskError};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Harness argument errors
#[derive(Debug, Error)]
pub enum SyntheticError {
    #[error("Failure rate must be within 0..=1, got {0}")]
    InvalidFailureRate(f64),

    #[error("Invalid latency range: {min}ms..{max}ms")]
    InvalidLatency { min: u64, max: u64 },

    #[error("Invalid clip duration range: {min}s..{max}s")]
    InvalidDuration { min: f64, max: f64 },
}

// =============================================================================
// Models
// =============================================================================

/// Placeholder model handle
#[derive(Debug, Clone, Serialize)]
pub struct SimulatedModel {
    pub kind: ModelKind,
    pub key: String,
    pub device: Device,
}

/// Loader that sleeps instead of loading weights
pub struct SimulatedLoader {
    kind: ModelKind,
    load_time: Duration,
    fail_on_cuda: bool,
}

impl SimulatedLoader {
    pub fn new(kind: ModelKind, load_time: Duration, fail_on_cuda: bool) -> Self {
        Self {
            kind,
            load_time,
            fail_on_cuda,
        }
    }
}

#[async_trait]
impl ResourceLoader for SimulatedLoader {
    async fn load(&self, key: &str, device: Device) -> Result<ResourceHandle, LoaderError> {
        debug!(model = %self.kind, key, %device, "Simulating model load");
        tokio::time::sleep(self.load_time).await;

        if self.fail_on_cuda && device.is_accelerator() {
            return Err(LoaderError::new("simulated CUDA out of memory"));
        }

        Ok(ResourceHandle::new(SimulatedModel {
            kind: self.kind,
            key: key.to_string(),
            device,
        }))
    }
}

// =============================================================================
// Clips
// =============================================================================

/// Synthetic stock clip
#[derive(Debug, Clone)]
pub struct SyntheticClip {
    pub url: String,
    pub duration: f64,
    pub latency: Duration,
    pub fail: bool,
}

impl AcquisitionCandidate for SyntheticClip {
    fn key(&self) -> &str {
        &self.url
    }
}

/// Shape of a synthetic search result set
#[derive(Debug, Clone)]
pub struct ClipProfile {
    pub terms: usize,
    pub per_term: usize,
    /// Fraction of shared URLs between neighbouring terms
    pub overlap: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub failure_rate: f64,
}

impl ClipProfile {
    pub fn validate(&self) -> Result<(), SyntheticError> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(SyntheticError::InvalidFailureRate(self.failure_rate));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(SyntheticError::InvalidLatency {
                min: self.min_latency_ms,
                max: self.max_latency_ms,
            });
        }
        if !(self.min_duration > 0.0 && self.min_duration <= self.max_duration) {
            return Err(SyntheticError::InvalidDuration {
                min: self.min_duration,
                max: self.max_duration,
            });
        }
        Ok(())
    }

    /// Generates search results per term
    pub fn generate<R: Rng>(&self, rng: &mut R) -> Vec<CandidateGroup<SyntheticClip>> {
        let mut next_id = 0usize;
        let mut previous: Vec<SyntheticClip> = Vec::new();
        let mut groups = Vec::with_capacity(self.terms);

        for term in 0..self.terms {
            let mut clips = Vec::with_capacity(self.per_term);
            for _ in 0..self.per_term {
                if !previous.is_empty() && rng.gen_bool(self.overlap.clamp(0.0, 1.0)) {
                    let shared = previous[rng.gen_range(0..previous.len())].clone();
                    clips.push(shared);
                    continue;
                }
                clips.push(SyntheticClip {
                    url: format!("https://stock.example/videos/{}", next_id),
                    duration: rng.gen_range(self.min_duration..=self.max_duration),
                    latency: Duration::from_millis(
                        rng.gen_range(self.min_latency_ms..=self.max_latency_ms),
                    ),
                    fail: rng.gen_bool(self.failure_rate),
                });
                next_id += 1;
            }
            previous = clips.clone();
            groups.push(CandidateGroup::new(format!("term-{}", term), clips));
        }
        groups
    }
}

/// Downloader that sleeps for the clip latency
#[derive(Debug, Default)]
pub struct SyntheticDownloader;

#[async_trait]
impl TaskExecutor for SyntheticDownloader {
    type Candidate = SyntheticClip;
    type Payload = String;

    async fn execute(
        &self,
        clip: SyntheticClip,
        _cancel: CancellationToken,
    ) -> Result<TaskResult<String>, TaskError> {
        tokio::time::sleep(clip.latency).await;
        if clip.fail {
            return Err(TaskError::failed(format!("HTTP 503 from {}", clip.url)));
        }
        let path = format!("cache/{}.mp4", clip.url.rsplit('/').next().unwrap_or("clip"));
        Ok(TaskResult::new(clip.url, clip.duration, path))
    }

    async fn discard(&self, result: &TaskResult<String>) -> Result<(), TaskError> {
        info!(key = %result.key, "Discarding surplus download {}", result.payload);
        Ok(())
    }
}
