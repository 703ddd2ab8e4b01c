//! ReelForge Core Library
//!
//! Model resource caching and budgeted parallel clip acquisition.
//! `EngineContext` is the composition root: the process builds one and hands
//! it to every consumer.

pub mod core;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::core::acquisition::{
    AcquisitionReport, AcquisitionRequest, AcquisitionScheduler, TaskExecutor,
};
use crate::core::models::{
    ModelKind, PreloadReport, Preloader, ResourceCache, ResourceLoader, ResourceSpec,
};
use crate::core::performance::{DeviceRuntime, DeviceSelector, SystemDeviceRuntime};
use crate::core::settings::EngineSettings;
use crate::core::CoreResult;

/// Long-lived engine state shared by the pipeline
pub struct EngineContext {
    settings: EngineSettings,
    cache: Arc<ResourceCache>,
    scheduler: AcquisitionScheduler,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("cache", &self.cache)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl EngineContext {
    /// Starts building a context from settings
    pub fn builder(settings: EngineSettings) -> EngineContextBuilder {
        EngineContextBuilder {
            settings,
            runtime: None,
            loaders: Vec::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &AcquisitionScheduler {
        &self.scheduler
    }

    /// Preloader over this context's cache
    pub fn preloader(&self) -> Preloader {
        Preloader::new(self.cache.clone())
    }

    /// Loads the configured startup models on a background task
    pub fn start_preload(&self) -> JoinHandle<PreloadReport> {
        let models = &self.settings.models;
        self.preloader()
            .spawn(models.preload.clone(), models.parallel_preload)
    }

    /// Runs an acquisition with the configured per-clip ceiling
    pub async fn acquire<E: TaskExecutor>(
        &self,
        executor: Arc<E>,
        candidates: Vec<E::Candidate>,
        target: f64,
    ) -> AcquisitionReport<E::Payload> {
        let ceiling = f64::from(self.settings.acquisition.max_clip_duration_secs);
        self.scheduler
            .run(executor, candidates, AcquisitionRequest::new(target, ceiling))
            .await
    }

    /// Drops every cached model and reclaims device memory
    pub async fn shutdown(&self) {
        self.cache.invalidate_all().await;
    }
}

/// Builder for [`EngineContext`]
pub struct EngineContextBuilder {
    settings: EngineSettings,
    runtime: Option<Arc<dyn DeviceRuntime>>,
    loaders: Vec<(ModelKind, Arc<dyn ResourceLoader>)>,
}

impl EngineContextBuilder {
    /// Overrides the device runtime (defaults to probing the local system)
    pub fn device_runtime(mut self, runtime: Arc<dyn DeviceRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Registers the loader for a model
    pub fn loader(mut self, kind: ModelKind, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loaders.push((kind, loader));
        self
    }

    pub fn build(self) -> CoreResult<EngineContext> {
        let mut settings = self.settings;
        settings.normalize();

        let runtime = self
            .runtime
            .unwrap_or_else(|| Arc::new(SystemDeviceRuntime::new()));
        let selector = Arc::new(DeviceSelector::new(runtime));
        let preference = settings.models.device_preference();

        let mut builder = ResourceCache::builder(selector);
        for (kind, loader) in self.loaders {
            let spec = ResourceSpec::new(kind.name(), settings.models.key_for(kind))
                .prefer(preference);
            builder = builder.register(spec, loader);
        }
        let cache = Arc::new(builder.build()?);

        let scheduler = AcquisitionScheduler::new(settings.acquisition.scheduler_config());

        info!(
            "Engine context ready: {} model(s) registered, {} acquisition worker(s)",
            cache.names().len(),
            scheduler.config().max_workers
        );

        Ok(EngineContext {
            settings,
            cache,
            scheduler,
        })
    }
}
