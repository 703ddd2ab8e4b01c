//! Resource Cache
//!
//! Process-wide store of expensive model handles. Each registered resource
//! is constructed lazily, at most once per construction key, and shared by
//! every caller until the key changes, a reload is forced, or the cache is
//! invalidated.
//!
//! Locking is per resource name: a construction of `clip` never delays a
//! cache hit on `whisper`. Cache hits only take the slot's read lock; the
//! loader runs under the resource's build lock, never under the slot lock.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::loader::{ResourceHandle, ResourceLoader};
use crate::core::performance::{AcceleratorInfo, DeviceSelector, ProcessMemory};
use crate::core::{
    ConstructionKey, CoreError, CoreResult, Device, DevicePreference, ResourceLoadError,
    ResourceName,
};

// =============================================================================
// Registration
// =============================================================================

/// Static description of a cacheable resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Resource name
    pub name: ResourceName,
    /// Construction key used by `get_default`
    pub default_key: ConstructionKey,
    /// Requested device policy
    pub preference: DevicePreference,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, default_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_key: default_key.into(),
            preference: DevicePreference::Auto,
        }
    }

    /// Sets the device preference
    pub fn prefer(mut self, preference: DevicePreference) -> Self {
        self.preference = preference;
        self
    }
}

/// Current cached state of one resource
#[derive(Debug, Clone, Default)]
struct ResourceSlot {
    construction_key: Option<ConstructionKey>,
    value: Option<ResourceHandle>,
    device: Option<Device>,
    last_load_duration_ms: Option<u64>,
    /// Outcome of the latest failed attempt, for callers that waited on it
    failure: Option<(ConstructionKey, ResourceLoadError)>,
    /// Bumped when a construction attempt finishes, successful or not
    attempts: u64,
}

impl ResourceSlot {
    fn matching(&self, key: &str) -> Option<ResourceHandle> {
        match (&self.value, self.construction_key.as_deref()) {
            (Some(handle), Some(cached)) if cached == key => Some(handle.clone()),
            _ => None,
        }
    }

    fn failed_for(&self, key: &str) -> Option<ResourceLoadError> {
        match &self.failure {
            Some((failed_key, err)) if failed_key == key => Some(err.clone()),
            _ => None,
        }
    }

    fn status(&self) -> ResourceStatus {
        ResourceStatus {
            loaded: self.value.is_some(),
            construction_key: self.construction_key.clone(),
            device: self.device,
            last_load_duration_ms: self.last_load_duration_ms,
            last_error: self.failure.as_ref().map(|(_, err)| err.to_string()),
        }
    }
}

struct ResourceEntry {
    spec: ResourceSpec,
    loader: Arc<dyn ResourceLoader>,
    build_lock: Mutex<()>,
    slot: RwLock<ResourceSlot>,
}

// =============================================================================
// Status
// =============================================================================

/// Read-only view of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub loaded: bool,
    pub construction_key: Option<ConstructionKey>,
    /// Device the handle was actually built on
    pub device: Option<Device>,
    pub last_load_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// Read-only view of the whole cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Device `auto` resolves to on this host
    pub device: Device,
    pub accelerator: Option<AcceleratorInfo>,
    pub models_preloaded: bool,
    pub resources: BTreeMap<ResourceName, ResourceStatus>,
    pub memory: Option<ProcessMemory>,
}

impl CacheStatus {
    /// Names of resources currently holding a handle
    pub fn loaded(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|(_, s)| s.loaded)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Registers loaders once, before the cache is shared
pub struct ResourceCacheBuilder {
    selector: Arc<DeviceSelector>,
    entries: Vec<(ResourceSpec, Arc<dyn ResourceLoader>)>,
}

impl ResourceCacheBuilder {
    /// Registers a loader for a resource name
    pub fn register(mut self, spec: ResourceSpec, loader: Arc<dyn ResourceLoader>) -> Self {
        self.entries.push((spec, loader));
        self
    }

    /// Builds the cache. Fails if a name was registered twice.
    pub fn build(self) -> CoreResult<ResourceCache> {
        let mut entries = HashMap::with_capacity(self.entries.len());
        for (spec, loader) in self.entries {
            if entries.contains_key(&spec.name) {
                return Err(CoreError::ResourceAlreadyRegistered(spec.name));
            }
            entries.insert(
                spec.name.clone(),
                ResourceEntry {
                    spec,
                    loader,
                    build_lock: Mutex::new(()),
                    slot: RwLock::new(ResourceSlot::default()),
                },
            );
        }

        Ok(ResourceCache {
            entries,
            selector: self.selector,
            epoch: AtomicU64::new(0),
            preloaded: AtomicBool::new(false),
        })
    }
}

// =============================================================================
// Resource Cache
// =============================================================================

/// Thread-safe lazy cache of named heavyweight resources
pub struct ResourceCache {
    /// Fixed after build; per-entry locks guard the mutable parts
    entries: HashMap<ResourceName, ResourceEntry>,
    selector: Arc<DeviceSelector>,
    /// Bumped by `invalidate_all`; constructions started in an older epoch
    /// are returned to their caller but not cached
    epoch: AtomicU64,
    preloaded: AtomicBool,
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("resources", &self.names())
            .field("selector", &self.selector)
            .finish()
    }
}

impl ResourceCache {
    /// Starts a builder over the given device selector
    pub fn builder(selector: Arc<DeviceSelector>) -> ResourceCacheBuilder {
        ResourceCacheBuilder {
            selector,
            entries: Vec::new(),
        }
    }

    /// Registered resource names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registration of a resource
    pub fn spec(&self, name: &str) -> Option<&ResourceSpec> {
        self.entries.get(name).map(|e| &e.spec)
    }

    pub fn selector(&self) -> &Arc<DeviceSelector> {
        &self.selector
    }

    fn entry(&self, name: &str) -> Result<&ResourceEntry, ResourceLoadError> {
        self.entries
            .get(name)
            .ok_or_else(|| ResourceLoadError::UnknownResource(name.to_string()))
    }

    /// Returns the resource built for `key`, constructing it if needed.
    ///
    /// Concurrent callers for the same name and key share one construction
    /// attempt and its outcome. A failure is not cached: a caller arriving
    /// after the failed attempt finished gets a fresh attempt.
    pub async fn get(
        &self,
        name: &str,
        key: &str,
        force_reload: bool,
    ) -> Result<ResourceHandle, ResourceLoadError> {
        let entry = self.entry(name)?;

        let observed_attempts = {
            let slot = entry.slot.read().await;
            if !force_reload {
                if let Some(handle) = slot.matching(key) {
                    debug!(resource = name, key, "Cache hit");
                    return Ok(handle);
                }
            }
            slot.attempts
        };

        let _build = entry.build_lock.lock().await;

        // An attempt finished while we waited: share its outcome.
        {
            let slot = entry.slot.read().await;
            if slot.attempts != observed_attempts {
                if let Some(handle) = slot.matching(key) {
                    debug!(resource = name, key, "Constructed by concurrent caller");
                    return Ok(handle);
                }
                if let Some(err) = slot.failed_for(key) {
                    return Err(err);
                }
            } else if !force_reload {
                if let Some(handle) = slot.matching(key) {
                    return Ok(handle);
                }
            }
        }

        self.construct(entry, key).await
    }

    /// `get` with the key configured at registration
    pub async fn get_default(&self, name: &str) -> Result<ResourceHandle, ResourceLoadError> {
        let key = self.entry(name)?.spec.default_key.clone();
        self.get(name, &key, false).await
    }

    /// Typed `get`
    pub async fn get_as<T: Any + Send + Sync>(
        &self,
        name: &str,
        key: &str,
        force_reload: bool,
    ) -> Result<Arc<T>, ResourceLoadError> {
        self.get(name, key, force_reload)
            .await?
            .downcast::<T>()
            .ok_or_else(|| ResourceLoadError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Runs the loader under the resource's build lock
    async fn construct(
        &self,
        entry: &ResourceEntry,
        key: &str,
    ) -> Result<ResourceHandle, ResourceLoadError> {
        let name = entry.spec.name.as_str();
        let epoch = self.epoch.load(Ordering::SeqCst);

        // Release the stale handle first so two models never share device memory.
        {
            let mut slot = entry.slot.write().await;
            if let Some(previous) = slot.construction_key.take() {
                if previous != key {
                    info!(resource = name, from = %previous, to = key, "Construction key changed, replacing resource");
                }
            }
            slot.value = None;
            slot.device = None;
        }

        let device = self.selector.select_async(entry.spec.preference).await;
        info!(resource = name, key, %device, "Loading resource");
        let started = Instant::now();

        let outcome = match entry.loader.load(key, device).await {
            Ok(handle) => Ok((handle, device)),
            Err(err) if device.is_accelerator() && err.retryable_on_cpu => {
                warn!(resource = name, %device, "Loading failed on accelerator ({}), falling back to CPU", err);
                match entry.loader.fallback(key, device, &err).await {
                    Ok(handle) => Ok((handle, Device::Cpu)),
                    Err(cpu_err) => Err((
                        Device::Cpu,
                        format!("{} attempt: {}; cpu attempt: {}", device, err, cpu_err),
                    )),
                }
            }
            Err(err) => Err((device, err.message)),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut slot = entry.slot.write().await;
        slot.attempts += 1;

        match outcome {
            Ok((handle, built_on)) => {
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    slot.construction_key = Some(key.to_string());
                    slot.value = Some(handle.clone());
                    slot.device = Some(built_on);
                    slot.last_load_duration_ms = Some(elapsed_ms);
                    slot.failure = None;
                } else {
                    warn!(resource = name, "Cache invalidated during construction; result not cached");
                }
                info!(resource = name, key, device = %built_on, elapsed_ms, "Resource loaded");
                Ok(handle)
            }
            Err((last_device, cause)) => {
                let err = ResourceLoadError::LoadFailed {
                    name: name.to_string(),
                    device: last_device,
                    cause,
                };
                error!(resource = name, key, "{}", err);
                slot.failure = Some((key.to_string(), err.clone()));
                Err(err)
            }
        }
    }

    /// Whether a handle is currently cached for `name`
    pub async fn is_loaded(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(entry) => entry.slot.read().await.value.is_some(),
            None => false,
        }
    }

    /// Drops every cached handle, clears error and timing records, and asks
    /// the device runtime to reclaim accelerator memory.
    ///
    /// Handles already given out stay alive until their holders drop them.
    pub async fn invalidate_all(&self) {
        info!("Cleaning up all resources");
        self.epoch.fetch_add(1, Ordering::SeqCst);

        for entry in self.entries.values() {
            let mut slot = entry.slot.write().await;
            let attempts = slot.attempts;
            *slot = ResourceSlot {
                attempts,
                ..ResourceSlot::default()
            };
        }

        self.preloaded.store(false, Ordering::SeqCst);
        self.selector.reclaim_memory();
        info!("All resources cleaned up");
    }

    /// Snapshot of every resource. Never waits on a running loader.
    pub async fn status(&self) -> CacheStatus {
        let mut resources = BTreeMap::new();
        for (name, entry) in &self.entries {
            resources.insert(name.clone(), entry.slot.read().await.status());
        }

        CacheStatus {
            device: self.selector.select_async(DevicePreference::Auto).await,
            accelerator: self.selector.detect().await.cloned(),
            models_preloaded: self.preloaded.load(Ordering::SeqCst),
            resources,
            memory: ProcessMemory::sample().await,
        }
    }

    pub(crate) fn mark_preloaded(&self) {
        self.preloaded.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::performance::device::tests::FakeDeviceRuntime;
    use crate::core::LoaderError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Model stand-in recording what it was built for
    #[derive(Debug)]
    pub(crate) struct FakeModel {
        pub(crate) key: String,
        pub(crate) device: Device,
    }

    /// Loader with scripted failures and a call counter
    pub(crate) struct CountingLoader {
        pub(crate) calls: AtomicUsize,
        pub(crate) delay: Duration,
        pub(crate) fail_on_cuda: bool,
        pub(crate) fail_always: bool,
    }

    impl CountingLoader {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                fail_on_cuda: false,
                fail_always: false,
            }
        }

        pub(crate) fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceLoader for CountingLoader {
        async fn load(&self, key: &str, device: Device) -> Result<ResourceHandle, LoaderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_always {
                return Err(LoaderError::new(format!("cannot open weights for {}", key)));
            }
            if self.fail_on_cuda && device == Device::Cuda {
                return Err(LoaderError::new("CUDA out of memory"));
            }
            Ok(ResourceHandle::new(FakeModel {
                key: key.to_string(),
                device,
            }))
        }
    }

    pub(crate) fn cache_with(
        runtime: Arc<FakeDeviceRuntime>,
        loaders: Vec<(ResourceSpec, Arc<dyn ResourceLoader>)>,
    ) -> ResourceCache {
        let mut builder = ResourceCache::builder(Arc::new(DeviceSelector::new(runtime)));
        for (spec, loader) in loaders {
            builder = builder.register(spec, loader);
        }
        builder.build().unwrap()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    #[test]
    fn test_duplicate_registration_fails() {
        let selector = Arc::new(DeviceSelector::new(Arc::new(FakeDeviceRuntime::cpu_only())));
        let result = ResourceCache::builder(selector)
            .register(ResourceSpec::new("clip", "a"), Arc::new(CountingLoader::new()))
            .register(ResourceSpec::new("clip", "b"), Arc::new(CountingLoader::new()))
            .build();

        assert!(matches!(result, Err(CoreError::ResourceAlreadyRegistered(name)) if name == "clip"));
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let cache = cache_with(Arc::new(FakeDeviceRuntime::cpu_only()), vec![]);
        let err = cache.get("whisper", "base", false).await.unwrap_err();
        assert_eq!(err, ResourceLoadError::UnknownResource("whisper".to_string()));
    }

    // ========================================================================
    // Hits, misses, reloads
    // ========================================================================

    #[tokio::test]
    async fn test_second_get_is_a_hit() {
        let loader = Arc::new(CountingLoader::new());
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cpu_only()),
            vec![(ResourceSpec::new("whisper", "base"), loader.clone())],
        );

        let first = cache.get("whisper", "base", false).await.unwrap();
        let second = cache.get("whisper", "base", false).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn test_key_change_rebuilds() {
        let loader = Arc::new(CountingLoader::new());
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cpu_only()),
            vec![(ResourceSpec::new("clip", "model-a"), loader.clone())],
        );

        let a = cache.get_as::<FakeModel>("clip", "model-a", false).await.unwrap();
        let b = cache.get_as::<FakeModel>("clip", "model-b", false).await.unwrap();

        assert_eq!(a.key, "model-a");
        assert_eq!(b.key, "model-b");
        assert_eq!(loader.calls(), 2);

        let status = cache.status().await;
        assert_eq!(
            status.resources["clip"].construction_key.as_deref(),
            Some("model-b")
        );
    }

    #[tokio::test]
    async fn test_force_reload_rebuilds_same_key() {
        let loader = Arc::new(CountingLoader::new());
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cpu_only()),
            vec![(ResourceSpec::new("whisper", "base"), loader.clone())],
        );

        let first = cache.get("whisper", "base", false).await.unwrap();
        let reloaded = cache.get("whisper", "base", true).await.unwrap();

        assert!(!first.ptr_eq(&reloaded));
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_get_default_uses_registered_key() {
        let loader = Arc::new(CountingLoader::new());
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cpu_only()),
            vec![(ResourceSpec::new("sentence_transformer", "all-mpnet-base-v2"), loader)],
        );

        let handle = cache.get_default("sentence_transformer").await.unwrap();
        assert_eq!(
            handle.downcast_ref::<FakeModel>().map(|m| m.key.as_str()),
            Some("all-mpnet-base-v2")
        );
    }

    #[tokio::test]
    async fn test_get_as_type_mismatch() {
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cpu_only()),
            vec![(ResourceSpec::new("clip", "a"), Arc::new(CountingLoader::new()))],
        );

        let err = cache.get_as::<String>("clip", "a", false).await.unwrap_err();
        assert!(matches!(err, ResourceLoadError::TypeMismatch { .. }));
    }

    // ========================================================================
    // Devices and failures
    // ========================================================================

    #[tokio::test]
    async fn test_cuda_failure_falls_back_to_cpu() {
        let loader = Arc::new(CountingLoader {
            fail_on_cuda: true,
            ..CountingLoader::new()
        });
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cuda()),
            vec![(
                ResourceSpec::new("sentence_transformer", "all-mpnet-base-v2")
                    .prefer(DevicePreference::Cuda),
                loader.clone(),
            )],
        );

        let model = cache
            .get_as::<FakeModel>("sentence_transformer", "all-mpnet-base-v2", false)
            .await
            .unwrap();

        assert_eq!(model.device, Device::Cpu);
        assert_eq!(loader.calls(), 2);
        let status = cache.status().await;
        let entry = &status.resources["sentence_transformer"];
        assert!(entry.loaded);
        assert_eq!(entry.device, Some(Device::Cpu));
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn test_cpu_failure_is_not_retried() {
        let loader = Arc::new(CountingLoader {
            fail_always: true,
            ..CountingLoader::new()
        });
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cpu_only()),
            vec![(ResourceSpec::new("whisper", "base"), loader.clone())],
        );

        let err = cache.get("whisper", "base", false).await.unwrap_err();

        assert!(matches!(err, ResourceLoadError::LoadFailed { device: Device::Cpu, .. }));
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_recorded_and_not_cached() {
        let loader = Arc::new(CountingLoader {
            fail_always: true,
            ..CountingLoader::new()
        });
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cuda()),
            vec![(ResourceSpec::new("clip", "a"), loader.clone())],
        );

        assert!(cache.get("clip", "a", false).await.is_err());
        // cuda attempt + cpu fallback
        assert_eq!(loader.calls(), 2);

        let status = cache.status().await;
        assert!(!status.resources["clip"].loaded);
        assert!(status.resources["clip"]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("cannot open weights")));

        assert!(cache.get("clip", "a", false).await.is_err());
        assert_eq!(loader.calls(), 4);
    }

    // ========================================================================
    // Invalidation and status
    // ========================================================================

    #[tokio::test]
    async fn test_invalidate_all_unloads_everything() {
        let runtime = Arc::new(FakeDeviceRuntime::cuda());
        let cache = cache_with(
            runtime.clone(),
            vec![
                (ResourceSpec::new("whisper", "base"), Arc::new(CountingLoader::new())),
                (ResourceSpec::new("clip", "a"), Arc::new(CountingLoader::new())),
            ],
        );
        cache.get_default("whisper").await.unwrap();
        cache.get_default("clip").await.unwrap();
        cache.mark_preloaded();

        cache.invalidate_all().await;

        let status = cache.status().await;
        assert!(status.loaded().is_empty());
        assert!(!status.models_preloaded);
        assert!(status
            .resources
            .values()
            .all(|s| s.last_load_duration_ms.is_none() && s.last_error.is_none()));
        assert_eq!(runtime.reclaims.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_on_empty_cache_is_safe() {
        let cache = cache_with(Arc::new(FakeDeviceRuntime::cpu_only()), vec![]);
        cache.invalidate_all().await;
        assert!(cache.status().await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_device_and_timing() {
        let cache = cache_with(
            Arc::new(FakeDeviceRuntime::cuda()),
            vec![(ResourceSpec::new("clip", "a"), Arc::new(CountingLoader::new()))],
        );
        cache.get_default("clip").await.unwrap();

        let status = cache.status().await;
        assert_eq!(status.device, Device::Cuda);
        assert_eq!(status.accelerator.as_ref().map(|a| a.memory_total_mb), Some(8192));
        let clip = &status.resources["clip"];
        assert_eq!(clip.device, Some(Device::Cuda));
        assert!(clip.last_load_duration_ms.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hit_does_not_wait_for_other_resource() {
        let slow = Arc::new(CountingLoader::slow(Duration::from_millis(500)));
        let cache = Arc::new(cache_with(
            Arc::new(FakeDeviceRuntime::cpu_only()),
            vec![
                (ResourceSpec::new("whisper", "large-v3"), slow),
                (ResourceSpec::new("clip", "a"), Arc::new(CountingLoader::new())),
            ],
        ));
        cache.get_default("clip").await.unwrap();

        let loading = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_default("whisper").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        cache.get_default("clip").await.unwrap();
        let status = cache.status().await;
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(!status.resources["whisper"].loaded);

        loading.await.unwrap().unwrap();
    }
}
