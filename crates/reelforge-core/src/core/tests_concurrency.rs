//! Cross-module concurrency tests
//!
//! Exercise the cache, preloader, and scheduler together under real
//! multi-threaded contention.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::acquisition::scheduler::tests::{FakeClip, FakeDownloader};
use crate::core::acquisition::{
    select_balanced, AcquisitionRequest, AcquisitionScheduler, CandidateGroup, SchedulerConfig,
    StopReason, TaskState,
};
use crate::core::models::cache::tests::{cache_with, CountingLoader, FakeModel};
use crate::core::models::{PreloadOutcome, Preloader, ResourceSpec};
use crate::core::performance::device::tests::FakeDeviceRuntime;
use crate::core::settings::EngineSettings;
use crate::core::{Device, DevicePreference, ResourceLoadError};
use crate::EngineContext;

// =============================================================================
// Resource Cache
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_gets_construct_once() {
    let loader = Arc::new(CountingLoader::slow(Duration::from_millis(100)));
    let cache = Arc::new(cache_with(
        Arc::new(FakeDeviceRuntime::cpu_only()),
        vec![(ResourceSpec::new("whisper", "large-v3"), loader.clone())],
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("whisper", "large-v3", false).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(loader.calls(), 1);
    assert!(results.iter().all(|h| h.ptr_eq(&results[0])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_waiters_share_failure() {
    let loader = Arc::new(CountingLoader {
        fail_always: true,
        ..CountingLoader::slow(Duration::from_millis(100))
    });
    let cache = Arc::new(cache_with(
        Arc::new(FakeDeviceRuntime::cpu_only()),
        vec![(ResourceSpec::new("clip", "model-a"), loader.clone())],
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("clip", "model-a", false).await })
        })
        .collect();

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ResourceLoadError::LoadFailed { .. }));
    }
    assert_eq!(loader.calls(), 1);

    // Not cached: a later call tries again
    assert!(cache.get("clip", "model-a", false).await.is_err());
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_model_key_switch_reports_new_key() {
    let loader = Arc::new(CountingLoader::new());
    let cache = cache_with(
        Arc::new(FakeDeviceRuntime::cpu_only()),
        vec![(ResourceSpec::new("clip", "model-a"), loader.clone())],
    );

    cache.get("clip", "model-a", false).await.unwrap();
    cache.get("clip", "model-b", false).await.unwrap();

    let status = cache.status().await;
    assert_eq!(
        status.resources["clip"].construction_key.as_deref(),
        Some("model-b")
    );
    assert_eq!(loader.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_cuda_failure_lands_on_cpu() {
    let loader = Arc::new(CountingLoader {
        fail_on_cuda: true,
        ..CountingLoader::new()
    });
    let cache = cache_with(
        Arc::new(FakeDeviceRuntime::cuda()),
        vec![(
            ResourceSpec::new("whisper", "large-v3").prefer(DevicePreference::Cuda),
            loader,
        )],
    );

    let model = cache
        .get_as::<FakeModel>("whisper", "large-v3", false)
        .await
        .unwrap();

    assert_eq!(model.device, Device::Cpu);
    assert_eq!(model.key, "large-v3");
    let status = cache.status().await;
    assert_eq!(status.resources["whisper"].device, Some(Device::Cpu));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidate_during_construction_does_not_cache() {
    let loader = Arc::new(CountingLoader::slow(Duration::from_millis(150)));
    let cache = Arc::new(cache_with(
        Arc::new(FakeDeviceRuntime::cpu_only()),
        vec![(ResourceSpec::new("clip", "model-a"), loader.clone())],
    ));

    let loading = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get("clip", "model-a", false).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cache.invalidate_all().await;

    // The caller still gets its handle
    assert!(loading.await.unwrap().is_ok());
    assert!(cache.status().await.loaded().is_empty());
}

// =============================================================================
// Preload
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_preload_failure_is_isolated() {
    let cache = Arc::new(cache_with(
        Arc::new(FakeDeviceRuntime::cpu_only()),
        vec![
            (
                ResourceSpec::new("whisper", "large-v3"),
                Arc::new(CountingLoader {
                    fail_always: true,
                    ..CountingLoader::new()
                }),
            ),
            (
                ResourceSpec::new("sentence_transformer", "all-mpnet-base-v2"),
                Arc::new(CountingLoader::slow(Duration::from_millis(20))),
            ),
            (
                ResourceSpec::new("clip", "clip-vit-base-patch32"),
                Arc::new(CountingLoader::slow(Duration::from_millis(20))),
            ),
        ],
    ));

    let names: Vec<String> = ["whisper", "sentence_transformer", "clip"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let report = Preloader::new(cache.clone()).preload(&names, true).await;

    assert_eq!(report.successful, 2);
    assert!(matches!(report.outcomes["whisper"], PreloadOutcome::Failed(_)));
    let status = cache.status().await;
    assert_eq!(status.loaded(), vec!["clip", "sentence_transformer"]);
    assert!(status.resources["whisper"].last_error.is_some());
}

// =============================================================================
// Acquisition
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_target_twelve_with_three_workers() {
    let executor = Arc::new(FakeDownloader::default());
    let candidates: Vec<FakeClip> = (0..10)
        .map(|i| FakeClip::new(&format!("https://videos.example/{}", i), 5.0, 40))
        .collect();
    let scheduler = AcquisitionScheduler::new(SchedulerConfig {
        max_workers: 3,
        ..SchedulerConfig::default()
    });

    let report = scheduler
        .run(executor.clone(), candidates, AcquisitionRequest::new(12.0, 5.0))
        .await;

    let stats = &report.stats;
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.accumulated, 15.0);
    assert_eq!(
        stats.succeeded + stats.failed + stats.skipped + stats.cancelled,
        10
    );
    assert_eq!(report.stop_reason, StopReason::Satisfied);
    assert!(executor.peak.load(Ordering::SeqCst) <= 3);
    assert!(report
        .records
        .iter()
        .all(|r| r.state.is_terminal()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_target_zero_runs_nothing() {
    let executor = Arc::new(FakeDownloader::default());
    let candidates: Vec<FakeClip> = (0..5)
        .map(|i| FakeClip::new(&format!("clip-{}", i), 5.0, 10))
        .collect();

    let report = AcquisitionScheduler::default()
        .run(executor.clone(), candidates, AcquisitionRequest::new(0.0, 5.0))
        .await;

    assert_eq!(executor.started.load(Ordering::SeqCst), 0);
    assert_eq!(report.stats.cancelled, 5);
    assert_eq!(report.stats.accumulated, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_balanced_selection_feeds_scheduler_without_duplicates() {
    let clip = |url: &str| FakeClip::new(url, 5.0, 10);
    let groups = vec![
        CandidateGroup::new("ocean", vec![clip("a"), clip("b"), clip("c")]),
        CandidateGroup::new("waves", vec![clip("b"), clip("d"), clip("e")]),
    ];
    let mut candidates = select_balanced(groups, 20.0, 5.0, true);
    // Same clip listed twice by the caller
    candidates.push(clip("a"));

    let executor = Arc::new(FakeDownloader::default());
    let report = AcquisitionScheduler::default()
        .run(executor, candidates, AcquisitionRequest::new(1000.0, 5.0))
        .await;

    let mut keys: Vec<&str> = report.results.iter().map(|r| r.key.as_str()).collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), report.results.len());
    assert_eq!(report.stats.duplicates, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caller_cancellation_waits_for_in_flight() {
    let executor = Arc::new(FakeDownloader::default());
    let token = CancellationToken::new();
    let candidates: Vec<FakeClip> = (0..9)
        .map(|i| FakeClip::new(&format!("clip-{}", i), 5.0, 80))
        .collect();
    let scheduler = AcquisitionScheduler::new(SchedulerConfig {
        max_workers: 3,
        ..SchedulerConfig::default()
    });

    let run = {
        let executor = executor.clone();
        let request = AcquisitionRequest::new(1000.0, 5.0).with_cancel(token.clone());
        tokio::spawn(async move { scheduler.run(executor, candidates, request).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let report = run.await.unwrap();
    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert_eq!(report.stats.succeeded, 3);
    assert_eq!(report.stats.cancelled, 6);
    assert_eq!(executor.running.load(Ordering::SeqCst), 0);
    assert!(report
        .records
        .iter()
        .filter(|r| r.state == TaskState::Cancelled)
        .all(|r| r.duration_ms.is_none()));
}

// =============================================================================
// Engine Context
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_context_preloads_configured_models() {
    let mut settings = EngineSettings::default();
    settings.models.clip_model = "clip-vit-large-patch14".to_string();

    let context = EngineContext::builder(settings)
        .device_runtime(Arc::new(FakeDeviceRuntime::cuda()))
        .loader(
            crate::core::models::ModelKind::SentenceTransformer,
            Arc::new(CountingLoader::new()),
        )
        .loader(
            crate::core::models::ModelKind::Clip,
            Arc::new(CountingLoader::new()),
        )
        .build()
        .unwrap();

    let report = context.start_preload().await.unwrap();
    assert!(report.all_loaded());

    let clip = context
        .cache()
        .get_as::<FakeModel>("clip", "clip-vit-large-patch14", false)
        .await
        .unwrap();
    assert_eq!(clip.device, Device::Cuda);

    context.shutdown().await;
    let status = context.cache().status().await;
    assert!(status.loaded().is_empty());
    assert!(!status.models_preloaded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_context_acquire_uses_clip_ceiling() {
    let mut settings = EngineSettings::default();
    settings.acquisition.max_clip_duration_secs = 4;

    let context = EngineContext::builder(settings)
        .device_runtime(Arc::new(FakeDeviceRuntime::cpu_only()))
        .build()
        .unwrap();

    let candidates = vec![
        FakeClip::new("long-1", 30.0, 5),
        FakeClip::new("long-2", 30.0, 5),
    ];
    let report = context
        .acquire(Arc::new(FakeDownloader::default()), candidates, 100.0)
        .await;

    assert_eq!(report.stats.accumulated, 8.0);
}
