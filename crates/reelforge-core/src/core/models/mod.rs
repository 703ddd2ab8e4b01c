//! Models Module
//!
//! Process-wide model resource cache, the loader seam, the model catalog,
//! and startup preloading.

pub mod cache;
pub mod catalog;
pub mod loader;
pub mod preload;
pub mod whisper;

// Re-export main types
pub use cache::{CacheStatus, ResourceCache, ResourceCacheBuilder, ResourceSpec, ResourceStatus};
pub use catalog::{clip_hub_id, ComputeType, ModelKind};
pub use loader::{BlockingLoader, ResourceHandle, ResourceLoader};
pub use preload::{PreloadOutcome, PreloadReport, Preloader};
#[cfg(feature = "whisper")]
pub use whisper::WhisperLoader;
