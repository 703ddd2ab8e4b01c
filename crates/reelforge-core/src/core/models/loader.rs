//! Resource Loaders
//!
//! The seam between the cache and the modules that actually construct
//! models. A loader builds one resource for a construction key on a device.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{Device, LoaderError};

/// Opaque shared handle to a constructed resource
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ResourceHandle {
    /// Wraps a constructed value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Typed shared access
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    /// Typed borrowed access
    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether both handles point at the same constructed instance
    pub fn ptr_eq(&self, other: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

/// Constructs one resource type
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// Builds the resource identified by `key` on `device`
    async fn load(&self, key: &str, device: Device) -> Result<ResourceHandle, LoaderError>;

    /// Second attempt after `load` failed on an accelerator.
    ///
    /// Defaults to a full reconstruction on CPU. Loaders that can move a
    /// partly built model between devices override this.
    async fn fallback(
        &self,
        key: &str,
        failed_on: Device,
        cause: &LoaderError,
    ) -> Result<ResourceHandle, LoaderError> {
        let _ = (failed_on, cause);
        self.load(key, Device::Cpu).await
    }
}

// =============================================================================
// Blocking Loader
// =============================================================================

/// Adapts a synchronous constructor to [`ResourceLoader`].
///
/// Model constructors are long CPU/IO-bound calls, so they run on tokio's
/// blocking pool. A panicking constructor becomes a non-retryable failure.
pub struct BlockingLoader<F, T> {
    build: Arc<F>,
    _output: PhantomData<fn() -> T>,
}

impl<F, T> BlockingLoader<F, T>
where
    F: Fn(&str, Device) -> Result<T, LoaderError> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self {
            build: Arc::new(build),
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T> ResourceLoader for BlockingLoader<F, T>
where
    F: Fn(&str, Device) -> Result<T, LoaderError> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    async fn load(&self, key: &str, device: Device) -> Result<ResourceHandle, LoaderError> {
        let build = self.build.clone();
        let key = key.to_string();

        let value = tokio::task::spawn_blocking(move || build(&key, device))
            .await
            .map_err(|e| LoaderError::fatal(format!("Loader task failed: {}", e)))??;

        Ok(ResourceHandle::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeModel {
        key: String,
        device: Device,
    }

    #[test]
    fn test_handle_downcast() {
        let handle = ResourceHandle::new(FakeModel {
            key: "base".to_string(),
            device: Device::Cpu,
        });

        assert_eq!(handle.downcast_ref::<FakeModel>().map(|m| m.key.as_str()), Some("base"));
        assert!(handle.downcast::<String>().is_none());

        let clone = handle.clone();
        assert!(clone.ptr_eq(&handle));
        assert!(!ResourceHandle::new(1u8).ptr_eq(&handle));
    }

    #[tokio::test]
    async fn test_blocking_loader_builds_on_requested_device() {
        let loader = BlockingLoader::new(|key: &str, device| {
            Ok(FakeModel {
                key: key.to_string(),
                device,
            })
        });

        let handle = loader.load("small", Device::Cuda).await.unwrap();
        let model = handle.downcast::<FakeModel>().unwrap();
        assert_eq!(model.key, "small");
        assert_eq!(model.device, Device::Cuda);
    }

    #[tokio::test]
    async fn test_blocking_loader_default_fallback_uses_cpu() {
        let loader = BlockingLoader::new(|key: &str, device| match device {
            Device::Cpu => Ok(key.len()),
            _ => Err(LoaderError::new("CUDA out of memory")),
        });

        let cause = LoaderError::new("CUDA out of memory");
        let handle = loader.fallback("tiny", Device::Cuda, &cause).await.unwrap();
        assert_eq!(handle.downcast_ref::<usize>(), Some(&4));
    }

    #[tokio::test]
    async fn test_blocking_loader_panic_is_fatal() {
        let loader = BlockingLoader::new(|_key: &str, _device| -> Result<u32, LoaderError> {
            panic!("corrupt weights")
        });

        let err = loader.load("x", Device::Cpu).await.unwrap_err();
        assert!(!err.retryable_on_cpu);
    }
}
