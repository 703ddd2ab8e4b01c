//! Whisper Model Loading
//!
//! Resolves Whisper construction keys to ggml model files. The loader itself
//! is only available with the `whisper` feature.

use std::path::{Path, PathBuf};

/// ggml file name for a Whisper model key (e.g. `large-v3` -> `ggml-large-v3.bin`)
pub fn ggml_filename(key: &str) -> String {
    let key = key.trim();
    if key.starts_with("ggml-") && key.ends_with(".bin") {
        key.to_string()
    } else {
        format!("ggml-{}.bin", key)
    }
}

/// Full model path inside a models directory
pub fn model_path(models_dir: &Path, key: &str) -> PathBuf {
    models_dir.join(ggml_filename(key))
}

/// Checks if the whisper loader is compiled in
pub fn is_whisper_available() -> bool {
    cfg!(feature = "whisper")
}

#[cfg(feature = "whisper")]
mod loader_impl {
    use super::*;
    use crate::core::models::loader::{ResourceHandle, ResourceLoader};
    use crate::core::{Device, LoaderError};
    use async_trait::async_trait;
    use tracing::debug;
    use whisper_rs::{WhisperContext, WhisperContextParameters};

    /// Loads whisper.cpp contexts from a models directory
    #[derive(Debug, Clone)]
    pub struct WhisperLoader {
        models_dir: PathBuf,
    }

    impl WhisperLoader {
        pub fn new(models_dir: impl Into<PathBuf>) -> Self {
            Self {
                models_dir: models_dir.into(),
            }
        }
    }

    #[async_trait]
    impl ResourceLoader for WhisperLoader {
        async fn load(&self, key: &str, device: Device) -> Result<ResourceHandle, LoaderError> {
            let path = model_path(&self.models_dir, key);
            if !path.exists() {
                // Another device will not make the file appear.
                return Err(LoaderError::fatal(format!(
                    "Whisper model not found: {}",
                    path.display()
                )));
            }

            let context = tokio::task::spawn_blocking(move || {
                let mut params = WhisperContextParameters::default();
                params.use_gpu(device.is_accelerator());
                debug!("Loading whisper context from {}", path.display());
                WhisperContext::new_with_params(&path.to_string_lossy(), params)
                    .map_err(|e| LoaderError::new(format!("Failed to load whisper model: {}", e)))
            })
            .await
            .map_err(|e| LoaderError::fatal(format!("Loader task failed: {}", e)))??;

            Ok(ResourceHandle::new(context))
        }
    }
}

#[cfg(feature = "whisper")]
pub use loader_impl::WhisperLoader;
