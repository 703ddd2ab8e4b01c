//! ReelForge Error Definitions
//!
//! Defines error types used throughout the engine.

use thiserror::Error;

use super::{Device, ResourceName, TaskKey};

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error(transparent)]
    ResourceLoad(#[from] ResourceLoadError),

    #[error("Resource already registered: {0}")]
    ResourceAlreadyRegistered(ResourceName),

    // =========================================================================
    // Settings Errors
    // =========================================================================
    #[error("Settings error: {0}")]
    Settings(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Resource Cache Errors
// =============================================================================

/// A resource could not be constructed on any attempted device.
///
/// Failures are transient: the cache never stores them as values, so the
/// next `get` for the same name starts a fresh attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceLoadError {
    #[error("Unknown resource: {0}")]
    UnknownResource(ResourceName),

    #[error("Failed to load {name} (last device: {device}): {cause}")]
    LoadFailed {
        name: ResourceName,
        device: Device,
        cause: String,
    },

    #[error("Resource {name} is not a {expected}")]
    TypeMismatch {
        name: ResourceName,
        expected: &'static str,
    },
}

impl ResourceLoadError {
    /// Name of the resource the error belongs to
    pub fn resource_name(&self) -> &str {
        match self {
            ResourceLoadError::UnknownResource(name) => name,
            ResourceLoadError::LoadFailed { name, .. } => name,
            ResourceLoadError::TypeMismatch { name, .. } => name,
        }
    }
}

/// Error returned by a resource loader for one construction attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LoaderError {
    /// Human-readable cause
    pub message: String,
    /// Whether retrying on CPU after an accelerator failure makes sense
    pub retryable_on_cpu: bool,
}

impl LoaderError {
    /// Creates a loader error that allows the CPU fallback
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable_on_cpu: true,
        }
    }

    /// Creates a loader error that must not be retried on another device
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable_on_cpu: false,
        }
    }
}

// =============================================================================
// Acquisition Errors
// =============================================================================

/// Failure of a single acquisition task.
///
/// Never aborts a batch; the scheduler records it against the task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task {key} timed out after {after_ms}ms")]
    TimedOut { key: TaskKey, after_ms: u64 },

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Convenience constructor for executor failures
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

// =============================================================================
// Device Probe Errors
// =============================================================================

/// Accelerator probe failure. The device selector downgrades to CPU instead
/// of surfacing this.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Accelerator runtime not available: {0}")]
    RuntimeMissing(String),

    #[error("Accelerator driver error: {0}")]
    Driver(String),
}

impl CoreError {
    /// Convert to a user-facing error message
    pub fn to_user_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_load_error_message() {
        let err = ResourceLoadError::LoadFailed {
            name: "clip".to_string(),
            device: Device::Cpu,
            cause: "weights missing".to_string(),
        };

        assert_eq!(err.resource_name(), "clip");
        assert_eq!(
            err.to_string(),
            "Failed to load clip (last device: cpu): weights missing"
        );
    }

    #[test]
    fn test_resource_load_error_converts_to_core_error() {
        let core: CoreError = ResourceLoadError::UnknownResource("tts".to_string()).into();
        assert!(matches!(core, CoreError::ResourceLoad(_)));
        assert_eq!(core.to_user_message(), "Unknown resource: tts");
    }

    #[test]
    fn test_loader_error_fallback_flag() {
        assert!(LoaderError::new("oom").retryable_on_cpu);
        assert!(!LoaderError::fatal("bad checkpoint").retryable_on_cpu);
    }

    #[test]
    fn test_task_error_display() {
        let err = TaskError::TimedOut {
            key: "https://example.com/a.mp4".to_string(),
            after_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "Task https://example.com/a.mp4 timed out after 1500ms"
        );
    }
}
