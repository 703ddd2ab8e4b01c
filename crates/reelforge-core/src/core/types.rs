//! ReelForge Core Type Definitions
//!
//! Defines fundamental types used throughout the engine.

use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// ID Types
// =============================================================================

/// Registered resource name (e.g. "whisper", "clip")
pub type ResourceName = String;

/// Value distinguishing cached variants of one resource (usually a model name)
pub type ConstructionKey = String;

/// Deduplication identity of an acquisition task (usually a source URL)
pub type TaskKey = String;

/// Acquisition run identifier (ULID)
pub type RunId = String;

// =============================================================================
// Device Types
// =============================================================================

/// Compute device a resource is constructed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Device {
    /// NVIDIA CUDA accelerator
    Cuda,
    /// Host CPU, always available
    Cpu,
}

impl Device {
    /// Whether this device is an accelerator
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested device policy for a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use an accelerator when one is detected
    #[default]
    Auto,
    /// Ask for CUDA; still downgrades to CPU when none is usable
    Cuda,
    /// Never probe, always CPU
    Cpu,
}

impl DevicePreference {
    /// Parses a preference string, defaulting to `Auto` for unknown values
    pub fn parse_lenient(value: &str) -> Self {
        match value.parse() {
            Ok(pref) => pref,
            Err(_) => {
                warn!("Unknown device preference '{}', using auto", value);
                DevicePreference::Auto
            }
        }
    }
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "cpu" => Ok(DevicePreference::Cpu),
            other => Err(format!("Unknown device preference: {}", other)),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DevicePreference::Auto => write!(f, "auto"),
            DevicePreference::Cuda => write!(f, "cuda"),
            DevicePreference::Cpu => write!(f, "cpu"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
