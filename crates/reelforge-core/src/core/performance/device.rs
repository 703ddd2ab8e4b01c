//! Device Selection Module
//!
//! Decides which compute device a resource should be constructed on.
//! Probing never fails the caller: any probe error downgrades to CPU.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Device, DevicePreference, ProbeError};

/// Accelerator detected by a device probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorInfo {
    /// Device kind
    pub device: Device,
    /// Device name as reported by the driver
    pub name: String,
    /// Total device memory in megabytes (0 if unknown)
    pub memory_total_mb: u64,
}

/// Runtime environment hooks for accelerators.
///
/// Implemented by the host process; tests script it.
pub trait DeviceRuntime: Send + Sync {
    /// Returns the usable accelerator, `Ok(None)` if there is none.
    fn probe(&self) -> Result<Option<AcceleratorInfo>, ProbeError>;

    /// Best-effort release of cached accelerator memory after handles are dropped.
    fn reclaim_memory(&self) -> Result<(), ProbeError> {
        Ok(())
    }
}

// =============================================================================
// System Runtime
// =============================================================================

/// Probes CUDA through the driver's device node and `nvidia-smi`.
///
/// Detection uses filesystem and process probes rather than linking to GPU
/// libraries, so the crate builds the same way on machines without CUDA.
#[derive(Debug, Default, Clone)]
pub struct SystemDeviceRuntime;

impl SystemDeviceRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceRuntime for SystemDeviceRuntime {
    fn probe(&self) -> Result<Option<AcceleratorInfo>, ProbeError> {
        if cuda_hidden_by_env(std::env::var("CUDA_VISIBLE_DEVICES").ok().as_deref()) {
            debug!("CUDA_VISIBLE_DEVICES hides all accelerators");
            return Ok(None);
        }

        if cfg!(target_os = "linux") && !Path::new("/dev/nvidia0").exists() {
            return Ok(None);
        }

        let output = std::process::Command::new("nvidia-smi")
            .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
            .output()
            .map_err(|e| ProbeError::RuntimeMissing(format!("nvidia-smi: {}", e)))?;

        if !output.status.success() {
            return Err(ProbeError::Driver(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)))
    }

    fn reclaim_memory(&self) -> Result<(), ProbeError> {
        // Handles own their device allocations; dropping them is the release.
        debug!("Accelerator memory released with dropped handles");
        Ok(())
    }
}

/// `CUDA_VISIBLE_DEVICES=""` or `-1` disables every device
fn cuda_hidden_by_env(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("") | Some("-1"))
}

/// Parses the first line of `nvidia-smi --query-gpu=name,memory.total` CSV output
fn parse_nvidia_smi(stdout: &str) -> Option<AcceleratorInfo> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (name, memory) = match line.rsplit_once(',') {
        Some((name, memory)) => (name.trim(), memory.trim()),
        None => (line, ""),
    };
    if name.is_empty() {
        return None;
    }

    Some(AcceleratorInfo {
        device: Device::Cuda,
        name: name.to_string(),
        memory_total_mb: memory.parse().unwrap_or(0),
    })
}

// =============================================================================
// Device Selector
// =============================================================================

/// Picks a device for a requested preference.
///
/// The accelerator probe runs at most once per selector; its result is
/// reused for every later selection.
pub struct DeviceSelector {
    runtime: Arc<dyn DeviceRuntime>,
    detected: OnceLock<Option<AcceleratorInfo>>,
}

impl std::fmt::Debug for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSelector")
            .field("detected", &self.detected.get())
            .finish()
    }
}

impl DeviceSelector {
    /// Creates a selector over the given runtime
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            runtime,
            detected: OnceLock::new(),
        }
    }

    /// Creates a selector probing the local system
    pub fn system() -> Self {
        Self::new(Arc::new(SystemDeviceRuntime::new()))
    }

    /// Selects a device for the given preference. Never fails.
    pub fn select(&self, preferred: DevicePreference) -> Device {
        match preferred {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto | DevicePreference::Cuda => match self.accelerator() {
                Some(info) => info.device,
                None => Device::Cpu,
            },
        }
    }

    /// The detected accelerator, probing on first use
    pub fn accelerator(&self) -> Option<&AcceleratorInfo> {
        self.detected
            .get_or_init(|| match self.runtime.probe() {
                Ok(Some(info)) => {
                    info!(
                        "Accelerator detected: {} ({} MB, {})",
                        info.name, info.memory_total_mb, info.device
                    );
                    Some(info)
                }
                Ok(None) => {
                    info!("No accelerator detected, using CPU");
                    None
                }
                Err(e) => {
                    warn!("Accelerator detection failed ({}), falling back to CPU", e);
                    None
                }
            })
            .as_ref()
    }

    /// Runs the first probe on the blocking pool, so async callers never
    /// wait on a driver query on a runtime worker.
    pub async fn detect(self: &Arc<Self>) -> Option<&AcceleratorInfo> {
        if self.detected.get().is_none() {
            let selector = Arc::clone(self);
            if let Err(e) = tokio::task::spawn_blocking(move || {
                selector.accelerator();
            })
            .await
            {
                warn!("Accelerator probe task failed: {}", e);
            }
        }
        self.accelerator()
    }

    /// `select` for async callers; see [`DeviceSelector::detect`]
    pub async fn select_async(self: &Arc<Self>, preferred: DevicePreference) -> Device {
        if preferred != DevicePreference::Cpu {
            self.detect().await;
        }
        self.select(preferred)
    }

    /// Best-effort accelerator memory reclamation
    pub fn reclaim_memory(&self) {
        if let Err(e) = self.runtime.reclaim_memory() {
            warn!("Accelerator memory reclamation failed: {}", e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
