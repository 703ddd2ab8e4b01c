//! Performance Module
//!
//! Provides device selection, bounded parallel execution, and process memory reporting.

pub mod device;
pub mod memory;
pub mod parallel;

// Re-export main types
pub use device::{AcceleratorInfo, DeviceRuntime, DeviceSelector, SystemDeviceRuntime};
pub use memory::ProcessMemory;
pub use parallel::{BoundedPool, PoolSlot, PoolStats};
