//! ReelForge Core Engine
//!
//! Model resource caching and budgeted parallel clip acquisition for the
//! generation pipeline.

pub mod acquisition;
pub mod models;
pub mod performance;
pub mod settings;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_concurrency;
