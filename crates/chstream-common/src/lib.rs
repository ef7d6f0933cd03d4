//! ChStream Common Library
//!
//! Shared error taxonomy, defaults, and environment helpers for ChStream services.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{EngineDefaults, StreamSettings};
pub use error::{ChStreamError, ExecutionError, Result};
