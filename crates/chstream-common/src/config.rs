//! Configuration utilities for ChStream services

use serde::{Deserialize, Serialize};

/// Engine host used when a request names none
pub const DEFAULT_ENGINE_HOST: &str = "localhost";
/// ClickHouse HTTP interface port
pub const DEFAULT_ENGINE_PORT: u16 = 8123;
/// Compression is on unless a request turns it off
pub const DEFAULT_COMPRESSION: bool = true;
/// Database used when a request names none
pub const DEFAULT_DATABASE: &str = "default";
/// Encoded events buffered between the emitter task and the response body
pub const DEFAULT_EVENT_BUFFER: usize = 16;

/// Fallback connection settings applied to every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDefaults {
    pub host: String,
    pub port: u16,
    pub compression: bool,
    pub database: String,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            host: DEFAULT_ENGINE_HOST.into(),
            port: DEFAULT_ENGINE_PORT,
            compression: DEFAULT_COMPRESSION,
            database: DEFAULT_DATABASE.into(),
        }
    }
}

/// Per-stream tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Capacity of the channel between emitter and response body
    pub event_buffer: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl StreamSettings {
    /// Read tunables from the environment, keeping defaults for anything unset
    pub fn from_env() -> Self {
        Self {
            event_buffer: env_parse_or_default("CHSTREAM_EVENT_BUFFER", DEFAULT_EVENT_BUFFER)
                .max(1),
        }
    }
}

/// Get environment variable as parsed type with default
pub fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
