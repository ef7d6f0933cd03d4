//! Connection resolution from request parameters
//!
//! Resolution never fails: every field that is missing or malformed falls back
//! to the gateway defaults independently of the others.

use chstream_common::EngineDefaults;
use url::Url;

/// Where and how to reach the engine for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub compression: bool,
    pub database: String,
}

impl ConnectionDescriptor {
    /// Descriptor used when a request supplies no connection parameters
    pub fn from_defaults(defaults: &EngineDefaults) -> Self {
        Self {
            host: defaults.host.clone(),
            port: defaults.port,
            compression: defaults.compression,
            database: defaults.database.clone(),
        }
    }

    /// Resolve a descriptor from raw query-string values
    pub fn resolve(
        url: Option<&str>,
        compression: Option<&str>,
        database: Option<&str>,
        defaults: &EngineDefaults,
    ) -> Self {
        let mut descriptor = Self::from_defaults(defaults);

        if let Some(parsed) = url.and_then(parse_engine_url) {
            if let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) {
                descriptor.host = host.trim_matches(|c| c == '[' || c == ']').to_string();
            }
            if let Some(port) = parsed.port() {
                descriptor.port = port;
            }
        }

        if let Some(flag) = compression.and_then(parse_bool_flag) {
            descriptor.compression = flag;
        }

        if let Some(db) = database.map(str::trim).filter(|db| !db.is_empty()) {
            descriptor.database = db.to_string();
        }

        descriptor
    }

    /// Base URL of the engine's HTTP interface
    pub fn http_base(&self) -> String {
        if self.host.contains(':') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

/// Parse `scheme://host:port`; a bare `host:port` is read as if `ch://` were prepended
fn parse_engine_url(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ch://{}", raw)
    };
    Url::parse(&candidate).ok()
}

/// Coerce a query-string flag to a boolean
fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> EngineDefaults {
        EngineDefaults::default()
    }

    #[test]
    fn test_no_parameters_gives_defaults() {
        let descriptor = ConnectionDescriptor::resolve(None, None, None, &defaults());
        assert_eq!(descriptor, ConnectionDescriptor::from_defaults(&defaults()));
        assert_eq!(descriptor.host, "localhost");
        assert_eq!(descriptor.port, 8123);
        assert!(descriptor.compression);
    }

    #[test]
    fn test_url_host_and_port() {
        let descriptor =
            ConnectionDescriptor::resolve(Some("ch://example.com:1234"), None, None, &defaults());
        assert_eq!(descriptor.host, "example.com");
        assert_eq!(descriptor.port, 1234);
        assert!(descriptor.compression);
    }

    #[test]
    fn test_url_without_port_keeps_default_port() {
        let descriptor =
            ConnectionDescriptor::resolve(Some("http://ch.internal"), None, None, &defaults());
        assert_eq!(descriptor.host, "ch.internal");
        assert_eq!(descriptor.port, 8123);
    }

    #[test]
    fn test_url_without_scheme() {
        let descriptor =
            ConnectionDescriptor::resolve(Some("db.local:9000"), None, None, &defaults());
        assert_eq!(descriptor.host, "db.local");
        assert_eq!(descriptor.port, 9000);
    }

    #[test]
    fn test_malformed_url_degrades_to_defaults() {
        for raw in ["", "::::", "ch://", "ch://host:99999999"] {
            let descriptor = ConnectionDescriptor::resolve(Some(raw), None, None, &defaults());
            assert_eq!(descriptor.port, 8123, "input {:?}", raw);
        }
        let descriptor = ConnectionDescriptor::resolve(Some("ch://"), None, None, &defaults());
        assert_eq!(descriptor.host, "localhost");
    }

    #[test]
    fn test_compression_flag_coercion() {
        let off = ["0", "false", "FALSE", "no", "off"];
        for raw in off {
            let d = ConnectionDescriptor::resolve(None, Some(raw), None, &defaults());
            assert!(!d.compression, "input {:?}", raw);
        }
        let on = ["1", "true", "Yes", "on"];
        for raw in on {
            let d = ConnectionDescriptor::resolve(None, Some(raw), None, &defaults());
            assert!(d.compression, "input {:?}", raw);
        }
        let d = ConnectionDescriptor::resolve(None, Some("maybe"), None, &defaults());
        assert!(d.compression);
    }

    #[test]
    fn test_database_override() {
        let d = ConnectionDescriptor::resolve(None, None, Some("analytics"), &defaults());
        assert_eq!(d.database, "analytics");
        let d = ConnectionDescriptor::resolve(None, None, Some("  "), &defaults());
        assert_eq!(d.database, "default");
    }

    #[test]
    fn test_ipv6_host() {
        let d = ConnectionDescriptor::resolve(Some("ch://[::1]:8124"), None, None, &defaults());
        assert_eq!(d.host, "::1");
        assert_eq!(d.http_base(), "http://[::1]:8124");
    }
}
