//! Health server configuration

use serde::Deserialize;

/// Configuration for the HTTP server hosting the health, metrics and API routes
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable or disable the server
    ///
    /// When disabled, no HTTP port is opened at all, including for the
    /// submission and admin APIs.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Address to bind
    ///
    /// Common values:
    /// - `[::]:8080` (IPv6 any address, port 8080)
    /// - `0.0.0.0:8080` (IPv4 any address, port 8080)
    /// - `127.0.0.1:8080` (localhost only, port 8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Upper bound on the time spent answering a health check or scrape
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

const fn default_enabled() -> bool {
    true
}

fn default_listen_address() -> String {
    "[::]:8080".to_string()
}

const fn default_check_timeout_ms() -> u64 {
    1000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen_address: default_listen_address(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_from_empty_section() {
        let config: HealthConfig = ron::from_str("()").unwrap();
        assert!(config.enabled);
        assert_eq!(config.listen_address, "[::]:8080");
        assert_eq!(config.check_timeout_ms, 1000);
    }

    #[test]
    fn test_overrides() {
        let config: HealthConfig =
            ron::from_str(r#"(enabled: false, listen_address: "127.0.0.1:9000")"#).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.listen_address, "127.0.0.1:9000");
    }
}
