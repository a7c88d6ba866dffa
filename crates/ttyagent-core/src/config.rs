//! Effective gateway configuration.
//!
//! The gateway reads a single JSON file (`config.json` by default, the
//! path may be given as the first CLI argument). Every key is optional
//! and falls back to a default; unknown keys are rejected so that typos
//! fail loudly instead of silently running with defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Optional TLS material for the outer listener. TLS is served only when
/// both paths are present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum WebSocket frame payload in bytes.
    #[serde(default = "default_ws_max_payload")]
    pub ws_max_payload: usize,
    /// Ping interval; a dead peer is detected within twice this.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub ws_heartbeat_interval_ms: u64,
    /// Deadline from accept to successful ticket consumption.
    #[serde(default = "default_auth_timeout_ms")]
    pub ws_auth_timeout_ms: u64,
    /// Ticket lifetime from issuance.
    #[serde(default = "default_ticket_ttl_ms")]
    pub ws_ticket_ttl_ms: u64,
    /// Maximum accepted kubeconfig size in UTF-8 bytes.
    #[serde(default = "default_max_kubeconfig_bytes")]
    pub ws_ticket_max_kubeconfig_bytes: usize,
    /// Exact-match Origin allowlist. Empty means any origin is accepted.
    #[serde(default)]
    pub ws_allowed_origins: Vec<String>,
    /// Per-IP rate limit on `POST /ws-ticket`.
    #[serde(default = "default_ticket_requests_per_minute")]
    pub ticket_requests_per_minute: u32,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub debug: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_ws_max_payload() -> usize {
    1024 * 1024
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_ticket_ttl_ms() -> u64 {
    60_000
}

fn default_max_kubeconfig_bytes() -> usize {
    128 * 1024
}

fn default_ticket_requests_per_minute() -> u32 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            ws_max_payload: default_ws_max_payload(),
            ws_heartbeat_interval_ms: default_heartbeat_interval_ms(),
            ws_auth_timeout_ms: default_auth_timeout_ms(),
            ws_ticket_ttl_ms: default_ticket_ttl_ms(),
            ws_ticket_max_kubeconfig_bytes: default_max_kubeconfig_bytes(),
            ws_allowed_origins: Vec::new(),
            ticket_requests_per_minute: default_ticket_requests_per_minute(),
            tls: TlsConfig::default(),
            debug: false,
        }
    }
}

impl GatewayConfig {
    /// Loads the config from `path`. A missing file yields the defaults;
    /// a present-but-invalid file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Whether a WebSocket upgrade with the given `Origin` header value is
    /// acceptable. An empty allowlist admits everything; a non-empty one
    /// requires an exact string match, so a missing header is rejected.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.ws_allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.ws_allowed_origins.iter().any(|allowed| allowed == origin),
            None => false,
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.cert_path.is_some() && self.tls.key_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = GatewayConfig::load(Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.ws_ticket_ttl_ms, 60_000);
        assert!(config.ws_allowed_origins.is_empty());
        assert!(!config.debug);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9000, "wsAuthTimeoutMs": 500}}"#).unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.ws_auth_timeout_ms, 500);
        assert_eq!(config.ws_max_payload, 1024 * 1024);
    }

    #[test]
    fn full_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "port": 8443,
                "wsMaxPayload": 65536,
                "wsHeartbeatIntervalMs": 5000,
                "wsAuthTimeoutMs": 2000,
                "wsTicketTtlMs": 30000,
                "wsTicketMaxKubeconfigBytes": 4096,
                "wsAllowedOrigins": ["https://console.example.com"],
                "ticketRequestsPerMinute": 10,
                "tls": {{"certPath": "/etc/tls/tls.crt", "keyPath": "/etc/tls/tls.key"}},
                "debug": true
            }}"#
        )
        .unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 8443);
        assert_eq!(config.ws_max_payload, 65536);
        assert_eq!(config.ws_allowed_origins, vec!["https://console.example.com"]);
        assert!(config.tls_enabled());
        assert!(config.debug);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"prot": 9000}}"#).unwrap();
        assert!(matches!(
            GatewayConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn empty_allowlist_admits_any_origin() {
        let config = GatewayConfig::default();
        assert!(config.origin_allowed(Some("https://anywhere.example")));
        assert!(config.origin_allowed(None));
    }

    #[test]
    fn allowlist_requires_exact_match() {
        let config = GatewayConfig {
            ws_allowed_origins: vec!["https://console.example.com".to_string()],
            ..GatewayConfig::default()
        };
        assert!(config.origin_allowed(Some("https://console.example.com")));
        assert!(!config.origin_allowed(Some("https://console.example.com/")));
        assert!(!config.origin_allowed(Some("https://evil.example.com")));
        assert!(!config.origin_allowed(None));
    }
}
