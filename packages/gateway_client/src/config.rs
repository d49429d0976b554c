//! Engine configuration.
//!
//! The embedding application owns configuration sources (files, CLI, env);
//! this struct is just the handed-down values plus sane defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// `wss://` instead of `ws://`.
    pub tls: bool,
    /// Bearer token presented during the handshake. May be empty when the
    /// device already holds a device token.
    pub token: Option<String>,

    pub client_id: String,
    pub client_version: String,
    pub client_platform: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub locale: String,
    pub user_agent: String,
    pub min_protocol: u32,
    pub max_protocol: u32,

    /// Per-request wall-clock deadline.
    pub request_timeout: Duration,
    /// Fixed delay between reconnect attempts. No backoff, no ceiling.
    pub reconnect_delay: Duration,
    /// Page size for `chat.history`.
    pub history_limit: u32,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            tls: false,
            token: None,
            client_id: "gateway-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            client_platform: std::env::consts::OS.to_string(),
            client_mode: "ui".to_string(),
            role: "operator".to_string(),
            scopes: vec!["chat".to_string(), "sessions".to_string()],
            locale: "en-US".to_string(),
            user_agent: concat!("gateway-client/", env!("CARGO_PKG_VERSION")).to_string(),
            min_protocol: 1,
            max_protocol: 1,
            request_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            history_limit: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_scheme_follows_tls_flag() {
        let mut config = ClientConfig::new("gateway.local", 443);
        assert_eq!(config.url(), "ws://gateway.local:443");
        config.tls = true;
        assert_eq!(config.url(), "wss://gateway.local:443");
    }

    #[test]
    fn defaults_match_reference_cadence() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
    }
}
