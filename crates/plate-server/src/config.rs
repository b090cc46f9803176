//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PLATEGATE_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use plate_core::{FanoutConfig, GatewayConfig};
use plate_transport::{Credentials, ReconnectPolicy, TcpConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind the HTTP surface to.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Remote messaging server.
    #[serde(default)]
    pub xmpp: XmppConfig,

    #[serde(default)]
    pub typing: TypingConfig,

    #[serde(default)]
    pub encryption: EncryptionConfig,

    #[serde(default)]
    pub fanout: FanoutSection,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmppConfig {
    #[serde(default = "default_xmpp_host")]
    pub host: String,

    #[serde(default = "default_xmpp_port")]
    pub port: u16,

    /// Domain of every principal address.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Request stream compression when opening sessions.
    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin")]
    pub username: String,

    #[serde(default = "default_admin")]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connect and request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reconnect_delay")]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Delay before an automatic PAUSED follows COMPOSING.
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Secret the credential key is derived from.
    #[serde(default = "default_secret")]
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutSection {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    std::env::var("PLATEGATE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PLATEGATE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_xmpp_host() -> String {
    "127.0.0.1".to_string()
}

fn default_xmpp_port() -> u16 {
    5222
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_admin() -> String {
    "admin".to_string()
}

fn default_timeout() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    5_000
}

fn default_debounce() -> u64 {
    3_000
}

fn default_secret() -> String {
    std::env::var("PLATEGATE_SECRET").unwrap_or_else(|_| "change-me".to_string())
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            xmpp: XmppConfig::default(),
            typing: TypingConfig::default(),
            encryption: EncryptionConfig::default(),
            fanout: FanoutSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self {
            host: default_xmpp_host(),
            port: default_xmpp_port(),
            domain: default_domain(),
            compression: true,
            admin: AdminConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: default_admin(),
            password: default_admin(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_reconnect_delay(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
        }
    }
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_subscriptions_per_connection: default_max_subscriptions(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "plategate.toml",
            "/etc/plategate/plategate.toml",
            "~/.config/plategate/plategate.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Socket address of the HTTP surface.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Transport settings for principal and admin sessions.
    #[must_use]
    pub fn tcp(&self) -> TcpConfig {
        let timeout = Duration::from_millis(self.xmpp.connection.timeout_ms);
        TcpConfig {
            host: self.xmpp.host.clone(),
            port: self.xmpp.port,
            domain: self.xmpp.domain.clone(),
            compression: self.xmpp.compression,
            connect_timeout: timeout,
            request_timeout: timeout,
            reconnect: ReconnectPolicy {
                enabled: self.xmpp.connection.reconnect.enabled,
                delay: Duration::from_millis(self.xmpp.connection.reconnect.delay_ms),
            },
        }
    }

    #[must_use]
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            domain: self.xmpp.domain.clone(),
            admin: Credentials::new(
                self.xmpp.admin.username.as_str(),
                self.xmpp.admin.password.as_str(),
            ),
            debounce: Duration::from_millis(self.typing.debounce_ms),
            fanout: FanoutConfig {
                channel_capacity: self.fanout.channel_capacity,
                max_subscriptions_per_connection: self.fanout.max_subscriptions_per_connection,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.xmpp.port, 5222);
        assert_eq!(config.typing.debounce_ms, 3_000);
        assert!(config.xmpp.connection.reconnect.enabled);
        assert!(config.xmpp.compression);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [xmpp]
            host = "chat.fleet.local"
            domain = "fleet.local"
            compression = false

            [xmpp.admin]
            username = "root"
            password = "s3cret"

            [xmpp.connection]
            timeout_ms = 2500

            [xmpp.connection.reconnect]
            enabled = false
            delay_ms = 1000

            [typing]
            debounce_ms = 1500
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_addr().unwrap().port(), 9000);

        let tcp = config.tcp();
        assert_eq!(tcp.host, "chat.fleet.local");
        assert_eq!(tcp.port, 5222);
        assert!(!tcp.compression);
        assert_eq!(tcp.connect_timeout, Duration::from_millis(2500));
        assert!(!tcp.reconnect.enabled);

        let gateway = config.gateway();
        assert_eq!(gateway.domain, "fleet.local");
        assert_eq!(gateway.admin.username, "root");
        assert_eq!(gateway.debounce, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_bind_address() {
        let config = Config {
            host: "not an address".to_string(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }
}
