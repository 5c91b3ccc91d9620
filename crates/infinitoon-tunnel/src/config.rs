//! Endpoint configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::TunnelError;

/// Delay between two dial attempts of a client
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Period of the client echo heartbeat
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

/// Outbound tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,

    /// Relay host name or IP address
    #[serde(alias = "ip")]
    pub host: String,

    pub port: u16,

    /// Name presented for TLS verification; `host` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default = "default_retry_delay", with = "secs")]
    pub retry_delay: Duration,

    #[serde(default = "default_heartbeat_interval", with = "secs")]
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            server_name: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Name the relay certificate is verified against
    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.heartbeat_interval.is_zero() {
            return Err(TunnelError::Configuration(format!(
                "client {}: heartbeat interval must be > 0",
                self.name
            )));
        }
        Ok(())
    }

    /// Resolve the relay address
    pub async fn resolve(&self) -> Result<SocketAddr, TunnelError> {
        resolve(&self.host, self.port).await
    }
}

/// Inbound relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,

    /// Listen address; `0.0.0.0` binds every interface
    #[serde(alias = "ip")]
    pub host: String,

    /// Listen port; 0 picks an ephemeral port
    pub port: u16,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub async fn resolve(&self) -> Result<SocketAddr, TunnelError> {
        resolve(&self.host, self.port).await
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TunnelError> {
    let target = format!("{}:{}", host, port);
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| TunnelError::Resolve(target.clone()))?
        .next()
        .ok_or(TunnelError::Resolve(target))
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"name":"edge","ip":"127.0.0.1","port":54321}"#).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.server_name, None);
        assert_eq!(config.tls_server_name(), "127.0.0.1");
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_server_name_follows_host() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"name":"a","ip":"relay.example.com","port":4433}"#).unwrap();
        assert_eq!(config.tls_server_name(), "relay.example.com");

        let pinned: ClientConfig = serde_json::from_str(
            r#"{"name":"a","host":"10.0.0.5","port":4433,"server_name":"relay.internal"}"#,
        )
        .unwrap();
        assert_eq!(pinned.tls_server_name(), "relay.internal");

        let built = ClientConfig::new("a", "relay.example.com", 4433);
        assert_eq!(built.tls_server_name(), "relay.example.com");
        assert_eq!(
            built.with_server_name("localhost").tls_server_name(),
            "localhost"
        );
    }

    #[test]
    fn test_client_config_durations_in_seconds() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"name":"edge","host":"relay","port":1,"retry_delay":2,"heartbeat_interval":30}"#,
        )
        .unwrap();

        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let config = ClientConfig::new("edge", "127.0.0.1", 1)
            .with_heartbeat_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(TunnelError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let config = ServerConfig::new("relay", "127.0.0.1", 54321);
        let addr = config.resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:54321".parse().unwrap());
    }
}
