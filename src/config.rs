//! Process configuration
//!
//! Loaded from a JSON file; every section is optional.

use anyhow::{bail, Context, Result};
use infinitoon_transport_quic::QuicConfig;
use infinitoon_tunnel::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Relay port used when nothing else is configured
pub const DEFAULT_RELAY_PORT: u16 = 54321;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// `development` turns on debug logging
    #[serde(default = "default_app_env")]
    pub app_env: String,

    #[serde(default)]
    pub server: Option<ServerConfig>,

    #[serde(default)]
    pub clients: Vec<ClientConfig>,

    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_app_name() -> String {
    "infinitoon".to_string()
}

fn default_app_env() -> String {
    "production".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_env: default_app_env(),
            server: None,
            clients: Vec::new(),
            logger: LoggerConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Any `EnvFilter` directive, e.g. `info` or `infinitoon_tunnel=debug`
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate served by the relay
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM private key matching `cert_path`
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Skip relay certificate verification on tunnel clients
    #[serde(default)]
    pub insecure: bool,
}

impl AppConfig {
    /// Load from `path`, or return the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.tls.cert_path, &self.tls.key_path) {
            (Some(_), None) => bail!("tls.cert_path is set but tls.key_path is missing"),
            (None, Some(_)) => bail!("tls.key_path is set but tls.cert_path is missing"),
            _ => {}
        }

        for client in &self.clients {
            client
                .validate()
                .with_context(|| format!("Invalid client {:?}", client.name))?;
        }

        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("development")
    }

    /// Log filter used unless `RUST_LOG` is set
    pub fn log_filter(&self, verbose: bool) -> String {
        if verbose || self.is_development() {
            "debug".to_string()
        } else {
            self.logger.level.clone()
        }
    }

    /// Relay endpoint, with `listen` (`host:port`) taking precedence
    pub fn relay_server(&self, listen: Option<&str>) -> Result<ServerConfig> {
        let mut server = self.server.clone().unwrap_or_else(|| {
            ServerConfig::new("relay server", "127.0.0.1", DEFAULT_RELAY_PORT)
        });

        if let Some(listen) = listen {
            let (host, port) = parse_host_port(listen)?;
            server.host = host;
            server.port = port;
        }

        Ok(server)
    }

    /// Tunnel clients; `relay` (`host:port`) re-targets every one of them
    pub fn tunnel_clients(&self, relay: Option<&str>) -> Result<Vec<ClientConfig>> {
        let mut clients = if self.clients.is_empty() {
            vec![ClientConfig::new(
                "tunnel client",
                "127.0.0.1",
                DEFAULT_RELAY_PORT,
            )]
        } else {
            self.clients.clone()
        };

        if let Some(relay) = relay {
            let (host, port) = parse_host_port(relay)?;
            for client in &mut clients {
                client.host = host.clone();
                client.port = port;
            }
        }

        Ok(clients)
    }
}

impl TlsConfig {
    /// Transport settings for the relay
    ///
    /// Without configured credentials an ephemeral self-signed certificate is
    /// generated, which only insecure clients accept.
    pub fn server_transport(&self) -> Result<QuicConfig> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => {
                QuicConfig::server_default(cert.clone(), key.clone())
                    .context("Failed to build relay TLS configuration")
            }
            _ => {
                warn!("No TLS certificate configured, using an ephemeral self-signed one");
                QuicConfig::server_ephemeral().context("Failed to generate relay certificate")
            }
        }
    }

    /// Transport settings for tunnel clients
    pub fn client_transport(&self) -> QuicConfig {
        if self.insecure {
            QuicConfig::client_insecure()
        } else {
            QuicConfig::client_default()
        }
    }
}

/// Split `host:port`; IPv6 hosts may be bracketed
pub fn parse_host_port(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("Expected host:port, got {:?}", value))?;

    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in {:?}", value))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("Missing host in {:?}", value);
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.app_name, "infinitoon");
        assert_eq!(config.logger.level, "info");
        assert!(!config.is_development());

        let server = config.relay_server(None).unwrap();
        assert_eq!((server.host.as_str(), server.port), ("127.0.0.1", 54321));

        let clients = config.tunnel_clients(None).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].port, 54321);
    }

    #[test]
    fn test_parse_full_document() {
        let json = r#"{
            "app_name": "edge-tunnel",
            "app_env": "development",
            "server": { "name": "relay server", "ip": "0.0.0.0", "port": 4433 },
            "clients": [
                { "name": "a", "ip": "relay.example.com", "port": 4433 },
                { "name": "b", "host": "10.0.0.2", "port": 4434, "heartbeat_interval": 15 }
            ],
            "logger": { "level": "warn" },
            "tls": { "insecure": true }
        }"#;

        let config: AppConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();

        assert_eq!(config.app_name, "edge-tunnel");
        assert_eq!(config.server.as_ref().unwrap().host, "0.0.0.0");
        assert_eq!(config.clients[0].host, "relay.example.com");
        assert_eq!(config.clients[1].heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.clients[1].retry_delay, Duration::from_secs(5));
        assert!(config.tls.insecure);

        // Development forces debug regardless of logger.level
        assert_eq!(config.log_filter(false), "debug");
    }

    #[test]
    fn test_log_filter() {
        let mut config = AppConfig::default();
        config.logger.level = "warn".to_string();
        assert_eq!(config.log_filter(false), "warn");
        assert_eq!(config.log_filter(true), "debug");
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig {
            clients: vec![
                ClientConfig::new("a", "10.0.0.1", 1),
                ClientConfig::new("b", "10.0.0.2", 2),
            ],
            ..Default::default()
        };

        let server = config.relay_server(Some("0.0.0.0:7000")).unwrap();
        assert_eq!((server.host.as_str(), server.port), ("0.0.0.0", 7000));

        let clients = config.tunnel_clients(Some("relay.local:9000")).unwrap();
        assert!(clients
            .iter()
            .all(|c| c.host == "relay.local" && c.port == 9000));
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("127.0.0.1:54321").unwrap(),
            ("127.0.0.1".to_string(), 54321)
        );
        assert_eq!(parse_host_port("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(parse_host_port("no-port").is_err());
        assert!(parse_host_port("host:http").is_err());
        assert!(parse_host_port(":80").is_err());
    }

    #[test]
    fn test_half_configured_tls_rejected() {
        let config = AppConfig {
            tls: TlsConfig {
                cert_path: Some("relay.crt".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("infinitoon-{}.json", uuid::Uuid::new_v4()));
        fs::write(&path, r#"{ "logger": { "level": "trace" } }"#).unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.logger.level, "trace");
        assert!(config.clients.is_empty());

        fs::remove_file(&path).unwrap();

        let err = AppConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_client_transport_security() {
        use infinitoon_transport::TransportConfig;

        let tls = TlsConfig::default();
        assert!(tls.client_transport().security_config().verify_server_cert);

        let tls = TlsConfig {
            insecure: true,
            ..Default::default()
        };
        assert!(!tls.client_transport().security_config().verify_server_cert);
    }
}
