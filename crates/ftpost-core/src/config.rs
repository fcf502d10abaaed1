use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FtpostError, FtpostResult};

/// Top-level daemon configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpostConfig {
    pub daemon: DaemonConfig,
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub tls: TlsConfig,
    pub accounts: AccountsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Prometheus metrics + health endpoint (optional)
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Lower bound of the passive data port range (inclusive)
    pub passive_port_min: Option<u16>,
    /// Upper bound of the passive data port range (inclusive)
    pub passive_port_max: Option<u16>,
    /// IPv4 address advertised in PASV replies when behind NAT
    pub masquerade_address: Option<String>,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    /// Seconds a control connection may stay silent before it is closed
    pub idle_timeout_secs: u64,
    /// Seconds to wait for a data connection or for data on it
    pub data_timeout_secs: u64,
    pub banner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP(S) endpoint that receives one multipart POST per upload
    pub url: String,
    /// Bound on connect + send + response wait. Absent means no bound.
    pub timeout_secs: Option<u64>,
    /// Uploads larger than this are staged in a temporary file
    pub spool_threshold_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain; enables FTPS and makes TLS mandatory
    pub cert_path: Option<PathBuf>,
    /// PEM private key (defaults to cert_path for combined PEM files)
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// `name:record` entries, e.g. `alice:sha256:<hex>` or `bob:plain:pw`
    pub users: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
            metrics_addr: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: 2121,
            passive_port_min: None,
            passive_port_max: None,
            masquerade_address: None,
            max_connections: 256,
            max_connections_per_ip: 5,
            idle_timeout_secs: 300,
            data_timeout_secs: 300,
            banner: "ftpost ready.".into(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: None,
            spool_threshold_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Inclusive passive port range, if one is configured.
    pub fn passive_ports(&self) -> Option<(u16, u16)> {
        match (self.passive_port_min, self.passive_port_max) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        self.cert_path.is_some()
    }

    /// Key file to read: explicit `key_path`, else the certificate file.
    pub fn key_file(&self) -> Option<&PathBuf> {
        self.key_path.as_ref().or(self.cert_path.as_ref())
    }
}

impl FtpostConfig {
    /// Structural checks that serde cannot express. Account records and the
    /// relay URL are validated by the crates that consume them.
    pub fn validate(&self) -> FtpostResult<()> {
        if self.relay.url.trim().is_empty() {
            return Err(FtpostError::Config("relay.url is required".into()));
        }
        match (self.server.passive_port_min, self.server.passive_port_max) {
            (Some(lo), Some(hi)) if lo > hi => {
                return Err(FtpostError::Config(format!(
                    "passive port range is empty: {lo}-{hi}"
                )));
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(FtpostError::Config(
                    "passive_port_min and passive_port_max must be set together".into(),
                ));
            }
            _ => {}
        }
        if let Some(addr) = &self.server.masquerade_address {
            addr.parse::<std::net::Ipv4Addr>().map_err(|_| {
                FtpostError::Config(format!("masquerade_address is not an IPv4 address: {addr}"))
            })?;
        }
        if self.server.max_connections == 0 || self.server.max_connections_per_ip == 0 {
            return Err(FtpostError::Config(
                "connection limits must be greater than zero".into(),
            ));
        }
        if self.tls.key_path.is_some() && self.tls.cert_path.is_none() {
            return Err(FtpostError::Config(
                "tls.key_path is set but tls.cert_path is not".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"
metrics_addr = "127.0.0.1:9102"

[server]
listen_host = "127.0.0.1"
listen_port = 21
passive_port_min = 60000
passive_port_max = 60010
masquerade_address = "203.0.113.7"
max_connections = 10
max_connections_per_ip = 2
idle_timeout_secs = 60
banner = "hello"

[relay]
url = "https://intake.example.com/upload/"
timeout_secs = 30
spool_threshold_bytes = 1024

[tls]
cert_path = "/etc/ftpost/cert.pem"

[accounts]
users = ["alice:plain:secret", "bob:sha256:abcd"]
"#;
        let config: FtpostConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.metrics_addr.as_deref(), Some("127.0.0.1:9102"));
        assert_eq!(config.server.listen_port, 21);
        assert_eq!(config.server.passive_ports(), Some((60000, 60010)));
        assert_eq!(config.server.max_connections_per_ip, 2);
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.relay.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.relay.spool_threshold_bytes, 1024);
        assert!(config.tls.enabled());
        assert_eq!(
            config.tls.key_file(),
            Some(&PathBuf::from("/etc/ftpost/cert.pem"))
        );
        assert_eq!(config.accounts.users.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_defaults() {
        let config: FtpostConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.log_format, "text");
        assert_eq!(config.server.listen_host, "0.0.0.0");
        assert_eq!(config.server.listen_port, 2121);
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.server.max_connections_per_ip, 5);
        assert_eq!(config.relay.timeout(), None);
        assert!(!config.tls.enabled());
        assert!(config.accounts.users.is_empty());
    }

    #[test]
    fn test_validate_requires_relay_url() {
        let config: FtpostConfig = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("relay.url"));
    }

    #[test]
    fn test_validate_passive_range() {
        let mut config = FtpostConfig::default();
        config.relay.url = "http://localhost/".into();
        config.server.passive_port_min = Some(60010);
        config.server.passive_port_max = Some(60000);
        assert!(config.validate().is_err());

        config.server.passive_port_max = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_masquerade_address() {
        let mut config = FtpostConfig::default();
        config.relay.url = "http://localhost/".into();
        config.server.masquerade_address = Some("not-an-ip".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[relay]\nurl = \"http://127.0.0.1:8000/\"\n[accounts]\nusers = [\"a:plain:b\"]\n",
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let config: FtpostConfig = toml::from_str(&text).unwrap();
        assert_eq!(config.relay.url, "http://127.0.0.1:8000/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut config = FtpostConfig::default();
        config.relay.url = "http://localhost:8000/".into();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: FtpostConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.relay.url, parsed.relay.url);
        assert_eq!(config.server.listen_port, parsed.server.listen_port);
    }
}
