//! Process configuration.
//!
//! Loaded once from JSON (optionally overridden from the command line),
//! validated, then shared read-only through [`crate::context::Context`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Endpoint;
use crate::middleware::{self, MiddlewareKind};

pub const DEFAULT_KEY: &str = "__MUST_BE_CHANGED__";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_DNS_EXPIRE_SECS: u64 = 3600;
const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BALANCER_INTERVAL_SECS: u64 = 60;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("'host' must be provided")]
    MissingHost,
    #[error("'port' must be a natural number")]
    InvalidPort,
    #[error("'servers' must not be empty when provided")]
    EmptyServers,
    #[error("'servers' contains an invalid item: {0:?}")]
    InvalidServer(String),
    #[error("'key' must not be empty")]
    EmptyKey,
    #[error("'key' must be changed from the default value")]
    DefaultKey,
    #[error("unknown {kind} '{name}'")]
    UnknownStage { kind: MiddlewareKind, name: String },
    #[error("'redirect' must be empty or host:port, got {0:?}")]
    InvalidRedirect(String),
    #[error("'log_level' is not recognised: {0:?}")]
    InvalidLogLevel(String),
}

/// Which side of the tunnel this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Present and non-empty on the client side only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<String>>,
    pub key: String,
    #[serde(default = "default_frame")]
    pub frame: String,
    #[serde(default)]
    pub frame_params: String,
    #[serde(default = "default_crypto")]
    pub crypto: String,
    #[serde(default)]
    pub crypto_params: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub protocol_params: String,
    #[serde(default = "default_obfs")]
    pub obfs: String,
    #[serde(default)]
    pub obfs_params: String,
    /// `host:port` to relay failed server connections to, or empty.
    #[serde(default)]
    pub redirect: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_dns_expire")]
    pub dns_expire: u64,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_balancer_interval")]
    pub balancer_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_over_https: Option<String>,

    #[serde(skip)]
    endpoints: Vec<Endpoint>,
    #[serde(skip)]
    redirect_target: Option<Endpoint>,
}

fn default_frame() -> String {
    "origin".to_string()
}

fn default_crypto() -> String {
    "chacha20-poly1305".to_string()
}

fn default_protocol() -> String {
    "basic".to_string()
}

fn default_obfs() -> String {
    "none".to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_dns_expire() -> u64 {
    DEFAULT_DNS_EXPIRE_SECS
}

fn default_timeout() -> u64 {
    DEFAULT_DIAL_TIMEOUT_SECS
}

fn default_balancer_interval() -> u64 {
    DEFAULT_BALANCER_INTERVAL_SECS
}

impl Config {
    /// Minimal configuration; everything else takes its default.
    pub fn new(host: impl Into<String>, port: u16, key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            servers: None,
            key: key.into(),
            frame: default_frame(),
            frame_params: String::new(),
            crypto: default_crypto(),
            crypto_params: String::new(),
            protocol: default_protocol(),
            protocol_params: String::new(),
            obfs: default_obfs(),
            obfs_params: String::new(),
            redirect: String::new(),
            log_level: default_log_level(),
            dns_expire: DEFAULT_DNS_EXPIRE_SECS,
            timeout: DEFAULT_DIAL_TIMEOUT_SECS,
            balancer_interval: DEFAULT_BALANCER_INTERVAL_SECS,
            dns_over_https: None,
            endpoints: Vec::new(),
            redirect_target: None,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks every field and resolves the derived values. Must be called
    /// before the config is handed to a [`crate::context::Context`].
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        self.endpoints = match &self.servers {
            None => Vec::new(),
            Some(servers) if servers.is_empty() => return Err(ConfigError::EmptyServers),
            Some(servers) => servers
                .iter()
                .map(|s| Endpoint::parse(s).ok_or_else(|| ConfigError::InvalidServer(s.clone())))
                .collect::<Result<_, _>>()?,
        };

        if self.key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        if self.key == DEFAULT_KEY {
            return Err(ConfigError::DefaultKey);
        }

        for (kind, name) in [
            (MiddlewareKind::Frame, &self.frame),
            (MiddlewareKind::Crypto, &self.crypto),
            (MiddlewareKind::Protocol, &self.protocol),
            (MiddlewareKind::Obfs, &self.obfs),
        ] {
            if !middleware::is_supported(kind, name) {
                return Err(ConfigError::UnknownStage {
                    kind,
                    name: name.clone(),
                });
            }
        }

        self.redirect_target = if self.redirect.is_empty() {
            None
        } else {
            Some(
                Endpoint::parse(&self.redirect)
                    .ok_or_else(|| ConfigError::InvalidRedirect(self.redirect.clone()))?,
            )
        };

        if crate::logging::parse_level(&self.log_level).is_none() {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        Ok(self)
    }

    pub fn role(&self) -> Role {
        match &self.servers {
            Some(servers) if !servers.is_empty() => Role::Client,
            _ => Role::Server,
        }
    }

    pub fn is_server(&self) -> bool {
        self.role() == Role::Server
    }

    pub fn is_client(&self) -> bool {
        self.role() == Role::Client
    }

    /// Parsed remote servers, in configured order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Parsed redirect target; `None` disables the redirect policy.
    pub fn redirect_target(&self) -> Option<&Endpoint> {
        self.redirect_target.as_ref()
    }

    pub fn dns_expire(&self) -> Duration {
        Duration::from_secs(self.dns_expire)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn balancer_interval(&self) -> Duration {
        Duration::from_secs(self.balancer_interval.max(1))
    }

    /// Printable abstract of the running configuration, key redacted.
    pub fn summary(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("key".to_string(), serde_json::Value::String("<redacted>".into()));
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::new("localhost", 1080, "123")
    }

    #[test]
    fn test_rejects_missing_host() {
        let mut config = base();
        config.host = String::new();
        assert_eq!(config.validated().unwrap_err(), ConfigError::MissingHost);
    }

    #[test]
    fn test_rejects_zero_port() {
        let mut config = base();
        config.port = 0;
        assert_eq!(config.validated().unwrap_err(), ConfigError::InvalidPort);
    }

    #[test]
    fn test_rejects_empty_or_invalid_servers() {
        let mut config = base();
        config.servers = Some(vec![]);
        assert_eq!(config.validated().unwrap_err(), ConfigError::EmptyServers);

        let mut config = base();
        config.servers = Some(vec![String::new()]);
        assert!(matches!(
            config.validated().unwrap_err(),
            ConfigError::InvalidServer(_)
        ));
    }

    #[test]
    fn test_rejects_empty_and_default_key() {
        let mut config = base();
        config.key = String::new();
        assert_eq!(config.validated().unwrap_err(), ConfigError::EmptyKey);

        let mut config = base();
        config.key = DEFAULT_KEY.to_string();
        assert_eq!(config.validated().unwrap_err(), ConfigError::DefaultKey);
    }

    #[test]
    fn test_rejects_unknown_stage_names() {
        let mut config = base();
        config.frame = "xxx".to_string();
        assert!(matches!(
            config.validated().unwrap_err(),
            ConfigError::UnknownStage { kind: MiddlewareKind::Frame, .. }
        ));

        let mut config = base();
        config.obfs = "tls1.2_ticket".to_string();
        assert!(matches!(
            config.validated().unwrap_err(),
            ConfigError::UnknownStage { kind: MiddlewareKind::Obfs, .. }
        ));
    }

    #[test]
    fn test_rejects_redirect_without_port() {
        let mut config = base();
        config.redirect = "test.com".to_string();
        assert_eq!(
            config.validated().unwrap_err(),
            ConfigError::InvalidRedirect("test.com".to_string())
        );
    }

    #[test]
    fn test_role_follows_servers() {
        let config = base().validated().unwrap();
        assert_eq!(config.role(), Role::Server);
        assert!(config.endpoints().is_empty());

        let mut config = base();
        config.servers = Some(vec!["abc.com:443".to_string(), "1.2.3.4:8080".to_string()]);
        let config = config.validated().unwrap();
        assert_eq!(config.role(), Role::Client);
        assert_eq!(config.endpoints().len(), 2);
        assert_eq!(config.endpoints()[0], Endpoint::new("abc.com", 443));
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config = Config::from_json(
            r#"{"host": "localhost", "port": 1080, "key": "123", "redirect": "127.0.0.1:80"}"#,
        )
        .unwrap()
        .validated()
        .unwrap();
        assert_eq!(config.frame, "origin");
        assert_eq!(config.protocol, "basic");
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.dns_expire(), Duration::from_secs(3600));
        assert_eq!(config.redirect_target(), Some(&Endpoint::new("127.0.0.1", 80)));
    }

    #[test]
    fn test_summary_redacts_key() {
        let config = base().validated().unwrap();
        let summary = config.summary();
        assert_eq!(summary["host"], "localhost");
        assert_eq!(summary["port"], 1080);
        assert_eq!(summary["key"], "<redacted>");
    }
}
