//! Configuration module.
//!
//! Settings are read from a TOML file and then selectively overridden from
//! environment variables, so deployments can keep secrets out of the file.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Default config file looked up when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "courrier.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no mailbox configured")]
    NoMailbox,
}

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Relay endpoint shared by every mailbox
    pub smtp: SmtpConfig,

    /// RPC listener settings
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Flush cadence shared by every worker
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Optional AMQP intake
    #[serde(default)]
    pub amqp: Option<AmqpConfig>,

    /// One entry per mailbox key, in declaration order
    #[serde(default, rename = "mailbox")]
    pub mailboxes: Vec<MailboxConfig>,
}

/// SMTP relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tls: TlsMode,

    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

/// How the relay connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    #[default]
    Starttls,
    Tls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_bind")]
    pub bind: SocketAddr,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            bind: default_rpc_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between two salvos of the same worker
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl WorkerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
        }
    }
}

/// RabbitMQ intake settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AmqpConfig {
    pub url: String,

    #[serde(default = "default_amqp_queue")]
    pub queue: String,

    /// Routing keys look like `<routing_prefix>.<mailbox key>`
    #[serde(default = "default_routing_prefix")]
    pub routing_prefix: String,

    #[serde(default = "default_amqp_prefetch")]
    pub prefetch: u16,
}

/// One mailbox: its key, its spool directory and the identity it sends as.
#[derive(Debug, Clone, Deserialize)]
pub struct MailboxConfig {
    pub key: String,
    pub path: PathBuf,
    pub sender: SenderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout() -> u64 {
    10
}

fn default_rpc_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8025))
}

fn default_flush_interval() -> u64 {
    5
}

fn default_amqp_queue() -> String {
    "mailing".to_string()
}

fn default_routing_prefix() -> String {
    "mailing".to_string()
}

fn default_amqp_prefetch() -> u16 {
    32
}

impl Config {
    /// Parse a configuration document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        if config.mailboxes.is_empty() {
            return Err(ConfigError::NoMailbox);
        }
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Load the file named by `path`, falling back to `COURRIER_CONFIG` and
    /// then [`DEFAULT_CONFIG_PATH`], and apply environment overrides.
    pub fn from_env(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path
            .or_else(|| env::var("COURRIER_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = Self::load(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override selected settings from environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Some(bind) = parse_var("COURRIER_RPC_BIND") {
            self.rpc.bind = bind;
        }
        if let Ok(host) = env::var("SMTP_HOST") {
            self.smtp.host = host;
        }
        if let Some(port) = parse_var("SMTP_PORT") {
            self.smtp.port = port;
        }
        if let Ok(username) = env::var("SMTP_USERNAME") {
            self.smtp.username = Some(username);
        }
        if let Ok(password) = env::var("SMTP_PASSWORD") {
            self.smtp.password = Some(password);
        }
        if let Some(secs) = parse_var("FLUSH_INTERVAL_SECS") {
            self.worker.flush_interval_secs = secs;
        }
    }
}

/// Parse an environment variable, ignoring it with a warning when malformed.
fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid override value, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [smtp]
        host = "relay.example.com"
        port = 2525
        tls = "none"

        [rpc]
        bind = "0.0.0.0:9000"

        [[mailbox]]
        key = "test"
        path = "/tmp/courrier/test"
        sender = { address = "test@example.com", name = "Test" }

        [[mailbox]]
        key = "toto"
        path = "/tmp/courrier/toto"
        sender = { address = "toto@example.com" }
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.smtp.host, "relay.example.com");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.tls, TlsMode::None);
        assert_eq!(config.rpc.bind, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.worker.flush_interval(), Duration::from_secs(5));
        assert!(config.amqp.is_none());

        let keys: Vec<_> = config.mailboxes.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["test", "toto"]);
        assert_eq!(config.mailboxes[0].sender.name.as_deref(), Some("Test"));
        assert_eq!(config.mailboxes[1].sender.name, None);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml(
            r#"
            [smtp]
            host = "localhost"

            [[mailbox]]
            key = "k"
            path = "/tmp/k"
            sender = { address = "k@example.com" }

            [amqp]
            url = "amqp://localhost"
            "#,
        )
        .unwrap();

        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.smtp.tls, TlsMode::Starttls);
        assert_eq!(config.rpc.bind, default_rpc_bind());

        let amqp = config.amqp.unwrap();
        assert_eq!(amqp.queue, "mailing");
        assert_eq!(amqp.routing_prefix, "mailing");
        assert_eq!(amqp.prefetch, 32);
    }

    #[test]
    fn test_routing_prefix_is_independent_of_queue() {
        let config = Config::from_toml(
            r#"
            [smtp]
            host = "localhost"

            [[mailbox]]
            key = "k"
            path = "/tmp/k"
            sender = { address = "k@example.com" }

            [amqp]
            url = "amqp://localhost"
            queue = "courrier-submissions"
            "#,
        )
        .unwrap();

        let amqp = config.amqp.unwrap();
        assert_eq!(amqp.queue, "courrier-submissions");
        assert_eq!(amqp.routing_prefix, "mailing");
    }

    #[test]
    fn test_missing_sender_is_rejected() {
        let result = Config::from_toml(
            r#"
            [smtp]
            host = "localhost"

            [[mailbox]]
            key = "k"
            path = "/tmp/k"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_no_mailbox_is_rejected() {
        let result = Config::from_toml("[smtp]\nhost = \"localhost\"\n");
        assert!(matches!(result, Err(ConfigError::NoMailbox)));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let worker = WorkerConfig {
            flush_interval_secs: 0,
        };
        assert_eq!(worker.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_var() {
        env::set_var("COURRIER_TEST_PORT", "2526");
        assert_eq!(parse_var::<u16>("COURRIER_TEST_PORT"), Some(2526));
        env::set_var("COURRIER_TEST_PORT", "not-a-port");
        assert_eq!(parse_var::<u16>("COURRIER_TEST_PORT"), None);
        env::remove_var("COURRIER_TEST_PORT");
        assert_eq!(parse_var::<u16>("COURRIER_TEST_PORT"), None);
    }
}
