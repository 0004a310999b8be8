//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub federation: FederationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and per-connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind the WebSocket listener to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// This server's address as published in `client_list` and `server_hello`.
    #[serde(default = "default_address")]
    pub address: String,

    /// Interval between keep-alive pings on every connection.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Outbound frames buffered per connection before sends are dropped.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Hex-encoded Ed25519 secret for signing `server_hello`. A fresh key is
    /// generated when absent.
    #[serde(default)]
    pub server_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// How often each outbound peer link re-requests the peer's client list.
    #[serde(default = "default_refresh")]
    pub refresh_secs: u64,

    #[serde(default)]
    pub neighbours: Vec<NeighbourConfig>,
}

/// A server this one federates with.
#[derive(Debug, Clone, Deserialize)]
pub struct NeighbourConfig {
    /// The address the neighbour announces in its `server_hello`.
    pub address: String,

    /// WebSocket URL to dial. Defaults to `address`.
    #[serde(default)]
    pub url: Option<String>,

    /// Hex-encoded Ed25519 public key the neighbour signs `server_hello` with.
    pub public_key: String,
}

impl NeighbourConfig {
    pub fn dial_url(&self) -> &str {
        self.url.as_deref().unwrap_or(&self.address)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "olaf_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_listen() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_address() -> String {
    "ws://127.0.0.1:8001".to_string()
}

fn default_ping_interval() -> u64 {
    30
}

fn default_outbound_queue() -> usize {
    256
}

fn default_refresh() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            address: default_address(),
            ping_interval_secs: default_ping_interval(),
            outbound_queue: default_outbound_queue(),
            server_key: None,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh(),
            neighbours: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Parse a TOML document into a validated [`Config`].
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents)?;
    validate(&config)?;
    Ok(config)
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `OLAF_LISTEN` overrides `server.listen`
/// - `OLAF_ADDRESS` overrides `server.address`
/// - `OLAF_SERVER_KEY` overrides `server.server_key`
/// - `OLAF_LOG_LEVEL` overrides `logging.level`
/// - `OLAF_LOG_JSON` overrides `logging.json` (set to "true" to enable)
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(listen) = std::env::var("OLAF_LISTEN") {
        config.server.listen = listen;
    }
    if let Ok(address) = std::env::var("OLAF_ADDRESS") {
        config.server.address = address;
    }
    if let Ok(key) = std::env::var("OLAF_SERVER_KEY") {
        config.server.server_key = Some(key);
    }
    if let Ok(level) = std::env::var("OLAF_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("OLAF_LOG_JSON") {
        config.logging.json = json.eq_ignore_ascii_case("true");
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.address.trim().is_empty() {
        return Err(ConfigError::Invalid("server.address must not be empty".into()));
    }
    if config.server.outbound_queue == 0 {
        return Err(ConfigError::Invalid("server.outbound_queue must be at least 1".into()));
    }
    if config.federation.refresh_secs == 0 {
        return Err(ConfigError::Invalid("federation.refresh_secs must be at least 1".into()));
    }
    for neighbour in &config.federation.neighbours {
        if neighbour.address == config.server.address {
            return Err(ConfigError::Invalid(format!(
                "neighbour {} is this server's own address",
                neighbour.address
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8001");
        assert_eq!(config.server.address, "ws://127.0.0.1:8001");
        assert_eq!(config.server.ping_interval_secs, 30);
        assert_eq!(config.federation.refresh_secs, 10);
        assert!(config.federation.neighbours.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn neighbours_parse_with_url_fallback() {
        let config = parse_config(
            r#"
            [server]
            address = "ws://s1:8001"

            [[federation.neighbours]]
            address = "ws://s2:8002"
            public_key = "aa"

            [[federation.neighbours]]
            address = "s3"
            url = "ws://10.0.0.3:8003"
            public_key = "bb"
            "#,
        )
        .unwrap();

        let n = &config.federation.neighbours;
        assert_eq!(n.len(), 2);
        assert_eq!(n[0].dial_url(), "ws://s2:8002");
        assert_eq!(n[1].dial_url(), "ws://10.0.0.3:8003");
    }

    #[test]
    fn self_as_neighbour_rejected() {
        let err = parse_config(
            r#"
            [server]
            address = "ws://s1:8001"

            [[federation.neighbours]]
            address = "ws://s1:8001"
            public_key = "aa"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_queue_rejected() {
        assert!(parse_config("[server]\noutbound_queue = 0").is_err());
    }

    #[test]
    fn bad_toml_is_parse_error() {
        assert!(matches!(
            parse_config("[server\nlisten = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("olaf.toml");
        std::fs::write(&path, "[federation]\nrefresh_secs = 3\n").unwrap();

        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.federation.refresh_secs, 3);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.federation.refresh_secs, 10);
    }
}
