//! Server configuration loading.
//!
//! TOML is the sole config source; every field has a default so an empty
//! document is a valid config.
//!
//! ```toml
//! host = "127.0.0.1"
//! web_port = 8080
//! rpc_port = 8081
//! data_maxsize = 102400
//! limit_heartbeat_interval_ms = 1000
//! workers = 0
//!
//! [auth]
//! username = "utranhost"
//! password = "utranhost"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use ut_protocol::codec::DEFAULT_MAX_SIZE;

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// HTTP + WebSocket endpoint port. 0 binds an ephemeral port.
    pub web_port: u16,
    /// Raw-stream endpoint port. 0 binds an ephemeral port.
    pub rpc_port: u16,
    /// Payload cap enforced by the frame decoder.
    pub data_maxsize: usize,
    /// Two PINGs closer together than this drop the connection.
    pub limit_heartbeat_interval: Duration,
    /// Worker-pool size for offloaded methods; 0 disables the pool.
    pub workers: usize,
    /// Basic-auth gate for the WebSocket handshake; `None` admits everyone.
    pub auth: Option<BasicAuth>,
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            web_port: 8080,
            rpc_port: 8081,
            data_maxsize: DEFAULT_MAX_SIZE,
            limit_heartbeat_interval: Duration::from_secs(1),
            workers: 0,
            auth: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    host: Option<String>,
    web_port: Option<u16>,
    rpc_port: Option<u16>,
    data_maxsize: Option<usize>,
    limit_heartbeat_interval_ms: Option<u64>,
    workers: Option<usize>,
    auth: Option<RawAuth>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    username: Option<String>,
    password: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = ServerConfig::default();

    let auth = match raw.auth {
        None => None,
        Some(raw_auth) => {
            let username = raw_auth
                .username
                .ok_or_else(|| ConfigError::Invalid("auth.username is required".to_owned()))?;
            let password = raw_auth
                .password
                .ok_or_else(|| ConfigError::Invalid("auth.password is required".to_owned()))?;
            Some(BasicAuth { username, password })
        }
    };

    let config = ServerConfig {
        host: raw.host.unwrap_or(defaults.host),
        web_port: raw.web_port.unwrap_or(defaults.web_port),
        rpc_port: raw.rpc_port.unwrap_or(defaults.rpc_port),
        data_maxsize: raw.data_maxsize.unwrap_or(defaults.data_maxsize),
        limit_heartbeat_interval: raw
            .limit_heartbeat_interval_ms
            .map_or(defaults.limit_heartbeat_interval, Duration::from_millis),
        workers: raw.workers.unwrap_or(defaults.workers),
        auth,
    };

    if config.web_port != 0 && config.web_port == config.rpc_port {
        return Err(ConfigError::Invalid(
            "web_port and rpc_port must differ".to_owned(),
        ));
    }
    if config.data_maxsize == 0 {
        return Err(ConfigError::Invalid(
            "data_maxsize must be positive".to_owned(),
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = load_config_from_str("").expect("defaults");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.web_port, 8080);
        assert_eq!(config.rpc_port, 8081);
        assert_eq!(config.data_maxsize, DEFAULT_MAX_SIZE);
        assert_eq!(config.limit_heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.workers, 0);
        assert!(config.auth.is_none());
    }

    #[test]
    fn full_document_round_trips() {
        let config = load_config_from_str(
            r#"
            host = "0.0.0.0"
            web_port = 9000
            rpc_port = 9001
            data_maxsize = 4096
            limit_heartbeat_interval_ms = 250
            workers = 4

            [auth]
            username = "svc"
            password = "secret"
            "#,
        )
        .expect("config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.workers, 4);
        assert_eq!(config.limit_heartbeat_interval, Duration::from_millis(250));
        let auth = config.auth.expect("auth");
        assert_eq!(auth.username, "svc");
        assert_eq!(auth.password, "secret");
    }

    #[test]
    fn partial_auth_is_rejected() {
        let err = load_config_from_str("[auth]\nusername = \"svc\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn clashing_ports_are_rejected() {
        let err = load_config_from_str("web_port = 9000\nrpc_port = 9000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
