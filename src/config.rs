use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_SSE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub page_size: Option<usize>,
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub sse_buffer: usize,
    pub log_directive: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be a positive integer")]
    InvalidNumber(&'static str),
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 8080,
            page_size: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            sse_buffer: DEFAULT_SSE_BUFFER,
            log_directive: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parses configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let bind_addr = value("BIND_ADDR").unwrap_or(defaults.bind_addr);
        let bind_port = value("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(defaults.bind_port);
        let page_size = value("MCP_PAGE_SIZE")
            .map(|value| positive("MCP_PAGE_SIZE", &value))
            .transpose()?;
        let request_timeout = value("MCP_REQUEST_TIMEOUT_SECS")
            .map(|value| positive("MCP_REQUEST_TIMEOUT_SECS", &value))
            .transpose()?
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(defaults.request_timeout);
        let max_body_bytes = value("MCP_MAX_BODY_BYTES")
            .map(|value| positive("MCP_MAX_BODY_BYTES", &value))
            .transpose()?
            .unwrap_or(defaults.max_body_bytes);
        let sse_buffer = value("MCP_SSE_BUFFER")
            .map(|value| positive("MCP_SSE_BUFFER", &value))
            .transpose()?
            .unwrap_or(defaults.sse_buffer);
        let log_directive = value("MCP_LOG").unwrap_or(defaults.log_directive);

        let config = Self {
            bind_addr,
            bind_port,
            page_size,
            request_timeout,
            max_body_bytes,
            sse_buffer,
            log_directive,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .ok()
        .filter(|number| *number > 0)
        .ok_or(ConfigError::InvalidNumber(key))
}
