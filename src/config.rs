use crate::error::{ProxyError, Result};
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyServerConfig {
    /// Port for the proxy listener (required, 0 = OS-assigned)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Name advertised in the `Proxy-agent` header of tunnel acknowledgments
    pub proxy_agent: String,
    /// Upstream port for forward-mode requests (default: 80)
    pub forward_port: u16,
    /// Upper bound on the first request head of a connection
    pub max_head_size: usize,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            host: "0.0.0.0".to_string(),
            proxy_agent: DEFAULT_PROXY_AGENT.to_string(),
            forward_port: 80,
            max_head_size: DEFAULT_MAX_HEAD_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Some(LogFormat::Pretty),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

pub const DEFAULT_PROXY_AGENT: &str = "zeoxy";
pub const DEFAULT_MAX_HEAD_SIZE: usize = 64 * 1024;

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig::from_env()?,
            log: LogConfig::from_env()?,
        })
    }
}

impl ProxyServerConfig {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ProxyError::MissingEnvVar("PORT".into()))?;

        let proxy_agent = get_env_or("PROXY_AGENT", DEFAULT_PROXY_AGENT);
        if proxy_agent.is_empty() || http::HeaderValue::from_str(&proxy_agent).is_err() {
            return Err(ProxyError::InvalidConfig(
                "PROXY_AGENT must be a non-empty header value".into(),
            ));
        }

        Ok(ProxyServerConfig {
            port: port.trim().parse().map_err(|_| {
                ProxyError::InvalidConfig("PORT must be a valid port number".into())
            })?,
            host: get_env_or("PROXY_HOST", "0.0.0.0"),
            proxy_agent,
            forward_port: get_env_or("FORWARD_PORT", "80").parse().map_err(|_| {
                ProxyError::InvalidConfig("FORWARD_PORT must be a valid port number".into())
            })?,
            max_head_size: get_env_or("MAX_HEAD_SIZE", "65536")
                .parse()
                .ok()
                .filter(|size| *size > 0)
                .ok_or_else(|| {
                    ProxyError::InvalidConfig("MAX_HEAD_SIZE must be a positive number".into())
                })?,
        })
    }

    /// Address the listener binds to
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Result<Self> {
        let raw_format = get_env_or("LOG_FORMAT", "pretty");
        let format = LogFormat::from_str(&raw_format).ok_or_else(|| {
            ProxyError::InvalidConfig(format!("LOG_FORMAT has unsupported value: {}", raw_format))
        })?;

        Ok(LogConfig {
            level: get_env_or("LOG_LEVEL", "info"),
            format,
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
