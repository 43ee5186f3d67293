//! Target resolution for forward and tunnel requests
//!
//! Extracts the destination from a request URL or a `CONNECT` authority.
//! No DNS lookups happen here; an unresolvable host fails at connect time.

use hyper::Uri;
use thiserror::Error;

/// Why a request target could not be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("missing host in '{0}'")]
    MissingHost(String),

    #[error("missing port in '{0}'")]
    MissingPort(String),

    #[error("invalid port '{port}' in '{authority}'")]
    InvalidPort { authority: String, port: String },

    #[error("invalid authority '{0}'")]
    InvalidAuthority(String),
}

/// Destination of a forward-mode request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub hostname: String,
    /// Path and query sent upstream, `/` when the URL has none
    pub path: String,
}

/// Destination of a `CONNECT` tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    /// `host:port` suitable for dialing, with IPv6 hosts bracketed
    pub fn addr(&self) -> String {
        format_tcp_addr(&self.host, self.port)
    }
}

/// Resolves request targets
pub struct TargetResolver;

impl TargetResolver {
    /// Resolve the destination of a forward-mode request from its URL
    pub fn forward(uri: &Uri) -> Result<ForwardTarget, TargetError> {
        let hostname = uri
            .host()
            .map(strip_brackets)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TargetError::MissingHost(uri.to_string()))?
            .to_ascii_lowercase();

        let path = match uri.path_and_query().map(|pq| pq.as_str()) {
            Some(pq) if pq.starts_with('/') => pq.to_string(),
            Some(pq) if pq.starts_with('?') => format!("/{}", pq),
            _ => "/".to_string(),
        };

        Ok(ForwardTarget { hostname, path })
    }

    /// Resolve a `CONNECT` authority (`host:port`)
    ///
    /// Both host and a non-zero numeric port are required. Userinfo before
    /// `@` is ignored.
    pub fn authority(authority: &str) -> Result<TunnelTarget, TargetError> {
        if authority.is_empty()
            || authority
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#'))
        {
            return Err(TargetError::InvalidAuthority(authority.to_string()));
        }

        let host_port = authority
            .rsplit_once('@')
            .map(|(_, hp)| hp)
            .unwrap_or(authority);

        let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| TargetError::InvalidAuthority(authority.to_string()))?;
            match after {
                "" => (host, None),
                _ => {
                    let port = after
                        .strip_prefix(':')
                        .ok_or_else(|| TargetError::InvalidAuthority(authority.to_string()))?;
                    (host, Some(port))
                }
            }
        } else {
            match host_port.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(TargetError::InvalidAuthority(authority.to_string()))
                }
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            }
        };

        if host.is_empty() {
            return Err(TargetError::MissingHost(authority.to_string()));
        }

        let port = match port {
            None | Some("") => return Err(TargetError::MissingPort(authority.to_string())),
            Some(port) => port,
        };

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0 && port.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| TargetError::InvalidPort {
                authority: authority.to_string(),
                port: port.to_string(),
            })?;

        Ok(TunnelTarget {
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Format a host and port for `TcpStream::connect`
pub fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
