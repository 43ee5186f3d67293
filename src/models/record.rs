use std::fmt;

use tracing::info;

/// One endpoint of a proxied connection pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Upstream => "upstream",
        }
    }

    /// The endpoint on the other end of the relay
    pub fn peer(&self) -> Side {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a client request is proxied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Plain HTTP request relayed to the origin
    Forward,
    /// `CONNECT` byte tunnel
    Tunnel,
}

impl ProxyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Forward => "forward",
            ProxyMode::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Access line emitted for every admitted request
///
/// Renders as `ALLOWED <METHOD> |<hostname>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub mode: ProxyMode,
    pub method: String,
    pub hostname: String,
}

impl AccessRecord {
    pub fn new(mode: ProxyMode, method: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            mode,
            method: method.into(),
            hostname: hostname.into(),
        }
    }

    /// Write the access line to the log
    pub fn emit(&self) {
        info!(mode = %self.mode, "{}", self);
    }
}

impl fmt::Display for AccessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ALLOWED {} |{}", self.method, self.hostname)
    }
}
