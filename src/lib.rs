//! Zeoxy - Forward HTTP Proxy
//!
//! A small forward proxy built on tokio and hyper.
//!
//! ## Features
//!
//! - Plain HTTP forwarding with streamed request and response bodies
//! - `CONNECT` tunnels relaying opaque bytes (typically TLS)
//! - Paired teardown: either endpoint closing releases the other
//! - Explicit listener lifecycle with graceful draining

pub mod config;
pub mod error;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{ProxyError, Result};
