//! Proxy server implementation
//!
//! This module provides the proxy server functionality including:
//! - Target resolution for forward and CONNECT requests
//! - Plain HTTP forwarding to the origin
//! - CONNECT tunnels with opaque byte relaying
//! - Listener lifecycle with graceful draining

pub mod handler;
pub mod relay;
pub mod server;
pub mod target;
pub mod transport;
pub mod tunnel;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};

pub use handler::{ForwardHandler, ForwardHandlerConfig};
pub use relay::{ConnectionSupervisor, RelayOutcome};
pub use server::{ListenerState, ProxyListener, ShutdownHandle};
pub use target::{ForwardTarget, TargetError, TargetResolver, TunnelTarget};
pub use transport::ProxyTransport;
pub use tunnel::{PendingTunnel, TunnelHandler};

/// Response body type produced by the proxy service
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Empty response body
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
