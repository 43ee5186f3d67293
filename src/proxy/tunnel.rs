//! CONNECT tunnel handling
//!
//! Opens the upstream connection, acknowledges the client and hands both
//! sockets to the [`ConnectionSupervisor`] for opaque relaying.

use bytes::Bytes;
use http::HeaderValue;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};
use crate::models::{AccessRecord, ClientRequest, ProxyMode, Side};
use crate::proxy::relay::{log_socket_error, ConnectionSupervisor, RelayOutcome};
use crate::proxy::target::{TargetResolver, TunnelTarget};
use crate::proxy::transport::ProxyTransport;
use crate::proxy::{empty, ProxyBody};

const ESTABLISHED_REASON: &[u8] = b"Connection Established";

/// Handles CONNECT tunnel requests
pub struct TunnelHandler {
    proxy_agent: String,
}

impl TunnelHandler {
    pub fn new(proxy_agent: impl Into<String>) -> Self {
        Self {
            proxy_agent: proxy_agent.into(),
        }
    }

    /// Exact bytes written to the client once the upstream is connected
    pub fn acknowledgment(&self) -> String {
        format!(
            "HTTP/1.1 200 Connection Established\r\nProxy-agent: {}\r\n\r\n",
            self.proxy_agent
        )
    }

    /// Tunnel a connection whose first request is `CONNECT`
    ///
    /// `leftover` holds bytes the client sent after the request head; they
    /// are delivered upstream before relaying starts. On an unresolvable
    /// authority or a failed upstream connect the client is closed without
    /// a response.
    #[instrument(skip(self, request, client, leftover), fields(target = %request.target))]
    pub async fn handle<C>(
        &self,
        request: &ClientRequest,
        mut client: C,
        leftover: Bytes,
    ) -> Result<RelayOutcome>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let target = match TargetResolver::authority(&request.target) {
            Ok(target) => target,
            Err(e) => {
                debug!("Rejecting CONNECT: {}", e);
                let _ = client.shutdown().await;
                return Err(e.into());
            }
        };

        let mut upstream = match self.connect(&request.method, &target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let _ = client.shutdown().await;
                return Err(e);
            }
        };

        if let Err(e) = client.write_all(self.acknowledgment().as_bytes()).await {
            let err = ProxyError::io(Side::Client, e);
            log_socket_error(&err);
            return Err(err);
        }

        if !leftover.is_empty() {
            if let Err(e) = upstream.write_all(&leftover).await {
                let err = ProxyError::io(Side::Upstream, e);
                log_socket_error(&err);
                let _ = client.shutdown().await;
                return Err(err);
            }
        }

        Ok(ConnectionSupervisor::relay(client, upstream).await)
    }

    /// Tunnel a `CONNECT` that arrived on a kept-alive HTTP connection
    ///
    /// The upstream is dialed before answering. The 200 response carries the
    /// `Connection Established` reason; the returned [`PendingTunnel`] relays
    /// once hyper hands over the upgraded connection and must be driven by
    /// the task serving that connection.
    #[instrument(skip(self, req), fields(uri = %req.uri()))]
    pub async fn handle_upgrade(
        &self,
        mut req: Request<Incoming>,
    ) -> Result<(Response<ProxyBody>, PendingTunnel)> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let target = TargetResolver::authority(&authority).inspect_err(|e| {
            debug!("Rejecting CONNECT: {}", e);
        })?;

        let upstream = self.connect(req.method().as_str(), &target).await?;

        let agent = HeaderValue::from_str(&self.proxy_agent)
            .map_err(|e| ProxyError::InvalidConfig(format!("invalid proxy agent: {}", e)))?;

        let response = Response::builder()
            .status(StatusCode::OK)
            .header("Proxy-agent", agent)
            .extension(ReasonPhrase::from_static(ESTABLISHED_REASON))
            .body(empty())
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        let pending = PendingTunnel {
            on_upgrade: hyper::upgrade::on(&mut req),
            upstream,
        };

        Ok((response, pending))
    }

    /// Relay an upgraded client connection to an already connected upstream
    pub async fn handle_upgraded(upgraded: Upgraded, upstream: TcpStream) -> RelayOutcome {
        // Wrap Upgraded with TokioIo to get tokio AsyncRead/AsyncWrite traits
        let client = TokioIo::new(upgraded);
        ConnectionSupervisor::relay(client, upstream).await
    }

    /// Dial the tunnel target, logging the access line only once connected
    async fn connect(&self, method: &str, target: &TunnelTarget) -> Result<TcpStream> {
        let upstream = ProxyTransport::connect(&target.addr())
            .await
            .inspect_err(log_socket_error)?;

        AccessRecord::new(ProxyMode::Tunnel, method, target.host.clone()).emit();
        Ok(upstream)
    }
}

/// Upstream connection waiting for hyper to release the client side
pub struct PendingTunnel {
    on_upgrade: OnUpgrade,
    upstream: TcpStream,
}

impl PendingTunnel {
    /// Wait for the upgrade, then relay until either side ends
    ///
    /// Returns `None` when the connection closed before the 200 response
    /// was written; the upstream is dropped in that case.
    pub async fn run(self) -> Option<RelayOutcome> {
        match self.on_upgrade.await {
            Ok(upgraded) => Some(TunnelHandler::handle_upgraded(upgraded, self.upstream).await),
            Err(e) => {
                debug!("CONNECT upgrade failed: {}", e);
                None
            }
        }
    }
}
