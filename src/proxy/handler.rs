//! Forward-mode request handler
//!
//! Relays plain HTTP requests to the origin named in the request URL and
//! streams the origin's response back unchanged.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder as ClientBuilder;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};

use crate::error::{ProxyError, Result};
use crate::models::{AccessRecord, ProxyMode, Side};
use crate::proxy::target::{format_tcp_addr, ForwardTarget, TargetResolver};
use crate::proxy::transport::ProxyTransport;
use crate::proxy::tunnel::{PendingTunnel, TunnelHandler};
use crate::proxy::ProxyBody;

/// Configuration for the forward handler
#[derive(Debug, Clone)]
pub struct ForwardHandlerConfig {
    /// Port dialed on the origin for every forwarded request
    pub upstream_port: u16,
}

impl Default for ForwardHandlerConfig {
    fn default() -> Self {
        Self { upstream_port: 80 }
    }
}

/// Forward-mode request handler
pub struct ForwardHandler {
    config: ForwardHandlerConfig,
    tunnel: Arc<TunnelHandler>,
}

impl ForwardHandler {
    pub fn new(config: ForwardHandlerConfig, tunnel: Arc<TunnelHandler>) -> Self {
        Self { config, tunnel }
    }

    /// Handle one request read by the HTTP/1 server
    ///
    /// An error return makes hyper close the client connection without
    /// writing a response. A `CONNECT` on a kept-alive connection answers
    /// 200 and queues its tunnel on `tunnels` for the connection task.
    #[instrument(skip(self, req, tunnels), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        tunnels: &mpsc::UnboundedSender<PendingTunnel>,
    ) -> Result<Response<ProxyBody>> {
        if req.method() == Method::CONNECT {
            let (response, tunnel) = self.tunnel.handle_upgrade(req).await?;
            if tunnels.send(tunnel).is_err() {
                return Err(ProxyError::Http("connection closed before tunnel start".into()));
            }
            return Ok(response);
        }

        self.handle_http(req).await
    }

    async fn handle_http(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let target = TargetResolver::forward(req.uri()).inspect_err(|e| {
            debug!("Not forwarding request: {}", e);
        })?;

        AccessRecord::new(ProxyMode::Forward, req.method().as_str(), target.hostname.clone())
            .emit();

        let addr = format_tcp_addr(&target.hostname, self.config.upstream_port);
        let stream = ProxyTransport::connect(&addr)
            .await
            .inspect_err(log_request_error)?;

        let (mut sender, conn) = ClientBuilder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(upstream_error)
            .inspect_err(log_request_error)?;

        // Ends once the response body is finished or dropped
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let request = Self::upstream_request(req, &target)?;
        let response = sender
            .send_request(request)
            .await
            .map_err(upstream_error)
            .inspect_err(log_request_error)?;

        Ok(response.map(|body| {
            body.map_err(|e| {
                error!(side = %Side::Upstream, error = %e, "HTTP server response error");
                e
            })
            .boxed()
        }))
    }

    /// Rewrite the request into origin-form, leaving method, headers and body untouched
    fn upstream_request(
        req: Request<Incoming>,
        target: &ForwardTarget,
    ) -> Result<Request<BoxBody<Bytes, hyper::Error>>> {
        let (mut parts, body) = req.into_parts();

        parts.uri = target
            .path
            .parse::<Uri>()
            .map_err(|e| ProxyError::Http(format!("invalid upstream path: {}", e)))?;

        let body = body
            .map_err(|e| {
                error!(side = %Side::Client, error = %e, "HTTP client request error");
                e
            })
            .boxed();

        Ok(Request::from_parts(parts, body))
    }
}

fn upstream_error(err: hyper::Error) -> ProxyError {
    ProxyError::io(Side::Upstream, std::io::Error::other(err))
}

fn log_request_error(err: &ProxyError) {
    error!(side = %Side::Upstream, error = %err, "HTTP server request error");
}
