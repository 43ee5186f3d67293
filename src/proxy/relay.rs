//! Connection supervision for paired client/upstream sockets
//!
//! Relays bytes in both directions and tears down both endpoints as soon as
//! either one finishes or fails. There is no half-open state.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, error, instrument};

use crate::error::ProxyError;
use crate::models::Side;

/// How a relay ended
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes read from the client for the upstream
    pub client_to_upstream: u64,
    /// Bytes read from the upstream for the client
    pub upstream_to_client: u64,
    /// Endpoint whose close or failure ended the relay
    pub closed_by: Side,
    /// Socket error that ended the relay, if any
    pub error: Option<ProxyError>,
}

/// Owns one client/upstream pair for the lifetime of a relay
pub struct ConnectionSupervisor;

impl ConnectionSupervisor {
    /// Relay bytes between `client` and `upstream` until either side ends
    ///
    /// End-of-stream is propagated to the opposite writer, then both sockets
    /// are shut down and dropped together.
    #[instrument(skip(client, upstream))]
    pub async fn relay<C, U>(client: C, upstream: U) -> RelayOutcome
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let mut client_to_upstream = 0u64;
        let mut upstream_to_client = 0u64;

        let ended = tokio::select! {
            ended = pump(&mut client_read, &mut upstream_write, Side::Client, &mut client_to_upstream) => ended,
            ended = pump(&mut upstream_read, &mut client_write, Side::Upstream, &mut upstream_to_client) => ended,
        };

        // The other direction was cancelled above; release both endpoints.
        let _ = upstream_write.shutdown().await;
        let _ = client_write.shutdown().await;

        let (closed_by, error) = match ended {
            Ok(side) => (side, None),
            Err(e) => (e.side().unwrap_or(Side::Client), Some(e)),
        };

        if let Some(e) = &error {
            log_socket_error(e);
        }

        debug!(
            client_to_upstream,
            upstream_to_client,
            closed_by = %closed_by,
            "Relay closed"
        );

        RelayOutcome {
            client_to_upstream,
            upstream_to_client,
            closed_by,
            error,
        }
    }
}

/// Copy `from`'s reads into the peer's writer until EOF or error
///
/// `tokio::io::copy` only writes once the destination accepts the bytes, so
/// a slow reader pauses the producer. Read failures are charged to `from`,
/// write failures to its peer.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Side,
    copied: &mut u64,
) -> Result<Side, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = TrackedReader {
        inner: reader,
        read: copied,
        failed: false,
    };

    match tokio::io::copy(&mut reader, writer).await {
        Ok(_) => {
            writer
                .shutdown()
                .await
                .map_err(|e| ProxyError::io(from.peer(), e))?;
            Ok(from)
        }
        Err(e) if reader.failed => Err(ProxyError::io(from, e)),
        Err(e) => Err(ProxyError::io(from.peer(), e)),
    }
}

/// Reader that counts bytes as they arrive and remembers read failures
struct TrackedReader<'a, R> {
    inner: &'a mut R,
    read: &'a mut u64,
    failed: bool,
}

impl<R: AsyncRead + Unpin> AsyncRead for TrackedReader<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        match Pin::new(&mut *this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                *this.read += (buf.filled().len() - before) as u64;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.failed = true;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Log a per-connection socket error with its originating side
pub fn log_socket_error(err: &ProxyError) {
    match err.side() {
        Some(Side::Client) => error!(side = %Side::Client, error = %err, "Client socket error"),
        Some(Side::Upstream) => {
            error!(side = %Side::Upstream, error = %err, "Server socket error")
        }
        None => error!(error = %err, "Connection error"),
    }
}
