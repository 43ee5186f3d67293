//! Transport helpers shared by the forward and tunnel paths
//!
//! Dials upstream targets and reads the first request head of a client
//! connection, keeping the bytes so they can be replayed to hyper.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};
use crate::models::ClientRequest;

const READ_CHUNK: usize = 4096;

/// Upstream dialer
pub struct ProxyTransport;

impl ProxyTransport {
    /// Open a raw TCP connection to `addr` (`host:port`)
    ///
    /// Name resolution happens here, so an unknown host surfaces as an
    /// upstream connect error.
    #[instrument]
    pub async fn connect(addr: &str) -> Result<TcpStream> {
        debug!("Connecting upstream to {}", addr);

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ProxyError::UpstreamConnect {
                target: addr.to_string(),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on upstream socket: {}", e);
        }

        Ok(stream)
    }
}

/// First request head of a connection plus every byte read so far
#[derive(Debug)]
pub struct RequestHead {
    pub request: ClientRequest,
    /// All bytes consumed from the socket, head included
    pub buffered: Bytes,
    /// Length of the head within `buffered`
    pub head_len: usize,
}

impl RequestHead {
    /// Bytes the client sent after the head
    pub fn leftover(&self) -> Bytes {
        self.buffered.slice(self.head_len..)
    }
}

/// Read until a complete request head is buffered
///
/// Returns `Ok(None)` when the peer closes before sending anything.
pub async fn read_request_head<S>(stream: &mut S, limit: usize) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK.min(limit));

    loop {
        if let Some((request, head_len)) = ClientRequest::parse(&buf)? {
            return Ok(Some(RequestHead {
                request,
                buffered: buf.freeze(),
                head_len,
            }));
        }

        if buf.len() >= limit {
            return Err(ProxyError::RequestHeadTooLarge { limit });
        }

        buf.reserve(READ_CHUNK.min(limit - buf.len()));
        let n = stream.read_buf(&mut buf).await.map_err(ProxyError::ClientIo)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::ClientIo(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid request head",
            )));
        }
    }
}

pin_project! {
    /// Client stream that yields already-consumed bytes before reading the socket
    #[derive(Debug)]
    pub struct PrefixedStream<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() && buf.remaining() > 0 {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
