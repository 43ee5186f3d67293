//! Proxy listener
//!
//! Accepts client connections, classifies each one by its first request
//! method and dispatches it to the tunnel or forward path.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped --bind()--> Listening --shutdown--> Draining --all connections done--> Stopped
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::handler::{ForwardHandler, ForwardHandlerConfig};
use crate::proxy::transport::{read_request_head, PrefixedStream};
use crate::proxy::tunnel::{PendingTunnel, TunnelHandler};

const BANNER_RULE: &str = "================================================";

/// Listener lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Listening,
    Draining,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Stopped => "stopped",
            ListenerState::Listening => "listening",
            ListenerState::Draining => "draining",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requests an orderly shutdown of a running listener
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ListenerState>,
}

impl ShutdownHandle {
    /// Stop accepting connections and start draining
    ///
    /// Fails with [`ProxyError::NotRunning`] unless the listener is
    /// currently `Listening`.
    pub fn shutdown(&self) -> Result<()> {
        if *self.state_rx.borrow() != ListenerState::Listening {
            return Err(ProxyError::NotRunning);
        }
        self.shutdown_tx.send_replace(true);
        Ok(())
    }

    /// Wait until the listener reaches `Stopped`
    pub async fn stopped(&mut self) {
        let _ = self
            .state_rx
            .wait_for(|state| *state == ListenerState::Stopped)
            .await;
    }
}

/// Shared per-connection dependencies
#[derive(Clone)]
struct Dispatch {
    forward: Arc<ForwardHandler>,
    tunnel: Arc<TunnelHandler>,
    max_head_size: usize,
}

/// Proxy listener
pub struct ProxyListener {
    config: ProxyServerConfig,
    dispatch: Dispatch,
    listener: Option<TcpListener>,
    state_tx: watch::Sender<ListenerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyListener {
    /// Create a stopped listener
    pub fn new(config: ProxyServerConfig) -> Self {
        let tunnel = Arc::new(TunnelHandler::new(config.proxy_agent.clone()));
        let forward = Arc::new(ForwardHandler::new(
            ForwardHandlerConfig {
                upstream_port: config.forward_port,
            },
            tunnel.clone(),
        ));

        let (state_tx, _) = watch::channel(ListenerState::Stopped);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            dispatch: Dispatch {
                forward,
                tunnel,
                max_head_size: config.max_head_size,
            },
            config,
            listener: None,
            state_tx,
            shutdown_tx,
        }
    }

    /// Bind the listening socket and enter `Listening`
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.state() != ListenerState::Stopped {
            return Err(ProxyError::InvalidConfig(format!(
                "listener cannot bind while {}",
                self.state()
            )));
        }

        let addr = self.config.addr();
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            error!("Proxy server listener error: {}", source);
            ProxyError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;

        info!("Proxy server running on port: {}", local_addr.port());
        info!("{}", BANNER_RULE);
        info!("STATUS METHOD |URL");
        info!("{}", BANNER_RULE);

        self.shutdown_tx.send_replace(false);
        self.listener = Some(listener);
        self.state_tx.send_replace(ListenerState::Listening);

        Ok(local_addr)
    }

    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            state_rx: self.state_tx.subscribe(),
        }
    }

    /// Accept connections until shutdown, then drain and stop
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        let listener = self.listener.take().ok_or(ProxyError::NotRunning)?;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let dispatch = self.dispatch.clone();
                            let shutdown = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    dispatch,
                                    shutdown,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    break;
                }
            }
        }

        self.state_tx.send_replace(ListenerState::Draining);
        drop(listener);
        info!(
            in_flight = connections.len(),
            "Listener closed, draining connections"
        );

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("Connection task failed: {}", e);
            }
        }

        self.state_tx.send_replace(ListenerState::Stopped);
        info!("Proxy server stopped");
        Ok(())
    }

    /// Classify a connection by its first request and serve it
    async fn handle_connection(
        mut stream: TcpStream,
        client_addr: SocketAddr,
        dispatch: Dispatch,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let head = tokio::select! {
            head = read_request_head(&mut stream, dispatch.max_head_size) => head?,
            _ = shutdown_requested(&mut shutdown) => {
                debug!("Closing {} before first request during shutdown", client_addr);
                return Ok(());
            }
        };

        let Some(head) = head else {
            debug!("{} closed before sending a request", client_addr);
            return Ok(());
        };

        if head.request.is_connect() {
            let leftover = head.leftover();
            dispatch
                .tunnel
                .handle(&head.request, stream, leftover)
                .await?;
            return Ok(());
        }

        let stream = PrefixedStream::new(head.buffered, stream);
        Self::serve_http(stream, dispatch.forward, shutdown).await
    }

    /// Serve forward-mode exchanges on a kept-alive HTTP/1 connection
    ///
    /// A `CONNECT` on the connection ends HTTP serving; its tunnel then runs
    /// on this task so draining waits for it.
    async fn serve_http(
        stream: PrefixedStream<TcpStream>,
        handler: Arc<ForwardHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (tunnels_tx, mut tunnels) = mpsc::unbounded_channel::<PendingTunnel>();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let tunnels_tx = tunnels_tx.clone();
            async move { handler.handle(req, &tunnels_tx).await }
        });

        // No Date header: responses carry only what the origin sent
        let conn = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .auto_date_header(false)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown_requested(&mut shutdown) => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };

        while let Ok(tunnel) = tunnels.try_recv() {
            tunnel.run().await;
        }

        result.map_err(ProxyError::from)
    }
}

/// Resolves once shutdown has been requested or the listener is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&stop| stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Duration;

    fn test_config() -> ProxyServerConfig {
        ProxyServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            ..Default::default()
        }
    }

    async fn start(
        config: ProxyServerConfig,
    ) -> (SocketAddr, ShutdownHandle, tokio::task::JoinHandle<Result<()>>) {
        let mut listener = ProxyListener::new(config);
        let addr = listener.bind().await.unwrap();
        let handle = listener.shutdown_handle();
        let task = tokio::spawn(listener.run());
        (addr, handle, task)
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Origin that echoes everything back on its first connection
    async fn spawn_echo_origin() -> SocketAddr {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });
        addr
    }

    /// Origin answering one request with `ok` and keeping the socket open
    async fn spawn_keep_alive_origin() -> u16 {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            read_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            let _ = socket.read_to_end(&mut Vec::new()).await;
        });
        port
    }

    async fn read_head(socket: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// Open a kept-alive client connection and complete one forwarded GET on it
    async fn keep_alive_client(addr: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET http://127.0.0.1/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
            .await
            .unwrap();

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert!(!head.to_ascii_lowercase().contains("date:"), "{head}");

        let mut body = [0u8; 2];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"ok");
        client
    }

    #[tokio::test]
    async fn test_listener_state_transitions() {
        let mut listener = ProxyListener::new(test_config());
        assert_eq!(listener.state(), ListenerState::Stopped);

        let mut states = listener.subscribe();
        let mut handle = listener.shutdown_handle();
        assert!(matches!(handle.shutdown(), Err(ProxyError::NotRunning)));

        let addr = listener.bind().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.state(), ListenerState::Listening);
        assert_eq!(listener.local_addr(), Some(addr));

        let task = tokio::spawn(listener.run());
        handle.shutdown().unwrap();

        states
            .wait_for(|s| *s == ListenerState::Draining || *s == ListenerState::Stopped)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle.stopped())
            .await
            .expect("listener did not stop");
        task.await.unwrap().unwrap();

        // Listening socket is released
        assert!(TcpStream::connect(addr).await.is_err());
        assert!(matches!(handle.shutdown(), Err(ProxyError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bind_failure_stays_stopped() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut listener = ProxyListener::new(ProxyServerConfig {
            port,
            ..test_config()
        });
        let err = listener.bind().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert_eq!(listener.state(), ListenerState::Stopped);

        assert!(matches!(listener.run().await, Err(ProxyError::NotRunning)));
    }

    #[tokio::test]
    async fn test_connect_tunnel_end_to_end() {
        let origin_addr = spawn_echo_origin().await;
        let (addr, handle, task) = start(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", origin_addr).as_bytes())
            .await
            .unwrap();

        let expected = b"HTTP/1.1 200 Connection Established\r\nProxy-agent: zeoxy\r\n\r\n";
        let mut ack = vec![0u8; expected.len()];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack[..], &expected[..]);

        client.write_all(b"\x16\x03\x01 opaque").await.unwrap();
        let mut echo = [0u8; 10];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"\x16\x03\x01 opaque");

        // Draining waits for the tunnel to finish
        handle.shutdown().unwrap();
        drop(client);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener did not drain")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_port_closes_with_no_bytes() {
        let (addr, handle, task) = start(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT badtarget HTTP/1.1\r\nHost: badtarget\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap();
        assert!(buf.is_empty());

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_end_to_end() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = origin.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                socket.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            assert!(head.starts_with(b"GET /page HTTP/1.1\r\n"));
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope")
                .await
                .unwrap();
        });

        let (addr, handle, task) = start(ProxyServerConfig {
            forward_port: origin_port,
            ..test_config()
        })
        .await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET http://127.0.0.1:9/page HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
            .await
            .expect("response timed out")
            .unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\nnope"));

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_tunnels_are_isolated() {
        let mut origins = Vec::new();
        for tag in [b'a', b'b'] {
            let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
            origins.push(origin.local_addr().unwrap());
            tokio::spawn(async move {
                let (mut socket, _) = origin.accept().await.unwrap();
                let mut buf = [0u8; 1];
                while socket.read_exact(&mut buf).await.is_ok() {
                    socket.write_all(&[tag]).await.unwrap();
                }
            });
        }

        let (addr, handle, task) = start(test_config()).await;

        let mut clients = Vec::new();
        for origin in &origins {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", origin).as_bytes())
                .await
                .unwrap();
            let mut ack = vec![0u8; TunnelHandler::new("zeoxy").acknowledgment().len()];
            client.read_exact(&mut ack).await.unwrap();
            clients.push(client);
        }

        // The first tunnel stays idle while the second one is used
        let mut reply = [0u8; 3];
        clients[1].write_all(b"xyz").await.unwrap();
        clients[1].read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"bbb");

        clients[0].write_all(b"xyz").await.unwrap();
        clients[0].read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"aaa");

        handle.shutdown().unwrap();
        drop(clients);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener did not drain")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_draining() {
        let (addr, handle, task) = start(test_config()).await;

        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("idle connection blocked draining")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_upstream_refused_tunnel_closes_client() {
        let port = closed_port().await;
        let (addr, handle, task) = start(test_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port).as_bytes())
            .await
            .unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap();
        assert!(buf.is_empty());

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_connect_tunnel_is_drained() {
        let echo_addr = spawn_echo_origin().await;
        let forward_port = spawn_keep_alive_origin().await;

        let mut listener = ProxyListener::new(ProxyServerConfig {
            forward_port,
            ..test_config()
        });
        let addr = listener.bind().await.unwrap();
        let mut states = listener.subscribe();
        let handle = listener.shutdown_handle();
        let mut task = tokio::spawn(listener.run());

        let mut client = keep_alive_client(addr).await;
        client
            .write_all(format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", echo_addr).as_bytes())
            .await
            .unwrap();

        // hyper title-cases header names on this path
        let expected = "HTTP/1.1 200 Connection Established\r\nProxy-Agent: zeoxy\r\n\r\n";
        let mut ack = vec![0u8; expected.len()];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(String::from_utf8(ack).unwrap(), expected);

        let mut echo = [0u8; 4];
        client.write_all(b"ping").await.unwrap();
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        handle.shutdown().unwrap();
        states
            .wait_for(|s| *s == ListenerState::Draining)
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), &mut task)
                .await
                .is_err(),
            "listener stopped while the tunnel was open"
        );

        client.write_all(b"pong").await.unwrap();
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"pong");
        assert_eq!(*states.borrow(), ListenerState::Draining);

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener did not drain")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_connect_without_port_closes_silently() {
        let forward_port = spawn_keep_alive_origin().await;
        let (addr, handle, task) = start(ProxyServerConfig {
            forward_port,
            ..test_config()
        })
        .await;

        let mut client = keep_alive_client(addr).await;
        client
            .write_all(b"CONNECT badtarget HTTP/1.1\r\nHost: badtarget\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap();
        assert!(buf.is_empty(), "{:?}", String::from_utf8_lossy(&buf));

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_connect_upstream_refused_closes_silently() {
        let port = closed_port().await;
        let forward_port = spawn_keep_alive_origin().await;
        let (addr, handle, task) = start(ProxyServerConfig {
            forward_port,
            ..test_config()
        })
        .await;

        let mut client = keep_alive_client(addr).await;
        client
            .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port).as_bytes())
            .await
            .unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap();
        assert!(buf.is_empty(), "{:?}", String::from_utf8_lossy(&buf));

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }
}
