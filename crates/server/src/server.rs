//! Relay server.
//!
//! Listens on one TCP port. `GET /tunnel/{id}` is served as a plain HTTP
//! download; every other request is upgraded to a party WebSocket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;
use tunnelshare_protocol::constants::WS_MAX_MESSAGE_SIZE;
use tunnelshare_relay::ConnId;

use crate::ServerError;
use crate::connection;
use crate::download::{self, DownloadRequest};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// The relay server.
///
/// Every accepted WebSocket becomes a party connection with its own
/// [`ConnId`]; messages are dispatched to the provided [`Handler`].
pub struct RelayServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    next_conn: AtomicU64,
}

impl<H: Handler> RelayServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server and every party connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::debug!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Routes a fresh TCP connection to the download endpoint or the
    /// WebSocket upgrade.
    async fn handle_connection(
        self: &Arc<Self>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let head = match download::peek_head(&stream).await {
            Ok(head) => head,
            Err(e @ ServerError::BadRequest(_)) => {
                let _ = download::write_bad_request(&mut stream).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Some(tunnel_id) = head.tunnel_id() {
            let tunnel_id = tunnel_id.to_string();
            let mut consumed = vec![0u8; head.len];
            stream.read_exact(&mut consumed).await?;

            if head.method != "GET" {
                tracing::debug!(%peer_addr, method = %head.method, "tunnel request with wrong method");
                download::write_method_not_allowed(&mut stream).await?;
                stream.shutdown().await?;
                return Ok(());
            }

            let request = DownloadRequest::new(tunnel_id, peer_addr, stream);
            self.handler.on_download(request).await;
            return Ok(());
        }

        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        tracing::info!(%peer_addr, %conn, "WebSocket connection established");

        connection::spawn_connection(
            ws_stream,
            conn,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::connection::Sender;
    use crate::handler::HandlerFuture;
    use tunnelshare_protocol::envelope::Message;

    /// Minimal test handler.
    #[derive(Default)]
    struct TestHandler {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        identity_requests: AtomicUsize,
    }

    impl Handler for TestHandler {
        fn on_connect(&self, _conn: ConnId, _sender: Sender) -> HandlerFuture<'_> {
            self.connected.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_disconnect(&self, _conn: ConnId) -> HandlerFuture<'_> {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_identity_request(
            &self,
            _conn: ConnId,
            _sender: Sender,
            _msg: Message,
        ) -> HandlerFuture<'_> {
            self.identity_requests.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    async fn start() -> (Arc<RelayServer<TestHandler>>, tokio::task::JoinHandle<()>, u16) {
        let config = ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        };
        let server = RelayServer::new(config, TestHandler::default());
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let port = server.port().await;
        (server, handle, port)
    }

    async fn http(port: u16, request: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, port) = start().await;
        assert!(port > 0, "should have bound to a dynamic port");
        assert!(server.local_addr().await.is_some());

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn connect_and_disconnect_reach_handler_once() {
        let (server, handle, port) = start().await;

        let url = format!("ws://127.0.0.1:{port}/ws");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.handler().connected.load(Ordering::SeqCst), 1);

        drop(ws);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.handler().disconnected.load(Ordering::SeqCst), 1);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_dispatches_text_message() {
        let (server, handle, port) = start().await;

        let url = format!("ws://127.0.0.1:{port}");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let msg = serde_json::json!({"id": "test-1", "type": "identity_request"});
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.handler().identity_requests.load(Ordering::SeqCst), 1);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_message_gets_not_implemented() {
        let (server, handle, port) = start().await;

        let url = format!("ws://127.0.0.1:{port}");
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let msg = serde_json::json!({"id": "x-1", "type": "connect_accept"});
        ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();

        let reply = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended early: {other:?}"),
            }
        };
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["id"], "x-1");
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"]["code"], 501);

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn default_download_is_not_found() {
        let (server, handle, port) = start().await;

        let response = http(port, "GET /tunnel/NOPE HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("\r\n\r\nInvalid Tunnel"));
        assert_eq!(server.handler().connected.load(Ordering::SeqCst), 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn tunnel_route_rejects_other_methods() {
        let (server, handle, port) = start().await;

        let response = http(port, "POST /tunnel/ABC HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.contains("Allow: GET\r\n"));

        server.shutdown();
        handle.await.unwrap();
    }
}
