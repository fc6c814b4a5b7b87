//! Pairing WebSocket server.
//!
//! Listens on a TCP port and upgrades every connection to WebSocket.
//! Operators and observers share the endpoint; there is no limit on the
//! number of concurrent clients.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use credlink_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::{self, ClientConnection, ConnectionId};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }
}

/// The pairing WebSocket server.
pub struct PairingServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    connections: Mutex<HashMap<ConnectionId, ClientConnection>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> PairingServer<H> {
    pub fn new(config: ServerConfig, handler: Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
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

    /// Number of clients whose socket is still open.
    pub async fn connection_count(&self) -> usize {
        let mut conns = self.connections.lock().await;
        conns.retain(|_, conn| conn.sender().is_connected());
        conns.len()
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until cancellation.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Err(ServerError::ShuttingDown);
        }
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("pairing server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    for (_, conn) in self.connections.lock().await.drain() {
                        conn.close();
                    }
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
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

    /// Upgrades one TCP connection and starts its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(conn = id, %peer_addr, "WebSocket connection established");

        let conn = connection::spawn_connection(
            ws_stream,
            id,
            peer_addr,
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );

        let mut conns = self.connections.lock().await;
        if self.cancel.is_cancelled() {
            conn.close();
            return Err(ServerError::ShuttingDown);
        }
        conns.retain(|_, c| c.sender().is_connected());
        conns.insert(id, conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite;

    use super::*;
    use crate::connection::Sender;
    use crate::handler::HandlerFuture;
    use credlink_protocol::MessageType;
    use credlink_protocol::envelope::Message;

    /// Answers `start_pairing` with an empty acknowledgment.
    struct EchoHandler;

    impl Handler for EchoHandler {
        fn on_start_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                let _ = sender.send_msg(
                    msg.reply(MessageType::PairingStarted, Option::<&()>::None)
                        .unwrap(),
                );
            })
        }
    }

    async fn running_server() -> (Arc<PairingServer<EchoHandler>>, tokio::task::JoinHandle<()>, String) {
        let server = PairingServer::new(ServerConfig::default(), Arc::new(EchoHandler));
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        let mut port = 0;
        for _ in 0..100 {
            port = server.port().await;
            if port > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0, "should have bound to a dynamic port");
        (server, handle, format!("ws://127.0.0.1:{port}"))
    }

    async fn next_message<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("reply timed out")
                .expect("socket closed")
                .unwrap();
            if let tungstenite::Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_json<S>(ws: &mut S, value: serde_json::Value)
    where
        S: futures_util::Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    {
        ws.send(tungstenite::Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, _) = running_server().await;
        assert_eq!(server.connection_count().await, 0);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn serves_many_clients() {
        let (server, handle, url) = running_server().await;

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        send_json(&mut a, serde_json::json!({"id": "a-1", "type": "ping"})).await;
        send_json(&mut b, serde_json::json!({"id": "b-1", "type": "ping"})).await;

        let pong_a = next_message(&mut a).await;
        let pong_b = next_message(&mut b).await;
        assert_eq!((pong_a.id.as_str(), pong_a.msg_type), ("a-1", MessageType::Pong));
        assert_eq!((pong_b.id.as_str(), pong_b.msg_type), ("b-1", MessageType::Pong));
        let mut count = 0;
        for _ in 0..100 {
            count = server.connection_count().await;
            if count == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count, 2);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dispatches_and_rejects_unknown() {
        let (server, handle, url) = running_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        send_json(&mut ws, serde_json::json!({"id": "s-1", "type": "start_pairing"})).await;
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.msg_type, MessageType::PairingStarted);

        // Handled by the default `not implemented` body.
        send_json(&mut ws, serde_json::json!({"id": "w-1", "type": "watch"})).await;
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.error.unwrap().code, 501);

        send_json(&mut ws, serde_json::json!({"id": "x-1", "type": "reboot"})).await;
        let reply = next_message(&mut ws).await;
        assert_eq!(reply.id, "x-1");
        assert_eq!(reply.error.unwrap().code, 501);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_clients() {
        let (server, handle, url) = running_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        send_json(&mut ws, serde_json::json!({"id": "p", "type": "ping"})).await;
        next_message(&mut ws).await;

        server.shutdown();
        handle.await.unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    None | Some(Err(_)) | Some(Ok(tungstenite::Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(end.is_ok(), "client should see the socket close");
    }
}
