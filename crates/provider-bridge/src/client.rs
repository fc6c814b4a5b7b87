//! WebSocket client for the linking sidecar.
//!
//! Requests carry a UUID and are matched to their response by the read
//! pump. Anything the sidecar sends unprompted is handed out as a push.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use credlink_protocol::MessageType;
use credlink_protocol::constants::WS_MAX_MESSAGE_SIZE;
use credlink_protocol::envelope::Message;

use crate::error::BridgeError;
use crate::pumps;

pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

const WRITE_BUFFER: usize = 256;
const PUSH_BUFFER: usize = 64;

/// One WebSocket connection to the sidecar.
pub struct BridgeClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: PendingMap,
    request_timeout: Duration,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

impl BridgeClient {
    /// Connects and starts the pumps. Returns the client and the stream of
    /// pushes; the stream ends when the socket does.
    pub async fn connect(
        url: &str,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<Message>), BridgeError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        debug!(url = %url, "connected to link sidecar");

        let (write, read) = ws_stream.split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_BUFFER);
        let (push_tx, push_rx) = mpsc::channel(PUSH_BUFFER);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(pumps::write::write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(pumps::read::read_pump(
            read,
            pending.clone(),
            push_tx,
            write_tx.clone(),
            cancel.clone(),
        ));

        let client = Self {
            write_tx,
            pending,
            request_timeout,
            cancel,
            read_handle,
            write_handle,
        };
        Ok((client, push_rx))
    }

    /// Sends a request and waits for its response.
    pub async fn send_request<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, BridgeError> {
        let msg = Message::request(msg_type, payload)?;
        let id = msg.id.clone();
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(BridgeError::Closed);
        }

        let result = tokio::time::timeout(self.request_timeout, rx).await;
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => resp.into_result().map_err(|err| BridgeError::Sidecar {
                code: err.code,
                message: err.message,
            }),
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => Err(BridgeError::Timeout),
        }
    }

    /// Sends a message without waiting for a reply.
    pub async fn notify<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<(), BridgeError> {
        let msg = Message::request(msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| BridgeError::Closed)
    }

    /// Sends a close frame and stops the pumps.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
    }
}
