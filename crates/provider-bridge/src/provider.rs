//! [`LinkProvider`] implementation over the sidecar bridge.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use credlink_pairing::{
    CloseReason, DeliveryReceipt, LinkProvider, LinkProviderFactory, ProviderConnection,
    ProviderError, ProviderEvent, ProviderFuture, SessionId, SessionStore,
};
use credlink_protocol::constants::WS_REQUEST_TIMEOUT;
use credlink_protocol::envelope::Message;
use credlink_protocol::messages::{
    ConnectionPhase, ConnectionUpdateEvent, CredsUpdateEvent, DeliveryReceiptResponse,
    IncomingMessageEvent, LinkBeginRequest, LinkBegunResponse, OutboundContent, QrEvent,
    SendMessageRequest, SessionRef,
};
use credlink_protocol::{CredentialArtifact, CredentialValue, MessageType};

use crate::client::BridgeClient;
use crate::error::BridgeError;

/// Fields required when the sidecar does not announce its own schema.
pub const DEFAULT_REQUIRED_FIELDS: &[&str] = &["me"];

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Sidecar WebSocket URL, e.g. `ws://127.0.0.1:9400/link`.
    pub url: String,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: WS_REQUEST_TIMEOUT,
        }
    }
}

/// Opens one sidecar connection per linking attempt.
pub struct BridgeProviderFactory {
    config: BridgeConfig,
}

impl BridgeProviderFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl LinkProviderFactory for BridgeProviderFactory {
    fn connect<'a>(
        &'a self,
        session_id: &'a SessionId,
        store: Arc<dyn SessionStore>,
    ) -> ProviderFuture<'a, Result<ProviderConnection, ProviderError>> {
        Box::pin(async move {
            let (client, pushes) =
                BridgeClient::connect(&self.config.url, self.config.request_timeout)
                    .await
                    .map_err(|e| ProviderError::Construction(e.to_string()))?;

            let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
            let closing = Arc::new(AtomicBool::new(false));
            let delivered = Arc::new(AtomicBool::new(false));
            tokio::spawn(forward_pushes(
                session_id.clone(),
                pushes,
                events_tx,
                store.clone(),
                closing.clone(),
                delivered.clone(),
            ));

            let provider = BridgeProvider {
                session_id: session_id.clone(),
                client,
                store,
                required: Mutex::new(None),
                closing,
                delivered,
            };
            Ok(ProviderConnection {
                provider: Arc::new(provider),
                events: events_rx,
            })
        })
    }
}

/// A live linking attempt on the sidecar.
pub struct BridgeProvider {
    session_id: SessionId,
    client: BridgeClient,
    store: Arc<dyn SessionStore>,
    /// Schema announced in `link_begun`.
    required: Mutex<Option<Vec<String>>>,
    closing: Arc<AtomicBool>,
    /// Set once the lineage's credential is delivered; stops staging.
    delivered: Arc<AtomicBool>,
}

impl BridgeProvider {
    fn staged_credentials(&self) -> Option<BTreeMap<String, CredentialValue>> {
        let document = match self.store.load(&self.session_id) {
            Ok(Some(document)) => document,
            Ok(None) => return None,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "failed to load staged credential");
                return None;
            }
        };
        match CredentialArtifact::from_document(&document) {
            Ok(artifact) if !artifact.fields.is_empty() => Some(artifact.fields),
            Ok(_) => None,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "staged credential unreadable");
                None
            }
        }
    }

    async fn link_begin(&self, identifier: Option<&str>) -> Result<Option<String>, BridgeError> {
        let req = LinkBeginRequest {
            session_id: self.session_id.to_string(),
            number: identifier.map(str::to_string),
            credentials: self.staged_credentials(),
        };
        let resp = self
            .client
            .send_request(MessageType::LinkBegin, Some(&req))
            .await?;
        let begun: LinkBegunResponse = resp.payload()?;

        if !begun.required_fields.is_empty() {
            *self.required.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(begun.required_fields);
        }
        debug!(
            session = %self.session_id,
            registered = begun.registered,
            "sidecar began linking"
        );
        Ok(if begun.registered { None } else { begun.code })
    }

    async fn send_message(
        &self,
        target: &str,
        content: OutboundContent,
    ) -> Result<DeliveryReceipt, BridgeError> {
        let req = SendMessageRequest {
            target: target.to_string(),
            content,
        };
        let resp = self
            .client
            .send_request(MessageType::SendMessage, Some(&req))
            .await?;
        let receipt: DeliveryReceiptResponse = resp.payload()?;
        Ok(DeliveryReceipt {
            message_id: receipt.message_id,
        })
    }
}

impl LinkProvider for BridgeProvider {
    fn begin_link<'a>(
        &'a self,
        identifier: Option<&'a str>,
    ) -> ProviderFuture<'a, Result<Option<String>, ProviderError>> {
        Box::pin(async move {
            self.link_begin(identifier)
                .await
                .map_err(|e| ProviderError::Construction(e.to_string()))
        })
    }

    fn required_fields(&self) -> Vec<String> {
        self.required
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| DEFAULT_REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect())
    }

    fn send<'a>(
        &'a self,
        target: &'a str,
        content: OutboundContent,
    ) -> ProviderFuture<'a, Result<DeliveryReceipt, ProviderError>> {
        Box::pin(async move {
            self.send_message(target, content)
                .await
                .map_err(|e| ProviderError::Send(e.to_string()))
        })
    }

    fn close(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if self.closing.swap(true, Ordering::Relaxed) {
                return;
            }
            let req = SessionRef {
                session_id: self.session_id.to_string(),
            };
            if let Err(e) = self.client.notify(MessageType::LinkClose, Some(&req)).await {
                debug!(session = %self.session_id, error = %e, "link_close not sent");
            }
            self.client.close().await;
        })
    }

    fn credentials_delivered(&self) {
        self.delivered.store(true, Ordering::Relaxed);
    }
}

/// Translates sidecar pushes into provider events until the socket
/// closes. An unrequested socket loss ends the attempt with
/// `connection-lost`.
async fn forward_pushes(
    session_id: SessionId,
    mut pushes: mpsc::Receiver<Message>,
    events_tx: mpsc::Sender<Result<ProviderEvent, ProviderError>>,
    store: Arc<dyn SessionStore>,
    closing: Arc<AtomicBool>,
    delivered: Arc<AtomicBool>,
) {
    while let Some(msg) = pushes.recv().await {
        let stage = !delivered.load(Ordering::Relaxed);
        let event = match translate_push(&session_id, &msg, store.as_ref(), stage) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(session = %session_id, msg_type = ?msg.msg_type, error = %e, "bad sidecar push");
                continue;
            }
        };
        let is_close = matches!(event, ProviderEvent::Close(_));
        if events_tx.send(Ok(event)).await.is_err() || is_close {
            return;
        }
    }

    if !closing.load(Ordering::Relaxed) {
        info!(session = %session_id, "sidecar connection lost");
        let _ = events_tx
            .send(Ok(ProviderEvent::Close(CloseReason::ConnectionLost)))
            .await;
    }
}

/// Maps one push to a provider event. Credential updates yield no event;
/// they are persisted here while `stage` is set.
pub(crate) fn translate_push(
    session_id: &SessionId,
    msg: &Message,
    store: &dyn SessionStore,
    stage: bool,
) -> Result<Option<ProviderEvent>, BridgeError> {
    match &msg.msg_type {
        MessageType::Qr => {
            let ev: QrEvent = msg.payload()?;
            Ok(Some(ProviderEvent::Qr(ev.value)))
        }
        MessageType::CredsUpdate => {
            let ev: CredsUpdateEvent = msg.payload()?;
            if stage {
                persist_credentials(session_id, ev.credentials, store)?;
            } else {
                debug!(session = %session_id, "credential already delivered, update dropped");
            }
            Ok(None)
        }
        MessageType::ConnectionUpdate => {
            let ev: ConnectionUpdateEvent = msg.payload()?;
            connection_event(ev)
        }
        MessageType::IncomingMessage => {
            let ev: IncomingMessageEvent = msg.payload()?;
            Ok(Some(ProviderEvent::Message {
                from: ev.from,
                text: ev.text,
            }))
        }
        other => {
            debug!(msg_type = ?other, "ignoring sidecar push");
            Ok(None)
        }
    }
}

fn connection_event(ev: ConnectionUpdateEvent) -> Result<Option<ProviderEvent>, BridgeError> {
    let event = match ev.connection {
        ConnectionPhase::Connecting => None,
        ConnectionPhase::Open => {
            let identity = ev
                .identity
                .filter(|identity| !identity.is_empty())
                .ok_or(BridgeError::MissingIdentity)?;
            Some(ProviderEvent::Open { identity })
        }
        ConnectionPhase::Close => {
            let reason = match (ev.status_code, ev.reason.as_deref()) {
                (Some(code), _) => CloseReason::from_status_code(code),
                (None, Some(text)) => text.parse().unwrap_or(CloseReason::Unknown),
                (None, None) => CloseReason::Unknown,
            };
            Some(ProviderEvent::Close(reason))
        }
    };
    Ok(event)
}

/// Merges an update into the staged document.
fn persist_credentials(
    session_id: &SessionId,
    update: BTreeMap<String, CredentialValue>,
    store: &dyn SessionStore,
) -> Result<(), BridgeError> {
    let mut artifact = match store.load(session_id)? {
        Some(document) => CredentialArtifact::from_document(&document)?,
        None => CredentialArtifact::default(),
    };
    artifact.fields.extend(update);
    store.save(session_id, &artifact.to_document()?)?;
    debug!(session = %session_id, fields = artifact.fields.len(), "credentials updated");
    Ok(())
}
