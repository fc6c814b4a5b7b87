//! Pairing control surface over a [`SessionRegistry`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use credlink_pairing::{
    PairingError, PairingRequest, SessionId, SessionRegistry, SessionSnapshot, StartOutcome,
    Subscription,
};
use credlink_protocol::MessageType;
use credlink_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_GONE, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_NOT_FOUND, WS_ERR_CODE_UNAVAILABLE,
};
use credlink_protocol::envelope::Message;
use credlink_protocol::messages::{
    PairingMode, PairingStartedResponse, SessionInfoResponse, SessionRef, StartPairingRequest,
};

use crate::connection::{ConnectionId, Sender};
use crate::handler::{Handler, HandlerFuture};

type WatchKey = (ConnectionId, SessionId);

/// One forwarder task. `serial` tells a replaced watch from its successor.
struct Watch {
    serial: u64,
    cancel: CancellationToken,
}

type WatchMap = Arc<Mutex<HashMap<WatchKey, Watch>>>;

fn lock_watches(watches: &WatchMap) -> MutexGuard<'_, HashMap<WatchKey, Watch>> {
    watches.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes control messages to the registry and forwards watched
/// lineages' observer events to their sockets.
pub struct PairingHandler {
    registry: Arc<SessionRegistry>,
    watches: WatchMap,
    next_serial: AtomicU64,
}

impl PairingHandler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            watches: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Number of registered watches across all connections.
    pub fn watch_count(&self) -> usize {
        self.watches().len()
    }

    fn watches(&self) -> MutexGuard<'_, HashMap<WatchKey, Watch>> {
        lock_watches(&self.watches)
    }

    async fn start_pairing(&self, sender: &Sender, msg: &Message) {
        let req: StartPairingRequest = match msg.parse_payload() {
            Ok(req) => req.unwrap_or_default(),
            Err(e) => {
                let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, &e.to_string());
                return;
            }
        };
        let request = PairingRequest {
            number: req.number,
            session_id: req.session_id.map(SessionId::from),
        };

        match self.registry.start(request).await {
            Ok(outcome) => {
                let resp = match outcome {
                    StartOutcome::PairingCode { session_id, code } => PairingStartedResponse {
                        session_id: session_id.to_string(),
                        mode: PairingMode::Code { code },
                    },
                    StartOutcome::AwaitingQr { session_id } => PairingStartedResponse {
                        session_id: session_id.to_string(),
                        mode: PairingMode::Qr,
                    },
                };
                reply(sender, msg, MessageType::PairingStarted, &resp);
            }
            Err(e) => send_pairing_error(sender, msg, &e),
        }
    }

    fn watch(&self, sender: &Sender, msg: &Message) {
        let Some(id) = session_ref(sender, msg) else {
            return;
        };
        let subscription = match self.registry.subscribe(&id) {
            Ok(sub) => sub,
            Err(e) => {
                send_pairing_error(sender, msg, &e);
                return;
            }
        };

        // Ack first so it precedes the snapshot on the wire.
        reply(
            sender,
            msg,
            MessageType::Watching,
            &SessionRef {
                session_id: id.to_string(),
            },
        );

        let cancel = CancellationToken::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let key = (sender.connection_id(), id.clone());
        let watch = Watch {
            serial,
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.watches().insert(key.clone(), watch) {
            previous.cancel.cancel();
        }
        debug!(conn = sender.connection_id(), session = %id, "observer attached");

        let watches = Arc::clone(&self.watches);
        let sender = sender.clone();
        tokio::spawn(async move {
            forward_events(subscription, &sender, &cancel).await;
            let mut map = lock_watches(&watches);
            if map.get(&key).is_some_and(|w| w.serial == serial) {
                map.remove(&key);
            }
        });
    }

    fn unwatch(&self, sender: &Sender, msg: &Message) {
        let Some(id) = session_ref(sender, msg) else {
            return;
        };
        if let Some(watch) = self.watches().remove(&(sender.connection_id(), id.clone())) {
            watch.cancel.cancel();
            debug!(conn = sender.connection_id(), session = %id, "observer detached");
        }
        reply(
            sender,
            msg,
            MessageType::Unwatched,
            &SessionRef {
                session_id: id.to_string(),
            },
        );
    }

    async fn abort_pairing(&self, sender: &Sender, msg: &Message) {
        let Some(id) = session_ref(sender, msg) else {
            return;
        };
        match self.registry.abort(&id).await {
            Ok(_) => reply(
                sender,
                msg,
                MessageType::PairingAborted,
                &SessionRef {
                    session_id: id.to_string(),
                },
            ),
            Err(e) => send_pairing_error(sender, msg, &e),
        }
    }

    fn get_session(&self, sender: &Sender, msg: &Message) {
        let Some(id) = session_ref(sender, msg) else {
            return;
        };
        match self.registry.snapshot(&id) {
            Ok(snapshot) => reply(sender, msg, MessageType::SessionInfo, &session_info(&snapshot)),
            Err(e) => send_pairing_error(sender, msg, &e),
        }
    }
}

impl Handler for PairingHandler {
    fn on_start_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move { self.start_pairing(&sender, &msg).await })
    }

    fn on_watch(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move { self.watch(&sender, &msg) })
    }

    fn on_unwatch(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move { self.unwatch(&sender, &msg) })
    }

    fn on_abort_pairing(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move { self.abort_pairing(&sender, &msg).await })
    }

    fn on_get_session(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move { self.get_session(&sender, &msg) })
    }

    fn on_disconnected(&self, conn: ConnectionId) -> HandlerFuture<'_> {
        Box::pin(async move {
            let mut watches = self.watches();
            let before = watches.len();
            watches.retain(|(owner, _), watch| {
                let keep = *owner != conn;
                if !keep {
                    watch.cancel.cancel();
                }
                keep
            });
            let dropped = before - watches.len();
            if dropped > 0 {
                info!(conn, dropped, "released observer subscriptions");
            }
        })
    }
}

/// Pumps one lineage's observer events into a socket until the lineage
/// ends, the observer unwatches, or the socket goes away.
async fn forward_events(mut subscription: Subscription, sender: &Sender, cancel: &CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            () = sender.closed() => break,
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if sender.send_event(&event).is_err() {
                    break;
                }
            }
        }
    }
}

fn session_info(snapshot: &SessionSnapshot) -> SessionInfoResponse {
    SessionInfoResponse {
        session_id: snapshot.session_id.to_string(),
        state: snapshot.state.as_str().to_string(),
        attempt_count: snapshot.attempt_count,
        captured: snapshot.captured_once,
        pairing_code: snapshot.pairing_code.clone(),
    }
}

/// Parses a required payload, answering 400 when it is missing or bad.
fn required_payload<T: DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.payload::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, &e.to_string());
            None
        }
    }
}

fn session_ref(sender: &Sender, msg: &Message) -> Option<SessionId> {
    required_payload::<SessionRef>(sender, msg).map(|r| SessionId::from(r.session_id))
}

fn reply<T: serde::Serialize>(sender: &Sender, msg: &Message, msg_type: MessageType, payload: &T) {
    match msg.reply(msg_type, Some(payload)) {
        Ok(resp) => {
            let _ = sender.send_msg(resp);
        }
        Err(e) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_INTERNAL, &e.to_string());
        }
    }
}

fn error_code(err: &PairingError) -> i32 {
    match err {
        PairingError::InvalidIdentifier(_) => WS_ERR_CODE_BAD_REQUEST,
        PairingError::SessionNotFound(_) => WS_ERR_CODE_NOT_FOUND,
        PairingError::SessionBusy(_) => WS_ERR_CODE_CONFLICT,
        PairingError::SessionClosed(_) => WS_ERR_CODE_GONE,
        PairingError::ProviderUnavailable(_) | PairingError::ShuttingDown => {
            WS_ERR_CODE_UNAVAILABLE
        }
        _ => WS_ERR_CODE_INTERNAL,
    }
}

fn send_pairing_error(sender: &Sender, msg: &Message, err: &PairingError) {
    debug!(msg_type = ?msg.msg_type, error = %err, "control request failed");
    let _ = sender.send_error(msg, error_code(err), &err.to_string());
}
