//! One pairing lineage: its state machine and the task that drives it.
//!
//! [`PairingSession`] holds the state and named transitions and nothing
//! else. [`LineageDriver`] owns a session, consumes provider events, and
//! decides when to restart.

use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use credlink_protocol::ObserverEvent;
use credlink_protocol::messages::OutboundContent;

use crate::capture::CredentialCapture;
use crate::error::ProviderError;
use crate::hub::BroadcastHub;
use crate::policy::{CloseReason, ReconnectAction, ReconnectPolicy};
use crate::provider::{LinkProvider, LinkProviderFactory, ProviderConnection, ProviderEvent};
use crate::registry::LineageMap;
use crate::store::SessionStore;
use crate::types::{PairingConfig, SessionId, SessionSnapshot, SessionState, StartOutcome};

/// Result of [`PairingSession::on_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTransition {
    /// `false` for a repeated open; the status is not republished.
    pub newly_open: bool,
    /// Capture has not yet succeeded for this lineage.
    pub should_capture: bool,
}

/// State of one lineage.
#[derive(Debug, Clone)]
pub struct PairingSession {
    id: SessionId,
    state: SessionState,
    current_qr: Option<String>,
    pairing_code: Option<String>,
    attempt_count: u32,
    captured_once: bool,
    created_at: DateTime<Utc>,
}

impl PairingSession {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Init,
            current_qr: None,
            pairing_code: None,
            attempt_count: 0,
            captured_once: false,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn captured_once(&self) -> bool {
        self.captured_once
    }

    pub fn current_qr(&self) -> Option<&str> {
        self.current_qr.as_deref()
    }

    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.as_deref()
    }

    /// Provider constructed and linking requested. A handed-out code moves
    /// the session to `AwaitingCode`, otherwise `Connecting`.
    pub fn begin_attempt(&mut self, code: Option<String>) {
        self.current_qr = None;
        self.state = if code.is_some() {
            SessionState::AwaitingCode
        } else {
            SessionState::Connecting
        };
        if code.is_some() {
            self.pairing_code = code;
        }
    }

    /// Records a QR payload. Returns `false` if the session is terminal.
    pub fn on_qr(&mut self, value: String) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::AwaitingQr;
        self.current_qr = Some(value);
        true
    }

    pub fn on_open(&mut self) -> OpenTransition {
        let newly_open = self.state != SessionState::Open;
        self.state = SessionState::Open;
        self.current_qr = None;
        OpenTransition {
            newly_open,
            should_capture: !self.captured_once,
        }
    }

    pub fn mark_captured(&mut self) {
        self.captured_once = true;
    }

    /// Moves to `ClosedRetrying` and counts the attempt.
    pub fn on_retrying(&mut self) {
        self.state = SessionState::ClosedRetrying;
        self.current_qr = None;
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    pub fn on_terminal(&mut self) {
        self.state = SessionState::ClosedTerminal;
        self.current_qr = None;
    }

    /// The operator-facing outcome of the current attempt.
    pub fn start_outcome(&self) -> StartOutcome {
        match (&self.state, &self.pairing_code) {
            (SessionState::AwaitingCode, Some(code)) => StartOutcome::PairingCode {
                session_id: self.id.clone(),
                code: code.clone(),
            },
            _ => StartOutcome::AwaitingQr {
                session_id: self.id.clone(),
            },
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            state: self.state,
            current_qr: self.current_qr.clone(),
            pairing_code: self.pairing_code.clone(),
            attempt_count: self.attempt_count,
            captured_once: self.captured_once,
            created_at: self.created_at,
        }
    }
}

enum AttemptEnd {
    Closed(CloseReason),
    Aborted,
}

/// Owns one lineage for its whole life. Shared handles are cloned in
/// from the registry.
pub(crate) struct LineageDriver {
    pub(crate) session: PairingSession,
    /// Normalized identifier for code-based pairing.
    pub(crate) number: Option<String>,
    pub(crate) factory: Arc<dyn LinkProviderFactory>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) hub: BroadcastHub,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) capture: CredentialCapture,
    pub(crate) config: PairingConfig,
    pub(crate) cancel: CancellationToken,
    pub(crate) snapshot_tx: watch::Sender<SessionSnapshot>,
    pub(crate) lineages: LineageMap,
    pub(crate) generation: u64,
}

impl LineageDriver {
    fn sync_snapshot(&self) {
        self.snapshot_tx.send_replace(self.session.snapshot());
    }

    fn publish_state(&self) {
        if let Some(status) = self.session.state().link_status() {
            self.hub.publish(ObserverEvent::Status(status));
        }
        self.sync_snapshot();
    }

    /// Builds a provider connection and asks it to begin linking.
    pub(crate) async fn open_attempt(&mut self) -> Result<ProviderConnection, ProviderError> {
        let id = self.session.id().clone();
        let connection = self.factory.connect(&id, self.store.clone()).await?;

        let code = match self.number.as_deref() {
            Some(number) => {
                // Give the provider's socket time to settle before asking
                // for a code.
                tokio::time::sleep(self.config.code_request_delay).await;
                connection.provider.begin_link(Some(number)).await
            }
            None => connection.provider.begin_link(None).await,
        };
        let code = match code {
            Ok(code) => code,
            Err(e) => {
                connection.provider.close().await;
                return Err(e);
            }
        };

        if code.is_some() {
            info!(session = %id, "pairing code issued");
        }
        self.session.begin_attempt(code);
        self.publish_state();
        Ok(connection)
    }

    /// Drives the lineage until it terminates. `first` is the attempt the
    /// registry already opened.
    pub(crate) async fn run(mut self, first: ProviderConnection) {
        let id = self.session.id().clone();
        let cancel = self.cancel.clone();
        let mut connection = Some(first);

        loop {
            let end = match connection.take() {
                Some(conn) => self.drive_attempt(conn).await,
                // The restart could not construct a provider.
                None => AttemptEnd::Closed(CloseReason::Unknown),
            };
            let reason = match end {
                AttemptEnd::Aborted => {
                    info!(session = %id, "pairing aborted");
                    break;
                }
                AttemptEnd::Closed(reason) => reason,
            };

            let attempt = self.session.attempt_count();
            match self.policy.decide(&reason, attempt) {
                ReconnectAction::Stop => {
                    info!(session = %id, reason = %reason, "connection closed permanently");
                    break;
                }
                ReconnectAction::Retry { delay } => {
                    let delay_secs = delay.as_secs_f64();
                    info!(
                        session = %id,
                        reason = %reason,
                        attempt,
                        delay_secs = format_args!("{delay_secs:.1}"),
                        "connection closed, restarting"
                    );
                    self.session.on_retrying();
                    self.publish_state();

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(session = %id, "restart cancelled");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    let restarted = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.open_attempt() => result,
                    };
                    match restarted {
                        Ok(conn) => connection = Some(conn),
                        Err(e) => warn!(session = %id, error = %e, "restart failed"),
                    }
                }
            }
        }

        self.finish();
    }

    async fn drive_attempt(&mut self, conn: ProviderConnection) -> AttemptEnd {
        let ProviderConnection {
            provider,
            mut events,
        } = conn;
        if self.session.captured_once() {
            self.notify_delivered(provider.as_ref());
        }

        let end = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break AttemptEnd::Aborted,
                next = events.recv() => next,
            };
            match next {
                Some(Ok(ProviderEvent::Close(reason))) => break AttemptEnd::Closed(reason),
                Some(Ok(event)) => self.on_provider_event(event, provider.as_ref()).await,
                Some(Err(e)) => {
                    warn!(session = %self.session.id(), error = %e, "provider stream error");
                    break AttemptEnd::Closed(e.close_reason());
                }
                None => {
                    debug!(session = %self.session.id(), "provider stream ended");
                    break AttemptEnd::Closed(CloseReason::Unknown);
                }
            }
        };

        provider.close().await;
        end
    }

    async fn on_provider_event(&mut self, event: ProviderEvent, provider: &dyn LinkProvider) {
        let id = self.session.id().clone();
        match event {
            ProviderEvent::Qr(value) => {
                if self.session.on_qr(value.clone()) {
                    debug!(session = %id, "qr updated");
                    self.hub.publish(ObserverEvent::Qr(value));
                    self.sync_snapshot();
                }
            }
            ProviderEvent::Open { identity } => {
                let transition = self.session.on_open();
                if transition.newly_open {
                    info!(session = %id, identity = %identity, "device linked");
                    self.publish_state();
                }
                if transition.should_capture {
                    match self.capture.capture(&id, &identity, provider).await {
                        Ok(_) => {
                            self.session.mark_captured();
                            self.notify_delivered(provider);
                            self.sync_snapshot();
                        }
                        Err(e) => warn!(session = %id, error = %e, "credential capture failed"),
                    }
                }
            }
            ProviderEvent::Message { from, text } => {
                if !self.config.liveness_echo || self.session.state() != SessionState::Open {
                    return;
                }
                if text.trim().eq_ignore_ascii_case("ping") {
                    let reply = OutboundContent::Text {
                        text: "pong".to_string(),
                    };
                    if let Err(e) = provider.send(&from, reply).await {
                        warn!(session = %id, error = %e, "liveness echo failed");
                    }
                }
            }
            ProviderEvent::Close(_) => {}
        }
    }

    fn notify_delivered(&self, provider: &dyn LinkProvider) {
        if !self.config.retain_after_delivery {
            provider.credentials_delivered();
        }
    }

    pub(crate) fn finish(mut self) {
        let id = self.session.id().clone();
        self.session.on_terminal();
        self.publish_state();

        if let Err(e) = self.store.clear(&id) {
            warn!(session = %id, error = %e, "failed to clear staged credential");
        }
        let mut map = self.lineages.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(&id).is_some_and(|entry| entry.generation == self.generation) {
            map.remove(&id);
        }
        drop(map);
        debug!(session = %id, "lineage finished");
    }
}
