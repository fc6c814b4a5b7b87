//! Session registry: the operator entry point.
//!
//! Creates lineages, hands out observer subscriptions and snapshots, and
//! aborts or shuts lineages down. Each lineage is driven by its own task;
//! the registry only keeps handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CredentialCapture;
use crate::error::PairingError;
use crate::hub::{BroadcastHub, Subscription};
use crate::policy::ReconnectPolicy;
use crate::provider::LinkProviderFactory;
use crate::session::{LineageDriver, PairingSession};
use crate::store::SessionStore;
use crate::types::{
    ConcurrencyMode, PairingConfig, PairingRequest, SessionId, SessionSnapshot, SessionState,
    StartOutcome, normalize_identifier,
};

/// Handles to one live lineage.
pub(crate) struct LineageEntry {
    /// Distinguishes a reused id from the lineage that held it before.
    pub(crate) generation: u64,
    hub: BroadcastHub,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

pub(crate) type LineageMap = Arc<Mutex<HashMap<SessionId, LineageEntry>>>;

/// Registry of pairing lineages keyed by session id.
pub struct SessionRegistry {
    factory: Arc<dyn LinkProviderFactory>,
    store: Arc<dyn SessionStore>,
    config: PairingConfig,
    lineages: LineageMap,
    shutting_down: AtomicBool,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn LinkProviderFactory>,
        store: Arc<dyn SessionStore>,
        config: PairingConfig,
    ) -> Self {
        Self {
            factory,
            store,
            config,
            lineages: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, LineageEntry>> {
        self.lineages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a lineage, or reports the current outcome of a live one when
    /// the request names it.
    ///
    /// Returns once the provider has been asked to link: with the pairing
    /// code if one was requested and issued, otherwise with an
    /// acknowledgment that QR events follow. The id is reserved before the
    /// provider is built, so a concurrent request naming the same id joins
    /// this lineage instead of starting a second one.
    pub async fn start(&self, request: PairingRequest) -> Result<StartOutcome, PairingError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(PairingError::ShuttingDown);
        }

        let number = match request.number.as_deref() {
            Some(raw) => Some(
                normalize_identifier(raw)
                    .ok_or_else(|| PairingError::InvalidIdentifier(raw.to_string()))?,
            ),
            None => None,
        };

        let id = request.session_id.unwrap_or_else(SessionId::generate);
        let session = PairingSession::new(id.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let hub = BroadcastHub::new(self.config.subscriber_buffer);
        let cancel = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let live = {
            let mut entries = self.entries();
            let live = entries
                .get(&id)
                .filter(|entry| !entry.snapshot_rx.borrow().state.is_terminal())
                .map(|entry| entry.snapshot_rx.clone());
            if live.is_none() {
                // Checked under the lock so `shutdown`'s drain sees this entry.
                if self.shutting_down.load(Ordering::Relaxed) {
                    return Err(PairingError::ShuttingDown);
                }
                if self.config.concurrency == ConcurrencyMode::SingleActive
                    && let Some(active) = entries.keys().next().cloned()
                {
                    return Err(PairingError::SessionBusy(active));
                }
                entries.insert(
                    id.clone(),
                    LineageEntry {
                        generation,
                        hub: hub.clone(),
                        snapshot_rx,
                        cancel: cancel.clone(),
                        task: None,
                    },
                );
            }
            live
        };
        if let Some(rx) = live {
            return join_live(&id, rx).await;
        }

        let mut driver = LineageDriver {
            session,
            number,
            factory: self.factory.clone(),
            store: self.store.clone(),
            hub,
            policy: ReconnectPolicy::new(self.config.reconnect.clone()),
            capture: CredentialCapture::new(
                self.store.clone(),
                self.config.capture_recheck,
                self.config.retain_after_delivery,
            ),
            config: self.config.clone(),
            cancel: cancel.clone(),
            snapshot_tx,
            lineages: self.lineages.clone(),
            generation,
        };

        info!(session = %id, code = driver.number.is_some(), "starting pairing");
        let opened = tokio::select! {
            _ = cancel.cancelled() => None,
            result = driver.open_attempt() => Some(result),
        };
        let connection = match opened {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                warn!(session = %id, error = %e, "link provider unavailable");
                self.release(&id, generation);
                if let Err(clear_err) = self.store.clear(&id) {
                    warn!(session = %id, error = %clear_err, "failed to clear staged credential");
                }
                return Err(PairingError::ProviderUnavailable(e));
            }
            None => {
                driver.finish();
                return Err(self.cancelled_error(&id));
            }
        };
        let outcome = driver.session.start_outcome();

        // Spawn under the lock so the driver's own removal always finds the
        // entry, unless abort or shutdown took it while the provider opened.
        let rejected = {
            let mut entries = self.entries();
            match entries.get_mut(&id) {
                Some(entry) if entry.generation == generation && !cancel.is_cancelled() => {
                    entry.task = Some(tokio::spawn(driver.run(connection)));
                    None
                }
                _ => Some((driver, connection)),
            }
        };
        let Some((driver, connection)) = rejected else {
            return Ok(outcome);
        };
        connection.provider.close().await;
        driver.finish();
        Err(self.cancelled_error(&id))
    }

    fn release(&self, id: &SessionId, generation: u64) {
        let mut entries = self.entries();
        if entries.get(id).is_some_and(|entry| entry.generation == generation) {
            entries.remove(id);
        }
    }

    fn cancelled_error(&self, id: &SessionId) -> PairingError {
        if self.shutting_down.load(Ordering::Relaxed) {
            PairingError::ShuttingDown
        } else {
            PairingError::SessionClosed(id.clone())
        }
    }

    /// Attaches an observer to a lineage's broadcast hub.
    pub fn subscribe(&self, id: &SessionId) -> Result<Subscription, PairingError> {
        self.entries()
            .get(id)
            .map(|entry| entry.hub.subscribe())
            .ok_or_else(|| PairingError::SessionNotFound(id.clone()))
    }

    pub fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot, PairingError> {
        self.entries()
            .get(id)
            .map(|entry| entry.snapshot_rx.borrow().clone())
            .ok_or_else(|| PairingError::SessionNotFound(id.clone()))
    }

    /// Returns a receiver that tracks every snapshot the lineage publishes.
    /// It keeps the final snapshot after the lineage is removed.
    pub fn watch(&self, id: &SessionId) -> Result<watch::Receiver<SessionSnapshot>, PairingError> {
        self.entries()
            .get(id)
            .map(|entry| entry.snapshot_rx.clone())
            .ok_or_else(|| PairingError::SessionNotFound(id.clone()))
    }

    /// Cancels a live attempt or a pending restart and waits for the
    /// lineage to reach `ClosedTerminal`. Returns its final snapshot.
    pub async fn abort(&self, id: &SessionId) -> Result<SessionSnapshot, PairingError> {
        let entry = self
            .entries()
            .remove(id)
            .ok_or_else(|| PairingError::SessionNotFound(id.clone()))?;
        if entry.snapshot_rx.borrow().state.is_terminal() {
            return Err(PairingError::SessionClosed(id.clone()));
        }

        info!(session = %id, "aborting pairing");
        entry.cancel.cancel();
        Ok(wait_finished(id, entry).await)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every lineage and waits for their tasks to finish.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let drained: Vec<_> = self.entries().drain().collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "shutting down pairing lineages");

        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        for (id, entry) in drained {
            wait_finished(&id, entry).await;
        }
    }
}

/// Waits for a cancelled lineage to end and returns its final snapshot. An
/// entry without a task is still opening its first attempt; `start` ends it.
async fn wait_finished(id: &SessionId, entry: LineageEntry) -> SessionSnapshot {
    match entry.task {
        Some(task) => {
            if let Err(e) = task.await {
                warn!(session = %id, error = %e, "lineage task failed");
            }
        }
        None => {
            let mut rx = entry.snapshot_rx.clone();
            if rx.wait_for(|s| s.state.is_terminal()).await.is_err() {
                debug!(session = %id, "lineage dropped before opening");
            }
        }
    }
    let final_snapshot = entry.snapshot_rx.borrow().clone();
    final_snapshot
}

/// Outcome for a request that named a live lineage. Waits for a lineage
/// that is still opening its first attempt.
async fn join_live(
    id: &SessionId,
    mut rx: watch::Receiver<SessionSnapshot>,
) -> Result<StartOutcome, PairingError> {
    debug!(session = %id, "reusing live lineage");
    let snapshot = match rx.wait_for(|s| s.state != SessionState::Init).await {
        Ok(snapshot) => snapshot.clone(),
        // The request that reserved the id failed to open a provider.
        Err(_) => return Err(PairingError::SessionNotFound(id.clone())),
    };
    if snapshot.state.is_terminal() {
        return Err(PairingError::SessionClosed(id.clone()));
    }
    Ok(match (snapshot.state, snapshot.pairing_code) {
        (SessionState::AwaitingCode, Some(code)) => StartOutcome::PairingCode {
            session_id: id.clone(),
            code,
        },
        _ => StartOutcome::AwaitingQr {
            session_id: id.clone(),
        },
    })
}
