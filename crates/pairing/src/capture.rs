//! Credential capture: validate the staged bundle, deliver it once, clean up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use credlink_protocol::constants::{CREDENTIAL_FILE_NAME, CREDENTIAL_MIME_TYPE};
use credlink_protocol::messages::OutboundContent;
use credlink_protocol::{CredentialArtifact, CredentialValue};

use crate::error::PairingError;
use crate::provider::{DeliveryReceipt, LinkProvider};
use crate::store::SessionStore;
use crate::types::SessionId;

/// Staged credential material plus the account that receives it.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialBundle {
    pub artifact: CredentialArtifact,
    pub target_identity: String,
}

impl CredentialBundle {
    /// Required field names that are absent or empty, in `required` order.
    pub fn missing_fields(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| {
                self.artifact
                    .fields
                    .get(name.as_str())
                    .is_none_or(CredentialValue::is_empty)
            })
            .cloned()
            .collect()
    }
}

pub struct CredentialCapture {
    store: Arc<dyn SessionStore>,
    recheck_delay: Duration,
    retain_after_delivery: bool,
}

impl CredentialCapture {
    pub fn new(
        store: Arc<dyn SessionStore>,
        recheck_delay: Duration,
        retain_after_delivery: bool,
    ) -> Self {
        Self {
            store,
            recheck_delay,
            retain_after_delivery,
        }
    }

    /// Loads, validates and delivers the staged credential for `lineage`.
    ///
    /// An incomplete bundle is re-read once after `recheck_delay`. The
    /// staging copy is cleared only after a successful send, and a receipt
    /// is returned whenever the send succeeded.
    pub async fn capture(
        &self,
        lineage: &SessionId,
        target_identity: &str,
        provider: &dyn LinkProvider,
    ) -> Result<DeliveryReceipt, PairingError> {
        let required = provider.required_fields();

        let mut bundle = self.load_bundle(lineage, target_identity)?;
        let mut missing = bundle.missing_fields(&required);
        if !missing.is_empty() {
            debug!(
                session = %lineage,
                missing = ?missing,
                "credential incomplete, re-checking"
            );
            tokio::time::sleep(self.recheck_delay).await;
            bundle = self.load_bundle(lineage, target_identity)?;
            missing = bundle.missing_fields(&required);
        }
        if !missing.is_empty() {
            warn!(session = %lineage, missing = ?missing, "credential still incomplete");
            return Err(PairingError::IncompleteCredential { missing });
        }

        let document = bundle.artifact.to_document()?;
        let content = OutboundContent::Document {
            file_name: CREDENTIAL_FILE_NAME.to_string(),
            mime_type: CREDENTIAL_MIME_TYPE.to_string(),
            data: document,
        };
        let receipt = provider
            .send(&bundle.target_identity, content)
            .await
            .map_err(PairingError::DeliveryFailed)?;
        info!(
            session = %lineage,
            message_id = %receipt.message_id,
            "credential delivered"
        );

        // A sent credential counts as delivered even if the clear fails.
        if !self.retain_after_delivery
            && let Err(e) = self.store.clear(lineage)
        {
            warn!(session = %lineage, error = %e, "failed to clear delivered credential");
        }
        Ok(receipt)
    }

    fn load_bundle(
        &self,
        lineage: &SessionId,
        target_identity: &str,
    ) -> Result<CredentialBundle, PairingError> {
        let artifact = match self.store.load(lineage)? {
            Some(document) => CredentialArtifact::from_document(&document)?,
            None => CredentialArtifact::default(),
        };
        Ok(CredentialBundle {
            artifact,
            target_identity: target_identity.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::{ProviderError, StoreError};
    use crate::provider::ProviderFuture;
    use crate::store::MemorySessionStore;

    #[derive(Default)]
    struct RecordingProvider {
        sent: Mutex<Vec<(String, OutboundContent)>>,
        fail: bool,
    }

    impl LinkProvider for RecordingProvider {
        fn begin_link<'a>(
            &'a self,
            _identifier: Option<&'a str>,
        ) -> ProviderFuture<'a, Result<Option<String>, ProviderError>> {
            Box::pin(async { Ok(None) })
        }

        fn required_fields(&self) -> Vec<String> {
            vec!["noiseKey".into(), "me".into()]
        }

        fn send<'a>(
            &'a self,
            target: &'a str,
            content: OutboundContent,
        ) -> ProviderFuture<'a, Result<DeliveryReceipt, ProviderError>> {
            Box::pin(async move {
                if self.fail {
                    return Err(ProviderError::Send("socket gone".into()));
                }
                self.sent.lock().unwrap().push((target.to_string(), content));
                Ok(DeliveryReceipt {
                    message_id: "m-1".into(),
                })
            })
        }

        fn close(&self) -> ProviderFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn complete_document() -> Vec<u8> {
        let mut fields = BTreeMap::new();
        fields.insert("noiseKey".to_string(), CredentialValue::Bytes(vec![1, 2, 3]));
        fields.insert("me".to_string(), "15550001111@link".into());
        CredentialArtifact::new(fields).to_document().unwrap()
    }

    fn capture_with(store: Arc<MemorySessionStore>, retain: bool) -> CredentialCapture {
        CredentialCapture::new(store, Duration::from_secs(3), retain)
    }

    #[test]
    fn missing_fields_counts_empty_values() {
        let mut fields = BTreeMap::new();
        fields.insert("noiseKey".to_string(), CredentialValue::Bytes(vec![]));
        fields.insert("me".to_string(), "x".into());
        let bundle = CredentialBundle {
            artifact: CredentialArtifact::new(fields),
            target_identity: "t".into(),
        };
        let required = vec!["noiseKey".to_string(), "me".to_string(), "account".to_string()];
        assert_eq!(bundle.missing_fields(&required), vec!["noiseKey", "account"]);
    }

    #[tokio::test]
    async fn delivers_document_and_clears() {
        let store = Arc::new(MemorySessionStore::new());
        let id = SessionId::from("s-1");
        store.save(&id, &complete_document()).unwrap();
        let provider = RecordingProvider::default();

        let receipt = capture_with(store.clone(), false)
            .capture(&id, "15550001111@link", &provider)
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "m-1");
        assert!(store.load(&id).unwrap().is_none());

        let sent = provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (target, OutboundContent::Document { file_name, mime_type, data }) = &sent[0] else {
            panic!("expected a document");
        };
        assert_eq!(target, "15550001111@link");
        assert_eq!(file_name, "creds.json");
        assert_eq!(mime_type, "application/json");
        let decoded = CredentialArtifact::from_document(data).unwrap();
        assert_eq!(decoded.fields["noiseKey"], CredentialValue::Bytes(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn retain_keeps_staging_copy() {
        let store = Arc::new(MemorySessionStore::new());
        let id = SessionId::from("s-2");
        store.save(&id, &complete_document()).unwrap();

        capture_with(store.clone(), true)
            .capture(&id, "t", &RecordingProvider::default())
            .await
            .unwrap();
        assert!(store.load(&id).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_after_recheck_reports_missing() {
        let store = Arc::new(MemorySessionStore::new());
        let id = SessionId::from("s-3");
        let provider = RecordingProvider::default();

        let err = capture_with(store, false)
            .capture(&id, "t", &provider)
            .await
            .unwrap_err();
        match err {
            PairingError::IncompleteCredential { missing } => {
                assert_eq!(missing, vec!["noiseKey", "me"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_picks_up_late_write() {
        let store = Arc::new(MemorySessionStore::new());
        let id = SessionId::from("s-4");
        let writer = store.clone();
        let writer_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.save(&writer_id, &complete_document()).unwrap();
        });

        let provider = RecordingProvider::default();
        capture_with(store, false)
            .capture(&id, "t", &provider)
            .await
            .unwrap();
        assert_eq!(provider.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_failure_keeps_staging_copy() {
        let store = Arc::new(MemorySessionStore::new());
        let id = SessionId::from("s-5");
        store.save(&id, &complete_document()).unwrap();
        let provider = RecordingProvider {
            fail: true,
            ..Default::default()
        };

        let err = capture_with(store.clone(), false)
            .capture(&id, "t", &provider)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::DeliveryFailed(_)));
        assert!(store.load(&id).unwrap().is_some());
    }

    /// Store whose `clear` always fails.
    #[derive(Default)]
    struct StickyStore {
        inner: MemorySessionStore,
    }

    impl SessionStore for StickyStore {
        fn load(&self, id: &SessionId) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.load(id)
        }

        fn save(&self, id: &SessionId, document: &[u8]) -> Result<(), StoreError> {
            self.inner.save(id, document)
        }

        fn clear(&self, _id: &SessionId) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("resource busy")))
        }
    }

    #[tokio::test]
    async fn failed_clear_still_reports_delivery() {
        let store = Arc::new(StickyStore::default());
        let id = SessionId::from("s-6");
        store.save(&id, &complete_document()).unwrap();
        let provider = RecordingProvider::default();

        let receipt = CredentialCapture::new(store.clone(), Duration::from_secs(3), false)
            .capture(&id, "t", &provider)
            .await
            .unwrap();
        assert_eq!(receipt.message_id, "m-1");
        assert_eq!(provider.sent.lock().unwrap().len(), 1);
    }
}
