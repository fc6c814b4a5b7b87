use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::CredentialValue;

// ---------------------------------------------------------------------------
// Operator control surface
// ---------------------------------------------------------------------------

/// Begins pairing, or reuses an existing lineage when `session_id` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPairingRequest {
    /// Phone-number-like identifier. When present, a pairing code is
    /// requested instead of QR-based linking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// How the user completes linking: a numeric code, or the QR event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PairingMode {
    Code { code: String },
    Qr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStartedResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub mode: PairingMode,
}

/// Payload naming a single lineage (`watch`, `unwatch`, `abort_pairing`,
/// `get_session` and their acknowledgments).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    pub session_id: String,
    pub state: String,
    pub attempt_count: u32,
    pub captured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Link sidecar requests
// ---------------------------------------------------------------------------

/// Asks the sidecar to start a linking attempt for a lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkBeginRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    /// Previously staged credential material, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<BTreeMap<String, CredentialValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkBegunResponse {
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Credential field names the sidecar's schema requires.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

/// Message body handed to the sidecar's send primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundContent {
    #[serde(rename_all = "camelCase")]
    Document {
        file_name: String,
        mime_type: String,
        /// Base64-encoded in JSON.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub target: String,
    #[serde(flatten)]
    pub content: OutboundContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceiptResponse {
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// Link sidecar push events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrEvent {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredsUpdateEvent {
    pub credentials: BTreeMap<String, CredentialValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdateEvent {
    pub connection: ConnectionPhase,
    /// Linked account identity, set on `open`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Disconnect reason name or error text, set on `close`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessageEvent {
    pub from: String,
    pub text: String,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_pairing_accepts_empty_payload() {
        let req: StartPairingRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req, StartPairingRequest::default());
    }

    #[test]
    fn pairing_started_code_shape() {
        let resp = PairingStartedResponse {
            session_id: "s-1".into(),
            mode: PairingMode::Code {
                code: "12345678".into(),
            },
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"sessionId": "s-1", "mode": "code", "code": "12345678"})
        );
    }

    #[test]
    fn pairing_started_qr_has_no_code() {
        let resp = PairingStartedResponse {
            session_id: "s-2".into(),
            mode: PairingMode::Qr,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"mode\":\"qr\""));
        assert!(!json.contains("code"));
        let parsed: PairingStartedResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.mode, PairingMode::Qr);
    }

    #[test]
    fn document_content_is_base64() {
        let req = SendMessageRequest {
            target: "15550001111@link".into(),
            content: OutboundContent::Document {
                file_name: "creds.json".into(),
                mime_type: "application/json".into(),
                data: b"Hello".to_vec(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "document");
        assert_eq!(json["fileName"], "creds.json");
        assert_eq!(json["data"], "SGVsbG8=");
        let parsed: SendMessageRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn connection_update_close_with_code() {
        let ev: ConnectionUpdateEvent =
            serde_json::from_str(r#"{"connection":"close","statusCode":401}"#).unwrap();
        assert_eq!(ev.connection, ConnectionPhase::Close);
        assert_eq!(ev.status_code, Some(401));
        assert!(ev.reason.is_none());
    }

    #[test]
    fn link_begun_defaults_required_fields() {
        let resp: LinkBegunResponse = serde_json::from_str(r#"{"registered":true}"#).unwrap();
        assert!(resp.registered);
        assert!(resp.code.is_none());
        assert!(resp.required_fields.is_empty());
    }
}
