//! Request/response envelope for the control socket and the sidecar bridge.
//!
//! Observer events do not use it; they travel as bare
//! [`ObserverEvent`](crate::ObserverEvent) frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::MessageType;

/// Numeric code and text of a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

/// Why a required payload could not be read.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("missing payload")]
    Missing,

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// `{id, type, payload?, error?}`. Replies reuse the request's `id`; the
/// payload stays raw until the receiver knows which type to expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let payload = payload.map(serde_json::value::to_raw_value).transpose()?;
        Ok(Self {
            id: id.into(),
            msg_type,
            payload,
            error: None,
        })
    }

    /// A request under a fresh correlation id.
    pub fn request<T: Serialize>(
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Self::new(uuid::Uuid::new_v4().to_string(), msg_type, payload)
    }

    /// Payload for messages where it is optional.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    /// Payload for messages that must carry one.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        self.parse_payload()?.ok_or(PayloadError::Missing)
    }

    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Self::new(self.id.as_str(), msg_type, payload)
    }

    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Splits a reply into success or the error the peer reported.
    pub fn into_result(self) -> Result<Self, ErrorBody> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{PairingMode, PairingStartedResponse, SessionRef};

    #[test]
    fn requests_get_distinct_ids() {
        let a = Message::request::<()>(MessageType::LinkBegin, None).unwrap();
        let b = Message::request::<()>(MessageType::LinkBegin, None).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.msg_type, MessageType::LinkBegin);
    }

    #[test]
    fn started_reply_on_the_wire() {
        let request = Message::new::<()>("op-7", MessageType::StartPairing, None).unwrap();
        let resp = PairingStartedResponse {
            session_id: "s-1".into(),
            mode: PairingMode::Code {
                code: "ABCD1234".into(),
            },
        };
        let reply = request.reply(MessageType::PairingStarted, Some(&resp)).unwrap();
        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["id"], "op-7");
        assert_eq!(json["type"], "pairing_started");
        assert_eq!(json["payload"]["mode"], "code");
        assert!(json.get("error").is_none());

        let parsed: PairingStartedResponse = reply.payload().unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn required_payload_distinguishes_missing_from_malformed() {
        let bare = Message::new::<()>("g", MessageType::GetSession, None).unwrap();
        assert!(matches!(
            bare.payload::<SessionRef>(),
            Err(PayloadError::Missing)
        ));
        assert_eq!(bare.parse_payload::<SessionRef>().unwrap(), None);

        let wrong = Message::new("g", MessageType::GetSession, Some(&42)).unwrap();
        assert!(matches!(
            wrong.payload::<SessionRef>(),
            Err(PayloadError::Malformed(_))
        ));
    }

    #[test]
    fn error_reply_splits_out() {
        let request = Message::new::<()>("req-99", MessageType::GetSession, None).unwrap();
        let reply = request.reply_error(404, "session not found");
        assert_eq!(reply.id, "req-99");
        assert_eq!(reply.msg_type, MessageType::Error);

        let err = reply.into_result().unwrap_err();
        assert_eq!(
            err,
            ErrorBody {
                code: 404,
                message: "session not found".into()
            }
        );
        assert!(request.into_result().is_ok());
    }
}
