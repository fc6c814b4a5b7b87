//! Canonical credential codec.
//!
//! Credential material is a tree of named values whose leaves may be raw
//! bytes. Bytes are written as a tagged wrapper,
//! `{"type":"Buffer","data":"<base64>"}`, so a document survives a JSON
//! round-trip byte-for-byte. This is the only place that walks the tree.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

const BUFFER_TAG: &str = "Buffer";

/// Errors from encoding or decoding credential documents.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 in buffer: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid buffer wrapper: {0}")]
    InvalidBuffer(String),

    #[error("credential document must be a JSON object")]
    NotAnObject,
}

/// One node of a credential tree.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<CredentialValue>),
    Map(BTreeMap<String, CredentialValue>),
}

impl CredentialValue {
    /// Returns `true` for values that carry no material.
    ///
    /// Booleans and numbers always count as present.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(_) | Self::Number(_) => false,
            Self::Text(s) => s.is_empty(),
            Self::Bytes(b) => b.is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Map(map) => map.is_empty(),
        }
    }

    /// Encodes the tree into JSON, wrapping byte leaves.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Text(s) => Value::String(s.clone()),
            Self::Bytes(bytes) => {
                let mut wrapper = Map::with_capacity(2);
                wrapper.insert("type".into(), Value::String(BUFFER_TAG.into()));
                wrapper.insert("data".into(), Value::String(STANDARD.encode(bytes)));
                Value::Object(wrapper)
            }
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Decodes a JSON tree, unwrapping buffer wrappers back into bytes.
    ///
    /// Accepts both base64 strings and arrays of octets as buffer data.
    pub fn from_json(value: Value) -> Result<Self, ArtifactError> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::Text(s),
            Value::Array(items) => Self::List(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(obj) if is_buffer_wrapper(&obj) => Self::Bytes(decode_buffer(obj)?),
            Value::Object(obj) => Self::Map(
                obj.into_iter()
                    .map(|(k, v)| Self::from_json(v).map(|node| (k, node)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

fn is_buffer_wrapper(obj: &Map<String, Value>) -> bool {
    obj.len() == 2
        && obj.get("type").and_then(Value::as_str) == Some(BUFFER_TAG)
        && obj.contains_key("data")
}

fn decode_buffer(mut obj: Map<String, Value>) -> Result<Vec<u8>, ArtifactError> {
    match obj.remove("data") {
        Some(Value::String(encoded)) => Ok(STANDARD.decode(encoded)?),
        Some(Value::Array(octets)) => octets
            .into_iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| ArtifactError::InvalidBuffer(format!("bad octet {v}")))
            })
            .collect(),
        other => Err(ArtifactError::InvalidBuffer(format!(
            "unexpected data field: {other:?}"
        ))),
    }
}

impl Serialize for CredentialValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CredentialValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl From<Vec<u8>> for CredentialValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&str> for CredentialValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// A complete, transmittable credential document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialArtifact {
    pub fields: BTreeMap<String, CredentialValue>,
}

impl CredentialArtifact {
    pub fn new(fields: BTreeMap<String, CredentialValue>) -> Self {
        Self { fields }
    }

    /// Serializes into the delivered document bytes.
    pub fn to_document(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses document bytes produced by [`to_document`](Self::to_document)
    /// or by any conformant writer.
    pub fn from_document(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let value: Value = serde_json::from_slice(bytes)?;
        match CredentialValue::from_json(value)? {
            CredentialValue::Map(fields) => Ok(Self { fields }),
            _ => Err(ArtifactError::NotAnObject),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CredentialArtifact {
        let mut noise = BTreeMap::new();
        noise.insert("private".to_string(), CredentialValue::Bytes(vec![0, 1, 2, 254, 255]));
        noise.insert("public".to_string(), CredentialValue::Bytes((0..=255).collect()));

        let mut fields = BTreeMap::new();
        fields.insert("noiseKey".to_string(), CredentialValue::Map(noise));
        fields.insert("registrationId".to_string(), CredentialValue::Number(1234.into()));
        fields.insert("registered".to_string(), CredentialValue::Bool(true));
        fields.insert("advSecretKey".to_string(), "c2VjcmV0".into());
        fields.insert(
            "prekeys".to_string(),
            CredentialValue::List(vec![vec![9u8; 32].into(), CredentialValue::Null]),
        );
        CredentialArtifact::new(fields)
    }

    #[test]
    fn bytes_use_tagged_wrapper() {
        let json = CredentialValue::Bytes(b"Hello".to_vec()).to_json();
        assert_eq!(json, serde_json::json!({"type": "Buffer", "data": "SGVsbG8="}));
    }

    #[test]
    fn document_roundtrip_preserves_bytes() {
        let artifact = sample();
        let doc = artifact.to_document().unwrap();
        let decoded = CredentialArtifact::from_document(&doc).unwrap();
        assert_eq!(decoded, artifact);

        let CredentialValue::Map(noise) = &decoded.fields["noiseKey"] else {
            panic!("noiseKey should decode as a map");
        };
        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(noise["public"], CredentialValue::Bytes(expected));
    }

    #[test]
    fn accepts_octet_array_buffers() {
        let doc = br#"{"key":{"type":"Buffer","data":[72,105]}}"#;
        let decoded = CredentialArtifact::from_document(doc).unwrap();
        assert_eq!(decoded.fields["key"], CredentialValue::Bytes(b"Hi".to_vec()));
    }

    #[test]
    fn lookalike_objects_stay_maps() {
        let doc = br#"{"key":{"type":"Buffer","data":"AA==","extra":1}}"#;
        let decoded = CredentialArtifact::from_document(doc).unwrap();
        assert!(matches!(decoded.fields["key"], CredentialValue::Map(_)));
    }

    #[test]
    fn rejects_bad_buffer_data() {
        let doc = br#"{"key":{"type":"Buffer","data":"***"}}"#;
        assert!(matches!(
            CredentialArtifact::from_document(doc),
            Err(ArtifactError::Base64(_))
        ));

        let doc = br#"{"key":{"type":"Buffer","data":[1,300]}}"#;
        assert!(matches!(
            CredentialArtifact::from_document(doc),
            Err(ArtifactError::InvalidBuffer(_))
        ));
    }

    #[test]
    fn rejects_non_object_document() {
        assert!(matches!(
            CredentialArtifact::from_document(b"[1,2]"),
            Err(ArtifactError::NotAnObject)
        ));
    }

    #[test]
    fn emptiness() {
        assert!(CredentialValue::Null.is_empty());
        assert!(CredentialValue::Bytes(vec![]).is_empty());
        assert!(CredentialValue::Text(String::new()).is_empty());
        assert!(!CredentialValue::Bool(false).is_empty());
        assert!(!CredentialValue::Bytes(vec![0]).is_empty());
    }
}
