//! Wire types: session envelopes, structured file payloads, discovery packets
//!
//! Envelopes keep `data` as raw JSON on the wire; [`Envelope::payload`] turns
//! an envelope into a typed [`Payload`] selected by its kind. A `data` blob
//! that does not match its kind is a [`PayloadError`], never a stream error,
//! so one bad envelope cannot tear down the session.

use super::types::BROADCAST_RECIPIENT;
use crate::crypto::KEY_SIZE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Envelope kind (`type` on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Handshake,
    HandshakeResponse,
    Chat,
    FileRequest,
    FileResponse,
    FileChunk,
    UpdateName,
    /// Kinds from newer peers; ignored by the dispatcher
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    pub fn command(&self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::HandshakeResponse => "handshake_response",
            MessageKind::Chat => "chat",
            MessageKind::FileRequest => "file_request",
            MessageKind::FileResponse => "file_response",
            MessageKind::FileChunk => "file_chunk",
            MessageKind::UpdateName => "update_name",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// One JSON unit of the session protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::option")]
    pub nonce: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::option")]
    pub ciphertext: Option<Vec<u8>>,
    #[serde(
        rename = "sender_pubkey",
        default,
        skip_serializing_if = "Option::is_none",
        with = "b64::option"
    )]
    pub sender_pubkey: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new(kind: MessageKind, from: &str, to: &str, content: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.to_string(),
            to: to.to_string(),
            content: content.into(),
            timestamp: Utc::now(),
            data: None,
            encrypted: false,
            nonce: None,
            ciphertext: None,
            sender_pubkey: None,
        }
    }

    pub fn handshake(from: &str, name: &str, pubkey: &[u8; KEY_SIZE]) -> Self {
        let mut env = Self::new(MessageKind::Handshake, from, "", name);
        env.sender_pubkey = Some(pubkey.to_vec());
        env
    }

    pub fn handshake_response(from: &str, to: &str, name: &str, pubkey: &[u8; KEY_SIZE]) -> Self {
        let mut env = Self::new(MessageKind::HandshakeResponse, from, to, name);
        env.sender_pubkey = Some(pubkey.to_vec());
        env
    }

    pub fn chat(from: &str, to: &str, text: &str) -> Self {
        Self::new(MessageKind::Chat, from, to, text)
    }

    pub fn update_name(from: &str, name: &str) -> Self {
        Self::new(MessageKind::UpdateName, from, BROADCAST_RECIPIENT, name)
    }

    pub fn file_request(from: &str, request: &FileTransferRequest) -> Self {
        Self::new(MessageKind::FileRequest, from, &request.to, "").with_data(request)
    }

    pub fn file_response(from: &str, to: &str, response: &FileTransferResponse) -> Self {
        Self::new(MessageKind::FileResponse, from, to, "").with_data(response)
    }

    pub fn file_chunk(from: &str, to: &str, chunk: &FileChunk) -> Self {
        Self::new(MessageKind::FileChunk, from, to, "").with_data(chunk)
    }

    fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        // Plain derive(Serialize) structs with string keys cannot fail here
        self.data = serde_json::to_value(data).ok();
        self
    }

    /// Public envelopes carry an empty or `"all"` recipient
    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty() || self.to == BROADCAST_RECIPIENT
    }

    /// Decode into the typed payload for this envelope's kind
    pub fn payload(&self) -> Result<Payload, PayloadError> {
        match self.kind {
            MessageKind::Handshake => Ok(Payload::Handshake {
                name: self.content.clone(),
                public_key: self.public_key()?,
            }),
            MessageKind::HandshakeResponse => Ok(Payload::HandshakeResponse {
                name: self.content.clone(),
                public_key: self.public_key()?,
            }),
            MessageKind::Chat => {
                let body = if self.encrypted {
                    match (&self.ciphertext, &self.nonce) {
                        (Some(ciphertext), Some(nonce)) if !ciphertext.is_empty() && !nonce.is_empty() => {
                            ChatBody::Sealed {
                                ciphertext: ciphertext.clone(),
                                nonce: nonce.clone(),
                            }
                        }
                        _ => return Err(PayloadError::MissingCiphertext),
                    }
                } else {
                    ChatBody::Plain(self.content.clone())
                };
                Ok(Payload::Chat(body))
            }
            MessageKind::FileRequest => Ok(Payload::FileRequest(self.decode_data()?)),
            MessageKind::FileResponse => Ok(Payload::FileResponse(self.decode_data()?)),
            MessageKind::FileChunk => Ok(Payload::FileChunk(self.decode_data()?)),
            MessageKind::UpdateName => Ok(Payload::UpdateName(self.content.clone())),
            MessageKind::Unknown => Err(PayloadError::UnknownKind),
        }
    }

    fn public_key(&self) -> Result<[u8; KEY_SIZE], PayloadError> {
        let raw = self.sender_pubkey.as_deref().unwrap_or_default();
        raw.try_into().map_err(|_| PayloadError::BadPublicKey(raw.len()))
    }

    fn decode_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let data = self.data.clone().ok_or(PayloadError::MissingData(self.kind))?;
        serde_json::from_value(data).map_err(|e| PayloadError::Malformed(self.kind, e.to_string()))
    }
}

/// Typed view of an envelope, selected by kind
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake { name: String, public_key: [u8; KEY_SIZE] },
    HandshakeResponse { name: String, public_key: [u8; KEY_SIZE] },
    Chat(ChatBody),
    FileRequest(FileTransferRequest),
    FileResponse(FileTransferResponse),
    FileChunk(FileChunk),
    UpdateName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatBody {
    Plain(String),
    Sealed { ciphertext: Vec<u8>, nonce: Vec<u8> },
}

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("public key must be 32 bytes, got {0}")]
    BadPublicKey(usize),
    #[error("{0} envelope has no data")]
    MissingData(MessageKind),
    #[error("malformed {0} data: {1}")]
    Malformed(MessageKind, String),
    #[error("encrypted chat without ciphertext/nonce")]
    MissingCiphertext,
    #[error("unknown envelope kind")]
    UnknownKind,
}

// =============================================================================
// FILE TRANSFER PAYLOADS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferRequest {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferResponse {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub file_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub file_id: String,
    pub chunk_num: u64,
    pub total_chunks: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "b64::vec")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::option")]
    pub nonce: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::option")]
    pub ciphertext: Option<Vec<u8>>,
}

impl FileChunk {
    pub fn is_last(&self) -> bool {
        self.chunk_num + 1 == self.total_chunks
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Announce,
    Response,
}

/// Unauthenticated UDP advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

// =============================================================================
// BASE64 BYTE FIELDS
// =============================================================================

/// Byte fields travel as standard base64 strings (Go `[]byte` JSON encoding)
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub mod vec {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&STANDARD.encode(bytes))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(s) => STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom),
                None => Ok(Vec::new()),
            }
        }
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => s.serialize_str(&STANDARD.encode(b)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(s) => STANDARD
                    .decode(s.as_bytes())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_field_names() {
        let mut env = Envelope::chat("a", "all", "");
        env.encrypted = true;
        env.nonce = Some(vec![1, 2, 3]);
        env.ciphertext = Some(vec![4, 5]);
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();

        assert_eq!(json["type"], "chat");
        assert_eq!(json["encrypted"], true);
        assert_eq!(json["nonce"], "AQID");
        assert_eq!(json["ciphertext"], "BAU=");
        assert!(json.get("data").is_none());
        assert!(json.get("sender_pubkey").is_none());
    }

    #[test]
    fn test_decodes_go_style_envelope() {
        // As emitted by the reference client: zero timestamp, null data
        let raw = r#"{"type":"update_name","from":"10.0.0.2_1","to":"all","content":"bob",
            "timestamp":"0001-01-01T00:00:00Z","encrypted":false}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.kind, MessageKind::UpdateName);
        assert_eq!(env.payload().unwrap(), Payload::UpdateName("bob".into()));
    }

    #[test]
    fn test_unknown_kind_is_not_a_decode_error() {
        let env: Envelope = serde_json::from_str(r#"{"type":"typing","from":"x"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Unknown);
        assert_eq!(env.payload(), Err(PayloadError::UnknownKind));
    }

    #[test]
    fn test_handshake_payload_requires_32_byte_key() {
        let mut env = Envelope::handshake("a", "alice", &[3u8; 32]);
        match env.payload().unwrap() {
            Payload::Handshake { name, public_key } => {
                assert_eq!(name, "alice");
                assert_eq!(public_key, [3u8; 32]);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        env.sender_pubkey = Some(vec![0u8; 16]);
        assert_eq!(env.payload(), Err(PayloadError::BadPublicKey(16)));

        env.sender_pubkey = None;
        assert_eq!(env.payload(), Err(PayloadError::BadPublicKey(0)));
    }

    #[test]
    fn test_file_request_payload() {
        let req = FileTransferRequest {
            kind: "file_request".into(),
            file_id: "f1".into(),
            file_name: "notes.txt".into(),
            file_size: 42,
            from: "a".into(),
            to: "b".into(),
            timestamp: Utc::now(),
        };
        let env = Envelope::file_request("a", &req);
        assert_eq!(env.to, "b");
        assert_eq!(env.data.as_ref().unwrap()["fileId"], "f1");
        assert_eq!(env.payload().unwrap(), Payload::FileRequest(req));
    }

    #[test]
    fn test_malformed_data_is_payload_error() {
        let mut env = Envelope::new(MessageKind::FileResponse, "a", "b", "");
        assert_eq!(env.payload(), Err(PayloadError::MissingData(MessageKind::FileResponse)));

        env.data = Some(serde_json::json!({"fileId": 12}));
        assert!(matches!(env.payload(), Err(PayloadError::Malformed(MessageKind::FileResponse, _))));
    }

    #[test]
    fn test_encrypted_chat_without_ciphertext() {
        let mut env = Envelope::chat("a", "all", "");
        env.encrypted = true;
        assert_eq!(env.payload(), Err(PayloadError::MissingCiphertext));
    }

    #[test]
    fn test_chunk_data_base64_and_last() {
        let chunk = FileChunk {
            kind: "file_chunk".into(),
            file_id: "f".into(),
            chunk_num: 2,
            total_chunks: 3,
            data: b"hi".to_vec(),
            timestamp: Utc::now(),
            encrypted: false,
            nonce: None,
            ciphertext: None,
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["data"], "aGk=");
        assert_eq!(json["chunkNum"], 2);
        assert!(chunk.is_last());

        let back: FileChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, b"hi");
    }

    #[test]
    fn test_empty_chunk_accepts_null_data() {
        let raw = r#"{"fileId":"f","chunkNum":0,"totalChunks":1,"data":null}"#;
        let chunk: FileChunk = serde_json::from_str(raw).unwrap();
        assert!(chunk.data.is_empty());
        assert!(chunk.is_last());
    }

    #[test]
    fn test_discovery_packet_wire() {
        let raw = r#"{"type":"announce","id":"n1","name":"alice","ip":"192.168.1.4","port":8888}"#;
        let pkt: DiscoveryPacket = serde_json::from_str(raw).unwrap();
        assert_eq!(pkt.kind, DiscoveryKind::Announce);
        assert_eq!(pkt.port, 8888);
    }
}
