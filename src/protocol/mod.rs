//! Wire types for the secure-messaging core.
//!
//! Everything on the wire is JSON with base64-encoded byte fields:
//! the encrypted envelope, the pre-verification control frames, and
//! the plaintext message that rides inside the ciphertext. This
//! module owns serialization only. It holds no key material and
//! performs no crypto.

use serde::{Deserialize, Serialize};

use crate::crypto::{NONCE_LEN, SIG_LEN};
use crate::error::Fault;

/// The encrypted envelope as it crosses the wire.
///
/// `dh` is the sender's current ratchet public key. It rides outside
/// the ciphertext so the receiver can follow a DH rotation before
/// deriving the message key; the plaintext carries its own copy and
/// the two must agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "b64_nonce")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "b64")]
    pub cipher: Vec<u8>,
    #[serde(with = "b64_sig")]
    pub sig: [u8; SIG_LEN],
    #[serde(with = "b64_key")]
    pub dh: [u8; 32],
    /// `type: "file"` for file-chunk envelopes; absent for text.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EnvelopeKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "file")]
    File,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Fault> {
        serde_json::to_vec(self).map_err(|e| Fault::Codec(format!("envelope encode: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fault> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| Fault::Codec(format!("envelope decode: {e}")))?;
        if envelope.cipher.is_empty() {
            return Err(Fault::Codec("envelope with empty ciphertext".into()));
        }
        Ok(envelope)
    }
}

/// Plaintext message carried inside `Envelope::cipher`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: MessageContent,
    /// Milliseconds since the epoch, jittered before encryption.
    pub timestamp: i64,
    pub counter: u32,
    #[serde(rename = "dhKey", with = "b64_key")]
    pub dh_key: [u8; 32],
}

/// UTF-8 text or one file-transfer payload object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    File(FilePayload),
}

/// One encrypted file chunk plus enough metadata to place it.
///
/// The offer fields (`filename`, `size`, `checksum`) travel on the
/// first chunk only; later chunks carry just their index and digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// SHA-256 of the whole file, hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub index: u32,
    pub total: u32,
    /// SHA-256 of this chunk, hex.
    pub chunk_checksum: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Control traffic: plaintext JSON before verification, and the
/// keep-alive pair inside the AEAD afterwards. One tagged sum matched
/// exhaustively by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "verification_challenge")]
    VerificationChallenge {
        #[serde(with = "b64_key")]
        challenge: [u8; 32],
    },
    #[serde(rename = "verification_response")]
    VerificationResponse {
        #[serde(with = "b64_key")]
        response: [u8; 32],
    },
    #[serde(rename = "verification_success")]
    VerificationSuccess { timestamp: i64 },
    #[serde(rename = "keepalive")]
    Keepalive {
        timestamp: i64,
        /// 32 random bytes in place of content, so the padded frame
        /// is indistinguishable from a small message.
        #[serde(default, with = "b64")]
        cover: Vec<u8>,
    },
    #[serde(rename = "keepalive_ack")]
    KeepaliveAck { timestamp: i64 },
}

impl ControlFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Fault> {
        serde_json::to_vec(self).map_err(|e| Fault::Codec(format!("control encode: {e}")))
    }

    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            ControlFrame::VerificationChallenge { .. }
                | ControlFrame::VerificationResponse { .. }
                | ControlFrame::VerificationSuccess { .. }
        )
    }
}

/// A decoded datagram payload: either a control frame or an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireFrame {
    Control(ControlFrame),
    Envelope(Envelope),
}

impl WireFrame {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fault> {
        let frame: WireFrame = serde_json::from_slice(bytes)
            .map_err(|e| Fault::Codec(format!("frame decode: {e}")))?;
        if let WireFrame::Envelope(ref envelope) = frame {
            if envelope.cipher.is_empty() {
                return Err(Fault::Codec("envelope with empty ciphertext".into()));
            }
        }
        Ok(frame)
    }
}

/// What a ratchet decrypt produced: application plaintext or an
/// encrypted keep-alive (which never advances counters).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InnerPlaintext {
    Control(ControlFrame),
    Message(ChatMessage),
}

impl InnerPlaintext {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Fault> {
        serde_json::to_vec(self).map_err(|e| Fault::Codec(format!("plaintext encode: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Fault> {
        serde_json::from_slice(bytes).map_err(|e| Fault::Codec(format!("plaintext decode: {e}")))
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

macro_rules! b64_fixed {
    ($name:ident, $len:expr) => {
        mod $name {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine;
            use serde::{Deserialize, Deserializer, Serializer};

            pub fn serialize<S: Serializer>(
                bytes: &[u8; $len],
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&STANDARD.encode(bytes))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<[u8; $len], D::Error> {
                let s: String = Deserialize::deserialize(deserializer)?;
                let decoded = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
                <[u8; $len]>::try_from(decoded.as_slice()).map_err(|_| {
                    serde::de::Error::custom(format!("expected {} bytes", $len))
                })
            }
        }
    };
}

b64_fixed!(b64_nonce, crate::crypto::NONCE_LEN);
b64_fixed!(b64_key, 32);
b64_fixed!(b64_sig, crate::crypto::SIG_LEN);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope(kind: Option<EnvelopeKind>) -> Envelope {
        Envelope {
            nonce: [1u8; NONCE_LEN],
            cipher: vec![2, 3, 4],
            sig: [5u8; SIG_LEN],
            dh: [6u8; 32],
            kind,
        }
    }

    #[test]
    fn envelope_json_shape() {
        let bytes = sample_envelope(None).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("nonce").unwrap().is_string());
        assert!(value.get("cipher").unwrap().is_string());
        assert!(value.get("sig").unwrap().is_string());
        assert!(value.get("dh").unwrap().is_string());
        assert!(value.get("type").is_none());

        let bytes = sample_envelope(Some(EnvelopeKind::File)).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value.get("type").unwrap(), "file");
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = sample_envelope(Some(EnvelopeKind::File));
        let parsed = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.nonce, envelope.nonce);
        assert_eq!(parsed.cipher, envelope.cipher);
        assert_eq!(parsed.sig, envelope.sig);
        assert_eq!(parsed.dh, envelope.dh);
        assert_eq!(parsed.kind, Some(EnvelopeKind::File));
    }

    #[test]
    fn empty_ciphertext_is_a_codec_fault() {
        let mut envelope = sample_envelope(None);
        envelope.cipher.clear();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let err = Envelope::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), "codec");
    }

    #[test]
    fn malformed_json_is_a_codec_fault() {
        let err = WireFrame::from_bytes(b"{not json").unwrap_err();
        assert_eq!(err.kind(), "codec");
        let err = Envelope::from_bytes(b"[1,2,3]").unwrap_err();
        assert_eq!(err.kind(), "codec");
    }

    #[test]
    fn control_frames_use_wire_type_tags() {
        let frame = ControlFrame::VerificationChallenge { challenge: [7u8; 32] };
        let value: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(value.get("type").unwrap(), "verification_challenge");

        let frame = ControlFrame::KeepaliveAck { timestamp: 123 };
        let value: serde_json::Value =
            serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(value.get("type").unwrap(), "keepalive_ack");
        assert_eq!(value.get("timestamp").unwrap(), 123);
    }

    #[test]
    fn wire_frame_dispatch() {
        let control = ControlFrame::Keepalive { timestamp: 5, cover: vec![0; 32] };
        match WireFrame::from_bytes(&control.to_bytes().unwrap()).unwrap() {
            WireFrame::Control(ControlFrame::Keepalive { timestamp, cover }) => {
                assert_eq!(timestamp, 5);
                assert_eq!(cover.len(), 32);
            }
            other => panic!("expected keepalive, got {other:?}"),
        }

        let envelope = sample_envelope(None);
        match WireFrame::from_bytes(&envelope.to_bytes().unwrap()).unwrap() {
            WireFrame::Envelope(e) => assert_eq!(e.cipher, vec![2, 3, 4]),
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    #[test]
    fn inner_plaintext_dispatch() {
        let message = ChatMessage {
            content: MessageContent::Text("hello".into()),
            timestamp: 1_700_000_000_000,
            counter: 3,
            dh_key: [9u8; 32],
        };
        let bytes = InnerPlaintext::Message(message).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value.get("counter").unwrap(), 3);
        assert!(value.get("dhKey").unwrap().is_string());

        match InnerPlaintext::from_bytes(&bytes).unwrap() {
            InnerPlaintext::Message(m) => match m.content {
                MessageContent::Text(t) => assert_eq!(t, "hello"),
                other => panic!("expected text, got {other:?}"),
            },
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn file_payload_round_trip() {
        let payload = FilePayload {
            file_id: "ab12".into(),
            filename: Some("notes.txt".into()),
            size: Some(10),
            checksum: Some("aa".repeat(32)),
            index: 0,
            total: 1,
            chunk_checksum: "bb".repeat(32),
            data: vec![1, 2, 3],
        };
        let message = ChatMessage {
            content: MessageContent::File(payload),
            timestamp: 0,
            counter: 0,
            dh_key: [0u8; 32],
        };
        let bytes = InnerPlaintext::Message(message).to_bytes().unwrap();
        match InnerPlaintext::from_bytes(&bytes).unwrap() {
            InnerPlaintext::Message(ChatMessage {
                content: MessageContent::File(p),
                ..
            }) => {
                assert_eq!(p.filename.as_deref(), Some("notes.txt"));
                assert_eq!(p.data, vec![1, 2, 3]);
            }
            other => panic!("expected file payload, got {other:?}"),
        }
    }
}
