//! natter wire messages.
//!
//! Every frame carries a one-byte [`MsgType`] tag followed by a type-specific
//! body. Control bodies are CBOR maps; unknown keys are ignored and optional
//! fields default, so newer peers can add fields without breaking older ones.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Protocol version carried in `Register` and `ForwardRequest`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Width of a [`SessionId`] in bytes.
pub const SESSION_ID_LEN: usize = 16;

/// Numeric message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Register = 0x01,
    RegisterAck = 0x02,
    ForwardRequest = 0x03,
    ForwardAck = 0x04,
    ForwardNotify = 0x05,
    Join = 0x06,
    DataFrame = 0x07,
    Close = 0x08,
    Heartbeat = 0x09,
}

impl From<MsgType> for u8 {
    fn from(m: MsgType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x01 => Ok(Self::Register),
            0x02 => Ok(Self::RegisterAck),
            0x03 => Ok(Self::ForwardRequest),
            0x04 => Ok(Self::ForwardAck),
            0x05 => Ok(Self::ForwardNotify),
            0x06 => Ok(Self::Join),
            0x07 => Ok(Self::DataFrame),
            0x08 => Ok(Self::Close),
            0x09 => Ok(Self::Heartbeat),
            _ => Err(format!("unknown message type: 0x{v:02x}")),
        }
    }
}

// ── Session IDs ───────────────────────────────────────────────────────

/// Unguessable identifier of one relay session.
///
/// Generated from the operating system's CSPRNG; encoded on the wire as a
/// fixed-width byte string and shown as hex in logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_LEN]);

impl SessionId {
    /// Generate a fresh random session ID.
    pub fn random() -> Self {
        let mut bytes = [0u8; SESSION_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SESSION_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a session ID from a slice, which must be exactly
    /// [`SESSION_ID_LEN`] bytes long.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; SESSION_ID_LEN] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_LEN] {
        &self.0
    }

    /// First eight hex characters, for compact log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SessionIdVisitor;

        impl<'de> serde::de::Visitor<'de> for SessionIdVisitor {
            type Value = SessionId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a {SESSION_ID_LEN}-byte session id")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<SessionId, E> {
                SessionId::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<SessionId, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<SessionId, A::Error> {
                let mut bytes = [0u8; SESSION_ID_LEN];
                for (i, slot) in bytes.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                if seq.next_element::<u8>()?.is_some() {
                    return Err(serde::de::Error::invalid_length(SESSION_ID_LEN + 1, &self));
                }
                Ok(SessionId(bytes))
            }
        }

        deserializer.deserialize_bytes(SessionIdVisitor)
    }
}

// ── Reason codes ──────────────────────────────────────────────────────

/// Why a registration, forward request or session was refused or ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Closed,
    NameInUse,
    InvalidName,
    PeerNotFound,
    PeerUnreachable,
    SelfForward,
    DialFailed,
    PolicyDenied,
    IdleTimeout,
    TransportError,
    ProtocolError,
    UnsupportedVersion,
    UnknownSession,
    Busy,
    SetupTimeout,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::NameInUse => "name_in_use",
            Self::InvalidName => "invalid_name",
            Self::PeerNotFound => "peer_not_found",
            Self::PeerUnreachable => "peer_unreachable",
            Self::SelfForward => "self_forward",
            Self::DialFailed => "dial_failed",
            Self::PolicyDenied => "policy_denied",
            Self::IdleTimeout => "idle_timeout",
            Self::TransportError => "transport_error",
            Self::ProtocolError => "protocol_error",
            Self::UnsupportedVersion => "unsupported_version",
            Self::UnknownSession => "unknown_session",
            Self::Busy => "busy",
            Self::SetupTimeout => "setup_timeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Message payloads ──────────────────────────────────────────────────

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(default = "default_version")]
    pub version: u8,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAckPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The client's address as seen by the broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequestPayload {
    #[serde(default = "default_version")]
    pub version: u8,
    /// Name of the requesting client.
    #[serde(default)]
    pub source: String,
    pub peer_name: String,
    pub target_addr: String,
    /// Command to run on the peer instead of dialing `target_addr`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardAckPayload {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CloseReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardNotifyPayload {
    pub session_id: SessionId,
    #[serde(default)]
    pub source: String,
    pub target_addr: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePayload {
    pub session_id: SessionId,
    pub reason: CloseReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Relay payload. Encoded raw, not as CBOR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub session_id: Option<SessionId>,
    pub payload: Vec<u8>,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register(RegisterPayload),
    RegisterAck(RegisterAckPayload),
    ForwardRequest(ForwardRequestPayload),
    ForwardAck(ForwardAckPayload),
    ForwardNotify(ForwardNotifyPayload),
    Join(JoinPayload),
    Data(DataFrame),
    Close(ClosePayload),
    Heartbeat,
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Register(_) => MsgType::Register,
            Self::RegisterAck(_) => MsgType::RegisterAck,
            Self::ForwardRequest(_) => MsgType::ForwardRequest,
            Self::ForwardAck(_) => MsgType::ForwardAck,
            Self::ForwardNotify(_) => MsgType::ForwardNotify,
            Self::Join(_) => MsgType::Join,
            Self::Data(_) => MsgType::DataFrame,
            Self::Close(_) => MsgType::Close,
            Self::Heartbeat => MsgType::Heartbeat,
        }
    }

    /// Short name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "Register",
            Self::RegisterAck(_) => "RegisterAck",
            Self::ForwardRequest(_) => "ForwardRequest",
            Self::ForwardAck(_) => "ForwardAck",
            Self::ForwardNotify(_) => "ForwardNotify",
            Self::Join(_) => "Join",
            Self::Data(_) => "DataFrame",
            Self::Close(_) => "Close",
            Self::Heartbeat => "Heartbeat",
        }
    }
}

// ── Message builders ─────────────────────────────────────────────────

pub fn register(name: &str) -> Message {
    Message::Register(RegisterPayload {
        version: PROTOCOL_VERSION,
        name: name.to_string(),
    })
}

pub fn register_ok(observed_addr: Option<String>) -> Message {
    Message::RegisterAck(RegisterAckPayload {
        ok: true,
        reason: None,
        detail: None,
        observed_addr,
    })
}

pub fn register_fail(reason: CloseReason, detail: &str) -> Message {
    Message::RegisterAck(RegisterAckPayload {
        ok: false,
        reason: Some(reason),
        detail: Some(detail.to_string()),
        observed_addr: None,
    })
}

pub fn forward_ok(session_id: SessionId) -> Message {
    Message::ForwardAck(ForwardAckPayload {
        ok: true,
        session_id: Some(session_id),
        reason: None,
        detail: None,
    })
}

pub fn forward_fail(reason: CloseReason, detail: &str) -> Message {
    Message::ForwardAck(ForwardAckPayload {
        ok: false,
        session_id: None,
        reason: Some(reason),
        detail: Some(detail.to_string()),
    })
}

pub fn join(session_id: SessionId) -> Message {
    Message::Join(JoinPayload { session_id })
}

pub fn close(session_id: SessionId, reason: CloseReason, detail: Option<&str>) -> Message {
    Message::Close(ClosePayload {
        session_id,
        reason,
        detail: detail.map(|s| s.to_string()),
    })
}

pub fn data(payload: &[u8]) -> Message {
    Message::Data(DataFrame {
        session_id: None,
        payload: payload.to_vec(),
    })
}
