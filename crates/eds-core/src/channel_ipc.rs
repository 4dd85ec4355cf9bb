//! NDJSON wire protocol spoken between the channel host and its clients.

use crate::slots::SlotName;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

pub const ERROR_UNSUPPORTED_VERSION: &str = "unsupported_version";
pub const ERROR_UNEXPECTED_MESSAGE: &str = "unexpected_message";
pub const ERROR_CHANNEL_UNAVAILABLE: &str = "channel_unavailable";
pub const ERROR_VALUE_TOO_LARGE: &str = "value_too_large";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);

    pub fn is_supported(self) -> bool {
        self.0 <= CURRENT_PROTOCOL_VERSION
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u64),
    Text(String),
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let version = match RawVersion::deserialize(deserializer)? {
            RawVersion::Number(value) => u16::try_from(value)
                .map_err(|_| D::Error::custom(format!("protocol version out of range: {value}")))?,
            RawVersion::Text(value) => value
                .trim()
                .trim_start_matches('v')
                .parse::<u16>()
                .map_err(|err| D::Error::custom(format!("invalid protocol version '{value}': {err}")))?,
        };
        Ok(ProtocolVersion(version))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: ChannelMsg,
}

impl ChannelEnvelope {
    pub fn new(sender_id: &str, request_id: Option<String>, msg: ChannelMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelMsg {
    Write(WritePayload),
    Read(SlotPayload),
    ReadAndClear(SlotPayload),
    Delete(SlotPayload),
    Watch(WatchPayload),
    Ack(AckPayload),
    Value(ValuePayload),
    Deleted(DeletedPayload),
    Event(SlotEvent),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WritePayload {
    pub slot: SlotName,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotPayload {
    pub slot: SlotName,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchPayload {
    /// Slot name prefixes of interest; empty means every slot.
    #[serde(default)]
    pub prefixes: Vec<String>,
}

impl WatchPayload {
    pub fn matches(&self, slot: &SlotName) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|prefix| slot.starts_with(prefix))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    #[serde(default)]
    pub slot: Option<SlotName>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValuePayload {
    pub slot: SlotName,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletedPayload {
    pub slot: SlotName,
    pub existed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotChange {
    NewValue,
    Deleted,
}

/// Change notification for one slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlotEvent {
    pub slot: SlotName,
    pub change: SlotChange,
}

impl SlotEvent {
    pub fn new_value(slot: SlotName) -> Self {
        Self {
            slot,
            change: SlotChange::NewValue,
        }
    }

    pub fn deleted(slot: SlotName) -> Self {
        Self {
            slot,
            change: SlotChange::Deleted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn new_sender_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
