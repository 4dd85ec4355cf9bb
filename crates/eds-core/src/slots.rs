//! Coordination slot names.
//!
//! Names are byte-for-byte compatible with the classic `nc` client so a
//! bridge can map them onto any property-style store.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Payload written to the presence slot and to pre-created file slots.
pub const PRESENCE_VALUE: &[u8] = b"True";
pub const FILE_PENDING_VALUE: &[u8] = b"True";

const SERVER_EXISTS_PREFIX: &str = "NEDIT_SERVER_EXISTS_";
const SERVER_REQUEST_PREFIX: &str = "NEDIT_SERVER_REQUEST_";
const FILE_PREFIX: &str = "NEDIT_FILE_";
const FILE_OPENED_SUFFIX: &str = "_WF_OPEN";
const FILE_CLOSED_SUFFIX: &str = "_WF_CLOSED";

/// Slot names embed file paths, so they are bytes rather than text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotName(Vec<u8>);

impl SlotName {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self(name.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn starts_with(&self, prefix: impl AsRef<[u8]>) -> bool {
        self.0.starts_with(prefix.as_ref())
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for SlotName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SlotName {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for SlotName {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

// Text names go over the wire as JSON strings, anything else as a byte array.
impl Serialize for SlotName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.serialize_bytes(&self.0),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSlotName {
    Text(String),
    Bytes(Vec<u8>),
}

impl<'de> Deserialize<'de> for SlotName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawSlotName::deserialize(deserializer)? {
            RawSlotName::Text(text) => Self(text.into_bytes()),
            RawSlotName::Bytes(bytes) => Self(bytes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Presence,
    Request,
    FileOpened(Vec<u8>),
    FileClosed(Vec<u8>),
    Other,
}

/// Host, user and server name triple that scopes every slot of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub host: String,
    pub user: String,
    pub server_name: String,
}

impl ServerIdentity {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            server_name: server_name.into(),
        }
    }

    /// Builds the identity from the environment; see [`crate::config`].
    pub fn resolve(server_name_flag: Option<&str>) -> Self {
        Self::new(
            crate::config::resolve_host_name(),
            crate::config::resolve_user_name(),
            crate::config::resolve_server_name(server_name_flag),
        )
    }

    fn scope(&self) -> String {
        format!("{}_{}_{}", self.host, self.user, self.server_name)
    }

    pub fn presence_slot(&self) -> SlotName {
        SlotName::from(format!("{SERVER_EXISTS_PREFIX}{}", self.scope()))
    }

    pub fn request_slot(&self) -> SlotName {
        SlotName::from(format!("{SERVER_REQUEST_PREFIX}{}", self.scope()))
    }

    /// Common prefix of every per-file slot owned by this server.
    pub fn file_slot_prefix(&self) -> String {
        format!("{FILE_PREFIX}{}_", self.scope())
    }

    pub fn file_opened_slot(&self, path: impl AsRef<[u8]>) -> SlotName {
        self.file_slot(path.as_ref(), FILE_OPENED_SUFFIX)
    }

    pub fn file_closed_slot(&self, path: impl AsRef<[u8]>) -> SlotName {
        self.file_slot(path.as_ref(), FILE_CLOSED_SUFFIX)
    }

    fn file_slot(&self, path: &[u8], suffix: &str) -> SlotName {
        let mut name = self.file_slot_prefix().into_bytes();
        name.extend_from_slice(path);
        name.extend_from_slice(suffix.as_bytes());
        SlotName(name)
    }

    pub fn classify(&self, slot: &SlotName) -> SlotKind {
        if *slot == self.presence_slot() {
            return SlotKind::Presence;
        }
        if *slot == self.request_slot() {
            return SlotKind::Request;
        }
        let prefix = self.file_slot_prefix();
        let Some(rest) = slot.as_bytes().strip_prefix(prefix.as_bytes()) else {
            return SlotKind::Other;
        };
        if let Some(path) = rest.strip_suffix(FILE_OPENED_SUFFIX.as_bytes()) {
            return SlotKind::FileOpened(path.to_vec());
        }
        if let Some(path) = rest.strip_suffix(FILE_CLOSED_SUFFIX.as_bytes()) {
            return SlotKind::FileClosed(path.to_vec());
        }
        SlotKind::Other
    }

    /// Filesystem-safe label used for the default socket directory.
    pub fn slug(&self) -> String {
        let raw = if self.server_name.is_empty() {
            format!("{}-{}", self.host, self.user)
        } else {
            format!("{}-{}-{}", self.host, self.user, self.server_name)
        };
        raw.chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }
}
