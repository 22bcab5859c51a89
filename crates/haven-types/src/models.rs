use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

// -- Channels --

/// Identifies a channel. Serialised as its canonical UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw 16 bytes, as fed into fingerprints and storage keys.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for ChannelId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ChannelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// -- Messages --

/// Length of a [`MessageId`] in bytes.
pub const MESSAGE_ID_LEN: usize = 32;

/// Content-derived message identifier. Serialised as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let id: [u8; MESSAGE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("message ID must be 32 bytes"))?;
        Ok(Self(id))
    }
}

/// Kind of channel message. Moderation actions (`Delete`, `Pinned`, `Mute`)
/// are the ones that carry leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum MessageType {
    Text,
    AdminText,
    Reaction,
    Silent,
    Invitation,
    Delete,
    Pinned,
    Mute,
    AdminReplay,
    FileTransfer,
}

impl MessageType {
    /// Wire code of the message type.
    pub fn code(self) -> u32 {
        match self {
            Self::Text => 1,
            Self::AdminText => 2,
            Self::Reaction => 3,
            Self::Silent => 4,
            Self::Invitation => 5,
            Self::Delete => 101,
            Self::Pinned => 102,
            Self::Mute => 103,
            Self::AdminReplay => 104,
            Self::FileTransfer => 40000,
        }
    }

    /// 4-byte little-endian form of the wire code.
    pub fn to_bytes(self) -> [u8; 4] {
        self.code().to_le_bytes()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "Text",
            Self::AdminText => "AdminText",
            Self::Reaction => "Reaction",
            Self::Silent => "Silent",
            Self::Invitation => "Invitation",
            Self::Delete => "Delete",
            Self::Pinned => "Pinned",
            Self::Mute => "Mute",
            Self::AdminReplay => "AdminReplay",
            Self::FileTransfer => "FileTransfer",
        };
        f.write_str(name)
    }
}

impl From<MessageType> for u32 {
    fn from(mt: MessageType) -> Self {
        mt.code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessageType(pub u32);

impl fmt::Display for UnknownMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message type code {}", self.0)
    }
}

impl std::error::Error for UnknownMessageType {}

impl TryFrom<u32> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Self::Text,
            2 => Self::AdminText,
            3 => Self::Reaction,
            4 => Self::Silent,
            5 => Self::Invitation,
            101 => Self::Delete,
            102 => Self::Pinned,
            103 => Self::Mute,
            104 => Self::AdminReplay,
            40000 => Self::FileTransfer,
            other => return Err(UnknownMessageType(other)),
        })
    }
}

/// Delivery status reported to the event model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentStatus {
    #[default]
    Unsent,
    Sent,
    Delivered,
    Failed,
}

// -- Rounds --

/// Network round number. Used as the logical clock for ordering replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub u64);

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
