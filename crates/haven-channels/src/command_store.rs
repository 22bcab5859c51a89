use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use haven_db::{Kv, PrefixedKv, VersionedObject};
use haven_types::{ChannelId, MessageId, MessageType, RoundId, SentStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::base64_bytes;
use crate::error::ChannelsError;
use crate::fingerprint::CommandFingerprint;

const COMMAND_STORE_PREFIX: &str = "channelCommandStore";
const COMMAND_STORE_VERSION: u64 = 0;

/// Everything known about a channel command message, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub message_type: MessageType,
    #[serde(default)]
    pub nickname: String,
    /// Sanitized command content. Together with the channel and type it
    /// determines the storage key.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    /// Encrypted channel message as received, kept for re-broadcast.
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
    /// Queue time of the round the message (or its latest replay) was sent on.
    pub timestamp: DateTime<Utc>,
    /// Time the sender first queued the command.
    pub originating_timestamp: DateTime<Utc>,
    pub lease: Duration,
    pub originating_round: RoundId,
    /// Round of the most recent replay.
    pub round: RoundId,
    #[serde(default)]
    pub status: SentStatus,
    #[serde(default)]
    pub from_admin: bool,
}

/// Persists one [`CommandMessage`] per command fingerprint.
#[derive(Clone)]
pub struct CommandStore {
    kv: PrefixedKv,
}

impl CommandStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self {
            kv: PrefixedKv::new(kv, COMMAND_STORE_PREFIX),
        }
    }

    pub fn save_command(&self, cm: &CommandMessage) -> Result<(), ChannelsError> {
        let key = storage_key(&cm.channel_id, cm.message_type, &cm.content);
        debug!(
            channel_id = %cm.channel_id,
            action = %cm.message_type,
            key = %key,
            "Storing command message"
        );

        let data = serde_json::to_vec(cm).map_err(|source| ChannelsError::Codec {
            channel_id: Some(cm.channel_id),
            op: "save command",
            source,
        })?;

        self.kv
            .set(&key, &VersionedObject::new(COMMAND_STORE_VERSION, data))
            .map_err(|source| ChannelsError::Storage {
                channel_id: cm.channel_id,
                op: "save command",
                source,
            })
    }

    pub fn load_command(
        &self,
        channel_id: &ChannelId,
        message_type: MessageType,
        content: &[u8],
    ) -> Result<CommandMessage, ChannelsError> {
        let key = storage_key(channel_id, message_type, content);
        debug!(%channel_id, action = %message_type, key = %key, "Loading command message");

        let obj = self
            .kv
            .get(&key, COMMAND_STORE_VERSION)
            .map_err(|source| ChannelsError::Storage {
                channel_id: *channel_id,
                op: "load command",
                source,
            })?;

        serde_json::from_slice(&obj.data).map_err(|source| ChannelsError::Codec {
            channel_id: Some(*channel_id),
            op: "load command",
            source,
        })
    }

    /// True when `err`, returned by this store, means the command was never
    /// stored.
    pub fn is_missing(&self, err: &ChannelsError) -> bool {
        err.is_missing(&self.kv)
    }

    /// Deleting a command that was never stored succeeds.
    pub fn delete_command(
        &self,
        channel_id: &ChannelId,
        message_type: MessageType,
        content: &[u8],
    ) -> Result<(), ChannelsError> {
        let key = storage_key(channel_id, message_type, content);
        debug!(%channel_id, action = %message_type, key = %key, "Deleting command message");

        self.kv
            .delete(&key, COMMAND_STORE_VERSION)
            .map_err(|source| ChannelsError::Storage {
                channel_id: *channel_id,
                op: "delete command",
                source,
            })
    }
}

fn storage_key(channel_id: &ChannelId, message_type: MessageType, content: &[u8]) -> String {
    CommandFingerprint::new(channel_id, message_type, content)
        .key()
        .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use haven_db::MemKv;
    use uuid::Uuid;

    pub(crate) fn sample_command(channel_id: ChannelId, content: &[u8]) -> CommandMessage {
        let now = Utc::now();
        CommandMessage {
            channel_id,
            message_id: MessageId([9; 32]),
            message_type: MessageType::Pinned,
            nickname: "admin".into(),
            content: content.to_vec(),
            encrypted_payload: b"ciphertext".to_vec(),
            timestamp: now,
            originating_timestamp: now,
            lease: Duration::from_secs(3600),
            originating_round: RoundId(10),
            round: RoundId(12),
            status: SentStatus::Delivered,
            from_admin: true,
        }
    }

    #[test]
    fn save_then_load_returns_same_command() {
        let store = CommandStore::new(Arc::new(MemKv::new()));
        let channel_id = ChannelId(Uuid::from_u128(1));
        let cm = sample_command(channel_id, b"pin me");

        store.save_command(&cm).unwrap();
        let loaded = store
            .load_command(&channel_id, MessageType::Pinned, b"pin me")
            .unwrap();
        assert_eq!(loaded, cm);
    }

    #[test]
    fn load_missing_is_not_found() {
        let store = CommandStore::new(Arc::new(MemKv::new()));
        let err = store
            .load_command(&ChannelId(Uuid::from_u128(1)), MessageType::Mute, b"x")
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(store.is_missing(&err));
    }

    #[test]
    fn delete_removes_only_that_command() {
        let mem = Arc::new(MemKv::new());
        let store = CommandStore::new(mem.clone());
        let channel_id = ChannelId(Uuid::from_u128(1));
        store.save_command(&sample_command(channel_id, b"a")).unwrap();
        store.save_command(&sample_command(channel_id, b"b")).unwrap();

        store
            .delete_command(&channel_id, MessageType::Pinned, b"a")
            .unwrap();

        assert!(
            store
                .load_command(&channel_id, MessageType::Pinned, b"a")
                .unwrap_err()
                .is_not_found()
        );
        assert!(store.load_command(&channel_id, MessageType::Pinned, b"b").is_ok());
        assert_eq!(mem.keys().len(), 1);
        assert!(mem.keys()[0].starts_with("channelCommandStore/"));
    }

    #[test]
    fn stored_json_uses_base64_payloads() {
        let cm = sample_command(ChannelId(Uuid::from_u128(1)), b"pin me");
        let json: serde_json::Value = serde_json::to_value(&cm).unwrap();
        assert_eq!(json["content"], "cGluIG1l");
        assert_eq!(json["message_type"], 102);
    }
}
