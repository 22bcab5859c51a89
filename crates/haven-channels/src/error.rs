use haven_db::{Kv, KvError};
use haven_types::{ChannelId, MessageType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelsError {
    /// A read or write for one channel's records failed.
    #[error("{op} failed for channel {channel_id}: {source}")]
    Storage {
        channel_id: ChannelId,
        op: &'static str,
        #[source]
        source: KvError,
    },

    /// A read or write of a channel-ID index failed.
    #[error("{op} failed: {source}")]
    Index {
        op: &'static str,
        #[source]
        source: KvError,
    },

    #[error(
        "{op} failed for {}: could not encode or decode record: {source}",
        .channel_id.map_or_else(|| "channel index".to_string(), |id| format!("channel {}", id))
    )]
    Codec {
        channel_id: Option<ChannelId>,
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("lease for {action} in channel {channel_id} has already expired")]
    LeaseExpired {
        channel_id: ChannelId,
        action: MessageType,
    },

    #[error("replay function not registered")]
    ReplayFnNotRegistered,

    #[error("lease worker already started")]
    AlreadyStarted,

    #[error("lease worker has stopped")]
    WorkerStopped,

    #[error("could not spawn {thread} thread: {source}")]
    Spawn {
        thread: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelsError {
    /// True when the underlying store reported a missing key. Loaders treat
    /// this as empty state rather than a failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage { source, .. } | Self::Index { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True when `kv`, the store the failed operation ran against, reports
    /// the underlying error as a missing key.
    pub fn is_missing(&self, kv: &dyn Kv) -> bool {
        match self {
            Self::Storage { source, .. } | Self::Index { source, .. } => !kv.exists(source),
            _ => false,
        }
    }

    /// The channel this error concerns, if any.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Self::Storage { channel_id, .. }
            | Self::LeaseExpired { channel_id, .. } => Some(*channel_id),
            Self::Codec { channel_id, .. } => *channel_id,
            _ => None,
        }
    }
}
