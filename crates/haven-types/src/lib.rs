/// Haven shared types.
///
/// Identifiers and enums shared between the channel subsystem, the storage
/// layer and tooling. Kept free of any storage or runtime dependency.

pub mod models;

pub use models::{ChannelId, MessageId, MessageType, RoundId, SentStatus, UnknownMessageType};
