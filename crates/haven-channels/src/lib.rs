/// Haven channel moderation leases.
///
/// Timed moderation actions (pin, mute, delete) are scheduled on an
/// [`ActionLeaseList`] and undone exactly once when their lease runs out,
/// surviving restarts through the versioned store. A [`ReplayBlocker`] sits in
/// front of it and rejects replays of commands that were superseded on a
/// newer round.
///
/// - `fingerprint`: content-addressed keys for (channel, action, payload)
/// - `command_store`: one persisted command record per fingerprint
/// - `replay_blocker`: per-channel newest-round guard
/// - `lease`: the single-worker lease scheduler

mod codec;
pub mod command_store;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lease;
pub mod replay_blocker;

pub use command_store::{CommandMessage, CommandStore};
pub use config::LeaseConfig;
pub use error::ChannelsError;
pub use fingerprint::{CommandFingerprint, Fingerprint, FingerprintKey, LeaseFingerprint};
pub use lease::{
    ActionLeaseList, ActionUndo, LeaseFault, LeaseMessage, LeaseQueue, LeaseRequest,
    LeaseThread, ReplayActionFn, UndoActionFn, VALID_FOREVER,
};
pub use replay_blocker::{ChannelCommand, CommandRecord, ReplayBlocker, TriggerLeaseReplay};
