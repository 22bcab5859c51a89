/// Replay guard for channel commands.
///
/// For every (channel, action, sanitized payload) the guard remembers the
/// round the command originated on. A replay that claims an older or equal
/// originating round with a different unsanitized payload is a stale command
/// being re-wrapped: it is rejected and the stored, authoritative command is
/// scheduled for a corrective replay so the network reconverges.
///
/// ```text
/// channelReplayBlocker/channelCommandList      -> [channel_id, ...]
/// channelReplayBlocker/<hex channel_id>        -> { fingerprint: CommandRecord }
/// channelCommandStore/<fingerprint>            -> CommandMessage
/// ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use haven_db::{Kv, PrefixedKv, VersionedObject};
use haven_types::{ChannelId, MessageId, MessageType, RoundId, SentStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::codec::base64_bytes;
use crate::command_store::{CommandMessage, CommandStore};
use crate::error::ChannelsError;
use crate::fingerprint::{CommandFingerprint, CommandKey};
use crate::lease::LeaseRequest;

const REPLAY_BLOCKER_PREFIX: &str = "channelReplayBlocker";
const COMMAND_CHANNEL_LIST_KEY: &str = "channelCommandList";
const COMMAND_CHANNEL_LIST_VERSION: u64 = 0;
const CHANNEL_COMMANDS_VERSION: u64 = 0;

/// Corrective replays waiting for the correction thread. Further requests
/// are dropped while it is full.
const CORRECTION_QUEUE_CAPACITY: usize = 64;

/// Schedules a corrective replay of the stored command for
/// (channel, action, payload).
pub type TriggerLeaseReplay =
    Arc<dyn Fn(ChannelId, MessageType, &[u8]) -> Result<(), ChannelsError> + Send + Sync>;

/// An inbound, already signature-checked command message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCommand {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub action: MessageType,
    pub nickname: String,
    /// Payload exactly as received.
    pub unsanitized_payload: Vec<u8>,
    /// Payload reduced to the fields that define the action.
    pub sanitized_payload: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub originating_timestamp: DateTime<Utc>,
    pub lease: Duration,
    pub originating_round: RoundId,
    pub round: RoundId,
    pub from_admin: bool,
}

impl ChannelCommand {
    /// The lease this command asks for, keyed on the sanitized payload.
    pub fn lease_request(&self) -> LeaseRequest {
        LeaseRequest {
            channel_id: self.channel_id,
            message_id: self.message_id,
            action: self.action,
            nickname: self.nickname.clone(),
            payload: self.sanitized_payload.clone(),
            encrypted_payload: self.encrypted_payload.clone(),
            timestamp: self.timestamp,
            originating_timestamp: self.originating_timestamp,
            lease: self.lease,
            originating_round: self.originating_round,
            round: self.round,
            from_admin: self.from_admin,
        }
    }

    fn command_message(&self) -> CommandMessage {
        CommandMessage {
            channel_id: self.channel_id,
            message_id: self.message_id,
            message_type: self.action,
            nickname: self.nickname.clone(),
            content: self.sanitized_payload.clone(),
            encrypted_payload: self.encrypted_payload.clone(),
            timestamp: self.timestamp,
            originating_timestamp: self.originating_timestamp,
            lease: self.lease,
            originating_round: self.originating_round,
            round: self.round,
            status: SentStatus::Delivered,
            from_admin: self.from_admin,
        }
    }
}

/// What the guard remembers about the newest accepted copy of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub channel_id: ChannelId,
    pub action: MessageType,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub originating_round: RoundId,
    /// Truncated fingerprint of the unsanitized payload. Tells an idempotent
    /// resend apart from a different command that sanitizes identically.
    pub unsanitized_fp: u64,
}

type ChannelCommands = BTreeMap<CommandKey, CommandRecord>;

enum Verdict {
    Accepted,
    Resend,
    Rejected(CommandRecord),
}

/// A write already made by an operation that is undone if a later write of
/// the same operation fails.
enum Revert {
    ChannelCommands {
        channel_id: ChannelId,
        previous: ChannelCommands,
    },
    ChannelList(Vec<ChannelId>),
    Command(CommandMessage),
}

pub struct ReplayBlocker {
    commands_by_channel: Mutex<HashMap<ChannelId, ChannelCommands>>,
    corrections: Sender<CommandRecord>,
    /// Commands with a corrective replay queued but not yet started.
    queued_corrections: Arc<Mutex<HashSet<CommandKey>>>,
    store: CommandStore,
    kv: PrefixedKv,
    lock_warn_threshold: Duration,
}

impl ReplayBlocker {
    /// Build an empty guard and start its `replay-correction` thread, which
    /// runs `replay` for rejected commands. The thread exits once the guard
    /// is dropped.
    pub fn new(
        replay: TriggerLeaseReplay,
        store: CommandStore,
        kv: Arc<dyn Kv>,
        lock_warn_threshold: Duration,
    ) -> Result<Self, ChannelsError> {
        let (corrections, queued) = bounded(CORRECTION_QUEUE_CAPACITY);
        let queued_corrections = Arc::new(Mutex::new(HashSet::new()));

        let pending = queued_corrections.clone();
        std::thread::Builder::new()
            .name("replay-correction".into())
            .spawn(move || run_corrections(queued, replay, pending))
            .map_err(|source| ChannelsError::Spawn {
                thread: "replay-correction",
                source,
            })?;

        Ok(Self {
            commands_by_channel: Mutex::new(HashMap::new()),
            corrections,
            queued_corrections,
            store,
            kv: PrefixedKv::new(kv, REPLAY_BLOCKER_PREFIX),
            lock_warn_threshold,
        })
    }

    /// Build a guard and fill it from storage. A store that has never held
    /// replay state yields an empty guard.
    pub fn new_or_load(
        replay: TriggerLeaseReplay,
        store: CommandStore,
        kv: Arc<dyn Kv>,
        lock_warn_threshold: Duration,
    ) -> Result<Self, ChannelsError> {
        let rb = Self::new(replay, store, kv, lock_warn_threshold)?;
        let loaded = load_all(&rb.kv)?;
        info!(channels = loaded.len(), "Loaded replay blocker state");
        *rb.commands_by_channel.lock() = loaded;
        Ok(rb)
    }

    /// Decide whether `cmd` is at least as new as the stored command for its
    /// fingerprint. Accepted commands are persisted; rejected ones trigger an
    /// asynchronous corrective replay and leave state untouched.
    pub fn verify_replay(&self, cmd: &ChannelCommand) -> Result<bool, ChannelsError> {
        let fp = CommandFingerprint::new(&cmd.channel_id, cmd.action, &cmd.sanitized_payload);
        let unsanitized_fp =
            CommandFingerprint::new(&cmd.channel_id, cmd.action, &cmd.unsanitized_payload)
                .truncated();

        let record = CommandRecord {
            channel_id: cmd.channel_id,
            action: cmd.action,
            payload: cmd.sanitized_payload.clone(),
            originating_round: cmd.originating_round,
            unsanitized_fp,
        };

        let verdict = {
            let start = Instant::now();
            let mut commands = self.commands_by_channel.lock();
            let waited = start.elapsed();
            if waited > self.lock_warn_threshold {
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    "Replay blocker waited too long for its lock; message handling is being delayed"
                );
            }

            let verdict = self.verify_locked(&mut commands, fp, record, cmd);

            let held = start.elapsed().saturating_sub(waited);
            if held > self.lock_warn_threshold {
                warn!(
                    held_ms = held.as_millis() as u64,
                    channel_id = %cmd.channel_id,
                    "Replay blocker held its lock too long"
                );
            }
            verdict?
        };

        match verdict {
            Verdict::Accepted => Ok(true),
            Verdict::Resend => {
                debug!(channel_id = %cmd.channel_id, action = %cmd.action, "Accepted idempotent resend");
                Ok(true)
            }
            Verdict::Rejected(stored) => {
                info!(
                    channel_id = %cmd.channel_id,
                    action = %cmd.action,
                    stored_round = %stored.originating_round,
                    replay_round = %cmd.originating_round,
                    "Rejected stale command replay; replaying stored command"
                );
                self.queue_corrective_replay(stored);
                Ok(false)
            }
        }
    }

    fn verify_locked(
        &self,
        commands: &mut HashMap<ChannelId, ChannelCommands>,
        fp: CommandFingerprint,
        record: CommandRecord,
        cmd: &ChannelCommand,
    ) -> Result<Verdict, ChannelsError> {
        let key = fp.key();
        let channel = commands.get(&cmd.channel_id);

        if let Some(existing) = channel.and_then(|m| m.get(&key)) {
            if existing.originating_round >= record.originating_round {
                if existing.unsanitized_fp != record.unsanitized_fp {
                    return Ok(Verdict::Rejected(existing.clone()));
                }
                return Ok(Verdict::Resend);
            }
        }

        let previous = channel.cloned().unwrap_or_default();
        let new_channel = channel.is_none();
        let mut updated = previous.clone();
        updated.insert(key, record);

        // Stored command last; corrective replays read it.
        self.store_channel_commands(&cmd.channel_id, &updated)?;
        let mut done = vec![Revert::ChannelCommands {
            channel_id: cmd.channel_id,
            previous,
        }];
        if new_channel {
            let previous_ids: Vec<ChannelId> = commands.keys().copied().collect();
            let mut ids = previous_ids.clone();
            ids.push(cmd.channel_id);
            if let Err(err) = self.store_channel_list(&ids) {
                self.revert(done);
                return Err(err);
            }
            done.push(Revert::ChannelList(previous_ids));
        }
        if let Err(err) = self.store.save_command(&cmd.command_message()) {
            self.revert(done);
            return Err(err);
        }

        commands.insert(cmd.channel_id, updated);
        Ok(Verdict::Accepted)
    }

    /// Forget the command for (channel, action, payload). The per-channel map,
    /// the channel index and the command store record change together: if
    /// any write fails the earlier ones are reverted and memory is left as it
    /// was.
    pub fn remove_command(
        &self,
        channel_id: &ChannelId,
        action: MessageType,
        payload: &[u8],
    ) -> Result<(), ChannelsError> {
        let key = CommandFingerprint::new(channel_id, action, payload).key();

        let mut commands = self.commands_by_channel.lock();

        let Some(previous) = commands.get(channel_id).filter(|m| m.contains_key(&key)).cloned()
        else {
            return self.store.delete_command(channel_id, action, payload);
        };

        let mut updated = previous.clone();
        updated.remove(&key);

        self.store_channel_commands(channel_id, &updated)?;
        let mut done = vec![Revert::ChannelCommands {
            channel_id: *channel_id,
            previous,
        }];
        if updated.is_empty() {
            let previous_ids: Vec<ChannelId> = commands.keys().copied().collect();
            let ids: Vec<ChannelId> = previous_ids.iter().filter(|id| *id != channel_id).copied().collect();
            if let Err(err) = self.store_channel_list(&ids) {
                self.revert(done);
                return Err(err);
            }
            done.push(Revert::ChannelList(previous_ids));
        }
        if let Err(err) = self.store.delete_command(channel_id, action, payload) {
            self.revert(done);
            return Err(err);
        }

        if updated.is_empty() {
            commands.remove(channel_id);
        } else {
            commands.insert(*channel_id, updated);
        }
        Ok(())
    }

    /// Forget every command of a channel, e.g. when leaving it. Either the
    /// index entry, the channel's map and every stored command are all
    /// removed, or none of them are.
    pub fn remove_channel_commands(&self, channel_id: &ChannelId) -> Result<(), ChannelsError> {
        let mut commands = self.commands_by_channel.lock();

        let Some(previous) = commands.get(channel_id).cloned() else {
            return Ok(());
        };

        let previous_ids: Vec<ChannelId> = commands.keys().copied().collect();
        let ids: Vec<ChannelId> = previous_ids.iter().filter(|id| *id != channel_id).copied().collect();
        self.store_channel_list(&ids)?;
        let mut done = vec![Revert::ChannelList(previous_ids)];

        if let Err(err) = self.delete_channel_commands(channel_id) {
            self.revert(done);
            return Err(err);
        }
        done.push(Revert::ChannelCommands {
            channel_id: *channel_id,
            previous: previous.clone(),
        });

        for record in previous.values() {
            if let Err(err) = self.delete_stored_command(record, &mut done) {
                error!(
                    channel_id = %record.channel_id,
                    action = %record.action,
                    "Failed to delete command from storage: {}",
                    err
                );
                self.revert(done);
                return Err(err);
            }
        }

        commands.remove(channel_id);
        Ok(())
    }

    /// Delete the stored command behind `record`, remembering it in `done`
    /// so it can be written back.
    fn delete_stored_command(
        &self,
        record: &CommandRecord,
        done: &mut Vec<Revert>,
    ) -> Result<(), ChannelsError> {
        let saved = match self
            .store
            .load_command(&record.channel_id, record.action, &record.payload)
        {
            Ok(cm) => Some(cm),
            Err(err) if self.store.is_missing(&err) => None,
            Err(err) => return Err(err),
        };
        self.store
            .delete_command(&record.channel_id, record.action, &record.payload)?;
        if let Some(cm) = saved {
            done.push(Revert::Command(cm));
        }
        Ok(())
    }

    /// The stored record for (channel, action, payload), if any.
    pub fn command(
        &self,
        channel_id: &ChannelId,
        action: MessageType,
        payload: &[u8],
    ) -> Option<CommandRecord> {
        let key = CommandFingerprint::new(channel_id, action, payload).key();
        self.commands_by_channel
            .lock()
            .get(channel_id)
            .and_then(|m| m.get(&key))
            .cloned()
    }

    /// Number of commands tracked for a channel.
    pub fn channel_len(&self, channel_id: &ChannelId) -> usize {
        self.commands_by_channel
            .lock()
            .get(channel_id)
            .map_or(0, |m| m.len())
    }

    /// Hand `stored` to the correction thread. A command that already has a
    /// correction queued is not queued twice; when the queue is full the
    /// request is dropped.
    fn queue_corrective_replay(&self, stored: CommandRecord) {
        let key = CommandFingerprint::new(&stored.channel_id, stored.action, &stored.payload).key();
        if !self.queued_corrections.lock().insert(key.clone()) {
            debug!(channel_id = %stored.channel_id, action = %stored.action, "Corrective replay already queued");
            return;
        }

        match self.corrections.try_send(stored) {
            Ok(()) => {}
            Err(TrySendError::Full(stored)) => {
                self.queued_corrections.lock().remove(&key);
                warn!(
                    channel_id = %stored.channel_id,
                    action = %stored.action,
                    "Corrective replay queue full, dropping request"
                );
            }
            Err(TrySendError::Disconnected(stored)) => {
                self.queued_corrections.lock().remove(&key);
                error!(
                    channel_id = %stored.channel_id,
                    "Replay correction thread is gone, corrective replay not queued"
                );
            }
        }
    }

    // -- Storage --

    fn store_channel_list(&self, ids: &[ChannelId]) -> Result<(), ChannelsError> {
        let mut ids = ids.to_vec();
        ids.sort();
        let data = serde_json::to_vec(&ids).map_err(|source| ChannelsError::Codec {
            channel_id: None,
            op: "store command channel list",
            source,
        })?;
        self.kv
            .set(
                COMMAND_CHANNEL_LIST_KEY,
                &VersionedObject::new(COMMAND_CHANNEL_LIST_VERSION, data),
            )
            .map_err(|source| ChannelsError::Index {
                op: "store command channel list",
                source,
            })
    }

    /// Writes the channel's map, or deletes it once empty.
    fn store_channel_commands(
        &self,
        channel_id: &ChannelId,
        commands: &ChannelCommands,
    ) -> Result<(), ChannelsError> {
        if commands.is_empty() {
            return self.delete_channel_commands(channel_id);
        }

        let data = serde_json::to_vec(commands).map_err(|source| ChannelsError::Codec {
            channel_id: Some(*channel_id),
            op: "store command messages",
            source,
        })?;
        self.kv
            .set(
                &channel_commands_key(channel_id),
                &VersionedObject::new(CHANNEL_COMMANDS_VERSION, data),
            )
            .map_err(|source| ChannelsError::Storage {
                channel_id: *channel_id,
                op: "store command messages",
                source,
            })
    }

    fn delete_channel_commands(&self, channel_id: &ChannelId) -> Result<(), ChannelsError> {
        self.kv
            .delete(&channel_commands_key(channel_id), CHANNEL_COMMANDS_VERSION)
            .map_err(|source| ChannelsError::Storage {
                channel_id: *channel_id,
                op: "delete command messages",
                source,
            })
    }

    /// Best-effort undo of `done`, newest write first.
    fn revert(&self, done: Vec<Revert>) {
        for step in done.into_iter().rev() {
            let result = match &step {
                Revert::ChannelCommands {
                    channel_id,
                    previous,
                } => self.store_channel_commands(channel_id, previous),
                Revert::ChannelList(ids) => self.store_channel_list(ids),
                Revert::Command(cm) => self.store.save_command(cm),
            };
            if let Err(err) = result {
                error!("Failed to roll back replay blocker write: {}", err);
            }
        }
    }
}

fn run_corrections(
    queued: Receiver<CommandRecord>,
    replay: TriggerLeaseReplay,
    pending: Arc<Mutex<HashSet<CommandKey>>>,
) {
    for stored in queued.iter() {
        pending
            .lock()
            .remove(&CommandFingerprint::new(&stored.channel_id, stored.action, &stored.payload).key());
        match replay(stored.channel_id, stored.action, &stored.payload) {
            Ok(()) => debug!(channel_id = %stored.channel_id, action = %stored.action, "Scheduled corrective replay"),
            Err(err) => error!(
                channel_id = %stored.channel_id,
                action = %stored.action,
                "Failed to replay stored command: {}",
                err
            ),
        }
    }
    debug!("Replay correction thread exiting");
}

/// Read the complete persisted replay-guard state without constructing a
/// guard. Used by diagnostics.
pub fn load_snapshot(
    kv: Arc<dyn Kv>,
) -> Result<BTreeMap<ChannelId, BTreeMap<CommandKey, CommandRecord>>, ChannelsError> {
    let kv = PrefixedKv::new(kv, REPLAY_BLOCKER_PREFIX);
    Ok(load_all(&kv)?.into_iter().collect())
}

fn load_all(kv: &PrefixedKv) -> Result<HashMap<ChannelId, ChannelCommands>, ChannelsError> {
    let ids = match load_channel_list(kv) {
        Ok(ids) => ids,
        Err(err) if err.is_missing(kv) => return Ok(HashMap::new()),
        Err(err) => return Err(err),
    };

    let mut commands = HashMap::with_capacity(ids.len());
    for channel_id in ids {
        commands.insert(channel_id, load_channel_commands(kv, &channel_id)?);
    }
    Ok(commands)
}

fn load_channel_list(kv: &PrefixedKv) -> Result<Vec<ChannelId>, ChannelsError> {
    let obj = kv
        .get(COMMAND_CHANNEL_LIST_KEY, COMMAND_CHANNEL_LIST_VERSION)
        .map_err(|source| ChannelsError::Index {
            op: "load command channel list",
            source,
        })?;
    serde_json::from_slice(&obj.data).map_err(|source| ChannelsError::Codec {
        channel_id: None,
        op: "load command channel list",
        source,
    })
}

fn load_channel_commands(
    kv: &PrefixedKv,
    channel_id: &ChannelId,
) -> Result<ChannelCommands, ChannelsError> {
    let obj = kv
        .get(&channel_commands_key(channel_id), CHANNEL_COMMANDS_VERSION)
        .map_err(|source| ChannelsError::Storage {
            channel_id: *channel_id,
            op: "load command messages",
            source,
        })?;
    serde_json::from_slice(&obj.data).map_err(|source| ChannelsError::Codec {
        channel_id: Some(*channel_id),
        op: "load command messages",
        source,
    })
}

fn channel_commands_key(channel_id: &ChannelId) -> String {
    hex::encode(channel_id.as_bytes())
}
