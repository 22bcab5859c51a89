/// Timed moderation leases.
///
/// Every pin, mute or delete with a lease is scheduled here and undone
/// exactly once when the lease runs out. Leases longer than the network's
/// message life are replayed at a jittered point before the network forgets
/// them, then rescheduled.
///
/// All mutation happens on one worker thread fed by a bounded FIFO of
/// [`LeaseCommand`]s; callers only ever send.

mod schedule;
mod storage;
mod trigger;
mod worker;

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use haven_db::Kv;
use haven_types::{ChannelId, MessageId, MessageType, RoundId, SentStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::{base64_bytes, truncated_hex};
use crate::command_store::CommandStore;
use crate::config::LeaseConfig;
use crate::error::ChannelsError;
use crate::fingerprint::{LeaseFingerprint, LeaseKey};
use crate::replay_blocker::{ChannelCommand, ReplayBlocker, TriggerLeaseReplay};

use storage::LeaseStorage;
use trigger::{is_expired, rand_duration_in_range, saturating_add};
use worker::{CallbackJob, LeaseWorker};

/// Lease that never runs out. Such actions are replayed once per message life
/// for as long as they stand.
pub const VALID_FOREVER: Duration = Duration::MAX;

/// Nickname attached to actions the lease system sends on its own behalf.
pub const LEASE_NICKNAME: &str = "LeaseSystem";

/// Undoes an expired action. Returns the ID the UI assigned to the undo.
pub type UndoActionFn = Box<dyn Fn(ActionUndo) -> anyhow::Result<u64> + Send + Sync>;

/// Re-broadcasts an encrypted command on its channel.
pub type ReplayActionFn = Arc<dyn Fn(ChannelId, &[u8]) + Send + Sync>;

/// A request to schedule a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub action: MessageType,
    pub nickname: String,
    /// Sanitized, action-defining payload.
    pub payload: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub originating_timestamp: DateTime<Utc>,
    pub lease: Duration,
    pub originating_round: RoundId,
    pub round: RoundId,
    pub from_admin: bool,
}

impl LeaseRequest {
    pub fn fingerprint(&self) -> LeaseFingerprint {
        LeaseFingerprint::new(&self.channel_id, self.action, &self.payload)
    }
}

/// A scheduled lease, as held by the worker and persisted per channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMessage {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub action: MessageType,
    #[serde(default)]
    pub nickname: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub originating_timestamp: DateTime<Utc>,
    pub lease: Duration,
    /// `originating_timestamp + lease`, or a later time if a past-due undo was
    /// deferred on load.
    pub lease_end: DateTime<Utc>,
    /// When the worker next acts on this lease.
    pub lease_trigger: DateTime<Utc>,
    /// When the copy currently on the network was sent. Replay windows are
    /// measured from here.
    pub replay_anchor: DateTime<Utc>,
    pub originating_round: RoundId,
    pub round: RoundId,
    #[serde(default)]
    pub from_admin: bool,
}

impl LeaseMessage {
    fn undo(&self) -> ActionUndo {
        ActionUndo {
            channel_id: self.channel_id,
            message_id: self.message_id,
            action: self.action,
            nickname: LEASE_NICKNAME.to_string(),
            payload: self.payload.clone(),
            timestamp: self.timestamp,
            originating_timestamp: self.originating_timestamp,
            lease: self.lease,
            round: self.round,
            status: SentStatus::Delivered,
            from_admin: self.from_admin,
        }
    }
}

impl fmt::Display for LeaseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lease = if self.lease == VALID_FOREVER {
            "forever".to_string()
        } else {
            format!("{:?}", self.lease)
        };
        write!(
            f,
            "{{channel:{} msg:{} action:{} nick:{:?} payload:{} encrypted:{} \
             ts:{} origin:{} lease:{} end:{} trigger:{} round:{} admin:{}}}",
            self.channel_id,
            truncated_hex(&self.message_id.0, 8),
            self.action,
            self.nickname,
            truncated_hex(&self.payload, 16),
            truncated_hex(&self.encrypted_payload, 16),
            self.timestamp.to_rfc3339(),
            self.originating_timestamp.to_rfc3339(),
            lease,
            self.lease_end.to_rfc3339(),
            self.lease_trigger.to_rfc3339(),
            self.round,
            self.from_admin,
        )
    }
}

/// Everything the UI needs to undo an expired action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionUndo {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub action: MessageType,
    pub nickname: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub originating_timestamp: DateTime<Utc>,
    pub lease: Duration,
    pub round: RoundId,
    pub status: SentStatus,
    pub from_admin: bool,
}

/// A storage failure while maintaining a channel's leases. Failures of the
/// worker's own writes quarantine the channel until it is removed; failures
/// to clear the channel from the replay guard are reported only.
#[derive(Debug)]
pub struct LeaseFault {
    pub channel_id: ChannelId,
    pub error: ChannelsError,
}

#[derive(Debug)]
pub(crate) enum LeaseCommand {
    Add {
        request: LeaseRequest,
        /// Forced trigger for a quick corrective replay.
        trigger: Option<DateTime<Utc>>,
    },
    Remove {
        channel_id: ChannelId,
        action: MessageType,
        payload: Vec<u8>,
    },
    RemoveChannel {
        channel_id: ChannelId,
    },
}

/// Sending half of the scheduler. Cheap to clone; every request is processed
/// by the worker in submission order.
#[derive(Clone)]
pub struct LeaseQueue {
    tx: Sender<LeaseCommand>,
    store: CommandStore,
    config: Arc<LeaseConfig>,
}

impl LeaseQueue {
    /// Schedule (or reschedule) a lease. Blocks while the queue is full.
    pub fn add_message(&self, request: LeaseRequest) -> Result<(), ChannelsError> {
        if is_expired(Utc::now(), request.originating_timestamp, request.lease) {
            debug!(
                channel_id = %request.channel_id,
                action = %request.action,
                "Dropping lease that has already expired"
            );
            return Err(ChannelsError::LeaseExpired {
                channel_id: request.channel_id,
                action: request.action,
            });
        }
        self.send(LeaseCommand::Add {
            request,
            trigger: None,
        })
    }

    /// Reschedule the stored command for (channel, action, payload) to be
    /// replayed within the quick replay window.
    pub fn add_or_overwrite(
        &self,
        channel_id: ChannelId,
        action: MessageType,
        payload: &[u8],
    ) -> Result<(), ChannelsError> {
        let cm = self.store.load_command(&channel_id, action, payload)?;
        if is_expired(Utc::now(), cm.originating_timestamp, cm.lease) {
            return Err(ChannelsError::LeaseExpired { channel_id, action });
        }

        let wait = rand_duration_in_range(
            self.config.quick_replay_floor,
            self.config.quick_replay_ceiling,
            &mut rand::rng(),
        );
        let trigger = saturating_add(Utc::now(), wait);

        self.send(LeaseCommand::Add {
            request: LeaseRequest {
                channel_id,
                message_id: cm.message_id,
                action,
                nickname: cm.nickname,
                payload: payload.to_vec(),
                encrypted_payload: cm.encrypted_payload,
                timestamp: cm.timestamp,
                originating_timestamp: cm.originating_timestamp,
                lease: cm.lease,
                originating_round: cm.originating_round,
                round: cm.round,
                from_admin: cm.from_admin,
            },
            trigger: Some(trigger),
        })
    }

    /// Drop the lease for (channel, action, payload) without undoing it.
    pub fn remove_message(
        &self,
        channel_id: ChannelId,
        action: MessageType,
        payload: &[u8],
    ) -> Result<(), ChannelsError> {
        self.send(LeaseCommand::Remove {
            channel_id,
            action,
            payload: payload.to_vec(),
        })
    }

    /// Drop every lease and command record of a channel.
    pub fn remove_channel(&self, channel_id: ChannelId) -> Result<(), ChannelsError> {
        self.send(LeaseCommand::RemoveChannel { channel_id })
    }

    fn send(&self, command: LeaseCommand) -> Result<(), ChannelsError> {
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(command)) => {
                debug!("Lease queue full, waiting for the worker");
                self.tx
                    .send(command)
                    .map_err(|_| ChannelsError::WorkerStopped)
            }
            Err(TrySendError::Disconnected(_)) => Err(ChannelsError::WorkerStopped),
        }
    }
}

struct PendingWorker {
    worker: LeaseWorker,
    commands: Receiver<LeaseCommand>,
    jobs: Receiver<CallbackJob>,
    faults: Sender<LeaseFault>,
    undo: UndoActionFn,
}

/// Scheduler for leased channel actions.
pub struct ActionLeaseList {
    queue: LeaseQueue,
    replay_blocker: Arc<ReplayBlocker>,
    replay_fn: Mutex<Option<ReplayActionFn>>,
    pending: Mutex<Option<PendingWorker>>,
    faults: Receiver<LeaseFault>,
}

impl ActionLeaseList {
    /// Build the scheduler and its replay guard, restoring both from `kv`.
    /// Nothing runs until [`start`](Self::start).
    pub fn new_or_load(
        undo: UndoActionFn,
        kv: Arc<dyn Kv>,
        config: LeaseConfig,
    ) -> Result<Self, ChannelsError> {
        let config = Arc::new(config);
        let store = CommandStore::new(kv.clone());
        let (tx, commands) = bounded(config.queue_capacity);
        let queue = LeaseQueue {
            tx,
            store: store.clone(),
            config: config.clone(),
        };

        let trigger_queue = queue.clone();
        let trigger: TriggerLeaseReplay =
            Arc::new(move |channel_id, action, payload: &[u8]| {
                trigger_queue.add_or_overwrite(channel_id, action, payload)
            });
        let replay_blocker = Arc::new(ReplayBlocker::new_or_load(
            trigger,
            store.clone(),
            kv.clone(),
            config.lock_warn_threshold,
        )?);

        let storage = LeaseStorage::new(kv);
        let loaded = storage.load_for_restart(Utc::now(), &config, &mut rand::rng())?;

        let (fault_tx, faults) = unbounded();
        let (jobs_tx, jobs) = unbounded();
        let worker = LeaseWorker::new(loaded, storage, store, config, fault_tx.clone(), jobs_tx);

        Ok(Self {
            queue,
            replay_blocker,
            replay_fn: Mutex::new(None),
            pending: Mutex::new(Some(PendingWorker {
                worker,
                commands,
                jobs,
                faults: fault_tx,
                undo,
            })),
            faults,
        })
    }

    /// Must be called before [`start`](Self::start).
    pub fn register_replay_fn(&self, replay: ReplayActionFn) {
        *self.replay_fn.lock() = Some(replay);
    }

    /// Spawn the worker and its callback thread.
    pub fn start(&self) -> Result<LeaseThread, ChannelsError> {
        let replay = self
            .replay_fn
            .lock()
            .clone()
            .ok_or(ChannelsError::ReplayFnNotRegistered)?;
        let PendingWorker {
            worker,
            commands,
            jobs,
            faults,
            undo,
        } = self
            .pending
            .lock()
            .take()
            .ok_or(ChannelsError::AlreadyStarted)?;

        let (stop_tx, stop_rx) = bounded(1);

        let replay_blocker = self.replay_blocker.clone();
        let callbacks = std::thread::Builder::new()
            .name("lease-callbacks".into())
            .spawn(move || worker::run_callbacks(jobs, undo, replay, replay_blocker, faults))
            .map_err(|source| ChannelsError::Spawn {
                thread: "lease-callbacks",
                source,
            })?;
        let worker = std::thread::Builder::new()
            .name("lease-worker".into())
            .spawn(move || worker.run(commands, stop_rx))
            .map_err(|source| ChannelsError::Spawn {
                thread: "lease-worker",
                source,
            })?;

        info!("Started action lease thread");
        Ok(LeaseThread {
            stop: stop_tx,
            worker: Some(worker),
            callbacks: Some(callbacks),
        })
    }

    /// A clonable handle for submitting requests from other components.
    pub fn queue(&self) -> LeaseQueue {
        self.queue.clone()
    }

    pub fn replay_blocker(&self) -> &Arc<ReplayBlocker> {
        &self.replay_blocker
    }

    /// Storage faults from the worker and from replay guard cleanup, in the
    /// order they happened.
    pub fn faults(&self) -> Receiver<LeaseFault> {
        self.faults.clone()
    }

    pub fn add_message(&self, request: LeaseRequest) -> Result<(), ChannelsError> {
        self.queue.add_message(request)
    }

    pub fn add_or_overwrite(
        &self,
        channel_id: ChannelId,
        action: MessageType,
        payload: &[u8],
    ) -> Result<(), ChannelsError> {
        self.queue.add_or_overwrite(channel_id, action, payload)
    }

    pub fn remove_message(
        &self,
        channel_id: ChannelId,
        action: MessageType,
        payload: &[u8],
    ) -> Result<(), ChannelsError> {
        self.queue.remove_message(channel_id, action, payload)
    }

    pub fn remove_channel(&self, channel_id: ChannelId) -> Result<(), ChannelsError> {
        self.queue.remove_channel(channel_id)
    }

    /// Run `cmd` through the replay guard and schedule its lease if it is
    /// accepted. Returns whether it was accepted.
    pub fn add_verified_message(&self, cmd: &ChannelCommand) -> Result<bool, ChannelsError> {
        if is_expired(Utc::now(), cmd.originating_timestamp, cmd.lease) {
            return Err(ChannelsError::LeaseExpired {
                channel_id: cmd.channel_id,
                action: cmd.action,
            });
        }
        if !self.replay_blocker.verify_replay(cmd)? {
            return Ok(false);
        }
        self.queue.add_message(cmd.lease_request())?;
        Ok(true)
    }

    /// Run `cmd` through the replay guard and drop its lease if it is
    /// accepted. Returns whether it was accepted.
    pub fn remove_verified_message(&self, cmd: &ChannelCommand) -> Result<bool, ChannelsError> {
        if is_expired(Utc::now(), cmd.originating_timestamp, cmd.lease) {
            return Err(ChannelsError::LeaseExpired {
                channel_id: cmd.channel_id,
                action: cmd.action,
            });
        }
        if !self.replay_blocker.verify_replay(cmd)? {
            return Ok(false);
        }
        self.queue
            .remove_message(cmd.channel_id, cmd.action, &cmd.sanitized_payload)?;
        Ok(true)
    }
}

/// Handle to a running lease worker.
pub struct LeaseThread {
    stop: Sender<()>,
    worker: Option<JoinHandle<()>>,
    callbacks: Option<JoinHandle<()>>,
}

impl LeaseThread {
    /// Signal the worker to stop and wait for it and for callbacks it has
    /// already dispatched.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(callbacks) = self.callbacks.take() {
            let _ = callbacks.join();
        }
    }
}

impl Drop for LeaseThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read the persisted lease schedule without starting anything. Used by
/// diagnostics.
pub fn load_snapshot(
    kv: Arc<dyn Kv>,
) -> Result<std::collections::BTreeMap<ChannelId, Vec<LeaseMessage>>, ChannelsError> {
    Ok(LeaseStorage::new(kv)
        .load_all()?
        .into_iter()
        .map(|(channel_id, leases)| (channel_id, leases.into_values().collect()))
        .collect())
}

pub(crate) fn lease_key(channel_id: &ChannelId, action: MessageType, payload: &[u8]) -> LeaseKey {
    LeaseFingerprint::new(channel_id, action, payload).key()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use uuid::Uuid;

    pub(crate) fn sample_message(channel_id: ChannelId, payload: &[u8]) -> LeaseMessage {
        let now = Utc::now();
        LeaseMessage {
            channel_id,
            message_id: MessageId([3; 32]),
            action: MessageType::Pinned,
            nickname: "admin".into(),
            payload: payload.to_vec(),
            encrypted_payload: b"ciphertext".to_vec(),
            timestamp: now,
            originating_timestamp: now,
            lease: Duration::from_secs(3600),
            lease_end: now + chrono::TimeDelta::hours(1),
            lease_trigger: now + chrono::TimeDelta::hours(1),
            replay_anchor: now,
            originating_round: RoundId(1),
            round: RoundId(1),
            from_admin: true,
        }
    }

    #[test]
    fn display_truncates_payloads() {
        let mut msg = sample_message(ChannelId(Uuid::from_u128(1)), &[0xab; 64]);
        msg.lease = VALID_FOREVER;
        let rendered = msg.to_string();
        assert!(rendered.contains("payload:abababababababababababababababab..."));
        assert!(rendered.contains("lease:forever"));
        assert!(rendered.contains("action:Pinned"));
    }

    #[test]
    fn undo_is_sent_as_lease_system() {
        let msg = sample_message(ChannelId(Uuid::from_u128(1)), b"p");
        let undo = msg.undo();
        assert_eq!(undo.nickname, LEASE_NICKNAME);
        assert_eq!(undo.payload, b"p");
        assert_eq!(undo.status, SentStatus::Delivered);
    }

    #[test]
    fn forever_lease_survives_serialization() {
        let mut msg = sample_message(ChannelId(Uuid::from_u128(1)), b"p");
        msg.lease = VALID_FOREVER;
        msg.lease_end = trigger::far_future();
        let json = serde_json::to_vec(&msg).unwrap();
        let back: LeaseMessage = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn start_requires_replay_fn() {
        let list = ActionLeaseList::new_or_load(
            Box::new(|_| Ok(0)),
            Arc::new(haven_db::MemKv::new()),
            LeaseConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            list.start(),
            Err(ChannelsError::ReplayFnNotRegistered)
        ));

        list.register_replay_fn(Arc::new(|_, _: &[u8]| {}));
        let thread = list.start().unwrap();
        assert!(matches!(list.start(), Err(ChannelsError::AlreadyStarted)));
        thread.stop();
    }

    #[test]
    fn expired_lease_is_rejected_up_front() {
        let list = ActionLeaseList::new_or_load(
            Box::new(|_| Ok(0)),
            Arc::new(haven_db::MemKv::new()),
            LeaseConfig::default(),
        )
        .unwrap();
        let msg = sample_message(ChannelId(Uuid::from_u128(1)), b"p");
        let request = LeaseRequest {
            channel_id: msg.channel_id,
            message_id: msg.message_id,
            action: msg.action,
            nickname: msg.nickname,
            payload: msg.payload,
            encrypted_payload: msg.encrypted_payload,
            timestamp: msg.timestamp,
            originating_timestamp: Utc::now() - chrono::TimeDelta::hours(2),
            lease: Duration::from_secs(3600),
            originating_round: msg.originating_round,
            round: msg.round,
            from_admin: msg.from_admin,
        };
        assert!(matches!(
            list.add_message(request),
            Err(ChannelsError::LeaseExpired { .. })
        ));
    }
}
