/// Lease worker: the only thread that touches the schedule.
///
/// ```text
/// [LeaseQueue] --bounded--> [Worker] --unbounded--> [Callbacks]
///  add/remove               schedule + storage       undo / replay
///  remove-channel           one timer (head)         replay guard cleanup
/// ```
///
/// The worker blocks only on its queue and timer. Anything that takes the
/// replay guard's lock runs on the callback thread.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, after, never, select};
use haven_types::{ChannelId, MessageType};
use tracing::{debug, error, info, warn};

use super::schedule::LeaseSchedule;
use super::storage::{ChannelLeases, LeaseStorage};
use super::trigger::{calculate_lease_trigger, lease_end, until};
use super::{
    ActionUndo, LeaseCommand, LeaseFault, LeaseMessage, LeaseRequest, ReplayActionFn,
    UndoActionFn, lease_key,
};
use crate::command_store::CommandStore;
use crate::config::LeaseConfig;
use crate::error::ChannelsError;
use crate::fingerprint::LeaseKey;
use crate::replay_blocker::ReplayBlocker;

#[derive(Debug)]
pub(crate) enum CallbackJob {
    Undo(ActionUndo),
    Replay {
        channel_id: ChannelId,
        encrypted_payload: Vec<u8>,
    },
    /// An expired lease's command leaves the replay guard.
    ForgetCommand {
        channel_id: ChannelId,
        action: MessageType,
        payload: Vec<u8>,
    },
    /// A removed channel leaves the replay guard.
    ForgetChannel { channel_id: ChannelId },
}

pub(crate) struct LeaseWorker {
    schedule: LeaseSchedule,
    storage: LeaseStorage,
    store: CommandStore,
    config: Arc<LeaseConfig>,
    /// Channels whose storage failed. Adds for them are dropped until the
    /// channel is removed.
    quarantined: HashSet<ChannelId>,
    faults: Sender<LeaseFault>,
    jobs: Sender<CallbackJob>,
}

impl LeaseWorker {
    pub fn new(
        loaded: Vec<(LeaseKey, LeaseMessage)>,
        storage: LeaseStorage,
        store: CommandStore,
        config: Arc<LeaseConfig>,
        faults: Sender<LeaseFault>,
        jobs: Sender<CallbackJob>,
    ) -> Self {
        let mut schedule = LeaseSchedule::new();
        for (key, message) in loaded {
            schedule.insert(key, message);
        }

        Self {
            schedule,
            storage,
            store,
            config,
            quarantined: HashSet::new(),
            faults,
            jobs,
        }
    }

    /// Runs until stopped or until every [`LeaseQueue`](super::LeaseQueue)
    /// is gone. Dropping the worker closes the callback thread's queue.
    pub fn run(mut self, commands: Receiver<LeaseCommand>, stop: Receiver<()>) {
        info!(leases = self.schedule.len(), "Lease worker running");

        loop {
            let timer: Receiver<Instant> = match self.schedule.next_trigger() {
                Some(trigger) => after(until(Utc::now(), trigger)),
                None => never(),
            };

            select! {
                recv(stop) -> _ => {
                    info!("Stopping action lease thread");
                    break;
                }
                recv(commands) -> command => match command {
                    Ok(command) => self.handle(command),
                    Err(_) => {
                        debug!("Lease queue closed");
                        break;
                    }
                },
                recv(timer) -> _ => self.fire_due(Utc::now()),
            }
        }
    }

    fn handle(&mut self, command: LeaseCommand) {
        let (channel_id, result) = match command {
            LeaseCommand::Add { request, trigger } => (request.channel_id, self.add(request, trigger)),
            LeaseCommand::Remove {
                channel_id,
                action,
                payload,
            } => (channel_id, self.remove(&channel_id, action, &payload)),
            LeaseCommand::RemoveChannel { channel_id } => {
                (channel_id, self.remove_channel(&channel_id))
            }
        };

        if let Err(err) = result {
            self.fault(channel_id, err);
        }
    }

    fn add(
        &mut self,
        request: LeaseRequest,
        trigger: Option<DateTime<Utc>>,
    ) -> Result<(), ChannelsError> {
        let channel_id = request.channel_id;
        if self.quarantined.contains(&channel_id) {
            warn!(
                %channel_id,
                action = %request.action,
                "Dropping lease for quarantined channel"
            );
            return Ok(());
        }

        let now = Utc::now();
        let key = request.fingerprint().key();
        let end = lease_end(request.originating_timestamp, request.lease);

        let mut anchor = request.originating_timestamp.max(request.timestamp);
        if let Some(existing) = self.schedule.get(&channel_id, &key) {
            anchor = anchor.max(existing.replay_anchor);
        }

        let lease_trigger = match trigger {
            Some(trigger) => trigger.min(end),
            None => match calculate_lease_trigger(
                now,
                request.originating_timestamp,
                anchor,
                request.lease,
                &self.config,
                &mut rand::rng(),
            ) {
                Some(trigger) => trigger,
                None => {
                    debug!(
                        %channel_id,
                        action = %request.action,
                        "Lease expired while queued, dropping"
                    );
                    return Ok(());
                }
            },
        };

        let message = LeaseMessage {
            channel_id,
            message_id: request.message_id,
            action: request.action,
            nickname: request.nickname,
            payload: request.payload,
            encrypted_payload: request.encrypted_payload,
            timestamp: request.timestamp,
            originating_timestamp: request.originating_timestamp,
            lease: request.lease,
            lease_end: end,
            lease_trigger,
            replay_anchor: anchor,
            originating_round: request.originating_round,
            round: request.round,
            from_admin: request.from_admin,
        };
        debug!(fingerprint = %key, "Inserting lease {}", message);

        let mut messages = self.schedule.channel_messages(&channel_id);
        messages.insert(key.clone(), message.clone());
        self.persist(&channel_id, &messages)?;

        self.schedule.insert(key, message);
        Ok(())
    }

    /// Drops a lease without undoing it. The replay guard keeps its record.
    fn remove(
        &mut self,
        channel_id: &ChannelId,
        action: MessageType,
        payload: &[u8],
    ) -> Result<(), ChannelsError> {
        let key = lease_key(channel_id, action, payload);
        let mut messages = self.schedule.channel_messages(channel_id);
        if messages.remove(&key).is_none() {
            debug!(%channel_id, %action, "No lease to remove");
            return Ok(());
        }

        self.persist(channel_id, &messages)?;
        self.schedule.remove(channel_id, &key);
        debug!(%channel_id, %action, fingerprint = %key, "Removed lease");
        Ok(())
    }

    fn remove_channel(&mut self, channel_id: &ChannelId) -> Result<(), ChannelsError> {
        if self.schedule.contains_channel(channel_id) {
            let ids: Vec<ChannelId> = self
                .schedule
                .channel_ids()
                .into_iter()
                .filter(|id| id != channel_id)
                .collect();
            self.storage.store_channel_list(&ids)?;
            self.storage.delete_channel(channel_id)?;

            let removed = self.schedule.remove_channel(channel_id);
            for message in &removed {
                if let Err(err) =
                    self.store
                        .delete_command(channel_id, message.action, &message.payload)
                {
                    warn!(%channel_id, action = %message.action, "Failed to delete command: {}", err);
                }
            }
            info!(%channel_id, leases = removed.len(), "Removed channel leases");
        }

        self.dispatch(CallbackJob::ForgetChannel {
            channel_id: *channel_id,
        });

        if self.quarantined.remove(channel_id) {
            info!(%channel_id, "Channel released from quarantine");
        }
        Ok(())
    }

    /// Act on every lease whose trigger has passed: undo the ones that
    /// expired, replay and reschedule the rest.
    fn fire_due(&mut self, now: DateTime<Utc>) {
        while let Some((key, message)) = self.schedule.peek_due(now) {
            let channel_id = message.channel_id;
            let mut messages = self.schedule.channel_messages(&channel_id);

            if message.lease_trigger >= message.lease_end || message.lease_end <= now {
                info!(%channel_id, action = %message.action, "Lease expired, undoing action");
                messages.remove(&key);
                let persisted = self.persist(&channel_id, &messages);
                self.schedule.remove(&channel_id, &key);

                self.dispatch(CallbackJob::Undo(message.undo()));
                self.dispatch(CallbackJob::ForgetCommand {
                    channel_id,
                    action: message.action,
                    payload: message.payload,
                });
                if let Err(err) = persisted {
                    self.fault(channel_id, err);
                }
                continue;
            }

            debug!(%channel_id, action = %message.action, "Replaying leased action");
            self.dispatch(CallbackJob::Replay {
                channel_id,
                encrypted_payload: message.encrypted_payload.clone(),
            });

            let mut next = message;
            next.replay_anchor = now;
            next.lease_trigger = calculate_lease_trigger(
                now,
                next.originating_timestamp,
                now,
                next.lease,
                &self.config,
                &mut rand::rng(),
            )
            .unwrap_or(next.lease_end);
            debug!(fingerprint = %key, "Rescheduled lease {}", next);

            messages.insert(key.clone(), next.clone());
            let persisted = self.persist(&channel_id, &messages);
            self.schedule.insert(key, next);
            if let Err(err) = persisted {
                self.fault(channel_id, err);
            }
        }
    }

    /// Write `messages` as the channel's new lease map. The channel index is
    /// only rewritten when the channel gains its first lease or loses its
    /// last.
    fn persist(&self, channel_id: &ChannelId, messages: &ChannelLeases) -> Result<(), ChannelsError> {
        let listed = self.schedule.contains_channel(channel_id);
        self.storage.store_channel(channel_id, messages)?;

        match (listed, messages.is_empty()) {
            (false, false) => {
                let mut ids = self.schedule.channel_ids();
                ids.push(*channel_id);
                ids.sort();
                self.storage.store_channel_list(&ids)
            }
            (true, true) => {
                let ids: Vec<ChannelId> = self
                    .schedule
                    .channel_ids()
                    .into_iter()
                    .filter(|id| id != channel_id)
                    .collect();
                self.storage.store_channel_list(&ids)
            }
            _ => Ok(()),
        }
    }

    fn dispatch(&self, job: CallbackJob) {
        if let Err(err) = self.jobs.send(job) {
            error!(job = ?err.into_inner(), "Lease callback thread is gone, job not delivered");
        }
    }

    fn fault(&mut self, channel_id: ChannelId, error: ChannelsError) {
        error!(%channel_id, "Lease storage failed, quarantining channel: {}", error);
        self.quarantined.insert(channel_id);
        let _ = self.faults.send(LeaseFault { channel_id, error });
    }
}

/// Runs callbacks and replay guard cleanup in dispatch order until the
/// worker drops its sender.
pub(crate) fn run_callbacks(
    jobs: Receiver<CallbackJob>,
    undo: UndoActionFn,
    replay: ReplayActionFn,
    replay_blocker: Arc<ReplayBlocker>,
    faults: Sender<LeaseFault>,
) {
    for job in jobs.iter() {
        match job {
            CallbackJob::Undo(action) => {
                let (channel_id, kind) = (action.channel_id, action.action);
                match undo(action) {
                    Ok(id) => debug!(%channel_id, action = %kind, undo_id = id, "Undid expired action"),
                    Err(err) => error!(%channel_id, action = %kind, "Failed to undo action: {:#}", err),
                }
            }
            CallbackJob::Replay {
                channel_id,
                encrypted_payload,
            } => replay(channel_id, &encrypted_payload),
            CallbackJob::ForgetCommand {
                channel_id,
                action,
                payload,
            } => {
                if let Err(err) = replay_blocker.remove_command(&channel_id, action, &payload) {
                    error!(
                        %channel_id,
                        %action,
                        "Failed to delete expired command from replay blocker: {}",
                        err
                    );
                }
            }
            CallbackJob::ForgetChannel { channel_id } => {
                if let Err(error) = replay_blocker.remove_channel_commands(&channel_id) {
                    error!(%channel_id, "Failed to delete channel commands: {}", error);
                    let _ = faults.send(LeaseFault { channel_id, error });
                }
            }
        }
    }
    debug!("Lease callback thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::tests::sample_message;
    use crossbeam_channel::unbounded;
    use haven_db::{Kv, KvError, MemKv, VersionedObject};
    use haven_types::MessageId;
    use std::time::Duration;
    use uuid::Uuid;

    fn channel(n: u128) -> ChannelId {
        ChannelId(Uuid::from_u128(n))
    }

    fn worker(kv: Arc<dyn Kv>) -> (LeaseWorker, Receiver<LeaseFault>, Receiver<CallbackJob>) {
        let (faults_tx, faults) = unbounded();
        let (jobs_tx, jobs) = unbounded();
        let worker = LeaseWorker::new(
            Vec::new(),
            LeaseStorage::new(kv.clone()),
            CommandStore::new(kv),
            Arc::new(LeaseConfig::default()),
            faults_tx,
            jobs_tx,
        );
        (worker, faults, jobs)
    }

    fn request(channel_id: ChannelId, payload: &[u8], lease: Duration) -> LeaseRequest {
        let now = Utc::now();
        LeaseRequest {
            channel_id,
            message_id: MessageId([1; 32]),
            action: MessageType::Mute,
            nickname: "admin".into(),
            payload: payload.to_vec(),
            encrypted_payload: b"enc".to_vec(),
            timestamp: now,
            originating_timestamp: now,
            lease,
            originating_round: haven_types::RoundId(1),
            round: haven_types::RoundId(1),
            from_admin: true,
        }
    }

    #[test]
    fn add_and_remove_keep_storage_in_step() {
        let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
        let (mut w, _faults, _jobs) = worker(kv.clone());
        let hour = Duration::from_secs(3600);

        w.handle(LeaseCommand::Add { request: request(channel(1), b"a", hour), trigger: None });
        w.handle(LeaseCommand::Add { request: request(channel(1), b"b", hour), trigger: None });
        w.handle(LeaseCommand::Add { request: request(channel(2), b"c", hour), trigger: None });

        let stored = LeaseStorage::new(kv.clone()).load_all().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[&channel(1)].len(), 2);
        assert_eq!(stored[&channel(1)], w.schedule.channel_messages(&channel(1)));

        w.handle(LeaseCommand::Remove {
            channel_id: channel(2),
            action: MessageType::Mute,
            payload: b"c".to_vec(),
        });
        let stored = LeaseStorage::new(kv).load_all().unwrap();
        assert_eq!(stored.keys().copied().collect::<Vec<_>>(), vec![channel(1)]);
        assert_eq!(w.schedule.len(), 2);
    }

    #[test]
    fn re_adding_updates_in_place() {
        let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
        let (mut w, _faults, _jobs) = worker(kv);
        let mut req = request(channel(1), b"a", Duration::from_secs(3600));
        w.handle(LeaseCommand::Add { request: req.clone(), trigger: None });

        req.lease = Duration::from_secs(7200);
        w.handle(LeaseCommand::Add { request: req.clone(), trigger: None });

        assert_eq!(w.schedule.len(), 1);
        let key = req.fingerprint().key();
        let stored = w.schedule.get(&channel(1), &key).unwrap();
        assert_eq!(stored.lease, Duration::from_secs(7200));
        assert_eq!(stored.lease_trigger, stored.lease_end);
    }

    #[test]
    fn fire_due_undoes_and_replays() {
        let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
        let (mut w, _faults, jobs_rx) = worker(kv);
        let now = Utc::now();

        let mut expired = sample_message(channel(1), b"expired");
        expired.lease_end = now - chrono::TimeDelta::seconds(1);
        expired.lease_trigger = expired.lease_end;
        let mut replayed = sample_message(channel(1), b"replayed");
        replayed.lease = super::super::VALID_FOREVER;
        replayed.lease_end = super::super::trigger::far_future();
        replayed.lease_trigger = now - chrono::TimeDelta::seconds(1);

        let expired_key = lease_key(&channel(1), expired.action, b"expired");
        let replayed_key = lease_key(&channel(1), replayed.action, b"replayed");
        w.schedule.insert(expired_key.clone(), expired);
        w.schedule.insert(replayed_key.clone(), replayed);

        w.fire_due(now);

        let jobs: Vec<CallbackJob> = jobs_rx.try_iter().collect();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().any(|j| matches!(j, CallbackJob::Undo(u) if u.payload == b"expired")));
        assert!(jobs.iter().any(
            |j| matches!(j, CallbackJob::ForgetCommand { payload, .. } if payload == b"expired")
        ));
        assert!(jobs.iter().any(|j| matches!(j, CallbackJob::Replay { .. })));

        assert!(w.schedule.get(&channel(1), &expired_key).is_none());
        let rescheduled = w.schedule.get(&channel(1), &replayed_key).unwrap();
        assert!(rescheduled.lease_trigger > now);
        assert_eq!(rescheduled.replay_anchor, now);
    }

    struct BrokenKv;

    impl Kv for BrokenKv {
        fn get(&self, key: &str, _version: u64) -> Result<VersionedObject, KvError> {
            Err(KvError::NotFound { key: key.into() })
        }

        fn set(&self, _key: &str, _object: &VersionedObject) -> Result<(), KvError> {
            Err(KvError::LockPoisoned)
        }

        fn delete(&self, _key: &str, _version: u64) -> Result<(), KvError> {
            Ok(())
        }
    }

    #[test]
    fn storage_failure_quarantines_channel() {
        let kv: Arc<dyn Kv> = Arc::new(BrokenKv);
        let (mut w, faults, _jobs) = worker(kv);
        let hour = Duration::from_secs(3600);

        w.handle(LeaseCommand::Add { request: request(channel(1), b"a", hour), trigger: None });
        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.channel_id, channel(1));
        assert!(matches!(fault.error, ChannelsError::Storage { .. }));
        assert!(w.schedule.is_empty());

        // Dropped silently while quarantined.
        w.handle(LeaseCommand::Add { request: request(channel(1), b"b", hour), trigger: None });
        assert!(faults.try_recv().is_err());

        // Removing the channel lifts the quarantine.
        w.handle(LeaseCommand::RemoveChannel { channel_id: channel(1) });
        assert!(!w.quarantined.contains(&channel(1)));
    }

    #[test]
    fn remove_channel_hands_guard_cleanup_to_callbacks() {
        let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
        let (mut w, _faults, jobs) = worker(kv);
        let hour = Duration::from_secs(3600);

        w.handle(LeaseCommand::Add { request: request(channel(1), b"a", hour), trigger: None });
        w.handle(LeaseCommand::RemoveChannel { channel_id: channel(1) });

        assert_eq!(w.schedule.len(), 0);
        assert!(matches!(
            jobs.try_recv(),
            Ok(CallbackJob::ForgetChannel { channel_id }) if channel_id == channel(1)
        ));
    }

    #[test]
    fn callback_thread_clears_replay_guard() {
        let kv: Arc<dyn Kv> = Arc::new(MemKv::new());
        let rb = Arc::new(
            ReplayBlocker::new(
                Arc::new(|_, _, _: &[u8]| Ok(())),
                CommandStore::new(kv.clone()),
                kv,
                Duration::from_millis(100),
            )
            .unwrap(),
        );
        let req = request(channel(1), b"a", Duration::from_secs(3600));
        let cmd = crate::replay_blocker::ChannelCommand {
            channel_id: req.channel_id,
            message_id: req.message_id,
            action: req.action,
            nickname: req.nickname.clone(),
            unsanitized_payload: b"a".to_vec(),
            sanitized_payload: b"a".to_vec(),
            encrypted_payload: req.encrypted_payload.clone(),
            timestamp: req.timestamp,
            originating_timestamp: req.originating_timestamp,
            lease: req.lease,
            originating_round: req.originating_round,
            round: req.round,
            from_admin: true,
        };
        assert!(rb.verify_replay(&cmd).unwrap());

        let (faults_tx, faults) = unbounded();
        let (jobs_tx, jobs_rx) = unbounded();
        jobs_tx
            .send(CallbackJob::ForgetCommand {
                channel_id: channel(1),
                action: MessageType::Mute,
                payload: b"a".to_vec(),
            })
            .unwrap();
        jobs_tx.send(CallbackJob::ForgetChannel { channel_id: channel(1) }).unwrap();
        drop(jobs_tx);

        run_callbacks(
            jobs_rx,
            Box::new(|_| Ok(0)),
            Arc::new(|_, _: &[u8]| {}),
            rb.clone(),
            faults_tx,
        );

        assert!(rb.command(&channel(1), MessageType::Mute, b"a").is_none());
        assert_eq!(rb.channel_len(&channel(1)), 0);
        assert!(faults.try_recv().is_err());
    }
}
