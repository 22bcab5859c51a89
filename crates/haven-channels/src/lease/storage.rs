use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use haven_db::{Kv, VersionedObject};
use haven_types::ChannelId;
use rand::Rng;
use tracing::{debug, info};

use super::LeaseMessage;
use super::trigger::{rand_duration_in_range, saturating_add};
use crate::config::LeaseConfig;
use crate::error::ChannelsError;
use crate::fingerprint::LeaseKey;

const LEASE_LIST_KEY: &str = "channelLeases";
const LEASE_LIST_VERSION: u64 = 0;
const LEASE_MESSAGES_PREFIX: &str = "channelLeaseMessages/";
const LEASE_MESSAGES_VERSION: u64 = 0;

pub(crate) type ChannelLeases = BTreeMap<LeaseKey, LeaseMessage>;

/// Persistence for the lease schedule:
///
/// ```text
/// channelLeases                         -> [channel_id, ...]
/// channelLeaseMessages/<b64 channel_id> -> { fingerprint: LeaseMessage }
/// ```
#[derive(Clone)]
pub(crate) struct LeaseStorage {
    kv: Arc<dyn Kv>,
}

impl LeaseStorage {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Rewrite the index of channels that have pending leases.
    pub fn store_channel_list(&self, ids: &[ChannelId]) -> Result<(), ChannelsError> {
        let data = serde_json::to_vec(ids).map_err(|source| ChannelsError::Codec {
            channel_id: None,
            op: "store lease channel list",
            source,
        })?;
        self.kv
            .set(LEASE_LIST_KEY, &VersionedObject::new(LEASE_LIST_VERSION, data))
            .map_err(|source| ChannelsError::Index {
                op: "store lease channel list",
                source,
            })
    }

    /// Write a channel's leases, or delete the record once there are none.
    pub fn store_channel(
        &self,
        channel_id: &ChannelId,
        messages: &ChannelLeases,
    ) -> Result<(), ChannelsError> {
        if messages.is_empty() {
            return self.delete_channel(channel_id);
        }

        let data = serde_json::to_vec(messages).map_err(|source| ChannelsError::Codec {
            channel_id: Some(*channel_id),
            op: "store lease messages",
            source,
        })?;
        self.kv
            .set(
                &channel_key(channel_id),
                &VersionedObject::new(LEASE_MESSAGES_VERSION, data),
            )
            .map_err(|source| ChannelsError::Storage {
                channel_id: *channel_id,
                op: "store lease messages",
                source,
            })
    }

    pub fn delete_channel(&self, channel_id: &ChannelId) -> Result<(), ChannelsError> {
        self.kv
            .delete(&channel_key(channel_id), LEASE_MESSAGES_VERSION)
            .map_err(|source| ChannelsError::Storage {
                channel_id: *channel_id,
                op: "delete lease messages",
                source,
            })
    }

    fn load_channel_list(&self) -> Result<Vec<ChannelId>, ChannelsError> {
        let obj = self
            .kv
            .get(LEASE_LIST_KEY, LEASE_LIST_VERSION)
            .map_err(|source| ChannelsError::Index {
                op: "load lease channel list",
                source,
            })?;
        serde_json::from_slice(&obj.data).map_err(|source| ChannelsError::Codec {
            channel_id: None,
            op: "load lease channel list",
            source,
        })
    }

    fn load_channel(&self, channel_id: &ChannelId) -> Result<ChannelLeases, ChannelsError> {
        let obj = self
            .kv
            .get(&channel_key(channel_id), LEASE_MESSAGES_VERSION)
            .map_err(|source| ChannelsError::Storage {
                channel_id: *channel_id,
                op: "load lease messages",
                source,
            })?;
        serde_json::from_slice(&obj.data).map_err(|source| ChannelsError::Codec {
            channel_id: Some(*channel_id),
            op: "load lease messages",
            source,
        })
    }

    /// Every persisted lease exactly as stored. A store without a lease index
    /// is empty.
    pub fn load_all(&self) -> Result<BTreeMap<ChannelId, ChannelLeases>, ChannelsError> {
        let ids = match self.load_channel_list() {
            Ok(ids) => ids,
            Err(err) if err.is_missing(self.kv.as_ref()) => {
                debug!("No lease index found, starting empty");
                return Ok(BTreeMap::new());
            }
            Err(err) => return Err(err),
        };

        let mut all = BTreeMap::new();
        for channel_id in ids {
            all.insert(channel_id, self.load_channel(&channel_id)?);
        }
        Ok(all)
    }

    /// Load the schedule for a restart. Leases whose trigger passed while we
    /// were down are pushed into the short wait window from `now` so that
    /// clients coming back together do not all replay at once.
    pub fn load_for_restart<R: Rng + ?Sized>(
        &self,
        now: DateTime<Utc>,
        cfg: &LeaseConfig,
        rng: &mut R,
    ) -> Result<Vec<(LeaseKey, LeaseMessage)>, ChannelsError> {
        let all = self.load_all()?;

        let mut loaded = Vec::new();
        let mut rescheduled = 0usize;
        for (key, mut msg) in all.into_values().flatten() {
            if msg.lease_trigger < now {
                let trigger = saturating_add(
                    now,
                    rand_duration_in_range(cfg.replay_wait_min, cfg.replay_wait_max, rng),
                );
                // A final undo moves with its trigger so an alternate replay
                // still has a chance to arrive first.
                if msg.lease_trigger == msg.lease_end {
                    msg.lease_end = trigger;
                }
                msg.lease_trigger = trigger;
                rescheduled += 1;
            }
            loaded.push((key, msg));
        }

        info!(
            leases = loaded.len(),
            rescheduled, "Loaded lease schedule from storage"
        );
        Ok(loaded)
    }
}

fn channel_key(channel_id: &ChannelId) -> String {
    format!("{}{}", LEASE_MESSAGES_PREFIX, BASE64.encode(channel_id.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::LeaseFingerprint;
    use crate::lease::tests::sample_message;
    use chrono::TimeDelta;
    use haven_db::MemKv;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use uuid::Uuid;

    fn channel(n: u128) -> ChannelId {
        ChannelId(Uuid::from_u128(n))
    }

    fn leases(channel_id: ChannelId, payloads: &[&[u8]]) -> ChannelLeases {
        payloads
            .iter()
            .map(|p| {
                let msg = sample_message(channel_id, p);
                (LeaseFingerprint::new(&channel_id, msg.action, p).key(), msg)
            })
            .collect()
    }

    #[test]
    fn store_and_load_reproduce_records() {
        let storage = LeaseStorage::new(Arc::new(MemKv::new()));
        let a = leases(channel(1), &[b"x", b"y"]);
        let b = leases(channel(2), &[b"z"]);

        storage.store_channel(&channel(1), &a).unwrap();
        storage.store_channel(&channel(2), &b).unwrap();
        storage.store_channel_list(&[channel(1), channel(2)]).unwrap();

        let all = storage.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&channel(1)], a);
        assert_eq!(all[&channel(2)], b);
    }

    #[test]
    fn empty_map_deletes_record() {
        let mem = Arc::new(MemKv::new());
        let storage = LeaseStorage::new(mem.clone());
        storage
            .store_channel(&channel(1), &leases(channel(1), &[b"x"]))
            .unwrap();
        assert!(mem.contains(&channel_key(&channel(1))));

        storage.store_channel(&channel(1), &ChannelLeases::new()).unwrap();
        assert!(!mem.contains(&channel_key(&channel(1))));
    }

    #[test]
    fn missing_index_is_empty() {
        let storage = LeaseStorage::new(Arc::new(MemKv::new()));
        assert!(storage.load_all().unwrap().is_empty());
    }

    #[test]
    fn missing_channel_record_is_an_error() {
        let storage = LeaseStorage::new(Arc::new(MemKv::new()));
        storage.store_channel_list(&[channel(1)]).unwrap();
        let err = storage.load_all().unwrap_err();
        assert_eq!(err.channel_id(), Some(channel(1)));
    }

    #[test]
    fn past_due_leases_move_into_short_window() {
        let storage = LeaseStorage::new(Arc::new(MemKv::new()));
        let cfg = LeaseConfig::default();
        let now = Utc::now();

        let mut map = leases(channel(1), &[b"undo", b"replay", b"future"]);
        for (_, msg) in map.iter_mut() {
            match msg.payload.as_slice() {
                b"undo" => {
                    msg.lease_end = now - TimeDelta::minutes(10);
                    msg.lease_trigger = msg.lease_end;
                }
                b"replay" => {
                    msg.lease_end = now + TimeDelta::days(30);
                    msg.lease_trigger = now - TimeDelta::hours(1);
                }
                _ => {
                    msg.lease_end = now + TimeDelta::days(2);
                    msg.lease_trigger = now + TimeDelta::days(1);
                }
            }
        }
        storage.store_channel(&channel(1), &map).unwrap();
        storage.store_channel_list(&[channel(1)]).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let loaded = storage.load_for_restart(now, &cfg, &mut rng).unwrap();
        assert_eq!(loaded.len(), 3);

        let lo = saturating_add(now, cfg.replay_wait_min);
        let hi = saturating_add(now, cfg.replay_wait_max);
        for (_, msg) in loaded {
            match msg.payload.as_slice() {
                b"undo" => {
                    assert!(msg.lease_trigger >= lo && msg.lease_trigger < hi);
                    assert_eq!(msg.lease_end, msg.lease_trigger);
                }
                b"replay" => {
                    assert!(msg.lease_trigger >= lo && msg.lease_trigger < hi);
                    assert_eq!(msg.lease_end, now + TimeDelta::days(30));
                }
                _ => assert_eq!(msg.lease_trigger, now + TimeDelta::days(1)),
            }
        }
    }
}
