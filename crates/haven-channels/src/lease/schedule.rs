use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use haven_types::ChannelId;

use super::LeaseMessage;
use crate::fingerprint::LeaseKey;

/// Stable slot identifier. Handles are never reused, so they also break ties
/// between equal triggers in insertion order.
pub(crate) type LeaseHandle = u64;

struct Slot {
    key: LeaseKey,
    message: LeaseMessage,
}

/// Pending leases, ordered by trigger and indexed by channel and fingerprint.
///
/// Owned by the lease worker alone, so nothing here locks.
#[derive(Default)]
pub(crate) struct LeaseSchedule {
    slots: HashMap<LeaseHandle, Slot>,
    by_trigger: BTreeSet<(DateTime<Utc>, LeaseHandle)>,
    by_channel: HashMap<ChannelId, HashMap<LeaseKey, LeaseHandle>>,
    next_handle: LeaseHandle,
}

impl LeaseSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, channel_id: &ChannelId, key: &LeaseKey) -> Option<&LeaseMessage> {
        let handle = self.by_channel.get(channel_id)?.get(key)?;
        self.slots.get(handle).map(|slot| &slot.message)
    }

    pub fn contains_channel(&self, channel_id: &ChannelId) -> bool {
        self.by_channel.contains_key(channel_id)
    }

    /// Channels with at least one pending lease, sorted.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.by_channel.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Copy of one channel's leases, in the shape they are persisted.
    pub fn channel_messages(&self, channel_id: &ChannelId) -> BTreeMap<LeaseKey, LeaseMessage> {
        self.by_channel
            .get(channel_id)
            .into_iter()
            .flatten()
            .filter_map(|(key, handle)| {
                self.slots
                    .get(handle)
                    .map(|slot| (key.clone(), slot.message.clone()))
            })
            .collect()
    }

    /// Insert or replace the lease stored under `key`. Returns the replaced
    /// record.
    pub fn insert(&mut self, key: LeaseKey, message: LeaseMessage) -> Option<LeaseMessage> {
        let channel_id = message.channel_id;
        let replaced = self.remove(&channel_id, &key);

        let handle = self.next_handle;
        self.next_handle += 1;

        self.by_trigger.insert((message.lease_trigger, handle));
        self.by_channel
            .entry(channel_id)
            .or_default()
            .insert(key.clone(), handle);
        self.slots.insert(handle, Slot { key, message });
        replaced
    }

    pub fn remove(&mut self, channel_id: &ChannelId, key: &LeaseKey) -> Option<LeaseMessage> {
        let channel = self.by_channel.get_mut(channel_id)?;
        let handle = channel.remove(key)?;
        if channel.is_empty() {
            self.by_channel.remove(channel_id);
        }

        let slot = self.slots.remove(&handle)?;
        self.by_trigger.remove(&(slot.message.lease_trigger, handle));
        Some(slot.message)
    }

    /// Drop every lease of a channel, returning them.
    pub fn remove_channel(&mut self, channel_id: &ChannelId) -> Vec<LeaseMessage> {
        let Some(handles) = self.by_channel.remove(channel_id) else {
            return Vec::new();
        };

        handles
            .into_values()
            .filter_map(|handle| {
                let slot = self.slots.remove(&handle)?;
                self.by_trigger.remove(&(slot.message.lease_trigger, handle));
                Some(slot.message)
            })
            .collect()
    }

    /// Trigger of the earliest lease.
    pub fn next_trigger(&self) -> Option<DateTime<Utc>> {
        self.by_trigger.first().map(|(trigger, _)| *trigger)
    }

    /// The earliest lease, if its trigger is at or before `now`.
    pub fn peek_due(&self, now: DateTime<Utc>) -> Option<(LeaseKey, LeaseMessage)> {
        let (trigger, handle) = self.by_trigger.first()?;
        if *trigger > now {
            return None;
        }
        self.slots
            .get(handle)
            .map(|slot| (slot.key.clone(), slot.message.clone()))
    }

    /// Leases in trigger order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &LeaseMessage> {
        self.by_trigger
            .iter()
            .filter_map(|(_, handle)| self.slots.get(handle).map(|slot| &slot.message))
    }
}
