/// Content-addressed identifiers for channel commands.
///
/// A fingerprint is `SHA-256(channel_id || action || payload)`. The same
/// construction backs two families, one for lease scheduling and one for
/// command / replay tracking. They are distinct types and never share a
/// storage namespace, so a key from one family cannot be used in the other.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use haven_types::{ChannelId, MessageType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

pub trait FingerprintFamily:
    fmt::Debug + Clone + Copy + PartialEq + Eq + Hash + PartialOrd + Ord + Default + Send + Sync + 'static
{
}

/// Fingerprints keying the lease scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LeaseFamily;

/// Fingerprints keying the replay guard and the command store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CommandFamily;

impl FingerprintFamily for LeaseFamily {}
impl FingerprintFamily for CommandFamily {}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint<F: FingerprintFamily> {
    bytes: [u8; FINGERPRINT_LEN],
    _family: PhantomData<F>,
}

pub type LeaseFingerprint = Fingerprint<LeaseFamily>;
pub type CommandFingerprint = Fingerprint<CommandFamily>;

impl<F: FingerprintFamily> Fingerprint<F> {
    pub fn new(channel_id: &ChannelId, action: MessageType, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(channel_id.as_bytes());
        hasher.update(action.to_bytes());
        hasher.update(payload);

        Self {
            bytes: hasher.finalize().into(),
            _family: PhantomData,
        }
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.bytes
    }

    /// String form used as a map and storage key.
    pub fn key(&self) -> FingerprintKey<F> {
        FingerprintKey {
            key: hex::encode(self.bytes),
            _family: PhantomData,
        }
    }

    /// First 8 bytes read as a little-endian integer. A short digest only:
    /// collisions are unlikely but possible.
    pub fn truncated(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.bytes[..8]);
        u64::from_le_bytes(head)
    }
}

impl<F: FingerprintFamily> fmt::Display for Fingerprint<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.bytes))
    }
}

impl<F: FingerprintFamily> fmt::Debug for Fingerprint<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{:?}>({})", F::default(), hex::encode(&self.bytes[..8]))
    }
}

/// Hex form of a [`Fingerprint`]. Serialises as a plain string so it can key
/// JSON maps.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct FingerprintKey<F: FingerprintFamily> {
    key: String,
    #[serde(skip)]
    _family: PhantomData<F>,
}

pub type LeaseKey = FingerprintKey<LeaseFamily>;
pub type CommandKey = FingerprintKey<CommandFamily>;

impl<F: FingerprintFamily> FingerprintKey<F> {
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl<F: FingerprintFamily> fmt::Display for FingerprintKey<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl<F: FingerprintFamily> fmt::Debug for FingerprintKey<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn channel(n: u128) -> ChannelId {
        ChannelId(Uuid::from_u128(n))
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = CommandFingerprint::new(&channel(1), MessageType::Pinned, b"payload");
        let b = CommandFingerprint::new(&channel(1), MessageType::Pinned, b"payload");
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str().len(), FINGERPRINT_LEN * 2);
    }

    #[test]
    fn every_input_changes_the_fingerprint() {
        let base = LeaseFingerprint::new(&channel(1), MessageType::Pinned, b"payload");
        let others = [
            LeaseFingerprint::new(&channel(2), MessageType::Pinned, b"payload"),
            LeaseFingerprint::new(&channel(1), MessageType::Mute, b"payload"),
            LeaseFingerprint::new(&channel(1), MessageType::Pinned, b"payloae"),
            LeaseFingerprint::new(&channel(1), MessageType::Pinned, b""),
        ];
        for other in others {
            assert_ne!(base, other);
        }
    }

    #[test]
    fn concatenation_order_matters() {
        // Moving the action bytes into the payload must not produce the same
        // digest as the structured input.
        let id = channel(7);
        let structured = CommandFingerprint::new(&id, MessageType::Delete, b"xyz");

        let mut hasher = Sha256::new();
        hasher.update(MessageType::Delete.to_bytes());
        hasher.update(id.as_bytes());
        hasher.update(b"xyz");
        let swapped: [u8; FINGERPRINT_LEN] = hasher.finalize().into();

        assert_ne!(structured.as_bytes(), &swapped);
    }

    #[test]
    fn key_serializes_as_plain_string() {
        let fp = CommandFingerprint::new(&channel(3), MessageType::Mute, b"m");
        let json = serde_json::to_string(&fp.key()).unwrap();
        assert_eq!(json, format!("\"{}\"", fp));
        let back: CommandKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp.key());
    }

    #[test]
    fn truncated_reads_little_endian_prefix() {
        let fp = CommandFingerprint::new(&channel(4), MessageType::Pinned, b"p");
        let mut head = [0u8; 8];
        head.copy_from_slice(&fp.as_bytes()[..8]);
        assert_eq!(fp.truncated(), u64::from_le_bytes(head));
    }
}
