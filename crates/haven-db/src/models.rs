use chrono::{DateTime, Utc};

/// A stored value together with the schema version it was written with and
/// the time of the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedObject {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

impl VersionedObject {
    /// Wrap `data` stamped with the current time.
    pub fn new(version: u64, data: Vec<u8>) -> Self {
        Self {
            version,
            timestamp: Utc::now(),
            data,
        }
    }
}
