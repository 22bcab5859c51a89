/// Serde helpers shared by persisted records.

/// Byte strings as standard base64 text.
pub(crate) mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Hex rendering of a payload for logs, cut to `n` bytes.
pub(crate) fn truncated_hex(bytes: &[u8], n: usize) -> String {
    if bytes.len() <= n {
        hex::encode(bytes)
    } else {
        format!("{}...", hex::encode(&bytes[..n]))
    }
}
