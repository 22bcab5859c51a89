use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::kv::{Kv, KvError};
use crate::models::VersionedObject;
use crate::Database;

impl Kv for Database {
    fn get(&self, key: &str, version: u64) -> Result<VersionedObject, KvError> {
        let obj = self
            .with_conn(|conn| query_object(conn, key))?
            .ok_or_else(|| KvError::NotFound {
                key: key.to_string(),
            })?;

        if obj.version != version {
            return Err(KvError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                found: obj.version,
            });
        }
        Ok(obj)
    }

    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), KvError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, version, timestamp, data) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    version = excluded.version,
                    timestamp = excluded.timestamp,
                    data = excluded.data",
                rusqlite::params![
                    key,
                    object.version as i64,
                    object.timestamp.to_rfc3339(),
                    object.data
                ],
            )?;
            Ok(())
        })
    }

    fn delete(&self, key: &str, _version: u64) -> Result<(), KvError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }
}

impl Database {
    /// Keys starting with `prefix`, sorted. Used by diagnostics tooling.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(rusqlite::params![prefix, prefix.len() as i64], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }
}

fn query_object(conn: &Connection, key: &str) -> Result<Option<VersionedObject>, KvError> {
    let mut stmt = conn.prepare("SELECT version, timestamp, data FROM kv WHERE key = ?1")?;

    let row = stmt
        .query_row([key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })
        .optional()?;

    let Some((version, timestamp, data)) = row else {
        return Ok(None);
    };

    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| KvError::Corrupt {
            key: key.to_string(),
            reason: format!("bad timestamp: {}", e),
        })?
        .with_timezone(&Utc);

    Ok(Some(VersionedObject {
        version: version as u64,
        timestamp,
        data,
    }))
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, KvError>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, KvError> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_roundtrip_and_overwrite() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get("missing", 0).unwrap_err().is_not_found());

        let first = VersionedObject::new(0, b"first".to_vec());
        db.set("k", &first).unwrap();
        assert_eq!(db.get("k", 0).unwrap(), first);

        let second = VersionedObject::new(0, b"second".to_vec());
        db.set("k", &second).unwrap();
        assert_eq!(db.get("k", 0).unwrap().data, b"second");

        db.delete("k", 0).unwrap();
        assert!(db.get("k", 0).unwrap_err().is_not_found());
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");

        {
            let db = Database::open(&path).unwrap();
            db.set("channelLeases", &VersionedObject::new(0, b"[]".to_vec()))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.get("channelLeases", 0).unwrap().data, b"[]");
        assert!(matches!(
            db.get("channelLeases", 1),
            Err(KvError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn keys_with_prefix_filters() {
        let db = Database::open_in_memory().unwrap();
        for key in ["a/1", "a/2", "b/1"] {
            db.set(key, &VersionedObject::new(0, vec![])).unwrap();
        }
        assert_eq!(db.keys_with_prefix("a/").unwrap(), vec!["a/1", "a/2"]);
    }
}
