use rusqlite::Connection;
use tracing::info;

use crate::KvError;

pub fn run(conn: &Connection) -> Result<(), KvError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv (
            key         TEXT PRIMARY KEY,
            version     INTEGER NOT NULL,
            timestamp   TEXT NOT NULL,
            data        BLOB NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
