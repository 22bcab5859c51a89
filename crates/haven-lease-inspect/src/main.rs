use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use haven_channels::{lease, replay_blocker};
use haven_db::{Database, Kv};
use haven_types::ChannelId;
use serde_json::{Value, json};
use tracing::info;

const COMMAND_STORE_PREFIX: &str = "channelCommandStore/";

/// Dump the persisted lease schedule and replay guard state as JSON.
///
/// Usage: `haven-lease-inspect [channel-id]`
fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven_channels=debug,haven_db=info".into()),
        )
        .init();

    let db_path = std::env::var("HAVEN_DB_PATH").unwrap_or_else(|_| "haven.db".into());
    let filter: Option<ChannelId> = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()
        .context("channel id must be a UUID")?;

    let db = Arc::new(
        Database::open(&PathBuf::from(&db_path))
            .with_context(|| format!("opening {}", db_path))?,
    );
    let stored_keys = db.keys_with_prefix(COMMAND_STORE_PREFIX)?;
    let kv: Arc<dyn Kv> = db;

    let now = Utc::now();
    let leases = lease::load_snapshot(kv.clone())?;
    let commands = replay_blocker::load_snapshot(kv)?;
    info!(
        path = %db_path,
        lease_channels = leases.len(),
        command_channels = commands.len(),
        stored_commands = stored_keys.len(),
        "Loaded persisted state"
    );

    let wanted = |id: &ChannelId| filter.is_none_or(|f| f == *id);

    let mut lease_report = serde_json::Map::new();
    for (channel_id, messages) in leases.iter().filter(|(id, _)| wanted(id)) {
        let entries: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "lease": m,
                    "overdue": m.lease_trigger < now,
                    "undo_at_trigger": m.lease_trigger >= m.lease_end,
                    "summary": m.to_string(),
                })
            })
            .collect();
        lease_report.insert(channel_id.to_string(), Value::Array(entries));
    }

    let command_report: serde_json::Map<String, Value> = commands
        .iter()
        .filter(|(id, _)| wanted(id))
        .map(|(channel_id, records)| Ok((channel_id.to_string(), serde_json::to_value(records)?)))
        .collect::<Result<_, serde_json::Error>>()?;

    // Stored commands the replay guard no longer refers to, across all channels.
    let tracked: HashSet<String> = commands
        .values()
        .flat_map(|records| records.keys().map(|key| key.to_string()))
        .collect();
    let untracked: Vec<&str> = stored_keys
        .iter()
        .filter_map(|key| key.strip_prefix(COMMAND_STORE_PREFIX))
        .filter(|key| !tracked.contains(*key))
        .collect();

    let report = json!({
        "db_path": db_path,
        "generated_at": now,
        "leases": lease_report,
        "commands": command_report,
        "stored_commands": stored_keys.len(),
        "untracked_commands": untracked,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
