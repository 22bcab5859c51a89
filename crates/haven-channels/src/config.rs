use std::time::Duration;

use tracing::warn;

/// Tunables for the lease scheduler and replay guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long a message stays retrievable from the network. Leases longer
    /// than this must be replayed before it elapses.
    pub message_life: Duration,

    /// Minimum time to wait for an alternate replay before sending our own.
    pub grace_period: Duration,

    /// Short wait window used when a replay window has already elapsed, e.g.
    /// for past-due leases found on load.
    pub replay_wait_min: Duration,
    pub replay_wait_max: Duration,

    /// Window for a corrective replay scheduled by the replay guard.
    pub quick_replay_floor: Duration,
    pub quick_replay_ceiling: Duration,

    /// Capacity of the scheduler's request queue.
    pub queue_capacity: usize,

    /// Replay guard lock waits or holds longer than this are logged.
    pub lock_warn_threshold: Duration,
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            message_life: Duration::from_secs(500 * HOUR),
            grace_period: Duration::from_secs(3 * MINUTE),
            replay_wait_min: Duration::from_secs(5 * MINUTE),
            replay_wait_max: Duration::from_secs(30 * MINUTE),
            quick_replay_floor: Duration::from_secs(3 * MINUTE),
            quick_replay_ceiling: Duration::from_secs(10 * MINUTE),
            queue_capacity: 100,
            lock_warn_threshold: Duration::from_millis(100),
        }
    }
}

impl LeaseConfig {
    /// Defaults overridden by `HAVEN_LEASE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `HAVEN_LEASE_*` key. Durations are in seconds, the lock threshold in
    /// milliseconds. Unparsable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Duration {
            parse_u64(&lookup, key).map_or(default, Duration::from_secs)
        };

        Self {
            message_life: secs("HAVEN_LEASE_MESSAGE_LIFE_SECS", defaults.message_life),
            grace_period: secs("HAVEN_LEASE_GRACE_PERIOD_SECS", defaults.grace_period),
            replay_wait_min: secs("HAVEN_LEASE_REPLAY_WAIT_MIN_SECS", defaults.replay_wait_min),
            replay_wait_max: secs("HAVEN_LEASE_REPLAY_WAIT_MAX_SECS", defaults.replay_wait_max),
            quick_replay_floor: secs(
                "HAVEN_LEASE_QUICK_REPLAY_FLOOR_SECS",
                defaults.quick_replay_floor,
            ),
            quick_replay_ceiling: secs(
                "HAVEN_LEASE_QUICK_REPLAY_CEILING_SECS",
                defaults.quick_replay_ceiling,
            ),
            queue_capacity: parse_u64(&lookup, "HAVEN_LEASE_QUEUE_CAPACITY")
                .map_or(defaults.queue_capacity, |n| n.max(1) as usize),
            lock_warn_threshold: parse_u64(&lookup, "HAVEN_LEASE_LOCK_WARN_MS")
                .map_or(defaults.lock_warn_threshold, Duration::from_millis),
        }
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable lease setting");
            None
        }
    }
}
