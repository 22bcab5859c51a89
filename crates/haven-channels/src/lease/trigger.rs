use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

use super::VALID_FOREVER;
use crate::config::LeaseConfig;

/// Latest instant a lease may end at. Keeps persisted timestamps within the
/// four-digit years RFC 3339 can represent.
pub(crate) fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `t + d`, clamped to [`far_future`].
pub(crate) fn saturating_add(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    let limit = far_future();
    TimeDelta::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .map_or(limit, |t| t.min(limit))
}

/// Non-negative time from `from` to `to`.
pub(crate) fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

pub(crate) fn lease_end(originating: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    saturating_add(originating, lease)
}

/// True once `lease` measured from `originating` has run out.
pub(crate) fn is_expired(now: DateTime<Utc>, originating: DateTime<Utc>, lease: Duration) -> bool {
    lease != VALID_FOREVER && now >= lease_end(originating, lease)
}

/// Uniformly random duration in `[min, max)`; `min` when the range is empty.
pub(crate) fn rand_duration_in_range<R: Rng + ?Sized>(
    min: Duration,
    max: Duration,
    rng: &mut R,
) -> Duration {
    if max <= min {
        return min;
    }
    let lo = u64::try_from(min.as_nanos()).unwrap_or(u64::MAX);
    let hi = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if hi <= lo {
        return min;
    }
    Duration::from_nanos(rng.random_range(lo..hi))
}

/// When the scheduler should next act on a lease, or `None` if the lease has
/// already run out.
///
/// Leases that end within `message_life` get their true end as trigger.
/// Longer ones must be replayed before the network forgets the command. The
/// replay point is drawn from the second half of the window starting at
/// `anchor` (when the copy currently on the network was sent). If that
/// window is already too late, a point in the short wait window from `now`
/// is used instead.
pub(crate) fn calculate_lease_trigger<R: Rng + ?Sized>(
    now: DateTime<Utc>,
    originating: DateTime<Utc>,
    anchor: DateTime<Utc>,
    lease: Duration,
    cfg: &LeaseConfig,
    rng: &mut R,
) -> Option<DateTime<Utc>> {
    if is_expired(now, originating, lease) {
        return None;
    }

    let end = lease_end(originating, lease);
    if lease != VALID_FOREVER && until(now, end) < cfg.message_life {
        return Some(end);
    }

    let mut floor = saturating_add(anchor, cfg.message_life / 2);
    let ceiling = saturating_add(anchor, cfg.message_life);
    if now > floor {
        floor = saturating_add(now, cfg.grace_period);
    }

    let trigger = if ceiling <= floor || until(floor, ceiling) < cfg.grace_period {
        saturating_add(
            now,
            rand_duration_in_range(cfg.replay_wait_min, cfg.replay_wait_max, rng),
        )
    } else {
        saturating_add(
            floor,
            rand_duration_in_range(Duration::ZERO, until(floor, ceiling), rng),
        )
    };
    Some(trigger.min(end))
}
