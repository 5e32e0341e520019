use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Wall clock used by every job.
///
/// `System` reads the host clock. `Manual` holds an explicit instant that is
/// only moved by [`Clock::advance`] / [`Clock::set`], which makes window
/// arithmetic deterministic in tests and replays.
#[derive(Clone)]
pub enum Clock {
    System,
    Manual(Arc<AtomicI64>),
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("Clock::System"),
            Self::Manual(ms) => f
                .debug_tuple("Clock::Manual")
                .field(&from_millis(ms.load(Ordering::Relaxed)))
                .finish(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::System
    }
}

impl Clock {
    /// Create a manual clock starting at `start`.
    pub fn manual(start: DateTime<Utc>) -> Self {
        Self::Manual(Arc::new(AtomicI64::new(start.timestamp_millis())))
    }

    /// Return the current instant (millisecond precision).
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => from_millis(Utc::now().timestamp_millis()),
            Self::Manual(ms) => from_millis(ms.load(Ordering::Relaxed)),
        }
    }

    /// Move a manual clock forward. No-op for the system clock.
    pub fn advance(&self, by: Duration) {
        if let Self::Manual(ms) = self {
            ms.fetch_add(duration_millis(by), Ordering::Relaxed);
        }
    }

    /// Set a manual clock to an absolute instant. No-op for the system clock.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Self::Manual(ms) = self {
            ms.store(at.timestamp_millis(), Ordering::Relaxed);
        }
    }
}

/// Converts unix milliseconds to a UTC instant.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Converts a std duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Converts a std duration to a chrono delta, saturating.
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::try_milliseconds(duration_millis(d)).unwrap_or(TimeDelta::MAX)
}

/// `t - d`, clamped to the earliest representable instant.
pub fn saturating_sub(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t.checked_sub_signed(to_delta(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `t + d`, clamped to the latest representable instant.
pub fn saturating_add(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t.checked_add_signed(to_delta(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Start of the window of width `width` containing `t`.
pub fn align_down(t: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let w = duration_millis(width).max(1);
    from_millis(t.timestamp_millis().div_euclid(w) * w)
}

/// First window boundary at or after `t`.
pub fn align_up(t: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let down = align_down(t, width);
    if down == t {
        down
    } else {
        saturating_add(down, width)
    }
}

/// Iterates window starts in `[from, to)` stepping by `width`.
///
/// Both bounds are expected to be aligned to `width`.
pub fn window_starts(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    width: Duration,
) -> impl Iterator<Item = DateTime<Utc>> {
    let step = duration_millis(width).max(1);
    let end = to.timestamp_millis();
    let mut cursor = from.timestamp_millis();
    std::iter::from_fn(move || {
        if cursor >= end {
            return None;
        }
        let current = cursor;
        cursor = cursor.saturating_add(step);
        Some(from_millis(current))
    })
}
