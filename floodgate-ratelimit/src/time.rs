//! Timestamps, clocks and tier unit parsing
//!
//! Every timestamp that reaches the store is a count of milliseconds since
//! the UNIX epoch. Keeping that in a [`Timestamp`] newtype and all spans in
//! [`Duration`] avoids mixing seconds and milliseconds in the algorithms.

use crate::error::{RateLimitError, RateLimitResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock instant with millisecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The UNIX epoch
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Current system time
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(millis as u64)
    }

    /// Create from milliseconds since the UNIX epoch
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the UNIX epoch
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// This instant moved back by `span`, clamped at the epoch
    pub fn saturating_sub(&self, span: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration_millis(span)))
    }

    /// This instant moved forward by `span`
    pub fn saturating_add(&self, span: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration_millis(span)))
    }

    /// Signed offset in milliseconds from `origin`, used as a sorted-set score.
    /// Saturates at the bounds of `i64`.
    pub fn offset_from(&self, origin: Timestamp) -> i64 {
        let offset = i128::from(self.0) - i128::from(origin.0);
        i64::try_from(offset).unwrap_or(if offset < 0 { i64::MIN } else { i64::MAX })
    }

    /// Parse a stored decimal millisecond value
    pub(crate) fn parse_stored(key: &str, raw: &str) -> RateLimitResult<Self> {
        raw.trim()
            .parse::<u64>()
            .map(Timestamp)
            .map_err(|_| RateLimitError::malformed(key, format!("{:?} is not a timestamp", raw)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let millis = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        Self(millis as u64)
    }
}

fn duration_millis(span: Duration) -> u64 {
    u64::try_from(span.as_millis()).unwrap_or(u64::MAX)
}

/// Source of the current time for policies and the in-memory store
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that only moves when told to
///
/// Useful for tests and simulations. Several policies and a
/// [`MemoryStore`](crate::MemoryStore) can share one instance via `Arc`.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, span: Duration) {
        self.millis.fetch_add(duration_millis(span), Ordering::SeqCst);
    }

    /// Jump to an absolute instant
    pub fn set(&self, at: Timestamp) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }
}

/// Parse a tier unit string into a span.
///
/// Accepted forms: a leading integer with a trailing `D`, `H`, `M` or `S`
/// (days, hours, minutes, seconds), a bare integer meaning seconds, or one of
/// the words `second`, `minute`, `hour`, `day` meaning one of that unit.
///
/// ```rust
/// use floodgate_ratelimit::time::parse_unit;
/// use std::time::Duration;
///
/// assert_eq!(parse_unit("15M").unwrap(), Duration::from_secs(900));
/// assert_eq!(parse_unit("hour").unwrap(), Duration::from_secs(3600));
/// ```
pub fn parse_unit(unit: &str) -> RateLimitResult<Duration> {
    let trimmed = unit.trim();
    let invalid = || RateLimitError::InvalidUnit(unit.to_string());

    let word = match trimmed.to_ascii_lowercase().as_str() {
        "second" => Some(1),
        "minute" => Some(60),
        "hour" => Some(3_600),
        "day" => Some(86_400),
        _ => None,
    };
    if let Some(secs) = word {
        return Ok(Duration::from_secs(secs));
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('D') => (&trimmed[..trimmed.len() - 1], 86_400),
        Some('H') => (&trimmed[..trimmed.len() - 1], 3_600),
        Some('M') => (&trimmed[..trimmed.len() - 1], 60),
        Some('S') => (&trimmed[..trimmed.len() - 1], 1),
        _ => (trimmed, 1),
    };

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }
    let secs = value.checked_mul(multiplier).ok_or_else(invalid)?;
    Ok(Duration::from_secs(secs))
}

/// [`parse_unit`] expressed in whole seconds
pub fn convert_unit_to_seconds(unit: &str) -> RateLimitResult<u64> {
    parse_unit(unit).map(|span| span.as_secs())
}

/// Serde helper storing a [`Duration`] as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
