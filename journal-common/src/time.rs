use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const USEC_PER_SEC: u64 = 1_000_000;
pub const USEC_PER_MSEC: u64 = 1_000;

/// A timestamp or duration in microseconds.
///
/// Realtime stamps count from the Unix epoch (`CLOCK_REALTIME`), monotonic
/// stamps from an unspecified boot-relative origin (`CLOCK_MONOTONIC`).
/// Which clock a value belongs to is a property of where it came from; the
/// type does not distinguish them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Microseconds(pub u64);

impl Microseconds {
    /// Current wall-clock time.
    pub fn now_realtime() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(elapsed.as_secs() * USEC_PER_SEC + elapsed.subsec_micros() as u64)
    }

    /// Current monotonic time.
    pub fn now_monotonic() -> Self {
        use nix::time::{ClockId, clock_gettime};

        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Self(ts.tv_sec() as u64 * USEC_PER_SEC + ts.tv_nsec() as u64 / 1_000),
            Err(_) => Self(0),
        }
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(USEC_PER_SEC))
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.0)
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for Microseconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}s", self.0 / USEC_PER_SEC, self.0 % USEC_PER_SEC)
    }
}

impl From<Duration> for Microseconds {
    fn from(d: Duration) -> Self {
        Self(d.as_secs() * USEC_PER_SEC + d.subsec_micros() as u64)
    }
}
