//! Per-unit rate limiting with suppression accounting.
//!
//! One bucket exists per `(unit, priority band)`. The return value of
//! [`JournalRateLimit::check`] is the number of messages the caller may
//! account for right now: `0` drops the current message, `1` admits it,
//! `k > 1` admits it and reports that `k − 1` earlier messages were
//! suppressed in the window that just ended.

use journal_common::{Microseconds, Priority};
use std::collections::HashMap;
use tracing::trace;

/// Buckets are garbage collected once the table grows past this.
const GROUPS_MAX: usize = 2047;

/// Severities sharing one bucket: emergencies and alerts together, then
/// one band per level, info and debug together.
fn priority_band(priority: Priority) -> u8 {
    match priority.value() {
        0 | 1 => 0,
        2 => 1,
        3 => 2,
        4 => 3,
        5 => 4,
        _ => 5,
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Microseconds,
    tokens_used: u64,
    suppressed: u64,
}

pub struct JournalRateLimit {
    interval_usec: u64,
    burst: u64,
    buckets: HashMap<(String, u8), Bucket>,
}

impl JournalRateLimit {
    pub fn new(interval_usec: u64, burst: u64) -> Self {
        Self {
            interval_usec,
            burst,
            buckets: HashMap::new(),
        }
    }

    /// Burst scaled by how much of the space budget is still available;
    /// never below one message per window.
    fn effective_burst(&self, available: u64, limit: u64) -> u64 {
        if limit == 0 {
            return self.burst.max(1);
        }

        let factor = (available as f64 / limit as f64).min(1.0);
        ((self.burst as f64 * factor) as u64).max(1)
    }

    /// Account one message for `(unit, priority)`. A zero interval or
    /// burst disables limiting entirely.
    pub fn check(
        &mut self,
        unit: &str,
        priority: Priority,
        available: u64,
        limit: u64,
        now: Microseconds,
    ) -> u64 {
        if self.interval_usec == 0 || self.burst == 0 {
            return 1;
        }

        if self.buckets.len() > GROUPS_MAX {
            self.gc(now);
        }

        let burst = self.effective_burst(available, limit);
        let key = (unit.to_string(), priority_band(priority));

        let bucket = self.buckets.entry(key).or_insert(Bucket {
            window_start: now,
            tokens_used: 0,
            suppressed: 0,
        });

        if now.get().saturating_sub(bucket.window_start.get()) >= self.interval_usec {
            // New window: release the suppression count accumulated in
            // the one that ended.
            let released = bucket.suppressed;
            bucket.window_start = now;
            bucket.tokens_used = 1;
            bucket.suppressed = 0;
            return released + 1;
        }

        if bucket.tokens_used < burst {
            bucket.tokens_used += 1;
            return 1;
        }

        bucket.suppressed += 1;
        trace!(unit, suppressed = bucket.suppressed, "rate limit suppressing");
        0
    }

    /// Drop buckets idle for longer than the interval.
    pub fn gc(&mut self, now: Microseconds) {
        let interval = self.interval_usec;
        self.buckets.retain(|_, bucket| {
            now.get().saturating_sub(bucket.window_start.get()) < 2 * interval
        });
    }

    pub fn n_buckets(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journal_common::USEC_PER_SEC;

    const INTERVAL: u64 = 30 * USEC_PER_SEC;

    #[test]
    fn burst_admits_then_suppresses() {
        let mut limit = JournalRateLimit::new(INTERVAL, 3);
        let now = Microseconds(1_000_000);

        let mut delivered = 0;
        let mut suppressed = 0;
        for _ in 0..10 {
            match limit.check("foo.service", Priority::Info, 100, 100, now) {
                0 => suppressed += 1,
                n => delivered += n,
            }
        }

        assert_eq!(delivered, 3);
        assert_eq!(suppressed, 7);

        // Next window: the first message reports the seven suppressed.
        let later = Microseconds(1_000_000 + INTERVAL);
        assert_eq!(
            limit.check("foo.service", Priority::Info, 100, 100, later),
            8
        );
    }

    #[test]
    fn delivered_plus_suppressed_is_total() {
        let mut limit = JournalRateLimit::new(INTERVAL, 5);
        let now = Microseconds(0);

        let total = 100u64;
        let mut delivered = 0;
        let mut suppressed = 0;
        for _ in 0..total {
            match limit.check("bar.service", Priority::Notice, 1, 1, now) {
                0 => suppressed += 1,
                n => delivered += n,
            }
        }

        assert_eq!(delivered + suppressed, total);
        assert!(delivered <= 5);
    }

    #[test]
    fn units_do_not_interfere() {
        let mut limit = JournalRateLimit::new(INTERVAL, 1);
        let now = Microseconds(0);

        assert_eq!(limit.check("a.service", Priority::Info, 1, 1, now), 1);
        assert_eq!(limit.check("a.service", Priority::Info, 1, 1, now), 0);
        assert_eq!(limit.check("b.service", Priority::Info, 1, 1, now), 1);
    }

    #[test]
    fn bands_share_buckets() {
        let mut limit = JournalRateLimit::new(INTERVAL, 1);
        let now = Microseconds(0);

        // Info and debug share a band.
        assert_eq!(limit.check("a.service", Priority::Info, 1, 1, now), 1);
        assert_eq!(limit.check("a.service", Priority::Debug, 1, 1, now), 0);

        // Critical does not.
        assert_eq!(limit.check("a.service", Priority::Critical, 1, 1, now), 1);
    }

    #[test]
    fn low_space_shrinks_burst() {
        let mut limit = JournalRateLimit::new(INTERVAL, 100);
        let now = Microseconds(0);

        // One tenth of the budget left: bursts shrink accordingly.
        let mut delivered = 0;
        for _ in 0..50 {
            if limit.check("c.service", Priority::Info, 10, 100, now) > 0 {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 10);

        // Burst never drops below one.
        assert_eq!(limit.check("d.service", Priority::Info, 0, 100, now), 1);
    }

    #[test]
    fn zero_interval_disables() {
        let mut limit = JournalRateLimit::new(0, 1);
        for _ in 0..100 {
            assert_eq!(
                limit.check("x.service", Priority::Info, 0, 100, Microseconds(0)),
                1
            );
        }
    }

    #[test]
    fn idle_buckets_are_collected() {
        let mut limit = JournalRateLimit::new(INTERVAL, 1);
        limit.check("a.service", Priority::Info, 1, 1, Microseconds(0));
        limit.check("b.service", Priority::Info, 1, 1, Microseconds(0));
        assert_eq!(limit.n_buckets(), 2);

        limit.gc(Microseconds(3 * INTERVAL));
        assert_eq!(limit.n_buckets(), 0);
    }
}
