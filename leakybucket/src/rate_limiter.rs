//! Token bucket admission control, driven by externally supplied timestamps.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{fmt, str::FromStr, time::Duration};

/// How fast a bucket leaks, i.e. how fast tokens are refilled, expressed as a string:
///
/// * `1 / 10s` - one token every ten seconds
/// * `5/1m` - five tokens per minute
/// * `10s` - shorthand for `1 / 10s`
/// * `0` - never refills
///
/// Durations use humantime syntax (`500ms`, `30s`, `5m`, `1h`, `2d`).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String")]
pub struct LeakRate {
    /// Number of tokens refilled per period.
    pub tokens: u32,
    /// The refill period.
    pub per: Duration,
}

impl LeakRate {
    /// A rate that never refills.
    pub const ZERO: LeakRate = LeakRate {
        tokens: 0,
        per: Duration::from_secs(1),
    };

    /// One token every `period`.
    pub fn every(period: Duration) -> Self {
        Self {
            tokens: 1,
            per: period,
        }
    }

    /// Refill rate in tokens per second.
    pub fn tokens_per_sec(&self) -> f64 {
        if self.tokens == 0 || self.per.is_zero() {
            return 0.0;
        }
        self.tokens as f64 / self.per.as_secs_f64()
    }
}

impl FromStr for LeakRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "0" {
            return Ok(Self::ZERO);
        }

        let (num, dur) = match s.split_once('/') {
            Some((num, dur)) => (num.trim(), dur.trim()),
            None => ("1", s),
        };

        let tokens: u32 = num
            .parse()
            .map_err(|err| format!("invalid number {num}: {err}"))?;
        let per =
            humantime::parse_duration(dur).map_err(|err| format!("invalid duration {dur}: {err}"))?;

        if tokens > 0 && per.is_zero() {
            return Err("invalid leak rate: period must be > 0".into());
        }

        Ok(LeakRate { tokens, per })
    }
}

impl TryFrom<String> for LeakRate {
    type Error = <LeakRate as FromStr>::Err;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        LeakRate::from_str(&s)
    }
}

impl fmt::Display for LeakRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tokens == 0 {
            return write!(f, "0");
        }
        write!(
            f,
            "{} / {}",
            self.tokens,
            humantime::format_duration(self.per).to_string().replace(' ', "")
        )
    }
}

/// Read-only view of a limiter's state, for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimiterSnapshot {
    /// Maximum number of tokens.
    pub capacity: u32,
    /// Tokens currently available.
    pub tokens: f64,
    /// Timestamp of the last evaluation.
    pub last: Option<DateTime<Utc>>,
    /// Timestamp of the last admitted request.
    pub last_event: Option<DateTime<Utc>>,
}

/// A token bucket that has no clock of its own: every evaluation is given the time to evaluate at.
///
/// The bucket starts full. Tokens refill continuously at the leak rate, capped at capacity,
/// and each admitted request removes tokens. Because time is always passed in, the same
/// limiter can be driven by wall-clock time or by timestamps read from replayed events,
/// and identical inputs always give identical decisions.
///
/// The level is kept in integer units of `1 / period_nanos` token, so refill is exact:
/// one full period after a token was spent, it is back.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    capacity: u32,
    /// Units per token: the leak period in nanoseconds.
    unit: u128,
    /// Units refilled per elapsed nanosecond: tokens per period.
    refill: u128,
    level: u128,
    /// Invariant: never decreases.
    last: Option<DateTime<Utc>>,
    last_event: Option<DateTime<Utc>>,
}

impl RateLimiter {
    /// Create a full limiter.
    pub fn new(capacity: u32, rate: LeakRate) -> Self {
        let (unit, refill) = if rate.tokens == 0 || rate.per.is_zero() {
            (1, 0)
        } else {
            (rate.per.as_nanos(), rate.tokens as u128)
        };
        Self {
            capacity,
            unit,
            refill,
            level: capacity as u128 * unit,
            last: None,
            last_event: None,
        }
    }

    /// Check whether one request fits the budget at time `at`.
    pub fn allow(&mut self, at: DateTime<Utc>) -> bool {
        self.allow_n(at, 1)
    }

    /// Check whether `n` requests fit the budget at time `at`, and if so, consume them.
    ///
    /// A timestamp older than the last evaluation is treated as if no time had elapsed.
    pub fn allow_n(&mut self, at: DateTime<Utc>, n: u32) -> bool {
        self.advance(at);
        let cost = n as u128 * self.unit;
        if self.level >= cost {
            self.level -= cost;
            self.last_event = Some(at);
            true
        } else {
            false
        }
    }

    /// Tokens currently available, as of the last evaluation.
    pub fn tokens(&self) -> f64 {
        self.level as f64 / self.unit as f64
    }

    /// Timestamp of the last evaluation.
    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    /// Maximum number of tokens.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Snapshot the limiter state without modifying it.
    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            capacity: self.capacity,
            tokens: self.tokens(),
            last: self.last,
            last_event: self.last_event,
        }
    }

    fn advance(&mut self, at: DateTime<Utc>) {
        match self.last {
            None => self.last = Some(at),
            Some(last) if at > last => {
                // Only overflows past ~292 years, which refills to capacity anyway
                let elapsed = (at - last).num_nanoseconds().unwrap_or(i64::MAX) as u128;
                let max = self.capacity as u128 * self.unit;
                self.level = self
                    .level
                    .saturating_add(elapsed.saturating_mul(self.refill))
                    .min(max);
                self.last = Some(at);
            }
            // Out of order, or same instant: nothing refills
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn parse_leak_rate() {
        let rate = LeakRate::from_str("1 / 10s").unwrap();
        assert_eq!(rate.tokens, 1);
        assert_eq!(rate.per, Duration::from_secs(10));

        let rate = LeakRate::from_str("5/1m").unwrap();
        assert_eq!(rate.tokens, 5);
        assert_eq!(rate.per, Duration::from_secs(60));

        let rate = LeakRate::from_str("500ms").unwrap();
        assert_eq!(rate, LeakRate::every(Duration::from_millis(500)));
        assert_eq!(rate.tokens_per_sec(), 2.0);

        let rate = LeakRate::from_str("2d").unwrap();
        assert_eq!(rate.per, Duration::from_secs(2 * 86400));

        assert_eq!(LeakRate::from_str("0").unwrap(), LeakRate::ZERO);
        assert_eq!(LeakRate::from_str("0 / 1h").unwrap().tokens_per_sec(), 0.0);

        assert!(LeakRate::from_str("x / 10s").is_err());
        assert!(LeakRate::from_str("1 / forever").is_err());
        assert!(LeakRate::from_str("1 / 0s").is_err());
    }

    #[test]
    fn display_leak_rate() {
        assert_eq!(LeakRate::from_str("1/90s").unwrap().to_string(), "1 / 1m30s");
        assert_eq!(LeakRate::ZERO.to_string(), "0");
    }

    #[test]
    fn burst_of_capacity_plus_one() {
        let mut limiter = RateLimiter::new(3, LeakRate::every(Duration::from_secs(10)));
        assert!(limiter.allow(t(0)));
        assert!(limiter.allow(t(0)));
        assert!(limiter.allow(t(0)));
        assert!(!limiter.allow(t(0)));
        assert_eq!(limiter.tokens(), 0.0);
    }

    #[test]
    fn refills_over_time() {
        let mut limiter = RateLimiter::new(2, LeakRate::every(Duration::from_secs(10)));
        assert!(limiter.allow(t(0)));
        assert!(limiter.allow(t(0)));
        assert!(!limiter.allow(t(5)));
        // 10s after the start, one token is back
        assert!(limiter.allow(t(10)));
        assert!(!limiter.allow(t(10)));
        // Long idle period refills only up to capacity
        assert!(limiter.allow(t(1000)));
        assert_eq!(limiter.tokens(), 1.0);
    }

    #[test]
    fn full_period_refills_exactly_one_token() {
        let mut limiter = RateLimiter::new(1, LeakRate::from_str("1 / 10s").unwrap());
        assert!(limiter.allow(t(0)));
        for secs in 1..10 {
            assert!(!limiter.allow(t(secs)), "admitted at t={secs}");
        }
        assert!(limiter.allow(t(10)));
        assert_eq!(limiter.tokens(), 0.0);

        // Same with sub-second steps and a rate that is not a whole number per second
        let mut limiter = RateLimiter::new(1, LeakRate::from_str("3 / 7s").unwrap());
        assert!(limiter.allow(t(0)));
        let step = TimeDelta::milliseconds(7000 / 3 / 10);
        let mut at = t(0);
        for _ in 0..10 {
            at += step;
            assert!(!limiter.allow(at));
        }
        // 2330ms elapsed, a token takes 2333.33ms
        assert!(!limiter.allow(t(0) + TimeDelta::milliseconds(2333)));
        assert!(limiter.allow(t(0) + TimeDelta::nanoseconds(2_333_333_334)));
    }

    #[test]
    fn zero_rate_never_refills() {
        let mut limiter = RateLimiter::new(1, LeakRate::ZERO);
        assert!(limiter.allow(t(0)));
        assert!(!limiter.allow(t(100_000)));
    }

    #[test]
    fn out_of_order_is_clamped() {
        let mut limiter = RateLimiter::new(1, LeakRate::every(Duration::from_secs(10)));
        assert!(limiter.allow(t(100)));
        // Older timestamp: no refill, and the last evaluation time does not go back
        assert!(!limiter.allow(t(50)));
        assert_eq!(limiter.last(), Some(t(100)));
        // Refill is measured from the newest timestamp seen
        assert!(!limiter.allow(t(105)));
        assert!(limiter.allow(t(110)));
    }

    #[test]
    fn request_larger_than_capacity_is_rejected() {
        let mut limiter = RateLimiter::new(2, LeakRate::every(Duration::from_secs(1)));
        assert!(!limiter.allow_n(t(0), 3));
        assert_eq!(limiter.tokens(), 2.0);
        assert!(limiter.allow_n(t(0), 2));
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let mut limiter = RateLimiter::new(2, LeakRate::every(Duration::from_secs(1)));
        assert_eq!(limiter.snapshot().last, None);
        assert!(limiter.allow(t(0)));
        let before = limiter.snapshot();
        let again = limiter.snapshot();
        assert_eq!(before, again);
        assert_eq!(before.tokens, 1.0);
        assert_eq!(before.last, Some(t(0)));
        assert_eq!(before.last_event, Some(t(0)));

        // A rejection moves `last` but not `last_event`
        let mut limiter = RateLimiter::new(0, LeakRate::ZERO);
        assert!(!limiter.allow(t(0) + TimeDelta::seconds(1)));
        assert_eq!(limiter.snapshot().last, Some(t(1)));
        assert_eq!(limiter.snapshot().last_event, None);
    }
}
