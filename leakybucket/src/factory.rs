//! Bucket configuration, and construction of buckets from it.

use crate::{
    bucket_queue::BucketQueue,
    leaky::{Leaky, OutOfOrderPolicy, OverflowPolicy},
    overflow::OverflowSender,
    rate_limiter::{LeakRate, RateLimiter},
    time_source::{BucketMode, Clock, SystemClock, TimeSource},
};
use conf::Conf;
use std::sync::Arc;
use tracing::trace;

/// Config options for the buckets of one scenario.
#[derive(Clone, Conf, Debug)]
#[conf(serde)]
pub struct BucketConfig {
    /// Scenario name, used in overflows and diagnostics
    #[conf(long, env)]
    pub name: String,
    /// Number of events the bucket admits in a burst before it overflows
    #[conf(long, env, default_value = "5")]
    pub capacity: u32,
    /// How fast the bucket leaks, e.g. "1 / 10s", "10s", or "0"
    #[conf(long, env, default_value = "10s")]
    pub leak_speed: LeakRate,
    /// Pour strategy: "live" (wall clock) or "time-machine" (event timestamps)
    #[conf(long, env, default_value = "live")]
    pub mode: BucketMode,
    /// Maximum number of events kept in the queue. Unbounded if unset or 0.
    #[conf(long, env)]
    pub queue_size: Option<usize>,
    /// What to do with the queue after an overflow: "continue" or "reset"
    #[conf(long, env, default_value = "continue")]
    pub overflow_policy: OverflowPolicy,
    /// What to do with events older than the last evaluation: "clamp" or "reject"
    #[conf(long, env, default_value = "clamp")]
    pub out_of_order: OutOfOrderPolicy,
}

impl BucketConfig {
    /// A config with default policies, an unbounded queue, and live mode.
    pub fn new(name: impl Into<String>, capacity: u32, leak_speed: LeakRate) -> Self {
        Self {
            name: name.into(),
            capacity,
            leak_speed,
            mode: BucketMode::Live,
            queue_size: None,
            overflow_policy: OverflowPolicy::Continue,
            out_of_order: OutOfOrderPolicy::Clamp,
        }
    }

    /// Set the pour strategy.
    pub fn mode(mut self, mode: BucketMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bound the queue.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Set the post-overflow policy.
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set the out-of-order policy.
    pub fn out_of_order(mut self, policy: OutOfOrderPolicy) -> Self {
        self.out_of_order = policy;
        self
    }
}

/// Builds buckets for a scenario.
///
/// The pour strategy is chosen here, once per bucket, from [`BucketConfig::mode`].
#[derive(Clone, Debug)]
pub struct BucketFactory {
    config: BucketConfig,
    clock: Arc<dyn Clock>,
}

impl BucketFactory {
    /// A factory whose live buckets read the system clock.
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used by live buckets.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The scenario config.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// Make a new, empty bucket that sends its overflows to `output`.
    pub fn make_bucket(&self, output: OverflowSender) -> Leaky {
        let config = &self.config;
        trace!(
            scenario = %config.name,
            "Instantiating {} bucket (capacity: {}, leak speed: {})",
            config.mode,
            config.capacity,
            config.leak_speed
        );

        Leaky::new(
            config.name.as_str(),
            TimeSource::for_mode(config.mode, self.clock.clone()),
            RateLimiter::new(config.capacity, config.leak_speed),
            BucketQueue::new(config.queue_size),
            output,
        )
        .with_overflow_policy(config.overflow_policy)
        .with_out_of_order_policy(config.out_of_order)
    }
}
