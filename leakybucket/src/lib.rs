//! Per-scenario leaky buckets for event correlation.
//!
//! Normalized events are poured into a [`Leaky`] bucket. The bucket admits events
//! while its token budget lasts; when an event does not fit, the bucket sends its
//! queued events as an [`Overflow`] to the alerting stage.
//!
//! A bucket is either live, timing pours by the wall clock, or a time machine,
//! timing pours by each event's own timestamp so that historical logs replay
//! with exactly the decisions they would have had live.

pub mod bucket_queue;
pub mod event;
pub mod factory;
pub mod leaky;
pub mod logging;
pub mod overflow;
pub mod rate_limiter;
pub mod time_source;
pub mod worker;

pub use bucket_queue::BucketQueue;
pub use event::{Event, EventBuilder, Line, WireTimeError};
pub use factory::{BucketConfig, BucketFactory};
pub use leaky::{
    BucketState, BucketStats, DiscardReason, Leaky, OutOfOrderPolicy, OverflowPolicy, PourError,
    PourOutcome,
};
pub use logging::{LogMode, LoggingConfig, LoggingError, init_logging};
pub use overflow::{Overflow, OverflowSender, overflow_channel};
pub use rate_limiter::{LeakRate, LimiterSnapshot, RateLimiter};
pub use time_source::{BucketMode, Clock, SystemClock, TimeSource};
pub use worker::BucketWorker;
