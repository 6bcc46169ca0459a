//! The leaky bucket: per-scenario state machine that events are poured into.

use crate::{
    bucket_queue::BucketQueue,
    event::{Event, WireTimeError},
    overflow::{Overflow, OverflowSender, SinkClosed},
    rate_limiter::RateLimiter,
    time_source::{BucketMode, TimeSource},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{debug, trace, warn};

/// Why an event was discarded without touching the bucket.
///
/// These are per-event problems: they are logged, and the stream carries on.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DiscardReason {
    /// The event has no serialized timestamp.
    #[error("event has no serialized timestamp")]
    MissingTimestamp,
    /// The serialized timestamp is not in the wire format.
    #[error("failed to parse event time '{raw}': {source}")]
    TimestampParse {
        /// The value that failed to parse.
        raw: Box<str>,
        /// Parser error.
        source: WireTimeError,
    },
    /// The timestamp is older than the limiter's last evaluation, and the bucket rejects those.
    #[error("event time {at} is older than last evaluation {last}")]
    OutOfOrderTimestamp {
        /// Timestamp of the event.
        at: DateTime<Utc>,
        /// Last evaluation time of the limiter.
        last: DateTime<Utc>,
    },
}

/// Errors that stop a bucket from making progress.
#[derive(Debug, thiserror::Error)]
pub enum PourError {
    /// The overflow consumer is gone, so the overflow could not be delivered.
    #[error("overflow sink closed, lost overflow for scenario {scenario}")]
    OverflowSinkClosed {
        /// Scenario of the bucket.
        scenario: Arc<str>,
        /// The undelivered overflow.
        overflow: Box<Overflow>,
    },
    /// The bucket worker task has stopped.
    #[error("bucket worker has shut down")]
    WorkerGone,
}

/// Result of a pour.
#[derive(Clone, Debug, PartialEq)]
pub enum PourOutcome {
    /// The event fit the budget and was queued.
    Admitted,
    /// The event exceeded the budget. It was queued and the queue was emitted as an overflow.
    Overflowed,
    /// The event was dropped before reaching the bucket.
    Discarded(DiscardReason),
}

/// Lifecycle state of a bucket.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    /// Nothing poured yet.
    Empty,
    /// Events poured, no overflow yet.
    Filling,
    /// At least one overflow emitted.
    Overflowed,
}

/// What happens to the queue after an overflow has been emitted.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Keep the queue; later overflows re-emit everything queued since the start.
    #[default]
    Continue,
    /// Empty the queue; each overflow carries only events since the previous one.
    Reset,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "reset" => Ok(Self::Reset),
            other => Err(format!(
                "unknown overflow policy '{other}', expected 'continue' or 'reset'"
            )),
        }
    }
}

/// What happens to an event older than the limiter's last evaluation.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum OutOfOrderPolicy {
    /// Pour it as if no time had passed since the last evaluation.
    #[default]
    Clamp,
    /// Discard it with [`DiscardReason::OutOfOrderTimestamp`].
    Reject,
}

impl FromStr for OutOfOrderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clamp" => Ok(Self::Clamp),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown out-of-order policy '{other}', expected 'clamp' or 'reject'"
            )),
        }
    }
}

/// Counters and timestamps of a bucket, for reporting.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BucketStats {
    /// Scenario name.
    pub scenario: Arc<str>,
    /// Lifecycle state.
    pub state: BucketState,
    /// Events poured, including the ones that overflowed.
    pub total_count: u64,
    /// Timestamp of the first pour.
    pub first_ts: Option<DateTime<Utc>>,
    /// Timestamp of the latest pour.
    pub last_ts: Option<DateTime<Utc>>,
    /// Timestamp of the latest overflow.
    pub overflow_ts: Option<DateTime<Utc>>,
    /// Events currently queued.
    pub queued: usize,
    /// Tokens left in the limiter.
    pub tokens: f64,
}

/// A leaky bucket for one scenario instance.
///
/// Each pour resolves a timestamp through the bucket's [`TimeSource`], updates the
/// counters, and asks the limiter for one token. Events that fit are queued; an event
/// that does not fit is queued too, and then a copy of the whole queue is sent as an
/// [`Overflow`].
///
/// `pour` takes `&mut self`, so a whole pour is one exclusive transition. Wrap the bucket
/// in a [`BucketWorker`](crate::BucketWorker) to feed it from another task.
#[derive(Debug)]
pub struct Leaky {
    name: Arc<str>,
    time_source: TimeSource,
    limiter: RateLimiter,
    queue: BucketQueue<Event>,
    overflow_policy: OverflowPolicy,
    out_of_order: OutOfOrderPolicy,
    total_count: u64,
    first_ts: Option<DateTime<Utc>>,
    last_ts: Option<DateTime<Utc>>,
    overflow_ts: Option<DateTime<Utc>>,
    output: OverflowSender,
}

impl Leaky {
    /// Assemble a bucket. Usually called through [`BucketFactory`](crate::BucketFactory).
    pub fn new(
        name: impl Into<Arc<str>>,
        time_source: TimeSource,
        limiter: RateLimiter,
        queue: BucketQueue<Event>,
        output: OverflowSender,
    ) -> Self {
        Self {
            name: name.into(),
            time_source,
            limiter,
            queue,
            overflow_policy: Default::default(),
            out_of_order: Default::default(),
            total_count: 0,
            first_ts: None,
            last_ts: None,
            overflow_ts: None,
            output,
        }
    }

    /// Set the post-overflow policy.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Set the out-of-order timestamp policy.
    pub fn with_out_of_order_policy(mut self, policy: OutOfOrderPolicy) -> Self {
        self.out_of_order = policy;
        self
    }

    /// Pour one event into the bucket.
    ///
    /// Returns the outcome for this event. Only a failure to deliver an overflow is an error;
    /// it is fatal for the bucket, since a lost overflow is a lost alert.
    pub async fn pour(&mut self, event: Event) -> Result<PourOutcome, PourError> {
        let at = match self.admission_time(&event) {
            Ok(at) => at,
            Err(reason) => {
                warn!(
                    evt_type = event.evt_type(),
                    evt_src = event.evt_src(),
                    scenario = %self.name,
                    "Event cannot be poured to scenario: {reason}"
                );
                return Ok(PourOutcome::Discarded(reason));
            }
        };

        self.total_count += 1;
        if self.first_ts.is_none() {
            debug!(scenario = %self.name, "First event, bucket creation time: {at}");
            self.first_ts = Some(at);
        }
        self.last_ts = Some(at);

        if self.limiter.allow(at) {
            trace!(
                scenario = %self.name,
                "Pouring event at {at} (tokens: {})",
                self.limiter.tokens()
            );
            self.queue.push_back(event);
            return Ok(PourOutcome::Admitted);
        }

        self.overflow_ts = Some(at);
        debug!(scenario = %self.name, "Bucket overflow at {at}");
        self.queue.push_back(event);

        let overflow = Overflow {
            scenario: self.name.clone(),
            first_ts: self.first_ts.unwrap_or(at),
            overflow_ts: at,
            total_count: self.total_count,
            events: self.queue.to_vec(),
        };
        if self.overflow_policy == OverflowPolicy::Reset {
            self.queue.clear();
        }

        self.output
            .send(overflow)
            .await
            .map_err(|SinkClosed(overflow)| PourError::OverflowSinkClosed {
                scenario: self.name.clone(),
                overflow: Box::new(overflow),
            })?;

        Ok(PourOutcome::Overflowed)
    }

    fn admission_time(&self, event: &Event) -> Result<DateTime<Utc>, DiscardReason> {
        let at = self.time_source.timestamp_for(event)?;
        if self.out_of_order == OutOfOrderPolicy::Reject
            && let Some(last) = self.limiter.last()
            && at < last
        {
            return Err(DiscardReason::OutOfOrderTimestamp { at, last });
        }
        Ok(at)
    }

    /// Scenario name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pour strategy this bucket is bound to.
    pub fn mode(&self) -> BucketMode {
        self.time_source.mode()
    }

    /// Number of events that reached the counting step.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Timestamp of the first pour.
    pub fn first_ts(&self) -> Option<DateTime<Utc>> {
        self.first_ts
    }

    /// Timestamp of the latest pour.
    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.last_ts
    }

    /// Timestamp of the latest overflow.
    pub fn overflow_ts(&self) -> Option<DateTime<Utc>> {
        self.overflow_ts
    }

    /// Queued events.
    pub fn queue(&self) -> &BucketQueue<Event> {
        &self.queue
    }

    /// The bucket's limiter, for inspection.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Lifecycle state.
    pub fn state(&self) -> BucketState {
        if self.overflow_ts.is_some() {
            BucketState::Overflowed
        } else if self.first_ts.is_some() {
            BucketState::Filling
        } else {
            BucketState::Empty
        }
    }

    /// Snapshot of counters and timestamps.
    pub fn stats(&self) -> BucketStats {
        BucketStats {
            scenario: self.name.clone(),
            state: self.state(),
            total_count: self.total_count,
            first_ts: self.first_ts,
            last_ts: self.last_ts,
            overflow_ts: self.overflow_ts,
            queued: self.queue.len(),
            tokens: self.limiter.tokens(),
        }
    }
}

impl fmt::Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Filling => write!(f, "filling"),
            Self::Overflowed => write!(f, "overflowed"),
        }
    }
}
