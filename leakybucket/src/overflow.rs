//! The overflow signal a bucket hands to the downstream alerting stage.

use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Emitted once per rejected pour, carrying a copy of the bucket's queue at that moment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Overflow {
    /// Scenario the bucket belongs to.
    pub scenario: Arc<str>,
    /// Timestamp of the first event poured into the bucket.
    pub first_ts: DateTime<Utc>,
    /// Timestamp of the pour that overflowed.
    pub overflow_ts: DateTime<Utc>,
    /// Number of events poured so far, including this one.
    pub total_count: u64,
    /// The queued events, oldest first. The event that overflowed is last.
    pub events: Vec<Event>,
}

/// Returned when the receiving side of the overflow channel is gone.
#[derive(Debug)]
pub struct SinkClosed(pub Overflow);

/// Sending half of the overflow channel. Cheap to clone, and shared by many buckets.
#[derive(Clone, Debug)]
pub struct OverflowSender {
    tx: mpsc::Sender<Overflow>,
}

impl OverflowSender {
    /// Wrap an existing channel sender.
    pub fn new(tx: mpsc::Sender<Overflow>) -> Self {
        Self { tx }
    }

    /// Hand an overflow to the consumer.
    ///
    /// Waits while the channel is full, so a bucket under sustained overflow
    /// cannot run ahead of the consumer. Fails only if the consumer has gone away.
    pub async fn send(&self, overflow: Overflow) -> Result<(), SinkClosed> {
        self.tx
            .send(overflow)
            .await
            .map_err(|mpsc::error::SendError(overflow)| SinkClosed(overflow))
    }

    /// True if the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Make an overflow channel holding at most `capacity` undelivered signals.
///
/// # Panics
/// Panics if capacity is 0.
pub fn overflow_channel(capacity: usize) -> (OverflowSender, mpsc::Receiver<Overflow>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OverflowSender::new(tx), rx)
}
