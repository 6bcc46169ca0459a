//! Where a bucket gets the time it evaluates admission at.
//!
//! A live bucket reads the wall clock when an event is poured. A time-machine
//! bucket reads the timestamp embedded in the event, so replaying the same
//! ordered events always gives the same decisions, however fast the replay runs.

use crate::{event::Event, leaky::DiscardReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

/// A source of "now".
pub trait Clock: fmt::Debug + Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock, in UTC.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Which pour strategy a bucket is bound to.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BucketMode {
    /// Admission time is the wall-clock time of the pour.
    #[default]
    Live,
    /// Admission time is the event's own serialized timestamp.
    #[serde(alias = "timemachine", alias = "replay")]
    TimeMachine,
}

impl FromStr for BucketMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "time-machine" | "timemachine" | "replay" => Ok(Self::TimeMachine),
            other => Err(format!(
                "unknown bucket mode '{other}', expected 'live' or 'time-machine'"
            )),
        }
    }
}

impl fmt::Display for BucketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::TimeMachine => write!(f, "time-machine"),
        }
    }
}

/// The time source bound to a bucket.
#[derive(Clone, Debug)]
pub enum TimeSource {
    /// Read the clock at the moment of the pour.
    WallClock(Arc<dyn Clock>),
    /// Parse the timestamp embedded in the event.
    EventEmbedded,
}

impl TimeSource {
    /// The time source for a mode, with `clock` used in live mode.
    pub fn for_mode(mode: BucketMode, clock: Arc<dyn Clock>) -> Self {
        match mode {
            BucketMode::Live => Self::WallClock(clock),
            BucketMode::TimeMachine => Self::EventEmbedded,
        }
    }

    /// The mode this time source implements.
    pub fn mode(&self) -> BucketMode {
        match self {
            Self::WallClock(_) => BucketMode::Live,
            Self::EventEmbedded => BucketMode::TimeMachine,
        }
    }

    /// Determine the admission timestamp for an event.
    ///
    /// Events without a serialized timestamp are refused in both modes. In live mode the
    /// value itself is not looked at.
    pub fn timestamp_for(&self, event: &Event) -> Result<DateTime<Utc>, DiscardReason> {
        let Some(raw) = event.serialized_time() else {
            return Err(DiscardReason::MissingTimestamp);
        };
        match self {
            Self::WallClock(clock) => Ok(clock.now()),
            Self::EventEmbedded => {
                crate::event::parse_wire_time(raw).map_err(|source| DiscardReason::TimestampParse {
                    raw: raw.into(),
                    source,
                })
            }
        }
    }
}
