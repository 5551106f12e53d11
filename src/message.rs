//! Message types and lifecycle timestamps for the work queue.
//!
//! A message is published against a topic, waits in the pending table until a
//! consumer claims it, and ends up in the archive once it either succeeds or fails
//! without asking for a retry.
//!
//! # Message Lifecycle
//!
//! 1. `Publish` inserts the message with `try_after` set to the publish time
//!    (or a later time chosen by the publisher).
//! 2. A consumer claims the message by setting `started_at`.
//! 3. On completion the message is either rescheduled in place (`started_at`
//!    reset, `try_after` bumped) or moved to the archive with `processed_at` set.
//!
//! A claimed message whose `started_at` is older than the consumer's lease expiry
//! is considered abandoned and can be claimed again.

use std::{
    collections::HashMap,
    ops::{Add, Sub},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use sqlx::prelude::FromRow;

use crate::error::{Error, SerializeSnafu};

/// Seconds since the unix epoch. Zero means "not set".
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UnixTime(pub i64);

impl UnixTime {
    pub const ZERO: UnixTime = UnixTime(0);

    pub fn now() -> Self {
        Utc::now().into()
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_secs(&self) -> i64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.0, 0)
    }
}

impl From<DateTime<Utc>> for UnixTime {
    fn from(t: DateTime<Utc>) -> Self {
        Self(t.timestamp())
    }
}

impl Add<Duration> for UnixTime {
    type Output = UnixTime;

    fn add(self, rhs: Duration) -> Self::Output {
        UnixTime(self.0.saturating_add(rhs.as_secs() as i64))
    }
}

impl Sub<Duration> for UnixTime {
    type Output = UnixTime;

    fn sub(self, rhs: Duration) -> Self::Output {
        UnixTime(self.0.saturating_sub(rhs.as_secs() as i64))
    }
}

fn is_zero_secs(elapsed: &f64) -> bool {
    *elapsed == 0.0
}

fn is_zero_tries(tries: &i64) -> bool {
    *tries == 0
}

/// A unit of asynchronous work.
///
/// The same shape is stored in the pending table, in the archive table and, as
/// JSON, inside a parent's `on_success` list. The payload is kept as JSON and
/// checked against the handler registered for `topic` when the message is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Store-assigned identity, `None` until the message is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default, skip_serializing_if = "UnixTime::is_zero")]
    pub created_at: UnixTime,
    /// Earliest time the message may be claimed.
    #[serde(default, skip_serializing_if = "UnixTime::is_zero")]
    pub try_after: UnixTime,
    /// Claim time of the current attempt, zero when unclaimed.
    #[serde(default, skip_serializing_if = "UnixTime::is_zero")]
    pub started_at: UnixTime,
    /// Completion time, zero until the message is terminal.
    #[serde(default, skip_serializing_if = "UnixTime::is_zero")]
    pub processed_at: UnixTime,

    /// Free-form metadata, passed through to handlers untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    #[sqlx(json)]
    pub header: HashMap<String, String>,
    /// Processing time in seconds, summed over all attempts.
    #[serde(default, skip_serializing_if = "is_zero_secs")]
    pub elapsed: f64,
    pub topic: String,
    /// Text of the last failure, empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "is_zero_tries")]
    pub tries: i64,
    /// Messages published once this one completes successfully.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[sqlx(json)]
    pub on_success: Vec<Message>,

    #[serde(default)]
    #[sqlx(json)]
    pub payload: serde_json::Value,
}

impl Message {
    /// Creates an unpersisted message, serializing `payload` to JSON.
    pub fn new<P>(topic: impl Into<String>, payload: &P) -> Result<Self, Error>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).context(SerializeSnafu)?;

        Ok(Self::from_value(topic, payload))
    }

    pub fn from_value(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            created_at: UnixTime::ZERO,
            try_after: UnixTime::ZERO,
            started_at: UnixTime::ZERO,
            processed_at: UnixTime::ZERO,
            header: HashMap::new(),
            elapsed: 0.0,
            topic: topic.into(),
            error: String::new(),
            tries: 0,
            on_success: Vec::new(),
            payload,
        }
    }

    /// Appends a follow-up message that is published after this one succeeds.
    pub fn publish_on_success<P>(
        &mut self,
        topic: impl Into<String>,
        payload: &P,
    ) -> Result<&mut Self, Error>
    where
        P: Serialize + ?Sized,
    {
        self.on_success.push(Message::new(topic, payload)?);
        Ok(self)
    }

    pub fn with_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Holds the message back until `at`. Has no effect on messages already persisted.
    pub fn deliver_after(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.try_after = at.into();
        self
    }

    pub fn is_claimed(&self) -> bool {
        !self.started_at.is_zero()
    }

    pub fn is_processed(&self) -> bool {
        !self.processed_at.is_zero()
    }

    /// Number of nested `on_success` levels below this message.
    pub fn cascade_depth(&self) -> usize {
        self.on_success
            .iter()
            .map(|m| m.cascade_depth() + 1)
            .max()
            .unwrap_or(0)
    }
}
