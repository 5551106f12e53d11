//! Per-topic consumers.
//!
//! A consumer binds a typed handler to a topic together with a bounded number of
//! worker slots and a lease expiry. Each poll pass claims as many eligible
//! messages as there are free slots and runs them concurrently; each finished
//! attempt is then either rescheduled or archived.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use snafu::{ResultExt as _, Snafu};
use tokio::{sync::Semaphore, time::Instant};

use crate::{
    broker::Broker,
    error::Error,
    message::{Message, UnixTime},
};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a failed handler invocation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HandlerError {
    /// Keep the message pending and try again at `at`.
    #[snafu(display("retry after: {}", at.to_rfc3339()))]
    RetryAfter { at: DateTime<Utc> },

    /// The stored payload could not be decoded into the handler's type.
    #[snafu(display("invalid payload: {source}"))]
    Payload {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(whatever, display("{message}"))]
    Failed {
        message: String,
        #[snafu(source(from(BoxedError, Some)))]
        source: Option<BoxedError>,
    },
}

impl HandlerError {
    pub fn retry_after(at: DateTime<Utc>) -> Self {
        Self::RetryAfter { at }
    }

    pub fn retry_in(delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);

        Self::RetryAfter {
            at: Utc::now()
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }
}

impl From<eyre::Report> for HandlerError {
    fn from(e: eyre::Report) -> Self {
        Self::Failed {
            message: format!("{e:#}"),
            source: Some(e.into()),
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        eyre::Report::new(e).into()
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        eyre::Report::new(e).into()
    }
}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        eyre::Report::new(e).into()
    }
}

/// Settings for a single topic.
#[derive(Debug, Clone, bon::Builder)]
pub struct ConsumerOptions {
    /// Maximum number of messages of this topic processed at the same time.
    #[builder(default = 1)]
    pub concurrency: usize,
    /// How long a claim holds before the message is presumed abandoned.
    #[builder(default = Duration::from_secs(60 * 60))]
    pub start_expire: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What a handler knows about the message it is processing.
#[derive(Clone)]
pub struct Context {
    broker: Broker,
    id: i64,
    topic: String,
    header: HashMap<String, String>,
    attempt: i64,
}

impl Context {
    /// The broker the message was dispatched from, for publishing follow-up work.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn header(&self) -> &HashMap<String, String> {
        &self.header
    }

    /// 1 for the first attempt.
    pub fn attempt(&self) -> i64 {
        self.attempt
    }
}

/// Processes payloads of type `V`.
///
/// Implemented for any `Fn(Context, V) -> impl Future<Output = Result<(), HandlerError>>`.
pub trait Handler<V>: Send + Sync + 'static {
    fn handle(&self, ctx: Context, payload: V) -> BoxFuture<'static, Result<(), HandlerError>>;
}

impl<V, F, Fut> Handler<V> for F
where
    F: Fn(Context, V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, ctx: Context, payload: V) -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(self(ctx, payload))
    }
}

type ErasedHandler =
    dyn Fn(Context, serde_json::Value) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

fn decode_as<V: DeserializeOwned>(payload: &serde_json::Value) -> Result<(), serde_json::Error> {
    V::deserialize(payload).map(drop)
}

/// A handler with its payload type erased, plus the topic's worker slots.
#[derive(Clone)]
pub(crate) struct Consumer {
    topic: String,
    options: ConsumerOptions,
    slots: Arc<Semaphore>,
    validate: fn(&serde_json::Value) -> Result<(), serde_json::Error>,
    handler: Arc<ErasedHandler>,
}

impl Consumer {
    pub(crate) fn new<V, H>(topic: String, handler: H, options: ConsumerOptions) -> Self
    where
        V: DeserializeOwned + Send + 'static,
        H: Handler<V>,
    {
        let handler = Arc::new(handler);

        Self {
            topic,
            slots: Arc::new(Semaphore::new(options.concurrency)),
            options,
            validate: decode_as::<V>,
            handler: Arc::new(
                move |ctx: Context,
                      payload: serde_json::Value|
                      -> BoxFuture<'static, Result<(), HandlerError>> {
                    let handler = handler.clone();
                    Box::pin(async move {
                        let payload = V::deserialize(payload).context(PayloadSnafu)?;
                        handler.handle(ctx, payload).await
                    })
                },
            ),
        }
    }

    pub(crate) fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Checks that `payload` decodes into the handler's payload type.
    pub(crate) fn validate(&self, payload: &serde_json::Value) -> Result<(), serde_json::Error> {
        (self.validate)(payload)
    }

    /// Claims and dispatches as many eligible messages as there are free slots.
    ///
    /// Returns whether anything was claimed.
    #[tracing::instrument(skip_all, fields(topic = %self.topic))]
    pub(crate) async fn poll_once(&self, broker: &Broker) -> Result<bool, Error> {
        let free = self.slots.available_permits();
        if free == 0 {
            return Ok(false);
        }

        let now = UnixTime::now();
        let mut conn = broker.store().db().acquire().await?;

        let candidates =
            Message::candidates(&mut conn, &self.topic, now, self.options.start_expire, free)
                .await?;

        tracing::debug!(count = candidates.len(), "messages found");

        let mut found = false;

        for mut msg in candidates {
            // Slots may have been taken by a concurrent pass since `free` was computed.
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };

            if !msg.claim(&mut conn, now, self.options.start_expire).await? {
                tracing::debug!(id = msg.id, "message claimed elsewhere");
                continue;
            }

            found = true;

            let consumer = self.clone();
            let broker_handle = broker.clone();
            broker.tracker().spawn(async move {
                consumer.consume_once(&broker_handle, msg).await;
                drop(permit);
                // A slot is free again.
                broker_handle.poll();
            });
        }

        Ok(found)
    }

    #[tracing::instrument(skip_all, fields(topic = %self.topic, id = msg.id))]
    async fn consume_once(&self, broker: &Broker, mut msg: Message) {
        let claimed_at = msg.started_at;

        tracing::debug!(tries = msg.tries, "consuming message");

        let ctx = Context {
            broker: broker.clone(),
            id: msg.id.unwrap_or_default(),
            topic: msg.topic.clone(),
            header: msg.header.clone(),
            attempt: msg.tries + 1,
        };

        let start = Instant::now();
        let result = (self.handler)(ctx, msg.payload.clone()).await;

        msg.elapsed += start.elapsed().as_secs_f64();
        msg.tries += 1;

        match result {
            Ok(()) => {
                msg.processed_at = UnixTime::now();
                msg.error.clear();

                // Published ahead of the lease-guarded archive. If the archive is refused or
                // fails, the next attempt publishes the children again.
                for child in msg.on_success.iter().cloned() {
                    if let Err(e) = broker.publish_message(child).await {
                        tracing::error!(error = %e, "failed to publish on-success message");
                    }
                }
            }
            Err(HandlerError::RetryAfter { at }) => {
                msg.error = HandlerError::RetryAfter { at }.to_string();
                msg.started_at = UnixTime::ZERO;
                msg.try_after = at.into();
                msg.processed_at = UnixTime::ZERO;
            }
            Err(e) => {
                tracing::debug!(error = %e, "message failed");
                msg.error = e.to_string();
                msg.processed_at = UnixTime::now();
            }
        }

        if let Err(e) = self.complete(broker, &msg, claimed_at).await {
            tracing::error!(error = %e, "failed to complete message");
        }
    }

    async fn complete(
        &self,
        broker: &Broker,
        msg: &Message,
        claimed_at: UnixTime,
    ) -> Result<(), Error> {
        let mut conn = broker.store().db().acquire().await?;

        let applied = if msg.is_processed() {
            match msg.archive(&mut conn, claimed_at).await? {
                Some(archived) => {
                    tracing::debug!(archived, tries = msg.tries, "message archived");
                    true
                }
                None => false,
            }
        } else {
            tracing::debug!(try_after = msg.try_after.as_secs(), "message rescheduled");
            msg.reschedule(&mut conn, claimed_at).await?
        };

        if !applied {
            tracing::warn!(
                lease = ?self.options.start_expire,
                "lease expired while processing, outcome discarded"
            );
        }

        Ok(())
    }
}
