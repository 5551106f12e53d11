use std::collections::HashMap;

use serde::de::DeserializeOwned;
use snafu::ResultExt as _;
use tokio::sync::Semaphore;

use crate::{
    consumer::{Consumer, ConsumerOptions, Handler},
    error::{
        CascadeTooDeepSnafu, ConcurrencyTooHighSnafu, DuplicateConsumerSnafu, Error,
        InvalidPayloadSnafu, ZeroConcurrencySnafu,
    },
    message::Message,
};

/// Deepest `on_success` nesting accepted at publish time.
pub const MAX_CASCADE_DEPTH: usize = 32;

/// Topic to consumer bindings.
///
/// Filled in while the application starts up, then handed to the broker, which
/// never changes it again.
#[derive(Default)]
pub struct Registry {
    consumers: HashMap<String, Consumer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` as the only consumer of `topic`.
    ///
    /// Fails if the topic already has a consumer, or if `options.concurrency` is zero or
    /// above [`Semaphore::MAX_PERMITS`].
    pub fn add_consumer<V, H>(
        &mut self,
        topic: impl Into<String>,
        handler: H,
        options: ConsumerOptions,
    ) -> Result<&mut Self, Error>
    where
        V: DeserializeOwned + Send + 'static,
        H: Handler<V>,
    {
        let topic = topic.into();

        if self.consumers.contains_key(&topic) {
            return DuplicateConsumerSnafu { topic }.fail();
        }

        if options.concurrency == 0 {
            return ZeroConcurrencySnafu { topic }.fail();
        }

        if options.concurrency > Semaphore::MAX_PERMITS {
            return ConcurrencyTooHighSnafu {
                topic,
                concurrency: options.concurrency,
                max: Semaphore::MAX_PERMITS,
            }
            .fail();
        }

        tracing::debug!(
            %topic,
            concurrency = options.concurrency,
            start_expire = ?options.start_expire,
            "consumer registered"
        );

        self.consumers
            .insert(topic.clone(), Consumer::new(topic, handler, options));

        Ok(self)
    }

    /// Same as [`Registry::add_consumer`], but consumes and returns the registry.
    pub fn with_consumer<V, H>(
        mut self,
        topic: impl Into<String>,
        handler: H,
        options: ConsumerOptions,
    ) -> Result<Self, Error>
    where
        V: DeserializeOwned + Send + 'static,
        H: Handler<V>,
    {
        self.add_consumer(topic, handler, options)?;
        Ok(self)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.consumers.keys().map(String::as_str)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.consumers.contains_key(topic)
    }

    pub fn options(&self, topic: &str) -> Option<&ConsumerOptions> {
        self.consumers.get(topic).map(Consumer::options)
    }

    pub(crate) fn consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers.values()
    }

    /// Checks that `msg` and every message in its `on_success` chain target a
    /// registered topic with a payload the topic's handler accepts.
    pub fn validate(&self, msg: &Message) -> Result<(), Error> {
        self.validate_at(msg, 0)
    }

    fn validate_at(&self, msg: &Message, depth: usize) -> Result<(), Error> {
        if depth > MAX_CASCADE_DEPTH {
            return CascadeTooDeepSnafu {
                topic: msg.topic.clone(),
                max: MAX_CASCADE_DEPTH,
            }
            .fail();
        }

        let consumer = self
            .consumers
            .get(&msg.topic)
            .ok_or_else(|| Error::unknown_topic(&msg.topic))?;

        consumer.validate(&msg.payload).context(InvalidPayloadSnafu {
            topic: msg.topic.clone(),
        })?;

        for child in &msg.on_success {
            self.validate_at(child, depth + 1)?;
        }

        Ok(())
    }
}
