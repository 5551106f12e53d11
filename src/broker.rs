use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    error::Error,
    message::{Message, UnixTime},
    registry::Registry,
    store::Store,
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Entry point of the queue: publishes messages and runs the poller that
/// dispatches them to the registered consumers.
///
/// Cloning is cheap; all clones share the same poller.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    registry: Registry,
    /// Capacity-2 wake-up signal for the poller. Sends never block and
    /// redundant wake-ups collapse into the one already queued.
    wake: mpsc::Sender<()>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

#[bon::bon]
impl Broker {
    /// Starts the poller in the background. Must be called within a tokio runtime.
    #[builder(finish_fn = start)]
    pub fn new(
        store: Store,
        registry: Registry,
        /// Period of the poll tick that picks up due retries and expired leases.
        #[builder(default = Duration::from_secs(5))]
        poll_interval: Duration,
    ) -> Self {
        let (wake, wake_rx) = mpsc::channel(2);

        let broker = Self {
            inner: Arc::new(Inner {
                store,
                registry,
                wake,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };

        broker
            .inner
            .tracker
            .spawn(broker.clone().run(wake_rx, poll_interval));

        broker
    }
}

impl Broker {
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    /// Publishes `payload` to `topic`, returning the new message's identity.
    pub async fn publish<P>(&self, topic: impl Into<String>, payload: &P) -> Result<i64, Error>
    where
        P: Serialize + ?Sized,
    {
        self.publish_message(Message::new(topic, payload)?).await
    }

    /// Publishes `payload` to `topic` after letting `mutate` adjust the message,
    /// e.g. to attach headers or on-success cascades.
    pub async fn publish_with<P, F>(
        &self,
        topic: impl Into<String>,
        payload: &P,
        mutate: F,
    ) -> Result<i64, Error>
    where
        P: Serialize + ?Sized,
        F: FnOnce(&mut Message) -> Result<(), Error>,
    {
        let mut msg = Message::new(topic, payload)?;
        mutate(&mut msg)?;

        self.publish_message(msg).await
    }

    /// Validates `msg` and its whole `on_success` chain, then stores it as a fresh
    /// pending message and wakes the poller.
    ///
    /// Nothing is written if validation fails.
    #[tracing::instrument(skip_all, fields(topic = %msg.topic))]
    pub async fn publish_message(&self, mut msg: Message) -> Result<i64, Error> {
        self.inner.registry.validate(&msg)?;

        let now = UnixTime::now();

        msg.id = None;
        msg.created_at = now;
        msg.try_after = msg.try_after.max(now);
        msg.started_at = UnixTime::ZERO;
        msg.processed_at = UnixTime::ZERO;
        msg.tries = 0;
        msg.elapsed = 0.0;
        msg.error.clear();

        let id = {
            let mut conn = self.inner.store.db().acquire().await?;
            msg.insert(&mut conn).await?
        };

        tracing::debug!(id, try_after = msg.try_after.as_secs(), "message published");

        self.poll();

        Ok(id)
    }

    /// Asks the poller for another pass without waiting for it.
    pub fn poll(&self) {
        if self.inner.wake.try_send(()).is_ok() {
            tracing::trace!("poll scheduled");
        } else {
            tracing::trace!("poll already pending");
        }
    }

    /// Runs one poll pass over every topic.
    ///
    /// Claimed messages are dispatched in the background. A store error aborts the
    /// remaining topics of this pass. Returns whether anything was claimed, in which
    /// case another pass has been scheduled as well.
    pub async fn poll_once(&self) -> Result<bool, Error> {
        let mut found = false;

        for consumer in self.inner.registry.consumers() {
            found |= consumer.poll_once(self).await?;
        }

        if found {
            self.poll();
        }

        Ok(found)
    }

    /// Stops the poller and waits for in-flight handlers to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        tracing::debug!("broker stopped");
    }

    async fn run(self, mut wake: mpsc::Receiver<()>, poll_interval: Duration) {
        let mut tick = tokio::time::interval(poll_interval.max(MIN_POLL_INTERVAL));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                Some(()) = wake.recv() => tracing::trace!("poll again"),
                _ = tick.tick() => tracing::trace!("poll tick"),
            }

            if let Err(e) = self.poll_once().await {
                tracing::error!(error = %e, "poll pass failed");
            }
        }
    }
}
