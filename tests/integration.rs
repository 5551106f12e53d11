use std::{
    future::Future,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sluice::{
    Broker, Config, ConsumerOptions, Context, Error, HandlerError, Registry, Store, UnixTime,
};
use tempfile::TempDir;

struct TmpBroker {
    broker: Broker,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpBroker {
    type Target = Broker;

    fn deref(&self) -> &Self::Target {
        &self.broker
    }
}

async fn setup(registry: Registry) -> TmpBroker {
    let path = tempfile::tempdir().unwrap();

    let store = Store::connect_with(&Config {
        db_path: Some(path.path().join("sluice.db").to_string_lossy().to_string()),
        ..Config::default()
    })
    .await
    .unwrap();

    TmpBroker {
        broker: Broker::builder()
            .store(store)
            .registry(registry)
            .poll_interval(Duration::from_millis(100))
            .start(),
        tmpdir: path,
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Resize {
    hash: String,
}

async fn resize(_: Context, _: Resize) -> Result<(), HandlerError> {
    Ok(())
}

fn counting<F>(
    calls: &Arc<AtomicUsize>,
    outcome: F,
) -> impl Fn(Context, serde_json::Value) -> BoxFuture<'static, Result<(), HandlerError>>
       + Send
       + Sync
       + 'static
where
    F: Fn() -> Result<(), HandlerError> + Send + Sync + 'static,
{
    let calls = calls.clone();
    move |_, _| -> BoxFuture<'static, Result<(), HandlerError>> {
        calls.fetch_add(1, Ordering::SeqCst);
        let result = outcome();
        Box::pin(async move { result })
    }
}

#[tokio::test]
async fn test_successful_message_is_archived() {
    let broker = setup(
        Registry::new()
            .with_consumer(
                "resize",
                resize,
                ConsumerOptions::builder().concurrency(1).build(),
            )
            .unwrap(),
    )
    .await;

    let id = broker
        .publish(
            "resize",
            &Resize {
                hash: "abc123".to_owned(),
            },
        )
        .await
        .unwrap();

    eventually(|| async { broker.store().archived_count(None).await.unwrap() == 1 }).await;

    assert_eq!(broker.store().pending_count(None).await.unwrap(), 0);
    assert!(broker.store().pending_message(id).await.unwrap().is_none());

    let archived = broker.store().archived(Some("resize")).await.unwrap();
    assert_eq!(archived.len(), 1);

    let msg = &archived[0];
    assert!(msg.is_processed());
    assert_eq!(msg.tries, 1);
    assert_eq!(msg.error, "");
    assert_eq!(msg.payload, json!({"hash": "abc123"}));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_retry_after_keeps_message_pending() {
    let calls = Arc::new(AtomicUsize::new(0));

    let broker = setup(
        Registry::new()
            .with_consumer(
                "fetch",
                counting(&calls, || {
                    Err(HandlerError::retry_in(Duration::from_secs(60)))
                }),
                ConsumerOptions::default(),
            )
            .unwrap(),
    )
    .await;

    let id = broker
        .publish("fetch", "https://example.com/a.jpg")
        .await
        .unwrap();

    eventually(|| async {
        broker
            .store()
            .pending_message(id)
            .await
            .unwrap()
            .is_some_and(|m| m.tries == 1)
    })
    .await;

    let msg = broker.store().pending_message(id).await.unwrap().unwrap();
    let now = UnixTime::now().as_secs();

    assert!(msg.started_at.is_zero());
    assert!(!msg.is_processed());
    assert!((now + 55..=now + 65).contains(&msg.try_after.as_secs()));
    assert!(msg.error.starts_with("retry after: "));

    // Not eligible again before the retry time.
    assert!(!broker.poll_once().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.store().archived_count(None).await.unwrap(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_unknown_topic_is_rejected() {
    let broker = setup(
        Registry::new()
            .with_consumer("resize", resize, ConsumerOptions::default())
            .unwrap(),
    )
    .await;

    let before = broker.store().pending_count(None).await.unwrap();

    let err = broker
        .publish("nonexistent-topic", &json!({"hash": "abc123"}))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownTopic { .. }));
    assert!(err.is_validation());
    assert_eq!(broker.store().pending_count(None).await.unwrap(), before);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_payload_is_rejected() {
    let broker = setup(
        Registry::new()
            .with_consumer("resize", resize, ConsumerOptions::default())
            .unwrap(),
    )
    .await;

    let err = broker.publish("resize", &42).await.unwrap_err();

    assert!(matches!(err, Error::InvalidPayload { .. }));
    assert_eq!(broker.store().pending_count(None).await.unwrap(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_cascade_to_unknown_topic_writes_nothing() {
    let broker = setup(
        Registry::new()
            .with_consumer("resize", resize, ConsumerOptions::default())
            .unwrap(),
    )
    .await;

    let err = broker
        .publish_with("resize", &json!({"hash": "abc123"}), |msg| {
            msg.publish_on_success("ghost", &json!({}))?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownTopic { ref topic } if topic == "ghost"));
    assert_eq!(broker.store().pending_count(None).await.unwrap(), 0);
    assert_eq!(broker.store().archived_count(None).await.unwrap(), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_success_publishes_each_follow_up_once() {
    let children = Arc::new(AtomicUsize::new(0));

    let broker = setup(
        Registry::new()
            .with_consumer("resize", resize, ConsumerOptions::default())
            .unwrap()
            .with_consumer(
                "notify",
                counting(&children, || {
                    Err(HandlerError::retry_in(Duration::from_secs(3600)))
                }),
                ConsumerOptions::builder().concurrency(2).build(),
            )
            .unwrap(),
    )
    .await;

    broker
        .publish_with("resize", &json!({"hash": "abc123"}), |msg| {
            msg.publish_on_success("notify", "album")?
                .publish_on_success("notify", "feed")?;
            Ok(())
        })
        .await
        .unwrap();

    eventually(|| async {
        let pending = broker.store().pending(Some("notify")).await.unwrap();
        let archived = broker.store().archived_count(Some("resize")).await.unwrap();
        archived == 1 && pending.len() == 2 && pending.iter().all(|m| m.tries == 1)
    })
    .await;

    let parent = broker.store().archived(Some("resize")).await.unwrap();
    assert_eq!(parent.len(), 1);
    assert_eq!(parent[0].error, "");
    assert_eq!(parent[0].on_success.len(), 2);

    let mut payloads: Vec<_> = broker
        .store()
        .pending(Some("notify"))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.payload)
        .collect();
    payloads.sort_by_key(|p| p.to_string());
    assert_eq!(payloads, vec![json!("album"), json!("feed")]);

    assert_eq!(children.load(Ordering::SeqCst), 2);
    assert_eq!(broker.store().pending_count(None).await.unwrap(), 2);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handler = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        move |_: Context, _: u32| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        }
    };

    let broker = setup(
        Registry::new()
            .with_consumer(
                "resize",
                handler,
                ConsumerOptions::builder().concurrency(2).build(),
            )
            .unwrap(),
    )
    .await;

    for i in 0..10u32 {
        broker.publish("resize", &i).await.unwrap();
    }

    eventually(|| async { broker.store().archived_count(Some("resize")).await.unwrap() == 10 })
        .await;

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= 2, "{peak} handlers ran at once");

    broker.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_is_terminal() {
    let calls = Arc::new(AtomicUsize::new(0));

    let broker = setup(
        Registry::new()
            .with_consumer(
                "resize",
                counting(&calls, || Err(HandlerError::failed("corrupt image"))),
                ConsumerOptions::default(),
            )
            .unwrap(),
    )
    .await;

    broker
        .publish_with("resize", &json!({"hash": "abc123"}), |msg| {
            msg.publish_on_success("resize", &json!({"hash": "def456"}))?;
            Ok(())
        })
        .await
        .unwrap();

    eventually(|| async { broker.store().archived_count(None).await.unwrap() == 1 }).await;

    let archived = broker.store().archived(None).await.unwrap();
    assert!(archived[0].is_processed());
    assert_eq!(archived[0].tries, 1);
    assert_eq!(archived[0].error, "corrupt image");

    // Failed messages do not cascade.
    assert_eq!(broker.store().pending_count(None).await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_handler_can_publish_follow_up_work() {
    let broker = setup(
        Registry::new()
            .with_consumer(
                "scan",
                |ctx: Context, dir: String| async move {
                    assert_eq!(ctx.topic(), "scan");
                    assert_eq!(ctx.attempt(), 1);
                    assert_eq!(ctx.header().get("origin").map(String::as_str), Some("test"));

                    ctx.broker()
                        .publish(
                            "resize",
                            &Resize {
                                hash: format!("{dir}/abc123"),
                            },
                        )
                        .await?;
                    Ok::<_, HandlerError>(())
                },
                ConsumerOptions::default(),
            )
            .unwrap()
            .with_consumer("resize", resize, ConsumerOptions::default())
            .unwrap(),
    )
    .await;

    broker
        .publish_with("scan", "photos", |msg| {
            msg.with_header("origin", "test");
            Ok(())
        })
        .await
        .unwrap();

    eventually(|| async { broker.store().archived_count(None).await.unwrap() == 2 }).await;

    let scan = broker.store().archived(Some("scan")).await.unwrap();
    assert_eq!(scan[0].error, "");
    assert_eq!(scan[0].header.get("origin").map(String::as_str), Some("test"));

    let resized = broker.store().archived(Some("resize")).await.unwrap();
    assert_eq!(resized[0].payload, json!({"hash": "photos/abc123"}));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_delayed_message_is_not_claimed_early() {
    let calls = Arc::new(AtomicUsize::new(0));

    let broker = setup(
        Registry::new()
            .with_consumer("resize", counting(&calls, || Ok(())), ConsumerOptions::default())
            .unwrap(),
    )
    .await;

    let at = Utc::now() + chrono::Duration::hours(1);
    let id = broker
        .publish_with("resize", &json!({}), |msg| {
            msg.deliver_after(at);
            Ok(())
        })
        .await
        .unwrap();

    assert!(!broker.poll_once().await.unwrap());

    let msg = broker.store().pending_message(id).await.unwrap().unwrap();
    assert_eq!(msg.try_after, UnixTime::from(at));
    assert!(!msg.is_claimed());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handlers() {
    let finished = Arc::new(AtomicBool::new(false));

    let handler = {
        let finished = finished.clone();
        move |_: Context, _: serde_json::Value| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        }
    };

    let broker = setup(
        Registry::new()
            .with_consumer("slow", handler, ConsumerOptions::default())
            .unwrap(),
    )
    .await;

    let id = broker.publish("slow", &json!(null)).await.unwrap();

    eventually(|| async {
        broker
            .store()
            .pending_message(id)
            .await
            .unwrap()
            .is_some_and(|m| m.is_claimed())
    })
    .await;

    broker.shutdown().await;

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(broker.store().archived_count(Some("slow")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_overlapping_poll_passes_claim_each_message_once() {
    let calls = Arc::new(AtomicUsize::new(0));

    let broker = setup(
        Registry::new()
            .with_consumer(
                "resize",
                counting(&calls, || Ok(())),
                ConsumerOptions::builder().concurrency(8).build(),
            )
            .unwrap(),
    )
    .await;

    for i in 0..20u32 {
        broker.publish("resize", &i).await.unwrap();
    }

    // Race explicit passes against each other and the background poller.
    for _ in 0..5 {
        let (a, b, c) = tokio::join!(broker.poll_once(), broker.poll_once(), broker.poll_once());
        a.unwrap();
        b.unwrap();
        c.unwrap();
    }

    eventually(|| async { broker.store().archived_count(Some("resize")).await.unwrap() == 20 })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 20);
    assert_eq!(broker.store().pending_count(None).await.unwrap(), 0);

    let archived = broker.store().archived(Some("resize")).await.unwrap();
    assert!(archived.iter().all(|m| m.tries == 1 && m.error.is_empty()));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_store_error_aborts_pass_and_poller_recovers() {
    let broker = setup(
        Registry::new()
            .with_consumer("resize", resize, ConsumerOptions::default())
            .unwrap(),
    )
    .await;

    sqlx::query("ALTER TABLE messages RENAME TO messages_offline")
        .execute(broker.store().db())
        .await
        .unwrap();

    let err = broker.poll_once().await.unwrap_err();
    assert!(matches!(err, Error::Sqlx { .. }));

    // Let the background poller run into the same failure a few times.
    broker.poll();
    tokio::time::sleep(Duration::from_millis(250)).await;

    sqlx::query("ALTER TABLE messages_offline RENAME TO messages")
        .execute(broker.store().db())
        .await
        .unwrap();

    broker
        .publish(
            "resize",
            &Resize {
                hash: "abc123".to_owned(),
            },
        )
        .await
        .unwrap();

    eventually(|| async { broker.store().archived_count(None).await.unwrap() == 1 }).await;
    assert_eq!(broker.store().pending_count(None).await.unwrap(), 0);

    broker.shutdown().await;
}
