use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::json;

use crate::event::{Event, EventBus};

type Log = Arc<StdMutex<Vec<String>>>;
type Recorder = Box<dyn Fn(&Event) + Send + Sync>;

fn recorder() -> (Log, impl Fn(&str) -> Recorder) {
    let log = Arc::new(StdMutex::new(Vec::new()));
    let sink = log.clone();
    let make = move |tag: &str| -> Recorder {
        let sink = sink.clone();
        let tag = tag.to_string();
        Box::new(move |e: &Event| sink.lock().unwrap().push(format!("{}:{}", tag, e.payload)))
    };
    (log, make)
}

#[test]
fn test_event_category_and_display() {
    let event = Event::new("user.created", json!({ "id": 1 })).with_source("accounts");
    assert_eq!(event.category(), "user");
    assert_eq!(event.to_string(), "user.created (from accounts)");
    assert_eq!(Event::new("plain", json!(null)).category(), "plain");
}

#[tokio::test]
async fn test_handlers_run_in_subscription_order() {
    let bus = EventBus::new();
    let (log, make) = recorder();
    let first = make("first");
    let second = make("second");
    bus.subscribe_fn("order.placed", move |e| first(e)).await;
    bus.subscribe_fn("order.placed", move |e| second(e)).await;

    let delivered = bus.publish(Event::new("order.placed", json!(7))).await;
    assert_eq!(delivered, 2);
    assert_eq!(*log.lock().unwrap(), vec!["first:7", "second:7"]);
}

#[tokio::test]
async fn test_publish_without_subscribers() {
    let bus = EventBus::new();
    let delivered = bus.publish(Event::new("nobody.listens", json!({}))).await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    bus.publish(Event::new("tick", json!(1))).await;
    let h = hits.clone();
    bus.subscribe_fn("tick", move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    bus.publish(Event::new("tick", json!(2))).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

fn explode(_event: &Event) {
    panic!("handler exploded")
}

#[tokio::test]
async fn test_panicking_handler_is_isolated() {
    let bus = EventBus::new();
    let (log, make) = recorder();
    let after = make("after");
    bus.subscribe_fn("boom", explode).await;
    bus.subscribe_fn("boom", move |e| after(e)).await;

    let delivered = bus.publish(Event::new("boom", json!("x"))).await;
    assert_eq!(delivered, 1);
    assert_eq!(*log.lock().unwrap(), vec!["after:\"x\""]);
}

#[tokio::test]
async fn test_unsubscribe_by_id_and_owner() {
    let bus = EventBus::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = |hits: &Arc<AtomicUsize>| {
        let hits = hits.clone();
        Arc::new(crate::event::FnHandler(move |_: &Event| {
            hits.fetch_add(1, Ordering::SeqCst);
        }))
    };

    let id = bus.subscribe("a", counter(&hits)).await;
    bus.subscribe_as("mod-x", "a", counter(&hits)).await;
    bus.subscribe_as("mod-x", "b", counter(&hits)).await;
    assert_eq!(bus.subscriber_count("a").await, 2);

    assert!(bus.unsubscribe(id).await);
    assert!(!bus.unsubscribe(id).await);
    assert_eq!(bus.unsubscribe_owner("mod-x").await, 2);
    assert_eq!(bus.subscriber_count("a").await, 0);
    assert_eq!(bus.subscriber_count("b").await, 0);

    bus.publish(Event::new("a", json!(null))).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_async_handler_receives_payload() {
    let bus = EventBus::new();
    let seen = Arc::new(StdMutex::new(None));
    let sink = seen.clone();
    bus.subscribe_async("job.done", move |event: Event| {
        let sink = sink.clone();
        async move {
            tokio::task::yield_now().await;
            *sink.lock().unwrap() = Some(event.payload);
        }
    })
    .await;

    let payload = json!({ "nested": { "ok": true } });
    bus.publish(Event::new("job.done", payload.clone())).await;
    assert_eq!(*seen.lock().unwrap(), Some(payload));
}

#[tokio::test]
async fn test_handler_may_publish_and_subscribe() {
    let bus = EventBus::new();
    let (log, make) = recorder();
    let chained = make("chained");
    bus.subscribe_fn("second", move |e| chained(e)).await;

    let inner = bus.clone();
    bus.subscribe_async("first", move |event: Event| {
        let inner = inner.clone();
        async move {
            inner.subscribe_fn("third", |_| {}).await;
            inner.publish(Event::new("second", event.payload)).await;
        }
    })
    .await;

    bus.publish(Event::new("first", json!(42))).await;
    assert_eq!(*log.lock().unwrap(), vec!["chained:42"]);
    assert_eq!(bus.subscriber_count("third").await, 1);
}
