use super::*;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

type Seen = Arc<Mutex<Vec<(String, Value)>>>;

fn recorder(
    seen: &Seen,
) -> impl Fn(&Value, &Message, &Unsubscribe) -> CallbackResult + Send + Sync + 'static {
    let seen = Arc::clone(seen);
    move |payload, message, _| {
        seen.lock()
            .push((message.channel().to_string(), payload.clone()));
        Ok(Reply::from(()))
    }
}

fn payloads(seen: &Seen) -> Vec<Value> {
    seen.lock().iter().map(|(_, payload)| payload.clone()).collect()
}

fn values(outcomes: &[Outcome]) -> Vec<Value> {
    outcomes
        .iter()
        .map(|outcome| outcome.value().cloned().unwrap_or(Value::Null))
        .collect()
}

#[tokio::test]
async fn literal_publish_creates_channel_and_stores_message() {
    let hub = Hub::new();
    assert!(!hub.has_channel("x"));
    let outcomes = hub.publish("x", json!({"n": 1})).await.expect("publish");
    assert!(outcomes.is_empty());
    assert!(hub.has_channel("x"));

    let history = hub.query(&Query::new("x"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload(), &json!({"n": 1}));
    assert_eq!(history[0].channel(), "x");
}

#[tokio::test]
async fn backlog_replays_newest_first_before_live_messages() {
    let hub = Hub::new();
    for n in 1..=4 {
        hub.publish("feed", n).await.expect("publish");
    }
    let seen: Seen = Arc::default();
    hub.subscribe("feed", 2, recorder(&seen));
    assert_eq!(payloads(&seen), vec![json!(4), json!(3)]);

    hub.publish("feed", 5).await.expect("publish");
    assert_eq!(payloads(&seen), vec![json!(4), json!(3), json!(5)]);
}

#[tokio::test]
async fn backlog_larger_than_history_replays_everything() {
    let hub = Hub::new();
    hub.publish("feed", 1).await.expect("publish");
    hub.publish("feed", 2).await.expect("publish");
    let seen: Seen = Arc::default();
    hub.subscribe("feed", 10, recorder(&seen));
    assert_eq!(payloads(&seen), vec![json!(2), json!(1)]);

    let all: Seen = Arc::default();
    hub.subscribe("feed", usize::MAX, recorder(&all));
    assert_eq!(payloads(&all), vec![json!(2), json!(1)]);
}

#[tokio::test]
async fn zero_backlog_replays_nothing() {
    let hub = Hub::new();
    hub.publish("feed", 1).await.expect("publish");
    let seen: Seen = Arc::default();
    hub.subscribe("feed", 0, recorder(&seen));
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn backlog_of_one_delivers_only_latest() {
    let hub = Hub::new();
    for payload in ["a", "b", "c"] {
        hub.publish("test", payload).await.expect("publish");
    }
    let seen: Seen = Arc::default();
    hub.subscribe("test", 1, recorder(&seen));
    assert_eq!(payloads(&seen), vec![json!("c")]);
}

#[tokio::test]
async fn unsubscribe_during_backlog_stops_replay() {
    let hub = Hub::new();
    for n in 1..=3 {
        hub.publish("feed", n).await.expect("publish");
    }
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    let handle = hub.subscribe("feed", usize::MAX, move |payload, message, unsubscribe| {
        sink.lock()
            .push((message.channel().to_string(), payload.clone()));
        unsubscribe.unsubscribe();
        Ok(Reply::from(()))
    });
    assert_eq!(payloads(&seen), vec![json!(3)]);
    assert!(handle.is_cancelled());
    assert_eq!(hub.subscriber_count(), 0);

    hub.publish("feed", 4).await.expect("publish");
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn publish_to_list_delivers_once_per_channel() {
    let hub = Hub::new();
    let seen: Seen = Arc::default();
    hub.subscribe("*", 0, recorder(&seen));
    hub.create_channel("a").expect("create");
    hub.create_channel("b").expect("create");

    let outcomes = hub
        .publish(["a", "b", "a"], "hi")
        .await
        .expect("publish");
    assert_eq!(outcomes.len(), 2);
    let channels: Vec<String> = seen.lock().iter().map(|(c, _)| c.clone()).collect();
    assert_eq!(channels, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn list_publish_shares_one_call_id() {
    let hub = Hub::new();
    let calls: Arc<Mutex<Vec<CallId>>> = Arc::default();
    let sink = Arc::clone(&calls);
    hub.subscribe(["a", "b"], 0, move |_, message, _| {
        sink.lock().push(message.call());
        Ok(Reply::from(()))
    });
    let publication = hub.publish(["a", "b"], 1);
    let call = publication.call();
    publication.await.expect("publish");
    assert_eq!(*calls.lock(), vec![call, call]);
}

#[tokio::test]
async fn wildcard_query_merges_channels_by_sequence() {
    let hub = Hub::new();
    hub.publish("A", 1).await.expect("publish");
    hub.publish("B", 2).await.expect("publish");
    hub.publish("C", 3).await.expect("publish");

    let desc = hub.query(&Query::new("*").unbounded());
    let desc: Vec<&Value> = desc.iter().map(|m| m.payload()).collect();
    assert_eq!(desc, vec![&json!(3), &json!(2), &json!(1)]);

    let asc = hub.query(&Query::new("*").order(Order::Asc).unbounded());
    let asc: Vec<&Value> = asc.iter().map(|m| m.payload()).collect();
    assert_eq!(asc, vec![&json!(1), &json!(2), &json!(3)]);

    let newest_two = hub.query(&Query::new("*").limit(Limit::Count(2)));
    assert_eq!(newest_two.len(), 2);
    assert_eq!(newest_two[0].payload(), &json!(3));

    let oldest_two = hub.query(&Query::new("*").order(Order::Asc).limit(Limit::Count(2)));
    let oldest: Vec<&Value> = oldest_two.iter().map(|m| m.payload()).collect();
    assert_eq!(oldest, vec![&json!(1), &json!(2)]);
}

#[tokio::test]
async fn query_defaults_to_single_newest_message() {
    let hub = Hub::new();
    hub.publish("x", 1).await.expect("publish");
    hub.publish("x", 2).await.expect("publish");
    let history = hub.query(&Query::new("x"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload(), &json!(2));
}

#[tokio::test]
async fn query_edge_cases_return_empty() {
    let hub = Hub::new();
    hub.publish("x", 1).await.expect("publish");
    assert!(hub.query(&Query::default()).is_empty());
    assert!(hub.query(&Query::new("x").limit(Limit::Count(0))).is_empty());
    assert!(hub.query(&Query::new("missing")).is_empty());
    // Reads never create channels.
    assert!(!hub.has_channel("missing"));
}

#[tokio::test]
async fn failing_callback_is_reported_and_others_still_run() {
    let hub = Hub::new();
    let mut events = hub.watch_events();
    hub.subscribe_with(
        "jobs",
        SubscribeOptions::default().with_label("broken"),
        |_, _, _| Err("boom".into()),
    );
    hub.subscribe("jobs", 0, |payload, _, _| Ok(Reply::from(json!({"ok": payload}))));

    let outcomes = hub.publish("jobs", 7).await.expect("publish");
    assert_eq!(outcomes.len(), 2);
    let failure = outcomes[0].error().expect("first callback failed");
    assert_eq!(failure.channel(), "jobs");
    assert_eq!(failure.subscriber(), Some("broken"));
    assert_eq!(failure.cause().to_string(), "boom");
    assert_eq!(outcomes[1].value(), Some(&json!({"ok": 7})));

    match events.try_recv() {
        Ok(HubEvent::CallbackFailed(err)) => assert!(Arc::ptr_eq(&err, failure)),
        other => panic!("expected one failure event, got {other:?}"),
    }
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn panicking_callback_becomes_failed_outcome() {
    let hub = Hub::new();
    hub.subscribe("jobs", 0, |_, _, _| -> CallbackResult { panic!("kaput") });
    hub.subscribe("jobs", 0, |_, _, _| Ok(Reply::from(json!("after"))));

    let outcomes = hub.publish("jobs", 1).await.expect("publish");
    let failure = outcomes[0].error().expect("panic reported");
    let panic = failure.panic().expect("panic payload");
    assert_eq!(panic.message(), "kaput");
    assert_eq!(outcomes[1].value(), Some(&json!("after")));
}

#[tokio::test]
async fn pending_replies_keep_invocation_order() {
    let hub = Hub::new();
    hub.subscribe("slow", 0, |_, _, _| {
        Ok(Reply::pending(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!("late"))
        }))
    });
    hub.subscribe("slow", 0, |_, _, _| Ok(Reply::pending(async { Ok(json!("early")) })));
    hub.subscribe("slow", 0, |_, _, _| Ok(Reply::from(json!("sync"))));

    let outcomes = hub.publish("slow", 1).await.expect("publish");
    assert_eq!(values(&outcomes), vec![json!("late"), json!("early"), json!("sync")]);
}

#[tokio::test]
async fn rejected_pending_reply_is_reported() {
    let hub = Hub::new();
    let mut events = hub.watch_events();
    hub.subscribe("slow", 0, |_, _, _| {
        Ok(Reply::pending(async { Err::<Value, BoxError>("rejected".into()) }))
    });
    let outcomes = hub.publish("slow", 1).await.expect("publish");
    assert_eq!(
        outcomes[0].error().map(|err| err.cause().to_string()),
        Some("rejected".to_string())
    );
    assert!(matches!(events.try_recv(), Ok(HubEvent::CallbackFailed(_))));
}

#[tokio::test]
async fn call_is_in_flight_until_settled() {
    let hub = Arc::new(Hub::new());
    let weak: Weak<Hub> = Arc::downgrade(&hub);
    hub.subscribe("x", 0, move |_, message, _| {
        let weak = weak.clone();
        let call = message.call();
        Ok(Reply::pending(async move {
            let hub = weak.upgrade().ok_or("hub dropped")?;
            Ok::<Value, BoxError>(json!(hub.in_flight(call).is_some()))
        }))
    });

    let publication = hub.publish("x", 1);
    let call = publication.call();
    assert_eq!(hub.in_flight(call), Some(InFlight { total: 1, settled: 0 }));
    let outcomes = publication.await.expect("publish");
    assert_eq!(values(&outcomes), vec![json!(true)]);
    assert!(hub.in_flight(call).is_none());
}

#[tokio::test]
async fn sync_callback_sees_its_own_call_in_flight() {
    let hub = Arc::new(Hub::new());
    for _ in 0..2 {
        let weak: Weak<Hub> = Arc::downgrade(&hub);
        hub.subscribe("x", 0, move |_, message, _| {
            let hub = weak.upgrade().ok_or("hub dropped")?;
            let total = hub.in_flight(message.call()).map(|flight| flight.total);
            Ok(Reply::from(json!(total)))
        });
    }

    let outcomes = hub.publish("x", 1).await.expect("publish");
    // The second callback runs after the first slot was recorded.
    assert_eq!(values(&outcomes), vec![json!(0), json!(1)]);
}

#[tokio::test]
async fn backlog_merges_matching_channels_newest_first() {
    let hub = Hub::new();
    hub.publish("feed.a", 1).await.expect("publish");
    hub.publish("feed.b", 2).await.expect("publish");
    hub.publish("feed.a", 3).await.expect("publish");
    hub.publish("other", 4).await.expect("publish");
    hub.publish("feed.b", 5).await.expect("publish");

    let seen: Seen = Arc::default();
    hub.subscribe("feed.*", 3, recorder(&seen));
    assert_eq!(
        *seen.lock(),
        vec![
            ("feed.b".to_string(), json!(5)),
            ("feed.a".to_string(), json!(3)),
            ("feed.b".to_string(), json!(2)),
        ]
    );
}

#[tokio::test]
async fn literal_subscribe_does_not_create_channel() {
    let hub = Hub::new();
    let seen: Seen = Arc::default();
    hub.subscribe("missing", 5, recorder(&seen));
    assert!(!hub.has_channel("missing"));
    assert!(hub.channels().is_empty());
    assert!(seen.lock().is_empty());

    hub.publish("missing", "now").await.expect("publish");
    assert_eq!(payloads(&seen), vec![json!("now")]);
}

#[tokio::test]
async fn equal_payloads_get_distinct_messages_and_calls() {
    let hub = Hub::new();
    let first = hub.publish("x", "same");
    let second = hub.publish("x", "same");
    assert_ne!(first.call(), second.call());
    first.await.expect("publish");
    second.await.expect("publish");

    let history = hub.query(&Query::new("x").unbounded());
    assert_eq!(history.len(), 2);
    assert_ne!(history[0].sequence(), history[1].sequence());
    assert_ne!(history[0].call(), history[1].call());
}

#[test]
fn channel_names_reject_asterisk_and_creation_is_idempotent() {
    let hub = Hub::new();
    let err = hub.create_channel("a*b").expect_err("invalid");
    assert!(matches!(err, HubError::InvalidChannelName(name) if name == "a*b"));
    let first = hub.create_channel("ab").expect("create");
    let second = hub.create_channel("ab").expect("create again");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(hub.channels(), vec![Arc::from("ab")]);
}

#[tokio::test]
async fn wildcard_publish_only_reaches_existing_channels() {
    let hub = Hub::new();
    hub.create_channel("sandwich").expect("create");
    let outcomes = hub.publish("sand*", 1).await.expect("publish");
    assert!(outcomes.is_empty());
    hub.publish("nothing*", 1).await.expect("publish");
    hub.publish("a*b", 1).await.expect("publish");
    assert_eq!(hub.channels(), vec![Arc::from("sandwich")]);
    assert_eq!(hub.messages("sandwich", Order::Desc, Limit::Unbounded).len(), 1);
}

#[tokio::test]
async fn subscription_added_during_dispatch_waits_for_next_publish() {
    let hub = Arc::new(Hub::new());
    let seen: Seen = Arc::default();
    let weak = Arc::downgrade(&hub);
    let late = Arc::clone(&seen);
    hub.subscribe("x", 0, move |_, _, unsubscribe| {
        if let Some(hub) = weak.upgrade() {
            hub.subscribe("x", 0, recorder(&late));
        }
        unsubscribe.unsubscribe();
        Ok(Reply::from(()))
    });

    hub.publish("x", 1).await.expect("publish");
    assert!(seen.lock().is_empty());
    hub.publish("x", 2).await.expect("publish");
    assert_eq!(payloads(&seen), vec![json!(2)]);
}

#[tokio::test]
async fn unsubscribe_during_dispatch_skips_later_subscriber() {
    let hub = Hub::new();
    let seen: Seen = Arc::default();
    let victim: Arc<Mutex<Option<Unsubscribe>>> = Arc::default();
    let target = Arc::clone(&victim);
    hub.subscribe("x", 0, move |_, _, _| {
        if let Some(handle) = target.lock().as_ref() {
            handle.unsubscribe();
        }
        Ok(Reply::from(()))
    });
    let handle = hub.subscribe("x", 0, recorder(&seen));
    *victim.lock() = Some(handle);

    let outcomes = hub.publish("x", 1).await.expect("publish");
    assert_eq!(outcomes.len(), 1);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn publish_without_subscribers_resolves_empty() {
    let hub = Hub::new();
    let outcomes = hub.publish("quiet", 1).await.expect("publish");
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn pattern_subscription_matches_future_channels() {
    let hub = Hub::new();
    let seen: Seen = Arc::default();
    let route = Route::pattern("^metrics\\.").expect("pattern");
    hub.subscribe(route, 0, recorder(&seen));
    hub.publish("metrics.cpu", 1).await.expect("publish");
    hub.publish("logs.app", 2).await.expect("publish");
    assert_eq!(payloads(&seen), vec![json!(1)]);
}

#[tokio::test]
async fn shared_sequencer_orders_messages_across_hubs() {
    let sequencer = Arc::new(Sequencer::starting_at(100));
    let left = Hub::with_sequencer(HubConfig::default(), Arc::clone(&sequencer)).expect("hub");
    let right = Hub::with_sequencer(HubConfig::default(), Arc::clone(&sequencer)).expect("hub");
    left.publish("x", 1).await.expect("publish");
    right.publish("x", 2).await.expect("publish");
    assert_eq!(left.query(&Query::new("x"))[0].sequence(), 100);
    assert_eq!(right.query(&Query::new("x"))[0].sequence(), 101);
}

#[test]
fn invalid_config_is_rejected() {
    let config = HubConfig {
        event_capacity: 0,
        ..HubConfig::default()
    };
    assert!(matches!(Hub::with_config(config), Err(HubError::Config(_))));
}

#[tokio::test]
async fn backlog_pending_replies_settle_on_runtime() {
    let hub = Hub::new();
    hub.publish("x", 1).await.expect("publish");
    let (tx, rx) = tokio::sync::oneshot::channel::<Value>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    hub.subscribe("x", 1, move |payload, _, _| {
        let tx = tx.lock().take();
        let payload = payload.clone();
        Ok(Reply::pending(async move {
            if let Some(tx) = tx {
                let _ = tx.send(payload.clone());
            }
            Ok(payload)
        }))
    });
    let replayed = tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("settled in time")
        .expect("sender kept");
    assert_eq!(replayed, json!(1));
}
