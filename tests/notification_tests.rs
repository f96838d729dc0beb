//! Change notifications from row writes to session events

mod common;

use common::{define, engine, open, replace};
use featherbone::datasource::{receiver, Datasource, Request};
use featherbone::events::{ChangeAction, EventBus, SessionEvent, SubscriptionRequest};
use featherbone::tools::{Criterion, Filter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

async fn setup() -> (Arc<Datasource>, broadcast::Receiver<SessionEvent>) {
    let ds = engine().await;
    define(
        &ds,
        json!({
            "name": "Contact",
            "plural": "Contacts",
            "authorization": open(),
            "properties": {
                "firstName": {"type": "string"},
                "lastName": {"type": "string"}
            }
        }),
    )
    .await;
    for (id, first) in [("c1", "Ann"), ("c2", "Bob")] {
        ds.request(Request::post(
            "Contact",
            "ann",
            json!({"id": id, "firstName": first, "lastName": "Lee"}),
        ))
        .await
        .unwrap();
    }
    let bus = Arc::new(EventBus::new(64));
    let events = bus.subscribe();
    receiver::start(ds.clone(), bus).await.unwrap();
    (ds, events)
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no event within 2s")
        .unwrap()
}

fn watch(session: &str, subscription: &str) -> SubscriptionRequest {
    SubscriptionRequest::new("", session, subscription)
}

async fn rename(ds: &Datasource, id: &str, first: &str) {
    ds.request(Request::patch(
        "Contact",
        "ann",
        id,
        replace("/firstName", json!(first)),
    ))
    .await
    .unwrap();
}

#[tokio::test]
async fn test_update_reaches_the_subscribed_session() {
    let (ds, mut events) = setup().await;
    ds.request(
        Request::get("Contact", "ann")
            .id("c1")
            .session("s1")
            .subscription(watch("s1", "sub1")),
    )
    .await
    .unwrap();

    rename(&ds, "c1", "Annie").await;
    let event = next_event(&mut events).await;
    assert_eq!(event.event_key, "s1");
    assert_eq!(event.subscription_id, "sub1");
    assert_eq!(event.action, ChangeAction::Update);
    assert_eq!(event.data["id"], "c1");
    assert_eq!(event.data["firstName"], "Annie");
    assert_eq!(event.data["lastName"], "Lee");
    assert_eq!(event.data["objectType"], "Contact");
}

#[tokio::test]
async fn test_resubscribing_replaces_unless_merged() {
    let (ds, mut events) = setup().await;
    ds.request(
        Request::get("Contact", "ann")
            .id("c1")
            .subscription(watch("s1", "sub1")),
    )
    .await
    .unwrap();
    // Same subscription, now over a filtered list holding only c2
    ds.request(
        Request::get("Contacts", "ann")
            .filter(Filter::default().criterion(Criterion::eq("id", "c2")))
            .subscription(watch("s1", "sub1")),
    )
    .await
    .unwrap();

    rename(&ds, "c1", "Annie").await;
    rename(&ds, "c2", "Bobby").await;
    let event = next_event(&mut events).await;
    assert_eq!(event.data["id"], "c2");
    assert_eq!(event.data["firstName"], "Bobby");

    ds.request(
        Request::post(
            "subscribe",
            "ann",
            json!({"subscription": {"eventKey": "s1", "id": "sub1", "merge": true}, "ids": ["c1"]}),
        ),
    )
    .await
    .unwrap();
    rename(&ds, "c1", "Ann").await;
    let event = next_event(&mut events).await;
    assert_eq!(event.data["id"], "c1");
    assert_eq!(event.data["firstName"], "Ann");
}

#[tokio::test]
async fn test_unfiltered_list_watches_inserts_and_deletes() {
    let (ds, mut events) = setup().await;
    ds.request(
        Request::get("Contacts", "ann").subscription(watch("s1", "all")),
    )
    .await
    .unwrap();

    ds.request(Request::post(
        "Contact",
        "ann",
        json!({"id": "c3", "firstName": "Cyd"}),
    ))
    .await
    .unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.action, ChangeAction::Create);
    assert_eq!(event.subscription_id, "all");
    assert_eq!(event.data["id"], "c3");
    assert_eq!(event.data["firstName"], "Cyd");

    ds.request(Request::delete("Contact", "ann", "c2"))
        .await
        .unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.action, ChangeAction::Delete);
    assert_eq!(event.data["id"], "c2");
}

#[tokio::test]
async fn test_released_session_stops_receiving() {
    let (ds, mut events) = setup().await;
    for session in ["s1", "s2"] {
        ds.request(
            Request::get("Contact", "ann")
                .id("c1")
                .subscription(watch(session, &format!("sub-{}", session))),
        )
        .await
        .unwrap();
    }

    ds.release_session("s1").await.unwrap();
    rename(&ds, "c1", "Annie").await;
    let event = next_event(&mut events).await;
    assert_eq!(event.event_key, "s2");
    assert_eq!(event.subscription_id, "sub-s2");
}

#[tokio::test]
async fn test_unsubscribe_function() {
    let (ds, mut events) = setup().await;
    for (id, subscription) in [("c1", "sub1"), ("c2", "sub2")] {
        ds.request(
            Request::get("Contact", "ann")
                .id(id)
                .subscription(watch("s1", subscription)),
        )
        .await
        .unwrap();
    }

    ds.request(Request::post("unsubscribe", "ann", json!({"id": "sub1"})))
        .await
        .unwrap();
    rename(&ds, "c1", "Annie").await;
    rename(&ds, "c2", "Bobby").await;
    let event = next_event(&mut events).await;
    assert_eq!(event.subscription_id, "sub2");
    assert_eq!(event.data["id"], "c2");
}

#[tokio::test]
async fn test_parent_list_hears_inserts_into_child_feathers() {
    let (ds, mut events) = setup().await;
    define(
        &ds,
        json!({
            "name": "Customer",
            "inherits": "Contact",
            "plural": "Customers",
            "authorization": open(),
            "properties": {"terms": {"type": "string"}}
        }),
    )
    .await;
    ds.request(Request::get("Contacts", "ann").subscription(watch("s1", "all")))
        .await
        .unwrap();

    ds.request(Request::post(
        "Customer",
        "ann",
        json!({"id": "k1", "firstName": "Kim", "terms": "net 30"}),
    ))
    .await
    .unwrap();
    let event = next_event(&mut events).await;
    assert_eq!(event.action, ChangeAction::Create);
    assert_eq!(event.subscription_id, "all");
    assert_eq!(event.data["id"], "k1");
    assert_eq!(event.data["objectType"], "Customer");
    assert_eq!(event.data["terms"], "net 30");
}
