//! Observer cursor semantics against a live bus.

mod common;

use std::sync::Arc;

use agentmesh::event::{EventBus, EventContext, EventType};
use agentmesh::observer::ObserverStore;

async fn emit_n(bus: &EventBus, ctx: &EventContext, n: usize) {
    for i in 0..n {
        bus.emit(ctx, EventType::TokenUsage, serde_json::json!({"i": i}))
            .await;
    }
}

#[tokio::test]
async fn test_cursor_stability_at_the_tip() {
    let bus = EventBus::new();
    let store = Arc::new(ObserverStore::new(1000));
    bus.register(store.clone());
    store.init_observer("o1", "s1");

    let ctx = EventContext::new("s1", "test");
    emit_n(&bus, &ctx, 10).await;

    // At the tip, the cursor comes back unchanged.
    let poll = store.get_since("o1", 9);
    assert!(poll.events.is_empty());
    assert_eq!(poll.last_index, 9);
    assert!(poll.exists);

    // One more event advances the cursor by exactly one.
    emit_n(&bus, &ctx, 1).await;
    let poll = store.get_since("o1", 9);
    assert_eq!(poll.events.len(), 1);
    assert_eq!(poll.last_index, 10);
}

#[tokio::test]
async fn test_no_event_at_or_below_cursor_is_returned() {
    let bus = EventBus::new();
    let store = Arc::new(ObserverStore::new(1000));
    bus.register(store.clone());
    store.init_observer("o1", "s1");

    let ctx = EventContext::new("s1", "test");
    emit_n(&bus, &ctx, 20).await;

    for cursor in [-1i64, 0, 5, 19] {
        let poll = store.get_since("o1", cursor);
        assert!(poll.events.iter().all(|(index, _)| *index > cursor));
        assert!(poll.last_index >= cursor);
        assert!(poll.last_index <= 19);
    }
}

#[tokio::test]
async fn test_ring_at_capacity_evicts_oldest_but_cursor_grows() {
    let bus = EventBus::new();
    let store = Arc::new(ObserverStore::new(5));
    bus.register(store.clone());
    store.init_observer("o1", "s1");

    let ctx = EventContext::new("s1", "test");
    emit_n(&bus, &ctx, 8).await;

    let poll = store.get_since("o1", -1);
    let indices: Vec<i64> = poll.events.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![3, 4, 5, 6, 7]);
    assert_eq!(poll.last_index, 7);

    emit_n(&bus, &ctx, 1).await;
    assert_eq!(store.get_since("o1", -1).last_index, 8);
}

#[tokio::test]
async fn test_two_observers_have_independent_cursors() {
    let bus = EventBus::new();
    let store = Arc::new(ObserverStore::new(100));
    bus.register(store.clone());
    store.init_observer("o1", "s1");

    let ctx = EventContext::new("s1", "test");
    emit_n(&bus, &ctx, 3).await;

    // A second observer attached mid-stream starts its own index sequence.
    store.init_observer("o2", "s1");
    emit_n(&bus, &ctx, 2).await;

    assert_eq!(store.get_since("o1", -1).events.len(), 5);
    assert_eq!(store.get_since("o2", -1).events.len(), 2);
}
