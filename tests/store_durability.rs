//! The store is the system of record: what was appended before a crash
//! must fold identically after reopening the database.

use serde_json::json;
use tempfile::tempdir;

use tradegate::events::{Event, EventKind};
use tradegate::replay::replay;
use tradegate::store::EventStore;

fn seed(store: &mut EventStore) {
    let events = [
        ("2026-03-02T14:30:00.000Z", EventKind::DecisionRecorded, json!({"action": "SKIP"})),
        ("2026-03-02T14:31:00.000Z", EventKind::DecisionRecorded, json!({"action": "ENTER"})),
        ("2026-03-02T14:31:00.500Z", EventKind::OrderSubmitted, json!({"client_order_id": "P-1"})),
        ("2026-03-02T14:31:01.000Z", EventKind::FillRecorded, json!({"fill_id": "F-1"})),
        ("2026-03-02T14:45:00.000Z", EventKind::TradeClosed, json!({"realized_pnl": -8.25})),
    ];
    for (ts, kind, payload) in events {
        store.append(&Event::new("durable", ts, kind, payload, "cfg-d")).unwrap();
    }
}

#[test]
fn test_replay_identical_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.sqlite");
    let path = path.to_str().unwrap();

    let before = {
        let mut store = EventStore::open(path).unwrap();
        store.init().unwrap();
        seed(&mut store);
        replay(&store, "durable", "cfg-d").unwrap()
    };

    let mut store = EventStore::open(path).unwrap();
    store.init().unwrap();
    let after = replay(&store, "durable", "cfg-d").unwrap();
    assert_eq!(before, after);
    assert_eq!(after.events_folded, 5);
    assert!((after.realized_pnl + 8.25).abs() < 1e-12);
}

#[test]
fn test_reingest_after_reopen_is_noop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.sqlite");
    let path = path.to_str().unwrap();

    {
        let mut store = EventStore::open(path).unwrap();
        store.init().unwrap();
        seed(&mut store);
    }

    let mut store = EventStore::open(path).unwrap();
    store.init().unwrap();
    seed(&mut store); // same logical events again
    assert_eq!(store.count("durable").unwrap(), 5);
}

#[test]
fn test_corruption_detected_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.sqlite");
    let path = path.to_str().unwrap();

    let original = Event::new(
        "durable",
        "2026-03-02T14:30:00.000Z",
        EventKind::Halt,
        json!({"reason": "x"}),
        "cfg-d",
    );
    {
        let mut store = EventStore::open(path).unwrap();
        store.init().unwrap();
        store.append(&original).unwrap();
    }

    let mut store = EventStore::open(path).unwrap();
    store.init().unwrap();
    let mut forged = original.clone();
    forged.payload = json!({"reason": "y"});
    assert!(store.append(&forged).is_err());
}
