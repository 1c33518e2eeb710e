//! Deterministic replay: fold a stream's full event sequence into derived
//! state.
//!
//! The fold is pure over the ordered sequence, so two replays of the same
//! stream under the same config hash produce byte-identical state and an
//! identical chained state hash, on any machine. This is the property
//! crash recovery and the test suite lean on.

use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::events::EventKind;
use crate::exec::kill_switch::{KillState, KillSwitch};
use crate::store::EventStore;

const REPLAY_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedState {
    pub stream_id: String,
    pub config_hash: String,
    pub events_folded: u64,
    pub decisions: u64,
    pub orders_submitted: u64,
    pub fills: u64,
    pub trades_closed: u64,
    pub attributions: u64,
    pub halts: u64,
    pub realized_pnl: f64,
    pub kill_state: KillState,
    /// Most recent reliability snapshot payload, if any
    pub reliability: Option<Value>,
    pub last_event_id: Option<String>,
    /// Chained sha256 over the event id sequence
    pub state_hash: String,
}

/// Fold the full stream. Events stamped with a different config hash are
/// counted into the hash chain (they are part of the stream's history) but
/// flagged; derived business state comes only from matching events.
pub fn replay(store: &EventStore, stream_id: &str, config_hash: &str) -> Result<DerivedState> {
    let mut hasher = Sha256::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(b"|");
    hasher.update(config_hash.as_bytes());
    let mut chain: Vec<u8> = hasher.finalize().to_vec();

    let mut state = DerivedState {
        stream_id: stream_id.to_string(),
        config_hash: config_hash.to_string(),
        events_folded: 0,
        decisions: 0,
        orders_submitted: 0,
        fills: 0,
        trades_closed: 0,
        attributions: 0,
        halts: 0,
        realized_pnl: 0.0,
        kill_state: KillState::Armed,
        reliability: None,
        last_event_id: None,
        state_hash: String::new(),
    };

    let mut cursor = store.cursor(stream_id, REPLAY_BATCH);
    loop {
        let batch = cursor.next_batch()?;
        if batch.is_empty() {
            break;
        }
        for event in batch {
            state.events_folded += 1;
            let mut hasher = Sha256::new();
            hasher.update(&chain);
            hasher.update(event.id.as_bytes());
            chain = hasher.finalize().to_vec();
            state.last_event_id = Some(event.id.clone());

            if event.config_hash != config_hash {
                continue;
            }
            match event.kind {
                EventKind::DecisionRecorded => state.decisions += 1,
                EventKind::OrderSubmitted => state.orders_submitted += 1,
                EventKind::FillRecorded => state.fills += 1,
                EventKind::TradeClosed => {
                    state.trades_closed += 1;
                    if let Some(pnl) = event.payload.get("realized_pnl").and_then(|p| p.as_f64()) {
                        state.realized_pnl += pnl;
                    }
                }
                EventKind::AttributionRecorded => state.attributions += 1,
                EventKind::ReliabilitySnapshot => {
                    state.reliability = Some(event.payload.clone());
                }
                EventKind::KillSwitchTripped | EventKind::KillSwitchReset => {
                    state.kill_state = KillSwitch::restore(&event.payload).state();
                }
                EventKind::Halt => state.halts += 1,
                EventKind::OrderStateChanged
                | EventKind::BracketAttached
                | EventKind::ReconcileMismatch
                | EventKind::SessionExit => {}
            }
        }
    }
    state.state_hash = hex::encode(chain);
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use serde_json::json;

    fn seed_store() -> EventStore {
        let mut store = EventStore::open_in_memory().unwrap();
        store.init().unwrap();
        let events = [
            ("2026-03-02T14:30:00.000Z", EventKind::DecisionRecorded, json!({"action": "ENTER"})),
            ("2026-03-02T14:30:00.000Z", EventKind::OrderSubmitted, json!({"client_order_id": "P-1"})),
            ("2026-03-02T14:30:05.000Z", EventKind::FillRecorded, json!({"fill_id": "F-1"})),
            ("2026-03-02T14:40:00.000Z", EventKind::TradeClosed, json!({"realized_pnl": 12.5})),
            (
                "2026-03-02T14:40:00.000Z",
                EventKind::KillSwitchTripped,
                json!({"state": "TRIPPED", "reason": "reconcile_mismatch", "tripped_ts": 1000}),
            ),
        ];
        for (ts, kind, payload) in events {
            store
                .append(&Event::new("s-1", ts, kind, payload, "cfg-1"))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_replay_counts_and_state() {
        let store = seed_store();
        let state = replay(&store, "s-1", "cfg-1").unwrap();
        assert_eq!(state.events_folded, 5);
        assert_eq!(state.decisions, 1);
        assert_eq!(state.orders_submitted, 1);
        assert_eq!(state.fills, 1);
        assert_eq!(state.trades_closed, 1);
        assert!((state.realized_pnl - 12.5).abs() < 1e-12);
        assert_eq!(state.kill_state, KillState::Tripped);
    }

    #[test]
    fn test_replay_is_bit_identical() {
        let store = seed_store();
        let a = replay(&store, "s-1", "cfg-1").unwrap();
        let b = replay(&store, "s-1", "cfg-1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.state_hash, b.state_hash);
        assert!(!a.state_hash.is_empty());
    }

    #[test]
    fn test_replay_idempotent_reingest() {
        let mut store = seed_store();
        let before = replay(&store, "s-1", "cfg-1").unwrap();
        // Re-ingesting an event that already exists changes nothing.
        store
            .append(&Event::new(
                "s-1",
                "2026-03-02T14:30:00.000Z",
                EventKind::DecisionRecorded,
                json!({"action": "ENTER"}),
                "cfg-1",
            ))
            .unwrap();
        let after = replay(&store, "s-1", "cfg-1").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_foreign_config_events_hash_but_do_not_fold() {
        let mut store = seed_store();
        store
            .append(&Event::new(
                "s-1",
                "2026-03-02T15:00:00.000Z",
                EventKind::TradeClosed,
                json!({"realized_pnl": 100.0}),
                "cfg-other",
            ))
            .unwrap();
        let state = replay(&store, "s-1", "cfg-1").unwrap();
        assert_eq!(state.events_folded, 6);
        assert_eq!(state.trades_closed, 1, "foreign-config trade not folded");
        assert!((state.realized_pnl - 12.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_stream() {
        let mut store = EventStore::open_in_memory().unwrap();
        store.init().unwrap();
        let state = replay(&store, "nothing", "cfg-1").unwrap();
        assert_eq!(state.events_folded, 0);
        assert!(state.last_event_id.is_none());
        assert_eq!(state.kill_state, KillState::Armed);
    }
}
