//! Event records shared by every subsystem.
//!
//! Events are immutable. The id is a pure function of the logical content,
//! so re-ingesting the same event is a no-op at the store and replays mint
//! the same ids on every machine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    DecisionRecorded,
    OrderSubmitted,
    OrderStateChanged,
    FillRecorded,
    BracketAttached,
    TradeClosed,
    AttributionRecorded,
    ReliabilitySnapshot,
    KillSwitchTripped,
    KillSwitchReset,
    ReconcileMismatch,
    SessionExit,
    Halt,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DecisionRecorded => "decision_recorded",
            EventKind::OrderSubmitted => "order_submitted",
            EventKind::OrderStateChanged => "order_state_changed",
            EventKind::FillRecorded => "fill_recorded",
            EventKind::BracketAttached => "bracket_attached",
            EventKind::TradeClosed => "trade_closed",
            EventKind::AttributionRecorded => "attribution_recorded",
            EventKind::ReliabilitySnapshot => "reliability_snapshot",
            EventKind::KillSwitchTripped => "kill_switch_tripped",
            EventKind::KillSwitchReset => "kill_switch_reset",
            EventKind::ReconcileMismatch => "reconcile_mismatch",
            EventKind::SessionExit => "session_exit",
            EventKind::Halt => "halt",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "decision_recorded" => EventKind::DecisionRecorded,
            "order_submitted" => EventKind::OrderSubmitted,
            "order_state_changed" => EventKind::OrderStateChanged,
            "fill_recorded" => EventKind::FillRecorded,
            "bracket_attached" => EventKind::BracketAttached,
            "trade_closed" => EventKind::TradeClosed,
            "attribution_recorded" => EventKind::AttributionRecorded,
            "reliability_snapshot" => EventKind::ReliabilitySnapshot,
            "kill_switch_tripped" => EventKind::KillSwitchTripped,
            "kill_switch_reset" => EventKind::KillSwitchReset,
            "reconcile_mismatch" => EventKind::ReconcileMismatch,
            "session_exit" => EventKind::SessionExit,
            "halt" => EventKind::Halt,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub stream_id: String,
    /// RFC3339 with millisecond precision
    pub ts: String,
    pub kind: EventKind,
    pub payload: Value,
    pub config_hash: String,
}

impl Event {
    pub fn new(
        stream_id: &str,
        ts: &str,
        kind: EventKind,
        payload: Value,
        config_hash: &str,
    ) -> Self {
        let id = event_id(stream_id, ts, kind, &payload, config_hash);
        Self {
            id,
            stream_id: stream_id.to_string(),
            ts: ts.to_string(),
            kind,
            payload,
            config_hash: config_hash.to_string(),
        }
    }
}

/// Deterministic event id. serde_json renders object keys in sorted order
/// (BTreeMap-backed maps), so the payload rendering is canonical.
pub fn event_id(
    stream_id: &str,
    ts: &str,
    kind: EventKind,
    payload: &Value,
    config_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(b"|");
    hasher.update(ts.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(payload.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(config_hash.as_bytes());
    hex::encode(hasher.finalize())
}
