//! Process-wide kill switch.
//!
//! Explicit state, not a file flag: `Armed -> Tripped -> ResetPending ->
//! Armed`, with every transition persisted as an event. Once tripped it is
//! terminal until an operator resets it with a reason and an identity;
//! there is no automatic re-arm.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillState {
    Armed,
    Tripped,
    ResetPending,
}

impl KillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillState::Armed => "ARMED",
            KillState::Tripped => "TRIPPED",
            KillState::ResetPending => "RESET_PENDING",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KillSwitch {
    state: KillState,
    reason: Option<String>,
    tripped_ts: Option<u64>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self { state: KillState::Armed, reason: None, tripped_ts: None }
    }

    pub fn state(&self) -> KillState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == KillState::Armed
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Trip the switch. Returns the event payload to persist, or None if it
    /// was already tripped (idempotent).
    pub fn trip(&mut self, reason: &str, ts: u64) -> Option<Value> {
        if self.state != KillState::Armed {
            return None;
        }
        self.state = KillState::Tripped;
        self.reason = Some(reason.to_string());
        self.tripped_ts = Some(ts);
        Some(json!({
            "state": self.state.as_str(),
            "reason": reason,
            "tripped_ts": ts,
        }))
    }

    /// First half of the audited reset: an operator acknowledges the trip.
    /// Requires a reason and an identity; both go into the event payload.
    pub fn request_reset(&mut self, operator: &str, reason: &str, ts: u64) -> Option<Value> {
        if self.state != KillState::Tripped {
            return None;
        }
        if operator.trim().is_empty() || reason.trim().is_empty() {
            return None;
        }
        self.state = KillState::ResetPending;
        Some(json!({
            "state": self.state.as_str(),
            "operator": operator,
            "reason": reason,
            "ts": ts,
        }))
    }

    /// Second half: re-arm after the operator confirms positions are flat
    /// and the mismatch is understood.
    pub fn confirm_reset(&mut self, operator: &str, ts: u64) -> Option<Value> {
        if self.state != KillState::ResetPending {
            return None;
        }
        self.state = KillState::Armed;
        self.reason = None;
        self.tripped_ts = None;
        Some(json!({
            "state": self.state.as_str(),
            "operator": operator,
            "ts": ts,
        }))
    }

    /// Rebuild from the most recent persisted transition payload.
    pub fn restore(payload: &Value) -> Self {
        let state = payload
            .get("state")
            .and_then(|s| s.as_str())
            .and_then(|s| match s {
                "ARMED" => Some(KillState::Armed),
                "TRIPPED" => Some(KillState::Tripped),
                "RESET_PENDING" => Some(KillState::ResetPending),
                _ => None,
            })
            .unwrap_or(KillState::Armed);
        Self {
            state,
            reason: payload.get("reason").and_then(|r| r.as_str()).map(String::from),
            tripped_ts: payload.get("tripped_ts").and_then(|t| t.as_u64()),
        }
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let mut ks = KillSwitch::new();
        assert!(ks.is_armed());

        let trip = ks.trip("reconcile_mismatch", 1000).unwrap();
        assert_eq!(trip["state"], "TRIPPED");
        assert!(!ks.is_armed());

        let req = ks.request_reset("ops-jordan", "venue confirmed flat", 1100).unwrap();
        assert_eq!(req["state"], "RESET_PENDING");
        assert_eq!(req["operator"], "ops-jordan");
        assert!(!ks.is_armed());

        let armed = ks.confirm_reset("ops-jordan", 1200).unwrap();
        assert_eq!(armed["state"], "ARMED");
        assert!(ks.is_armed());
    }

    #[test]
    fn test_trip_is_idempotent() {
        let mut ks = KillSwitch::new();
        assert!(ks.trip("first", 1000).is_some());
        assert!(ks.trip("second", 1001).is_none());
        assert_eq!(ks.reason(), Some("first"));
    }

    #[test]
    fn test_reset_requires_identity_and_reason() {
        let mut ks = KillSwitch::new();
        ks.trip("mismatch", 1000);
        assert!(ks.request_reset("", "reason", 1100).is_none());
        assert!(ks.request_reset("ops", "  ", 1100).is_none());
        assert_eq!(ks.state(), KillState::Tripped);
        assert!(ks.request_reset("ops", "ok", 1100).is_some());
    }

    #[test]
    fn test_no_reset_without_trip() {
        let mut ks = KillSwitch::new();
        assert!(ks.request_reset("ops", "reason", 1000).is_none());
        assert!(ks.confirm_reset("ops", 1000).is_none());
        assert!(ks.is_armed());
    }

    #[test]
    fn test_restore_from_payload() {
        let mut ks = KillSwitch::new();
        let payload = ks.trip("drift", 1000).unwrap();
        let restored = KillSwitch::restore(&payload);
        assert_eq!(restored.state(), KillState::Tripped);
        assert_eq!(restored.reason(), Some("drift"));
    }
}
