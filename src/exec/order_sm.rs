//! Parent/child order lifecycle state machine.
//!
//! Transitions are driven only by adapter-reported events. An event that
//! does not match a legal transition from the current state is rejected
//! with a `TransitionError`; the supervisor logs and discards it, which is
//! what protects the book against duplicate and out-of-order delivery.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentState {
    Created,
    Submitting,
    Acked,
    PartiallyFilled,
    Filled,
    Rejected,
    Canceled,
    Done,
}

impl ParentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentState::Created => "CREATED",
            ParentState::Submitting => "SUBMITTING",
            ParentState::Acked => "ACKED",
            ParentState::PartiallyFilled => "PARTIAL",
            ParentState::Filled => "FILLED",
            ParentState::Rejected => "REJECTED",
            ParentState::Canceled => "CANCELED",
            ParentState::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ParentState::Filled | ParentState::Rejected | ParentState::Canceled | ParentState::Done
        )
    }
}

#[derive(Debug, Clone)]
pub enum OrderEvent {
    SubmitSent,
    Ack { venue_order_id: String },
    Reject { reason: String },
    Fill { fill_id: String, qty: u32, price: f64, commission: f64 },
    CancelAck,
    CancelOnTimeout,
}

impl OrderEvent {
    pub fn evidence(&self) -> &'static str {
        match self {
            OrderEvent::SubmitSent => "submit",
            OrderEvent::Ack { .. } => "venue_ack",
            OrderEvent::Reject { .. } => "venue_reject",
            OrderEvent::Fill { .. } => "execution_report",
            OrderEvent::CancelAck => "cancel_ack",
            OrderEvent::CancelOnTimeout => "ttl_timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionError {
    pub state: ParentState,
    pub evidence: &'static str,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal transition: {} in state {}", self.evidence, self.state.as_str())
    }
}

impl std::error::Error for TransitionError {}

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Transitioned(ParentState, ParentState),
    /// Duplicate delivery, legal but already seen; no state change
    Ignored,
}

#[derive(Debug, Clone)]
pub struct OrderCore {
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
    pub state: ParentState,
    pub qty: u32,
    pub filled_qty: u32,
    pub avg_fill_price: f64,
    pub commission: f64,
    pub seen_fills: HashSet<String>,
    pub reject_reason: Option<String>,
}

impl OrderCore {
    pub fn new(client_order_id: String, qty: u32) -> Self {
        Self {
            client_order_id,
            venue_order_id: None,
            state: ParentState::Created,
            qty,
            filled_qty: 0,
            avg_fill_price: 0.0,
            commission: 0.0,
            seen_fills: HashSet::new(),
            reject_reason: None,
        }
    }
}

pub fn apply_event(order: &mut OrderCore, event: OrderEvent) -> Result<Applied, TransitionError> {
    let prev = order.state;
    match (order.state, event) {
        (ParentState::Created, OrderEvent::SubmitSent) => {
            order.state = ParentState::Submitting;
            Ok(Applied::Transitioned(prev, order.state))
        }
        (ParentState::Submitting, OrderEvent::Ack { venue_order_id }) => {
            order.venue_order_id = Some(venue_order_id);
            order.state = ParentState::Acked;
            Ok(Applied::Transitioned(prev, order.state))
        }
        // A late ack after we already saw a fill for the same order is a
        // duplicate-path delivery, not an error.
        (ParentState::PartiallyFilled | ParentState::Filled, OrderEvent::Ack { venue_order_id }) => {
            if order.venue_order_id.is_none() {
                order.venue_order_id = Some(venue_order_id);
            }
            Ok(Applied::Ignored)
        }
        (ParentState::Submitting | ParentState::Acked, OrderEvent::Reject { reason }) => {
            order.reject_reason = Some(reason);
            order.state = ParentState::Rejected;
            Ok(Applied::Transitioned(prev, order.state))
        }
        (
            ParentState::Submitting | ParentState::Acked | ParentState::PartiallyFilled,
            OrderEvent::Fill { fill_id, qty, price, commission },
        ) => {
            if order.seen_fills.contains(&fill_id) {
                return Ok(Applied::Ignored);
            }
            order.seen_fills.insert(fill_id);
            let filled_before = order.filled_qty as f64;
            order.filled_qty = order.filled_qty.saturating_add(qty).min(order.qty);
            let filled_after = order.filled_qty as f64;
            if filled_after > 0.0 {
                order.avg_fill_price = (order.avg_fill_price * filled_before
                    + price * (filled_after - filled_before))
                    / filled_after;
            }
            order.commission += commission;
            order.state = if order.filled_qty >= order.qty {
                ParentState::Filled
            } else {
                ParentState::PartiallyFilled
            };
            Ok(Applied::Transitioned(prev, order.state))
        }
        (
            ParentState::Submitting | ParentState::Acked | ParentState::PartiallyFilled,
            OrderEvent::CancelAck,
        ) => {
            order.state = ParentState::Canceled;
            Ok(Applied::Transitioned(prev, order.state))
        }
        (
            ParentState::Submitting | ParentState::Acked,
            OrderEvent::CancelOnTimeout,
        ) => {
            order.state = ParentState::Canceled;
            Ok(Applied::Transitioned(prev, order.state))
        }
        // Cancel confirmations for already-terminal orders are duplicates.
        (ParentState::Canceled | ParentState::Filled | ParentState::Rejected | ParentState::Done,
            OrderEvent::CancelAck | OrderEvent::CancelOnTimeout) => Ok(Applied::Ignored),
        (_, event) => Err(TransitionError { state: order.state, evidence: event.evidence() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(id: &str, qty: u32, price: f64) -> OrderEvent {
        OrderEvent::Fill {
            fill_id: id.to_string(),
            qty,
            price,
            commission: 0.74,
        }
    }

    #[test]
    fn test_happy_path_lifecycle() {
        let mut o = OrderCore::new("CO-1".to_string(), 2);
        apply_event(&mut o, OrderEvent::SubmitSent).unwrap();
        assert_eq!(o.state, ParentState::Submitting);
        apply_event(&mut o, OrderEvent::Ack { venue_order_id: "V-1".to_string() }).unwrap();
        assert_eq!(o.state, ParentState::Acked);
        apply_event(&mut o, fill("F-1", 1, 15000.0)).unwrap();
        assert_eq!(o.state, ParentState::PartiallyFilled);
        apply_event(&mut o, fill("F-2", 1, 15001.0)).unwrap();
        assert_eq!(o.state, ParentState::Filled);
        assert_eq!(o.filled_qty, 2);
        assert!((o.avg_fill_price - 15000.5).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_fill_ignored() {
        let mut o = OrderCore::new("CO-1".to_string(), 2);
        apply_event(&mut o, OrderEvent::SubmitSent).unwrap();
        apply_event(&mut o, OrderEvent::Ack { venue_order_id: "V-1".to_string() }).unwrap();
        apply_event(&mut o, fill("F-1", 1, 15000.0)).unwrap();
        let applied = apply_event(&mut o, fill("F-1", 1, 15000.0)).unwrap();
        assert_eq!(applied, Applied::Ignored);
        assert_eq!(o.filled_qty, 1);
        assert_eq!(o.state, ParentState::PartiallyFilled);
    }

    #[test]
    fn test_out_of_order_ack_rejected() {
        let mut o = OrderCore::new("CO-1".to_string(), 1);
        // Ack before submit is not a legal transition.
        let err = apply_event(&mut o, OrderEvent::Ack { venue_order_id: "V-1".to_string() });
        assert!(err.is_err());
        assert_eq!(o.state, ParentState::Created);
    }

    #[test]
    fn test_fill_after_cancel_rejected() {
        let mut o = OrderCore::new("CO-1".to_string(), 1);
        apply_event(&mut o, OrderEvent::SubmitSent).unwrap();
        apply_event(&mut o, OrderEvent::Ack { venue_order_id: "V-1".to_string() }).unwrap();
        apply_event(&mut o, OrderEvent::CancelAck).unwrap();
        let err = apply_event(&mut o, fill("F-1", 1, 15000.0));
        assert!(err.is_err());
        assert_eq!(o.state, ParentState::Canceled);
        assert_eq!(o.filled_qty, 0);
    }

    #[test]
    fn test_reject_from_submitting() {
        let mut o = OrderCore::new("CO-1".to_string(), 1);
        apply_event(&mut o, OrderEvent::SubmitSent).unwrap();
        apply_event(&mut o, OrderEvent::Reject { reason: "margin".to_string() }).unwrap();
        assert_eq!(o.state, ParentState::Rejected);
        assert_eq!(o.reject_reason.as_deref(), Some("margin"));
    }

    #[test]
    fn test_fill_while_submitting_before_ack() {
        // Venues can report the fill before the ack arrives; both orders of
        // delivery must land in the same terminal state.
        let mut o = OrderCore::new("CO-1".to_string(), 1);
        apply_event(&mut o, OrderEvent::SubmitSent).unwrap();
        apply_event(&mut o, fill("F-1", 1, 15000.0)).unwrap();
        assert_eq!(o.state, ParentState::Filled);
        let applied =
            apply_event(&mut o, OrderEvent::Ack { venue_order_id: "V-1".to_string() }).unwrap();
        assert_eq!(applied, Applied::Ignored);
        assert_eq!(o.venue_order_id.as_deref(), Some("V-1"));
    }

    #[test]
    fn test_duplicate_cancel_ack_ignored() {
        let mut o = OrderCore::new("CO-1".to_string(), 1);
        apply_event(&mut o, OrderEvent::SubmitSent).unwrap();
        apply_event(&mut o, OrderEvent::CancelOnTimeout).unwrap();
        assert_eq!(o.state, ParentState::Canceled);
        let applied = apply_event(&mut o, OrderEvent::CancelAck).unwrap();
        assert_eq!(applied, Applied::Ignored);
    }

    #[test]
    fn test_overfill_clamped_to_order_qty() {
        let mut o = OrderCore::new("CO-1".to_string(), 1);
        apply_event(&mut o, OrderEvent::SubmitSent).unwrap();
        apply_event(&mut o, fill("F-1", 3, 15000.0)).unwrap();
        assert_eq!(o.filled_qty, 1);
        assert_eq!(o.state, ParentState::Filled);
    }
}
