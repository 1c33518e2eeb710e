//! Simulated venue.
//!
//! Fills entries at the mark plus configured slippage, rests bracket legs
//! until the mark crosses them, and injects deterministic faults (ack
//! timeouts, duplicate fills, dropped fills) so the supervisor's defenses
//! are exercised without a broker.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::decision::Side;

use super::{
    AdapterEvent, CancelAck, ExecutionAdapter, OrderTicket, SubmitAck, TicketKind,
    VenueOrderState, VenueSnapshot,
};

#[derive(Debug, Clone)]
pub struct FaultProfile {
    pub timeout_rate: f64,
    pub dup_fill_rate: f64,
    pub drop_fill_rate: f64,
}

impl FaultProfile {
    pub fn disabled() -> Self {
        Self { timeout_rate: 0.0, dup_fill_rate: 0.0, drop_fill_rate: 0.0 }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout_rate: cfg.sim_timeout_rate,
            dup_fill_rate: cfg.sim_dup_fill_rate,
            drop_fill_rate: cfg.sim_drop_fill_rate,
        }
    }
}

/// Deterministic fault draw from a sequence seed; no RNG so test runs are
/// reproducible.
pub fn should_fault(seed: u64, rate: f64) -> bool {
    let v = (seed.wrapping_mul(2654435761) % 10_000) as f64 / 10_000.0;
    v < rate
}

struct RestingOrder {
    venue_order_id: String,
    ticket: OrderTicket,
}

struct SimState {
    mark: f64,
    ts: u64,
    position: i64,
    avg_price: f64,
    open: HashMap<String, RestingOrder>,
    seen_client_ids: HashSet<String>,
    seq: u64,
}

pub struct SimulatedVenue {
    instrument: String,
    tick_size: f64,
    slippage_ticks: f64,
    commission: f64,
    fault: FaultProfile,
    events_tx: mpsc::Sender<AdapterEvent>,
    state: Mutex<SimState>,
}

impl SimulatedVenue {
    pub fn new(cfg: &Config, fault: FaultProfile, events_tx: mpsc::Sender<AdapterEvent>) -> Self {
        Self {
            instrument: cfg.instrument.clone(),
            tick_size: cfg.tick_size,
            slippage_ticks: cfg.sim_slippage_ticks,
            commission: cfg.commission_per_contract,
            fault,
            events_tx,
            state: Mutex::new(SimState {
                mark: 0.0,
                ts: 0,
                position: 0,
                avg_price: 0.0,
                open: HashMap::new(),
                seen_client_ids: HashSet::new(),
                seq: 0,
            }),
        }
    }

    /// Advance the simulated market. Resting bracket legs whose level the
    /// mark has crossed fill at their level.
    pub async fn set_mark(&self, price: f64, ts: u64) {
        let mut triggered = Vec::new();
        {
            let mut st = self.state.lock().await;
            st.mark = price;
            st.ts = ts;
            let ids: Vec<String> = st.open.keys().cloned().collect();
            for client_id in ids {
                let fire = {
                    let resting = &st.open[&client_id];
                    let level = resting.ticket.price.unwrap_or(price);
                    match (resting.ticket.kind, resting.ticket.side) {
                        (TicketKind::Stop, Side::Short) => price <= level,
                        (TicketKind::Stop, Side::Long) => price >= level,
                        (TicketKind::Target, Side::Short) => price >= level,
                        (TicketKind::Target, Side::Long) => price <= level,
                        (TicketKind::Entry, _) => false,
                    }
                };
                if fire {
                    if let Some(resting) = st.open.remove(&client_id) {
                        let level = resting.ticket.price.unwrap_or(price);
                        let qty = resting.ticket.qty;
                        let sign = resting.ticket.side.sign();
                        st.position += sign * qty as i64;
                        st.seq += 1;
                        let fill_seq = st.seq;
                        triggered.push((resting, level, qty, fill_seq, ts));
                    }
                }
            }
        }
        for (resting, level, qty, fill_seq, ts) in triggered {
            let _ = self
                .events_tx
                .send(AdapterEvent::ExecutionReport {
                    order_id: resting.venue_order_id.clone(),
                    client_order_id: resting.ticket.client_order_id.clone(),
                    fill_id: format!("F-{}", fill_seq),
                    filled_qty: qty,
                    fill_price: level,
                    remaining_qty: 0,
                    commission: self.commission * qty as f64,
                    slippage_ticks: 0.0,
                    ts,
                })
                .await;
        }
    }

    pub async fn position(&self) -> i64 {
        self.state.lock().await.position
    }
}

#[async_trait]
impl ExecutionAdapter for SimulatedVenue {
    async fn submit(&self, ticket: OrderTicket) -> Result<SubmitAck> {
        let (order_id, fill, dup) = {
            let mut st = self.state.lock().await;
            st.seq += 1;
            let seed = st.seq;
            if should_fault(seed, self.fault.timeout_rate) {
                return Err(anyhow!("submit ack timeout for {}", ticket.client_order_id));
            }
            // Venue-side idempotency on the client order id: a resubmission
            // after a crash acks without creating a second order.
            if st.seen_client_ids.contains(&ticket.client_order_id) {
                return Ok(SubmitAck {
                    order_id: format!("V-dup-{}", seed),
                    accepted: true,
                    reason: Some("duplicate_client_order_id".to_string()),
                });
            }
            st.seen_client_ids.insert(ticket.client_order_id.clone());
            let order_id = format!("V-{}", seed);

            match ticket.kind {
                TicketKind::Entry => {
                    if should_fault(seed, self.fault.drop_fill_rate) {
                        // Acked but the fill never arrives; the order rests
                        // until canceled or reconciled away.
                        st.open.insert(
                            ticket.client_order_id.clone(),
                            RestingOrder { venue_order_id: order_id.clone(), ticket: ticket.clone() },
                        );
                        (order_id, None, false)
                    } else {
                        let sign = ticket.side.sign();
                        let fill_price = st.mark + sign as f64 * self.slippage_ticks * self.tick_size;
                        st.position += sign * ticket.qty as i64;
                        st.avg_price = fill_price;
                        st.seq += 1;
                        let fill_seq = st.seq;
                        let dup = should_fault(seed, self.fault.dup_fill_rate);
                        (
                            order_id,
                            Some(AdapterEvent::ExecutionReport {
                                order_id: format!("V-{}", seed),
                                client_order_id: ticket.client_order_id.clone(),
                                fill_id: format!("F-{}", fill_seq),
                                filled_qty: ticket.qty,
                                fill_price,
                                remaining_qty: 0,
                                commission: self.commission * ticket.qty as f64,
                                slippage_ticks: self.slippage_ticks,
                                ts: st.ts,
                            }),
                            dup,
                        )
                    }
                }
                TicketKind::Stop | TicketKind::Target => {
                    st.open.insert(
                        ticket.client_order_id.clone(),
                        RestingOrder { venue_order_id: order_id.clone(), ticket: ticket.clone() },
                    );
                    (order_id, None, false)
                }
            }
        };

        let _ = self
            .events_tx
            .send(AdapterEvent::OrderState {
                order_id: order_id.clone(),
                client_order_id: ticket.client_order_id.clone(),
                state: VenueOrderState::Acked,
                reason: None,
            })
            .await;
        if let Some(report) = fill {
            let _ = self.events_tx.send(report.clone()).await;
            if dup {
                // Same fill id delivered twice; the supervisor must dedup.
                let _ = self.events_tx.send(report).await;
            }
        }
        Ok(SubmitAck { order_id, accepted: true, reason: None })
    }

    async fn cancel(&self, order_id: &str) -> Result<CancelAck> {
        let removed = {
            let mut st = self.state.lock().await;
            let key = st
                .open
                .iter()
                .find(|(client_id, resting)| {
                    resting.venue_order_id == order_id || client_id.as_str() == order_id
                })
                .map(|(client_id, _)| client_id.clone());
            key.and_then(|k| st.open.remove(&k))
        };
        match removed {
            Some(resting) => {
                let _ = self
                    .events_tx
                    .send(AdapterEvent::OrderState {
                        order_id: resting.venue_order_id.clone(),
                        client_order_id: resting.ticket.client_order_id.clone(),
                        state: VenueOrderState::Canceled,
                        reason: Some("cancel_requested".to_string()),
                    })
                    .await;
                Ok(CancelAck { accepted: true, reason: None })
            }
            // Canceling an order the venue no longer knows is idempotent.
            None => Ok(CancelAck { accepted: true, reason: Some("unknown_order".to_string()) }),
        }
    }

    async fn flatten(&self, _account: &str) -> Result<()> {
        let (canceled, snapshot) = {
            let mut st = self.state.lock().await;
            let canceled: Vec<RestingOrder> = st.open.drain().map(|(_, v)| v).collect();
            st.position = 0;
            st.avg_price = 0.0;
            (
                canceled,
                AdapterEvent::PositionSnapshot {
                    instrument: self.instrument.clone(),
                    qty: 0,
                    avg_price: 0.0,
                    unrealized_pnl: 0.0,
                },
            )
        };
        for resting in canceled {
            let _ = self
                .events_tx
                .send(AdapterEvent::OrderState {
                    order_id: resting.venue_order_id.clone(),
                    client_order_id: resting.ticket.client_order_id.clone(),
                    state: VenueOrderState::Canceled,
                    reason: Some("flatten".to_string()),
                })
                .await;
        }
        let _ = self.events_tx.send(snapshot).await;
        Ok(())
    }

    async fn snapshot(&self) -> Result<VenueSnapshot> {
        let st = self.state.lock().await;
        Ok(VenueSnapshot {
            position: st.position,
            avg_price: st.avg_price,
            open_client_order_ids: st.open.keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.tick_size = 0.25;
        cfg.sim_slippage_ticks = 0.5;
        cfg.commission_per_contract = 0.74;
        cfg.instrument = "MNQ".to_string();
        cfg
    }

    fn ticket(kind: TicketKind, side: Side, price: Option<f64>) -> OrderTicket {
        OrderTicket {
            decision_id: "D-1".to_string(),
            order_group_id: "G-1".to_string(),
            client_order_id: format!("CO-{}-{:?}", kind.as_str(), side),
            instrument: "MNQ".to_string(),
            side,
            qty: 1,
            kind,
            price,
        }
    }

    #[tokio::test]
    async fn test_entry_fills_with_slippage() {
        let (tx, mut rx) = mpsc::channel(32);
        let venue = SimulatedVenue::new(&cfg(), FaultProfile::disabled(), tx);
        venue.set_mark(15000.0, 1000).await;

        let ack = venue.submit(ticket(TicketKind::Entry, Side::Long, None)).await.unwrap();
        assert!(ack.accepted);
        assert_eq!(venue.position().await, 1);

        // Ack first, then the fill.
        match rx.recv().await.unwrap() {
            AdapterEvent::OrderState { state, .. } => assert_eq!(state, VenueOrderState::Acked),
            other => panic!("expected ack, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            AdapterEvent::ExecutionReport { fill_price, .. } => {
                assert!((fill_price - 15000.125).abs() < 1e-9);
            }
            other => panic!("expected fill, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_rests_until_crossed() {
        let (tx, mut rx) = mpsc::channel(32);
        let venue = SimulatedVenue::new(&cfg(), FaultProfile::disabled(), tx);
        venue.set_mark(15000.0, 1000).await;

        // Protective stop for a long: sell if the mark trades down to 14996.
        venue
            .submit(ticket(TicketKind::Stop, Side::Short, Some(14996.0)))
            .await
            .unwrap();
        let _ack = rx.recv().await.unwrap();

        venue.set_mark(14998.0, 1060).await;
        assert!(rx.try_recv().is_err(), "no fill before the level");

        venue.set_mark(14995.0, 1120).await;
        match rx.recv().await.unwrap() {
            AdapterEvent::ExecutionReport { fill_price, .. } => {
                assert!((fill_price - 14996.0).abs() < 1e-9)
            }
            other => panic!("expected stop fill, got {:?}", other),
        }
        assert_eq!(venue.position().await, -1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (tx, mut rx) = mpsc::channel(32);
        let venue = SimulatedVenue::new(&cfg(), FaultProfile::disabled(), tx);
        venue.set_mark(15000.0, 1000).await;
        let ack = venue
            .submit(ticket(TicketKind::Target, Side::Short, Some(15010.0)))
            .await
            .unwrap();
        let _ = rx.recv().await;

        let c1 = venue.cancel(&ack.order_id).await.unwrap();
        assert!(c1.accepted && c1.reason.is_none());
        let c2 = venue.cancel(&ack.order_id).await.unwrap();
        assert!(c2.accepted);
        assert_eq!(c2.reason.as_deref(), Some("unknown_order"));
    }

    #[tokio::test]
    async fn test_duplicate_fill_fault_emits_same_fill_id() {
        let mut cfg = cfg();
        cfg.sim_dup_fill_rate = 1.0;
        let (tx, mut rx) = mpsc::channel(32);
        let venue = SimulatedVenue::new(&cfg, FaultProfile::from_config(&cfg), tx);
        venue.set_mark(15000.0, 1000).await;
        venue.submit(ticket(TicketKind::Entry, Side::Long, None)).await.unwrap();

        let _ack = rx.recv().await.unwrap();
        let f1 = rx.recv().await.unwrap();
        let f2 = rx.recv().await.unwrap();
        match (f1, f2) {
            (
                AdapterEvent::ExecutionReport { fill_id: a, .. },
                AdapterEvent::ExecutionReport { fill_id: b, .. },
            ) => assert_eq!(a, b),
            other => panic!("expected two fills, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_fault_returns_error() {
        let mut cfg = cfg();
        cfg.sim_timeout_rate = 1.0;
        let (tx, _rx) = mpsc::channel(32);
        let venue = SimulatedVenue::new(&cfg, FaultProfile::from_config(&cfg), tx);
        venue.set_mark(15000.0, 1000).await;
        let res = venue.submit(ticket(TicketKind::Entry, Side::Long, None)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_flatten_clears_everything() {
        let (tx, mut rx) = mpsc::channel(32);
        let venue = SimulatedVenue::new(&cfg(), FaultProfile::disabled(), tx);
        venue.set_mark(15000.0, 1000).await;
        venue.submit(ticket(TicketKind::Entry, Side::Long, None)).await.unwrap();
        venue
            .submit(ticket(TicketKind::Stop, Side::Short, Some(14996.0)))
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        venue.flatten("sim-1").await.unwrap();
        assert_eq!(venue.position().await, 0);
        let snap = venue.snapshot().await.unwrap();
        assert!(snap.open_client_order_ids.is_empty());
    }
}
