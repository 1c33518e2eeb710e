//! Venue adapter contract.
//!
//! Broker-specific clients live outside this repo; the supervisor is
//! written once against this capability set. Outbound calls are
//! request/acknowledge with bounded timeouts; inbound events arrive on a
//! single mpsc channel and are applied to the supervisor one at a time in
//! delivery order. Every message carries the decision_id ->
//! order_group_id -> order_id lineage.

pub mod sim;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::decision::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketKind {
    Entry,
    Stop,
    Target,
}

impl TicketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketKind::Entry => "entry",
            TicketKind::Stop => "stop",
            TicketKind::Target => "target",
        }
    }
}

/// Outbound order request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub decision_id: String,
    pub order_group_id: String,
    pub client_order_id: String,
    pub instrument: String,
    pub side: Side,
    pub qty: u32,
    pub kind: TicketKind,
    /// Trigger price for stops, limit price for targets, None for market
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub order_id: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancelAck {
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderState {
    Acked,
    Rejected,
    Canceled,
}

/// Inbound events from the venue, in delivery order.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    OrderState {
        order_id: String,
        client_order_id: String,
        state: VenueOrderState,
        reason: Option<String>,
    },
    ExecutionReport {
        order_id: String,
        client_order_id: String,
        fill_id: String,
        filled_qty: u32,
        fill_price: f64,
        remaining_qty: u32,
        commission: f64,
        slippage_ticks: f64,
        ts: u64,
    },
    PositionSnapshot {
        instrument: String,
        qty: i64,
        avg_price: f64,
        unrealized_pnl: f64,
    },
    Disconnected {
        reason: String,
    },
}

/// Venue truth at a point in time, used by startup and interval
/// reconciliation.
#[derive(Debug, Clone)]
pub struct VenueSnapshot {
    pub position: i64,
    pub avg_price: f64,
    pub open_client_order_ids: Vec<String>,
}

#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn submit(&self, ticket: OrderTicket) -> Result<SubmitAck>;
    async fn cancel(&self, order_id: &str) -> Result<CancelAck>;
    async fn flatten(&self, account: &str) -> Result<()>;
    async fn snapshot(&self) -> Result<VenueSnapshot>;
}
