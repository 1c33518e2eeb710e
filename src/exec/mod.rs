//! The execution supervisor: an idempotent order/bracket lifecycle machine
//! with reconciliation and kill-switch safety.
//!
//! One position at a time per stream. Entries spawn an OCO stop/target
//! bracket on fill; a position is never left unprotected. All venue truth
//! arrives through the adapter event channel and is applied serially.

pub mod kill_switch;
pub mod order_sm;
pub mod reconcile;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::json;
use tokio::time::{timeout, Duration};

use crate::adapter::{
    AdapterEvent, ExecutionAdapter, OrderTicket, TicketKind, VenueOrderState,
};
use crate::config::Config;
use crate::decision::euc::EucScore;
use crate::decision::templates::Template;
use crate::decision::{EntryType, OrderIntent, Side};
use crate::events::{Event, EventKind};
use crate::learning::attribution::TradeOutcome;
use crate::learning::ts_rfc3339;
use crate::logging::{json_log, log_fill, log_order_state, obj, v_num, v_str, Domain};
use crate::regime::{RegimeBucket, TimeBucket};
use crate::retry::{retry_async, RetryConfig};
use crate::store::EventStore;

use kill_switch::KillSwitch;
use order_sm::{apply_event, Applied, OrderCore, OrderEvent, ParentState};
use reconcile::{compare, ReconcileOutcome};

/// Entry-time snapshot carried on the order; becomes part of the
/// TradeOutcome when the position closes. Captured once, never recomputed.
#[derive(Debug, Clone)]
pub struct EntryContext {
    pub template: Template,
    pub regime: RegimeBucket,
    pub time_bucket: TimeBucket,
    pub probability: f64,
    pub stability: f64,
    pub dvs: f64,
    pub eqs: f64,
    pub euc: EucScore,
    pub expected_slippage_ticks: f64,
    pub spread_ticks: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Stop,
    Target,
}

impl ChildKind {
    fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Stop => "stop",
            ChildKind::Target => "target",
        }
    }
}

#[derive(Debug, Clone)]
struct ChildOrder {
    kind: ChildKind,
    core: OrderCore,
    level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParentRole {
    Entry,
    Close,
}

#[derive(Debug)]
struct ParentOrder {
    core: OrderCore,
    role: ParentRole,
    decision_id: String,
    order_group_id: String,
    side: Side,
    placed_ts: u64,
    ttl_secs: u64,
    cancel_requested: bool,
}

/// A filled entry with its live bracket and path statistics.
#[derive(Debug)]
struct OpenTrade {
    decision_id: String,
    order_group_id: String,
    ctx: EntryContext,
    side: Side,
    qty: u32,
    entry_price: f64,
    entry_ts: u64,
    entry_commission: f64,
    entry_slippage_ticks: f64,
    stop_ticks: u32,
    target_ticks: u32,
    submit_ts_ms: u64,
    bracket_attach_ms: u64,
    stop: Option<ChildOrder>,
    target: Option<ChildOrder>,
    path_high: f64,
    path_low: f64,
    shock_seen: bool,
}

pub struct ExecutionSupervisor {
    cfg: Config,
    config_hash: String,
    adapter: Arc<dyn ExecutionAdapter>,
    parents: HashMap<String, ParentOrder>,
    /// child client id -> parent decision grouping (open trade)
    child_index: HashMap<String, ChildKind>,
    open_trade: Option<OpenTrade>,
    position: i64,
    kill: KillSwitch,
    ready: bool,
    outcomes: Vec<TradeOutcome>,
    last_mark: f64,
    now_ms: u64,
}

impl ExecutionSupervisor {
    pub fn new(cfg: Config, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        let config_hash = cfg.config_hash();
        Self {
            cfg,
            config_hash,
            adapter,
            parents: HashMap::new(),
            child_index: HashMap::new(),
            open_trade: None,
            position: 0,
            kill: KillSwitch::new(),
            ready: false,
            outcomes: Vec::new(),
            last_mark: 0.0,
            now_ms: 0,
        }
    }

    pub fn kill_state(&self) -> kill_switch::KillState {
        self.kill.state()
    }

    pub fn is_armed(&self) -> bool {
        self.kill.is_armed()
    }

    pub fn restore_kill_switch(&mut self, kill: KillSwitch) {
        self.kill = kill;
    }

    pub fn expected_position(&self) -> i64 {
        self.position
    }

    pub fn open_stop_ticks(&self) -> Option<u32> {
        self.open_trade.as_ref().map(|t| t.stop_ticks)
    }

    /// Closed trades since the last drain, in close order.
    pub fn drain_outcomes(&mut self) -> Vec<TradeOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    fn append(&self, store: &mut EventStore, ts: u64, kind: EventKind, payload: serde_json::Value) -> Result<()> {
        let event = Event::new(&self.cfg.stream_id, &ts_rfc3339(ts), kind, payload, &self.config_hash);
        store.append(&event)?;
        Ok(())
    }

    /// Startup reconciliation: adopt the venue's truth before accepting any
    /// intent. Until this succeeds the supervisor refuses submissions.
    pub async fn startup_reconcile(&mut self, store: &mut EventStore, now_ts: u64) -> Result<()> {
        let snap = self.adapter.snapshot().await?;
        if snap.position != self.position {
            json_log(
                Domain::Reconcile,
                "startup_adopt",
                obj(&[
                    ("venue_position", json!(snap.position)),
                    ("local_position", json!(self.position)),
                ]),
            );
            self.position = snap.position;
        }
        if !snap.open_client_order_ids.is_empty() {
            // Orders we no longer know about are canceled rather than
            // adopted; the ambiguity is not tradable.
            for client_id in &snap.open_client_order_ids {
                if !self.parents.contains_key(client_id) && !self.child_index.contains_key(client_id)
                {
                    let _ = self.cancel_with_retry(client_id).await;
                }
            }
        }
        self.append(
            store,
            now_ts,
            EventKind::OrderStateChanged,
            json!({
                "scope": "startup_reconcile",
                "venue_position": snap.position,
                "open_orders": snap.open_client_order_ids.len(),
            }),
        )?;
        self.ready = true;
        Ok(())
    }

    /// Track the bar for path statistics and stale-order sweeping. `shock`
    /// marks an exogenous volatility print during the hold.
    pub fn on_bar(&mut self, close: f64, ts: u64, shock: bool) {
        self.last_mark = close;
        self.now_ms = ts * 1000;
        if let Some(trade) = self.open_trade.as_mut() {
            trade.path_high = trade.path_high.max(close);
            trade.path_low = trade.path_low.min(close);
            trade.shock_seen |= shock;
        }
    }

    /// Submit a new entry intent. Idempotent on the decision id: a crash
    /// and resubmission of the same intent cannot create a second venue
    /// order.
    pub async fn submit_intent(
        &mut self,
        intent: &OrderIntent,
        ctx: EntryContext,
        now_ts: u64,
        store: &mut EventStore,
    ) -> Result<()> {
        if !self.ready {
            return Err(anyhow!("supervisor not reconciled; refusing intent"));
        }
        if !self.kill.is_armed() {
            json_log(
                Domain::Exec,
                "intent_blocked",
                obj(&[("decision_id", v_str(&intent.decision_id)), ("reason", v_str("kill_switch"))]),
            );
            return Ok(());
        }
        if self.open_trade.is_some() || self.position != 0 {
            json_log(
                Domain::Exec,
                "intent_blocked",
                obj(&[
                    ("decision_id", v_str(&intent.decision_id)),
                    ("reason", v_str("position_open")),
                ]),
            );
            return Ok(());
        }
        let client_order_id = format!("P-{}", intent.decision_id);
        if self.parents.contains_key(&client_order_id) {
            json_log(
                Domain::Exec,
                "intent_duplicate",
                obj(&[("client_order_id", v_str(&client_order_id)), ("status", v_str("noop"))]),
            );
            return Ok(());
        }

        let order_group_id = format!("G-{}", intent.decision_id);
        let mut parent = ParentOrder {
            core: OrderCore::new(client_order_id.clone(), intent.contracts),
            role: ParentRole::Entry,
            decision_id: intent.decision_id.clone(),
            order_group_id: order_group_id.clone(),
            side: intent.side,
            placed_ts: now_ts,
            ttl_secs: intent.ttl_secs,
            cancel_requested: false,
        };
        self.apply_to_core(&mut parent.core, OrderEvent::SubmitSent);
        self.append(
            store,
            now_ts,
            EventKind::OrderSubmitted,
            json!({
                "decision_id": intent.decision_id,
                "order_group_id": order_group_id,
                "client_order_id": client_order_id,
                "side": intent.side,
                "contracts": intent.contracts,
                "template": intent.template,
                "stop_ticks": intent.stop_ticks,
                "target_ticks": intent.target_ticks,
                "ttl_secs": intent.ttl_secs,
            }),
        )?;

        // Stash the entry context now; the fill may arrive before the
        // submit call returns.
        self.open_trade = Some(OpenTrade {
            decision_id: intent.decision_id.clone(),
            order_group_id: order_group_id.clone(),
            ctx,
            side: intent.side,
            qty: intent.contracts,
            entry_price: 0.0,
            entry_ts: now_ts,
            entry_commission: 0.0,
            entry_slippage_ticks: 0.0,
            stop_ticks: intent.stop_ticks,
            target_ticks: intent.target_ticks,
            submit_ts_ms: now_ts * 1000,
            bracket_attach_ms: 0,
            stop: None,
            target: None,
            path_high: f64::MIN,
            path_low: f64::MAX,
            shock_seen: false,
        });
        self.parents.insert(client_order_id.clone(), parent);

        let ticket = OrderTicket {
            decision_id: intent.decision_id.clone(),
            order_group_id,
            client_order_id: client_order_id.clone(),
            instrument: self.cfg.instrument.clone(),
            side: intent.side,
            qty: intent.contracts,
            kind: TicketKind::Entry,
            price: match intent.entry {
                EntryType::Market => None,
                EntryType::Limit(px) => Some(px),
            },
        };
        let submit = timeout(
            Duration::from_millis(self.cfg.ack_timeout_ms),
            self.adapter.submit(ticket),
        )
        .await;
        match submit {
            Ok(Ok(ack)) => {
                json_log(
                    Domain::Exec,
                    "submit_sent",
                    obj(&[
                        ("client_order_id", v_str(&client_order_id)),
                        ("venue_order_id", v_str(&ack.order_id)),
                        ("status", v_str("request_acknowledged")),
                    ]),
                );
            }
            Ok(Err(err)) => {
                // No acknowledgement inside the budget. The venue may or
                // may not have the order: cancel, never resubmit;
                // reconciliation resolves whatever remains.
                json_log(
                    Domain::Exec,
                    "submit_unacked",
                    obj(&[
                        ("client_order_id", v_str(&client_order_id)),
                        ("error", v_str(&err.to_string())),
                        ("action", v_str("cancel_pending")),
                    ]),
                );
                self.open_trade = None;
                let _ = self.cancel_with_retry(&client_order_id).await;
                if let Some(parent) = self.parents.get_mut(&client_order_id) {
                    parent.cancel_requested = true;
                }
            }
            Err(_elapsed) => {
                json_log(
                    Domain::Exec,
                    "submit_timeout",
                    obj(&[
                        ("client_order_id", v_str(&client_order_id)),
                        ("budget_ms", v_num(self.cfg.ack_timeout_ms as f64)),
                        ("action", v_str("cancel_pending")),
                    ]),
                );
                self.open_trade = None;
                let _ = self.cancel_with_retry(&client_order_id).await;
                if let Some(parent) = self.parents.get_mut(&client_order_id) {
                    parent.cancel_requested = true;
                }
            }
        }
        Ok(())
    }

    /// Apply one adapter-delivered event. Called serially, in delivery
    /// order; anything that does not fit the state machine is logged and
    /// discarded.
    pub async fn on_adapter_event(&mut self, event: AdapterEvent, store: &mut EventStore) -> Result<()> {
        match event {
            AdapterEvent::OrderState { order_id, client_order_id, state, reason } => {
                let sm_event = match state {
                    VenueOrderState::Acked => OrderEvent::Ack { venue_order_id: order_id },
                    VenueOrderState::Rejected => OrderEvent::Reject {
                        reason: reason.unwrap_or_else(|| "venue_reject".to_string()),
                    },
                    VenueOrderState::Canceled => OrderEvent::CancelAck,
                };
                self.route_event(&client_order_id, sm_event, store).await?;
            }
            AdapterEvent::ExecutionReport {
                client_order_id,
                fill_id,
                filled_qty,
                fill_price,
                commission,
                slippage_ticks,
                ts,
                ..
            } => {
                log_fill(&client_order_id, &fill_id, filled_qty as f64, fill_price, commission);
                self.append(
                    store,
                    ts,
                    EventKind::FillRecorded,
                    json!({
                        "client_order_id": client_order_id,
                        "fill_id": fill_id,
                        "qty": filled_qty,
                        "price": fill_price,
                        "commission": commission,
                        "slippage_ticks": slippage_ticks,
                    }),
                )?;
                let sm_event = OrderEvent::Fill {
                    fill_id,
                    qty: filled_qty,
                    price: fill_price,
                    commission,
                };
                self.route_fill(&client_order_id, sm_event, slippage_ticks, ts, store).await?;
            }
            AdapterEvent::PositionSnapshot { qty, .. } => {
                json_log(Domain::Reconcile, "position_snapshot", obj(&[("qty", json!(qty))]));
            }
            AdapterEvent::Disconnected { reason } => {
                json_log(Domain::System, "adapter_disconnected", obj(&[("reason", v_str(&reason))]));
            }
        }
        Ok(())
    }

    fn apply_to_core(&self, core: &mut OrderCore, event: OrderEvent) -> Option<Applied> {
        match apply_event(core, event) {
            Ok(applied) => {
                if let Applied::Transitioned(prev, next) = applied {
                    log_order_state(&core.client_order_id, prev.as_str(), next.as_str(), "applied");
                }
                Some(applied)
            }
            Err(err) => {
                // Out-of-order or duplicate delivery: record and discard.
                json_log(
                    Domain::Exec,
                    "transition_discarded",
                    obj(&[
                        ("client_order_id", v_str(&core.client_order_id)),
                        ("state", v_str(err.state.as_str())),
                        ("evidence", v_str(err.evidence)),
                    ]),
                );
                None
            }
        }
    }

    async fn route_event(
        &mut self,
        client_order_id: &str,
        event: OrderEvent,
        store: &mut EventStore,
    ) -> Result<()> {
        if let Some(parent) = self.parents.get_mut(client_order_id) {
            let role = parent.role;
            let decision_id = parent.decision_id.clone();
            let mut core = parent.core.clone();
            let applied = self.apply_to_core(&mut core, event);
            if let Some(parent) = self.parents.get_mut(client_order_id) {
                parent.core = core;
            }
            if let Some(Applied::Transitioned(prev, next)) = applied {
                self.append(
                    store,
                    self.now_ms / 1000,
                    EventKind::OrderStateChanged,
                    json!({
                        "client_order_id": client_order_id,
                        "prev": prev.as_str(),
                        "next": next.as_str(),
                    }),
                )?;
                // A rejected or canceled entry that never filled leaves no
                // trade behind.
                if role == ParentRole::Entry
                    && matches!(next, ParentState::Rejected | ParentState::Canceled)
                {
                    if self
                        .open_trade
                        .as_ref()
                        .map(|t| t.decision_id == decision_id && t.entry_price == 0.0)
                        .unwrap_or(false)
                    {
                        self.open_trade = None;
                    }
                }
            }
            return Ok(());
        }
        if let Some(kind) = self.child_index.get(client_order_id).copied() {
            if let Some(trade) = self.open_trade.as_mut() {
                let child = match kind {
                    ChildKind::Stop => trade.stop.as_mut(),
                    ChildKind::Target => trade.target.as_mut(),
                };
                if let Some(child) = child {
                    match apply_event(&mut child.core, event) {
                        Ok(Applied::Transitioned(prev, next)) => {
                            log_order_state(
                                client_order_id,
                                prev.as_str(),
                                next.as_str(),
                                child.kind.as_str(),
                            );
                        }
                        Ok(Applied::Ignored) => {}
                        Err(err) => {
                            json_log(
                                Domain::Exec,
                                "transition_discarded",
                                obj(&[
                                    ("client_order_id", v_str(client_order_id)),
                                    ("leg", v_str(child.kind.as_str())),
                                    ("level", v_num(child.level)),
                                    ("state", v_str(err.state.as_str())),
                                    ("evidence", v_str(err.evidence)),
                                ]),
                            );
                        }
                    }
                }
            }
            return Ok(());
        }
        json_log(
            Domain::Exec,
            "event_unmatched",
            obj(&[("client_order_id", v_str(client_order_id)), ("status", v_str("discarded"))]),
        );
        Ok(())
    }

    async fn route_fill(
        &mut self,
        client_order_id: &str,
        event: OrderEvent,
        slippage_ticks: f64,
        ts: u64,
        store: &mut EventStore,
    ) -> Result<()> {
        // Parent entry or close order fill.
        if let Some(parent) = self.parents.get_mut(client_order_id) {
            let role = parent.role;
            let side = parent.side;
            let mut core = parent.core.clone();
            let applied = self.apply_to_core(&mut core, event);
            let filled = core.state == ParentState::Filled;
            let avg_price = core.avg_fill_price;
            let commission = core.commission;
            let qty = core.qty;
            if let Some(parent) = self.parents.get_mut(client_order_id) {
                parent.core = core;
            }
            if applied.is_none() || !filled {
                return Ok(());
            }
            match role {
                ParentRole::Entry => {
                    self.position += side.sign() * qty as i64;
                    let (stop_level, target_level) = {
                        let Some(trade) = self.open_trade.as_mut() else { return Ok(()) };
                        trade.entry_price = avg_price;
                        trade.entry_ts = ts;
                        trade.entry_commission = commission;
                        trade.entry_slippage_ticks = slippage_ticks;
                        trade.path_high = avg_price;
                        trade.path_low = avg_price;
                        let tick = self.cfg.tick_size;
                        let sign = side.sign() as f64;
                        (
                            avg_price - sign * trade.stop_ticks as f64 * tick,
                            avg_price + sign * trade.target_ticks as f64 * tick,
                        )
                    };
                    self.attach_bracket(stop_level, target_level, ts, store).await?;
                }
                ParentRole::Close => {
                    self.position += side.sign() * qty as i64;
                    self.finish_trade(avg_price, commission, ts, store)?;
                }
            }
            return Ok(());
        }

        // Child (bracket leg) fill.
        if let Some(kind) = self.child_index.get(client_order_id).copied() {
            let mut closed = None;
            if let Some(trade) = self.open_trade.as_mut() {
                let child = match kind {
                    ChildKind::Stop => trade.stop.as_mut(),
                    ChildKind::Target => trade.target.as_mut(),
                };
                if let Some(child) = child {
                    match apply_event(&mut child.core, event) {
                        Ok(Applied::Transitioned(_, ParentState::Filled)) => {
                            closed = Some((
                                child.core.avg_fill_price,
                                child.core.commission,
                                child.core.qty,
                                kind,
                            ));
                        }
                        Ok(_) => {}
                        Err(err) => {
                            json_log(
                                Domain::Exec,
                                "transition_discarded",
                                obj(&[
                                    ("client_order_id", v_str(client_order_id)),
                                    ("state", v_str(err.state.as_str())),
                                    ("evidence", v_str(err.evidence)),
                                ]),
                            );
                        }
                    }
                }
            }
            if let Some((exit_price, exit_commission, qty, filled_kind)) = closed {
                // Closing side is opposite the entry side.
                let closing_sign = -self
                    .open_trade
                    .as_ref()
                    .map(|t| t.side.sign())
                    .unwrap_or(0);
                self.position += closing_sign * qty as i64;
                // One-cancels-other: the sibling goes away with retry.
                let sibling_id = self.sibling_client_id(filled_kind);
                if let Some(sibling_id) = sibling_id {
                    let _ = self.cancel_with_retry(&sibling_id).await;
                }
                self.finish_trade(exit_price, exit_commission, ts, store)?;
            }
            return Ok(());
        }

        json_log(
            Domain::Fill,
            "fill_unmatched",
            obj(&[("client_order_id", v_str(client_order_id)), ("status", v_str("discarded"))]),
        );
        Ok(())
    }

    fn sibling_client_id(&self, filled: ChildKind) -> Option<String> {
        let trade = self.open_trade.as_ref()?;
        let sibling = match filled {
            ChildKind::Stop => trade.target.as_ref(),
            ChildKind::Target => trade.stop.as_ref(),
        }?;
        if sibling.core.state.is_terminal() {
            None
        } else {
            Some(sibling.core.client_order_id.clone())
        }
    }

    /// Attach the OCO bracket after an entry fill. On any attachment
    /// failure the position is closed immediately; a fill without a working
    /// stop is not a state this system holds.
    async fn attach_bracket(
        &mut self,
        stop_level: f64,
        target_level: f64,
        ts: u64,
        store: &mut EventStore,
    ) -> Result<()> {
        let Some((decision_id, group_id, side, qty, submit_ts_ms)) = self
            .open_trade
            .as_ref()
            .map(|t| {
                (
                    t.decision_id.clone(),
                    t.order_group_id.clone(),
                    t.side,
                    t.qty,
                    t.submit_ts_ms,
                )
            })
        else {
            return Ok(());
        };
        let closing_side = side.opposite();
        let mut attached = Vec::new();
        let mut failure: Option<String> = None;
        for (kind, level) in [(ChildKind::Stop, stop_level), (ChildKind::Target, target_level)] {
            let client_id = format!("{}-{}", kind.as_str().to_uppercase(), decision_id);
            let ticket = OrderTicket {
                decision_id: decision_id.clone(),
                order_group_id: group_id.clone(),
                client_order_id: client_id.clone(),
                instrument: self.cfg.instrument.clone(),
                side: closing_side,
                qty,
                kind: match kind {
                    ChildKind::Stop => TicketKind::Stop,
                    ChildKind::Target => TicketKind::Target,
                },
                price: Some(level),
            };
            let result = timeout(
                Duration::from_millis(self.cfg.ack_timeout_ms),
                self.adapter.submit(ticket),
            )
            .await;
            match result {
                Ok(Ok(_ack)) => {
                    let mut core = OrderCore::new(client_id.clone(), qty);
                    let _ = apply_event(&mut core, OrderEvent::SubmitSent);
                    let child = ChildOrder { kind, core, level };
                    self.child_index.insert(client_id.clone(), kind);
                    if let Some(trade) = self.open_trade.as_mut() {
                        match kind {
                            ChildKind::Stop => trade.stop = Some(child),
                            ChildKind::Target => trade.target = Some(child),
                        }
                    }
                    attached.push(client_id);
                }
                Ok(Err(err)) => {
                    failure = Some(err.to_string());
                    break;
                }
                Err(_) => {
                    failure = Some("bracket submit ack timeout".to_string());
                    break;
                }
            }
        }

        let attach_ms = self.now_ms.saturating_sub(submit_ts_ms).max(1);
        if let Some(trade) = self.open_trade.as_mut() {
            trade.bracket_attach_ms = attach_ms;
        }
        self.append(
            store,
            ts,
            EventKind::BracketAttached,
            json!({
                "decision_id": decision_id,
                "order_group_id": group_id,
                "status": if failure.is_none() { "ok" } else { "failed" },
                "attached": attached,
                "error": failure,
                "attach_ms": attach_ms,
            }),
        )?;

        if let Some(err) = failure {
            // Unprotected position: cancel what did attach and flatten.
            json_log(
                Domain::Exec,
                "bracket_attach_failed",
                obj(&[
                    ("decision_id", v_str(&decision_id)),
                    ("error", v_str(&err)),
                    ("action", v_str("flatten_entry")),
                ]),
            );
            for client_id in attached {
                let _ = self.cancel_with_retry(&client_id).await;
            }
            self.close_position("bracket_attach_failed", ts, store).await?;
        }
        Ok(())
    }

    /// Submit a market order closing the open position (decision-driven
    /// exit, session flatten, or bracket failure).
    pub async fn close_position(
        &mut self,
        reason: &str,
        ts: u64,
        store: &mut EventStore,
    ) -> Result<()> {
        if self.position == 0 {
            return Ok(());
        }
        let Some(trade) = self.open_trade.as_ref() else {
            // Position with no tracked trade: emergency-only path.
            return self.emergency_flatten(reason, ts, store).await;
        };
        let decision_id = trade.decision_id.clone();
        let group_id = trade.order_group_id.clone();
        let closing_side = trade.side.opposite();
        let qty = self.position.unsigned_abs() as u32;

        // Children first so the close cannot race its own bracket.
        for client_id in [
            trade.stop.as_ref().map(|c| c.core.client_order_id.clone()),
            trade.target.as_ref().map(|c| c.core.client_order_id.clone()),
        ]
        .into_iter()
        .flatten()
        {
            let _ = self.cancel_with_retry(&client_id).await;
        }

        let client_id = format!("X-{}", decision_id);
        if self.parents.contains_key(&client_id) {
            return Ok(()); // close already in flight
        }
        let mut parent = ParentOrder {
            core: OrderCore::new(client_id.clone(), qty),
            role: ParentRole::Close,
            decision_id: decision_id.clone(),
            order_group_id: group_id.clone(),
            side: closing_side,
            placed_ts: ts,
            ttl_secs: self.cfg.order_ttl_secs,
            cancel_requested: false,
        };
        self.apply_to_core(&mut parent.core, OrderEvent::SubmitSent);
        self.parents.insert(client_id.clone(), parent);
        self.append(
            store,
            ts,
            EventKind::OrderSubmitted,
            json!({
                "decision_id": decision_id,
                "order_group_id": group_id,
                "client_order_id": client_id,
                "side": closing_side,
                "contracts": qty,
                "role": "close",
                "reason": reason,
            }),
        )?;
        let ticket = OrderTicket {
            decision_id,
            order_group_id: group_id,
            client_order_id: client_id.clone(),
            instrument: self.cfg.instrument.clone(),
            side: closing_side,
            qty,
            kind: TicketKind::Entry,
            price: None,
        };
        let submit = timeout(
            Duration::from_millis(self.cfg.ack_timeout_ms),
            self.adapter.submit(ticket),
        )
        .await;
        if !matches!(submit, Ok(Ok(_))) {
            // A close that cannot be placed is a consistency emergency.
            return self.emergency_flatten("close_submit_failed", ts, store).await;
        }
        Ok(())
    }

    /// Venue-side flatten plus local halt bookkeeping. Used when normal
    /// order flow cannot be trusted anymore.
    async fn emergency_flatten(&mut self, reason: &str, ts: u64, store: &mut EventStore) -> Result<()> {
        let _ = retry_async(
            &RetryConfig { max_retries: self.cfg.cancel_max_retries, ..Default::default() },
            "flatten",
            || {
                let adapter = self.adapter.clone();
                let account = self.cfg.account_id.clone();
                async move { adapter.flatten(&account).await }
            },
        )
        .await;
        self.position = 0;
        self.open_trade = None;
        self.child_index.clear();
        self.append(store, ts, EventKind::SessionExit, json!({
            "scope": "emergency_flatten",
            "reason": reason,
            "last_mark": self.last_mark,
        }))?;
        Ok(())
    }

    /// Build and queue the TradeOutcome once the position is flat.
    fn finish_trade(
        &mut self,
        exit_price: f64,
        exit_commission: f64,
        exit_ts: u64,
        store: &mut EventStore,
    ) -> Result<()> {
        let Some(trade) = self.open_trade.take() else { return Ok(()) };
        // Remove child routing for this trade.
        self.child_index.clear();

        let point_value = self.cfg.tick_value / self.cfg.tick_size;
        let sign = trade.side.sign() as f64;
        let gross = (exit_price - trade.entry_price) * sign * trade.qty as f64 * point_value;
        let commission = trade.entry_commission + exit_commission;
        let realized_pnl = gross - commission;

        let tick = self.cfg.tick_size;
        let (mfe_ticks, mae_ticks) = if trade.side == Side::Long {
            (
                ((trade.path_high - trade.entry_price) / tick).max(0.0),
                ((trade.entry_price - trade.path_low) / tick).max(0.0),
            )
        } else {
            (
                ((trade.entry_price - trade.path_low) / tick).max(0.0),
                ((trade.path_high - trade.entry_price) / tick).max(0.0),
            )
        };

        let outcome = TradeOutcome {
            trade_id: format!("T-{}", trade.decision_id),
            decision_id: trade.decision_id.clone(),
            template: trade.ctx.template,
            regime: trade.ctx.regime,
            time_bucket: trade.ctx.time_bucket,
            side: trade.side,
            contracts: trade.qty,
            entry_price: trade.entry_price,
            exit_price,
            entry_ts: trade.entry_ts,
            exit_ts,
            realized_pnl,
            commission,
            stop_ticks: trade.stop_ticks,
            target_ticks: trade.target_ticks,
            expected_slippage_ticks: trade.ctx.expected_slippage_ticks,
            realized_slippage_ticks: trade.entry_slippage_ticks,
            spread_ticks_at_entry: trade.ctx.spread_ticks,
            bracket_attach_ms: trade.bracket_attach_ms,
            mfe_ticks,
            mae_ticks,
            exogenous_shock: trade.shock_seen,
            entry_probability: trade.ctx.probability,
            entry_stability: trade.ctx.stability,
            entry_dvs: trade.ctx.dvs,
            entry_eqs: trade.ctx.eqs,
            euc_at_entry: trade.ctx.euc,
        };
        self.append(store, exit_ts, EventKind::TradeClosed, serde_json::to_value(&outcome)?)?;
        json_log(
            Domain::Exec,
            "trade_closed",
            obj(&[
                ("trade_id", v_str(&outcome.trade_id)),
                ("pnl", v_num(outcome.realized_pnl)),
                ("exit_price", v_num(exit_price)),
            ]),
        );
        self.outcomes.push(outcome);
        Ok(())
    }

    /// Replace the working stop with a tighter one (decision-driven
    /// MODIFY). Cancel-then-replace; on replace failure the position is
    /// closed rather than left with no stop.
    pub async fn modify_stop(
        &mut self,
        new_stop_ticks: u32,
        ts: u64,
        store: &mut EventStore,
    ) -> Result<()> {
        let Some((decision_id, group_id, side, qty, entry_price, old_client_id)) =
            self.open_trade.as_ref().and_then(|t| {
                t.stop.as_ref().map(|s| {
                    (
                        t.decision_id.clone(),
                        t.order_group_id.clone(),
                        t.side,
                        t.qty,
                        t.entry_price,
                        s.core.client_order_id.clone(),
                    )
                })
            })
        else {
            return Ok(());
        };
        let level =
            entry_price - side.sign() as f64 * new_stop_ticks as f64 * self.cfg.tick_size;
        let _ = self.cancel_with_retry(&old_client_id).await;
        self.child_index.remove(&old_client_id);

        let client_id = format!("STOP-{}-{}", decision_id, new_stop_ticks);
        let ticket = OrderTicket {
            decision_id: decision_id.clone(),
            order_group_id: group_id.clone(),
            client_order_id: client_id.clone(),
            instrument: self.cfg.instrument.clone(),
            side: side.opposite(),
            qty,
            kind: TicketKind::Stop,
            price: Some(level),
        };
        let result = timeout(
            Duration::from_millis(self.cfg.ack_timeout_ms),
            self.adapter.submit(ticket),
        )
        .await;
        match result {
            Ok(Ok(_ack)) => {
                let mut core = OrderCore::new(client_id.clone(), qty);
                let _ = apply_event(&mut core, OrderEvent::SubmitSent);
                self.child_index.insert(client_id.clone(), ChildKind::Stop);
                if let Some(trade) = self.open_trade.as_mut() {
                    trade.stop = Some(ChildOrder { kind: ChildKind::Stop, core, level });
                    trade.stop_ticks = new_stop_ticks;
                }
                self.append(
                    store,
                    ts,
                    EventKind::OrderStateChanged,
                    json!({
                        "client_order_id": client_id,
                        "scope": "stop_modified",
                        "new_stop_ticks": new_stop_ticks,
                        "level": level,
                    }),
                )?;
            }
            _ => {
                json_log(
                    Domain::Exec,
                    "stop_replace_failed",
                    obj(&[("decision_id", v_str(&decision_id)), ("action", v_str("flatten"))]),
                );
                self.close_position("stop_replace_failed", ts, store).await?;
            }
        }
        Ok(())
    }

    /// Cancel unfilled parents past their time budget. The cancel itself is
    /// retried with backoff and is idempotent at the venue.
    pub async fn sweep_ttl(&mut self, now_ts: u64, store: &mut EventStore) -> Result<()> {
        let expired: Vec<String> = self
            .parents
            .iter()
            .filter(|(_, p)| {
                !p.core.state.is_terminal()
                    && p.core.filled_qty == 0
                    && !p.cancel_requested
                    && now_ts.saturating_sub(p.placed_ts) >= p.ttl_secs
            })
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in expired {
            let group_id = self
                .parents
                .get(&client_id)
                .map(|p| p.order_group_id.clone())
                .unwrap_or_default();
            json_log(
                Domain::Exec,
                "ttl_cancel",
                obj(&[
                    ("client_order_id", v_str(&client_id)),
                    ("order_group_id", v_str(&group_id)),
                    ("status", v_str("requested")),
                ]),
            );
            if self.cancel_with_retry(&client_id).await.is_ok() {
                if let Some(parent) = self.parents.get_mut(&client_id) {
                    parent.cancel_requested = true;
                    let mut core = parent.core.clone();
                    let applied = self.apply_to_core(&mut core, OrderEvent::CancelOnTimeout);
                    if let Some(parent) = self.parents.get_mut(&client_id) {
                        parent.core = core;
                        if applied.is_some() && parent.role == ParentRole::Entry {
                            // The entry never filled; drop the provisional trade.
                            if self
                                .open_trade
                                .as_ref()
                                .map(|t| t.decision_id == parent.decision_id && t.entry_price == 0.0)
                                .unwrap_or(false)
                            {
                                self.open_trade = None;
                            }
                        }
                    }
                    self.append(
                        store,
                        now_ts,
                        EventKind::OrderStateChanged,
                        json!({
                            "client_order_id": client_id,
                            "next": "CANCELED",
                            "evidence": "ttl_timeout",
                        }),
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn cancel_with_retry(&self, client_order_id: &str) -> Result<()> {
        let retry_cfg = RetryConfig {
            max_retries: self.cfg.cancel_max_retries,
            base_delay_ms: 50,
            ..Default::default()
        };
        let adapter = self.adapter.clone();
        let id = client_order_id.to_string();
        retry_async(&retry_cfg, "cancel_order", || {
            let adapter = adapter.clone();
            let id = id.clone();
            async move {
                let ack = adapter.cancel(&id).await?;
                if ack.accepted {
                    Ok(())
                } else {
                    Err(anyhow!("cancel rejected: {:?}", ack.reason))
                }
            }
        })
        .await
    }

    /// Interval reconciliation: compare expected position against venue
    /// truth. Any drift past tolerance trips the kill switch, flattens, and
    /// halts new submissions until an operator resets.
    pub async fn run_reconcile(&mut self, now_ts: u64, store: &mut EventStore) -> Result<()> {
        let snap = match self.adapter.snapshot().await {
            Ok(snap) => snap,
            Err(err) => {
                json_log(
                    Domain::Reconcile,
                    "snapshot_error",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                return Ok(());
            }
        };
        match compare(self.position, &snap, self.cfg.reconcile_tolerance) {
            ReconcileOutcome::Clean => {
                self.archive_terminal_orders();
                Ok(())
            }
            ReconcileOutcome::Mismatch { expected, reported, drift } => {
                self.append(
                    store,
                    now_ts,
                    EventKind::ReconcileMismatch,
                    json!({
                        "expected": expected,
                        "reported": reported,
                        "drift": drift,
                    }),
                )?;
                self.trip_kill("reconcile_mismatch", now_ts, store)?;
                self.emergency_flatten("reconcile_mismatch", now_ts, store).await?;
                self.append(
                    store,
                    now_ts,
                    EventKind::Halt,
                    json!({
                        "reason": "reconcile_mismatch",
                        "expected": expected,
                        "reported": reported,
                    }),
                )?;
                Ok(())
            }
        }
    }

    /// Terminal orders whose venue truth has been confirmed by a clean
    /// reconcile pass move to Done and can be archived.
    fn archive_terminal_orders(&mut self) {
        self.parents.retain(|_, p| {
            if p.core.state.is_terminal() {
                p.core.state = ParentState::Done;
                false
            } else {
                true
            }
        });
    }

    pub fn trip_kill(&mut self, reason: &str, now_ts: u64, store: &mut EventStore) -> Result<()> {
        if let Some(payload) = self.kill.trip(reason, now_ts) {
            self.append(store, now_ts, EventKind::KillSwitchTripped, payload)?;
        }
        Ok(())
    }

    /// Operator reset, first half. Requires a reason and an identity.
    pub fn request_kill_reset(
        &mut self,
        operator: &str,
        reason: &str,
        now_ts: u64,
        store: &mut EventStore,
    ) -> Result<bool> {
        match self.kill.request_reset(operator, reason, now_ts) {
            Some(payload) => {
                self.append(store, now_ts, EventKind::KillSwitchReset, payload)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Operator reset, second half: re-arm.
    pub fn confirm_kill_reset(
        &mut self,
        operator: &str,
        now_ts: u64,
        store: &mut EventStore,
    ) -> Result<bool> {
        match self.kill.confirm_reset(operator, now_ts) {
            Some(payload) => {
                self.append(store, now_ts, EventKind::KillSwitchReset, payload)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

