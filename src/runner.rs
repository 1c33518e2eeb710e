//! The runner: one decision cycle per bar, serial adapter-event
//! application, interval reconciliation, and the thin administrative
//! surface.
//!
//! Error routing follows the taxonomy: gate and adapter failures are
//! handled locally and recorded as events; state-consistency failures trip
//! the kill switch inside the supervisor; store corruption propagates out
//! of `run_cycle` so the caller can halt new decisions while continuing to
//! drain and log adapter events.

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::adapter::AdapterEvent;
use crate::beliefs::{Bar, BeliefSnapshot, FeatureVector, SignalQuality};
use crate::config::Config;
use crate::decision::session::SessionClock;
use crate::decision::{Action, AccountState, CycleInput, DecisionEngine, DecisionRecord};
use crate::events::{Event, EventKind};
use crate::exec::kill_switch::KillSwitch;
use crate::exec::{EntryContext, ExecutionSupervisor};
use crate::learning::reliability::ReliabilityBook;
use crate::learning::{ts_rfc3339, LearningLoop};
use crate::logging::{json_log, obj, v_num, v_str, Domain};
use crate::regime::{RegimeBucket, TimeBucket};
use crate::store::EventStore;

/// One line of the cycle feed: everything external collaborators hand us
/// for a single bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub bar: Bar,
    #[serde(default)]
    pub features: FeatureVector,
    pub quality: SignalQuality,
    #[serde(default)]
    pub beliefs: BeliefSnapshot,
}

/// Administrative surface consumed between cycles.
#[derive(Debug, Clone)]
pub enum AdminCommand {
    TripKillSwitch { operator: String, reason: String },
    RequestKillReset { operator: String, reason: String },
    ConfirmKillReset { operator: String },
    QueryReliability,
    TriggerReconcile,
}

#[derive(Debug, Clone)]
struct AccountTracker {
    equity: f64,
    realized_pnl_today: f64,
    trades_today: u32,
    consecutive_losses: u32,
    trade_day: u64,
}

impl AccountTracker {
    fn new(initial_equity: f64) -> Self {
        Self {
            equity: initial_equity,
            realized_pnl_today: 0.0,
            trades_today: 0,
            consecutive_losses: 0,
            trade_day: 0,
        }
    }

    fn roll_day(&mut self, ts: u64) {
        let day = ts / 86_400;
        if self.trade_day != day {
            self.trade_day = day;
            self.realized_pnl_today = 0.0;
            self.trades_today = 0;
        }
    }

    fn on_trade_closed(&mut self, pnl: f64, ts: u64) {
        self.roll_day(ts);
        self.equity += pnl;
        self.realized_pnl_today += pnl;
        self.trades_today += 1;
        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }
    }
}

pub struct Runner {
    cfg: Config,
    config_hash: String,
    store: EventStore,
    engine: DecisionEngine,
    supervisor: ExecutionSupervisor,
    learning: LearningLoop,
    book: Arc<RwLock<ReliabilityBook>>,
    events_rx: mpsc::Receiver<AdapterEvent>,
    clock: SessionClock,
    account: AccountTracker,
    last_reconcile_ts: u64,
}

impl Runner {
    pub fn new(
        cfg: Config,
        store: EventStore,
        supervisor: ExecutionSupervisor,
        book: Arc<RwLock<ReliabilityBook>>,
        events_rx: mpsc::Receiver<AdapterEvent>,
    ) -> Self {
        let config_hash = cfg.config_hash();
        let engine = DecisionEngine::new(cfg.clone());
        let learning = LearningLoop::new(&cfg, book.clone());
        let clock = SessionClock::from_config(&cfg);
        let account = AccountTracker::new(cfg.initial_equity);
        Self {
            cfg,
            config_hash,
            store,
            engine,
            supervisor,
            learning,
            book,
            events_rx,
            clock,
            account,
            last_reconcile_ts: 0,
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn supervisor(&self) -> &ExecutionSupervisor {
        &self.supervisor
    }

    /// Recover persisted state and reconcile against the venue before the
    /// first cycle. Intents are refused until this has run.
    pub async fn startup(&mut self, now_ts: u64) -> Result<()> {
        // Kill switch: latest persisted transition wins.
        let mut kill_events =
            self.store
                .query(&self.cfg.stream_id, Some(EventKind::KillSwitchTripped), None)?;
        kill_events.extend(self.store.query(
            &self.cfg.stream_id,
            Some(EventKind::KillSwitchReset),
            None,
        )?);
        kill_events.sort_by(|a, b| a.ts.cmp(&b.ts));
        if let Some(last) = kill_events.last() {
            let restored = KillSwitch::restore(&last.payload);
            json_log(
                Domain::System,
                "kill_switch_recovered",
                obj(&[("state", v_str(restored.state().as_str()))]),
            );
            self.supervisor.restore_kill_switch(restored);
        }

        // Reliability book: latest snapshot event.
        let snapshots = self
            .store
            .query(&self.cfg.stream_id, Some(EventKind::ReliabilitySnapshot), None)?;
        if let Some(last) = snapshots.last() {
            let mut book = self
                .book
                .write()
                .map_err(|_| anyhow!("reliability book lock poisoned"))?;
            book.restore(&last.payload);
            json_log(
                Domain::System,
                "reliability_recovered",
                obj(&[("keys", v_num(book.len() as f64))]),
            );
        }

        self.supervisor.startup_reconcile(&mut self.store, now_ts).await?;
        json_log(Domain::System, "startup_complete", obj(&[("ts", json!(now_ts))]));
        Ok(())
    }

    /// Apply queued adapter events in delivery order. Safe to call while
    /// decisions are halted; the book of record keeps moving.
    pub async fn drain_adapter_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            self.supervisor.on_adapter_event(event, &mut self.store).await?;
        }
        Ok(())
    }

    fn time_bucket(&self, ts: u64) -> TimeBucket {
        TimeBucket::classify(
            SessionClock::minute_of_day(ts),
            self.clock.open_min(),
            self.clock.close_min(),
        )
    }

    /// One full cycle for one bar. Returns the decision record; errors are
    /// store-level only (corruption), which the caller treats as fatal to
    /// trading.
    pub async fn run_cycle(&mut self, cycle: &CycleRecord) -> Result<DecisionRecord> {
        let ts = cycle.bar.ts;
        self.account.roll_day(ts);
        self.drain_adapter_events().await?;

        let account_state = AccountState {
            equity: self.account.equity,
            realized_pnl_today: self.account.realized_pnl_today,
            trades_today: self.account.trades_today,
            consecutive_losses: self.account.consecutive_losses,
            open_position: self.supervisor.expected_position(),
            open_stop_ticks: self.supervisor.open_stop_ticks(),
        };
        let input = CycleInput {
            bar: &cycle.bar,
            features: &cycle.features,
            quality: cycle.quality,
            beliefs: &cycle.beliefs,
            account: &account_state,
        };
        let record = {
            let book = self
                .book
                .read()
                .map_err(|_| anyhow!("reliability book lock poisoned"))?;
            self.engine.decide(&input, self.supervisor.is_armed(), &book)
        };

        // The record is persisted before any execution side effect.
        self.append(ts, EventKind::DecisionRecorded, record.to_payload())?;
        json_log(
            Domain::Decision,
            "decision",
            obj(&[
                ("decision_id", v_str(&record.decision_id)),
                ("action", v_str(&format!("{:?}", record.action))),
                ("summary", v_str(&record.summary)),
            ]),
        );

        let shock = self.engine.regime() == RegimeBucket::Shock;
        self.supervisor.on_bar(cycle.bar.c, ts, shock);

        match record.action {
            Action::Enter => {
                if let Some(intent) = record.intent.as_ref() {
                    let ctx = self.entry_context(&record, cycle, ts);
                    self.supervisor
                        .submit_intent(intent, ctx, ts, &mut self.store)
                        .await?;
                }
            }
            Action::Exit => {
                self.supervisor
                    .close_position("decision_exit", ts, &mut self.store)
                    .await?;
            }
            Action::SessionExitFlatten => {
                self.append(
                    ts,
                    EventKind::SessionExit,
                    json!({
                        "decision_id": record.decision_id,
                        "position": account_state.open_position,
                    }),
                )?;
                self.supervisor
                    .close_position("session_exit", ts, &mut self.store)
                    .await?;
            }
            Action::Modify => {
                if let Some(stop_ticks) = record.modify_stop_ticks {
                    self.supervisor
                        .modify_stop(stop_ticks, ts, &mut self.store)
                        .await?;
                }
            }
            Action::Halt => {
                self.append(
                    ts,
                    EventKind::Halt,
                    json!({
                        "decision_id": record.decision_id,
                        "reason": "engine_internal_error",
                    }),
                )?;
            }
            Action::Hold | Action::Skip => {}
        }

        // Fills and bracket events triggered by this cycle's submissions.
        self.drain_adapter_events().await?;
        self.supervisor.sweep_ttl(ts, &mut self.store).await?;

        for outcome in self.supervisor.drain_outcomes() {
            self.account.on_trade_closed(outcome.realized_pnl, outcome.exit_ts);
            self.learning.on_trade_closed(&outcome, &mut self.store)?;
        }

        if ts.saturating_sub(self.last_reconcile_ts) >= self.cfg.reconcile_secs {
            self.last_reconcile_ts = ts;
            self.supervisor.run_reconcile(ts, &mut self.store).await?;
        }
        Ok(record)
    }

    fn entry_context(&self, record: &DecisionRecord, cycle: &CycleRecord, ts: u64) -> EntryContext {
        let template = record.template.unwrap_or(crate::decision::templates::Template::K2RangeFade);
        let belief = cycle
            .beliefs
            .beliefs
            .iter()
            .find(|b| b.constraint_id == template.constraint_id());
        EntryContext {
            template,
            regime: record.regime,
            time_bucket: self.time_bucket(ts),
            probability: belief.map(|b| b.probability).unwrap_or(0.0),
            stability: belief.map(|b| b.stability).unwrap_or(0.0),
            dvs: cycle.quality.dvs,
            eqs: cycle.quality.eqs,
            euc: record.euc.unwrap_or(crate::decision::euc::EucScore {
                edge: 0.0,
                uncertainty: 0.0,
                cost: 0.0,
                score: 0.0,
                effective_threshold: 0.0,
            }),
            expected_slippage_ticks: self.cfg.est_slippage_ticks,
            spread_ticks: self.cfg.est_spread_ticks,
        }
    }

    fn append(&mut self, ts: u64, kind: EventKind, payload: serde_json::Value) -> Result<()> {
        let event = Event::new(
            &self.cfg.stream_id,
            &ts_rfc3339(ts),
            kind,
            payload,
            &self.config_hash,
        );
        self.store.append(&event)?;
        Ok(())
    }

    /// Administrative surface. Processed between cycles, never mid-cycle.
    pub async fn handle_admin(&mut self, cmd: AdminCommand, now_ts: u64) -> Result<()> {
        match cmd {
            AdminCommand::TripKillSwitch { operator, reason } => {
                json_log(
                    Domain::System,
                    "admin_trip",
                    obj(&[("operator", v_str(&operator)), ("reason", v_str(&reason))]),
                );
                self.supervisor.trip_kill(&reason, now_ts, &mut self.store)?;
            }
            AdminCommand::RequestKillReset { operator, reason } => {
                let ok = self
                    .supervisor
                    .request_kill_reset(&operator, &reason, now_ts, &mut self.store)?;
                json_log(
                    Domain::System,
                    "admin_reset_request",
                    obj(&[
                        ("operator", v_str(&operator)),
                        ("accepted", serde_json::Value::Bool(ok)),
                    ]),
                );
            }
            AdminCommand::ConfirmKillReset { operator } => {
                let ok = self
                    .supervisor
                    .confirm_kill_reset(&operator, now_ts, &mut self.store)?;
                json_log(
                    Domain::System,
                    "admin_reset_confirm",
                    obj(&[
                        ("operator", v_str(&operator)),
                        ("accepted", serde_json::Value::Bool(ok)),
                    ]),
                );
            }
            AdminCommand::QueryReliability => {
                let book = self
                    .book
                    .read()
                    .map_err(|_| anyhow!("reliability book lock poisoned"))?;
                json_log(
                    Domain::System,
                    "admin_reliability",
                    obj(&[("snapshot", book.snapshot_payload())]),
                );
            }
            AdminCommand::TriggerReconcile => {
                self.supervisor.run_reconcile(now_ts, &mut self.store).await?;
            }
        }
        Ok(())
    }
}
