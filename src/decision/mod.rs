//! The decision engine: a strictly ordered gate hierarchy in front of an
//! Edge/Uncertainty/Cost scorer and capital-tier sizing.
//!
//! One DecisionRecord is emitted per cycle, trade or no trade. Gate
//! failures are expected and fully explained; engine-internal errors
//! produce a `Halt` decision, never a silent skip.

pub mod euc;
pub mod gates;
pub mod session;
pub mod templates;
pub mod tiers;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::beliefs::{Bar, BeliefSnapshot, DecayState, FeatureVector, SignalQuality};
use crate::config::Config;
use crate::learning::reliability::ReliabilityBook;
use crate::regime::{RegimeBucket, RegimeConfig, RegimeTracker, TimeBucket};

use euc::{EucInputs, EucScore};
use gates::{GateFailure, ReasonCode};
use session::SessionClock;
use templates::Template;
use tiers::CapitalTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Enter,
    Hold,
    Exit,
    Modify,
    Skip,
    Halt,
    SessionExitFlatten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn sign(&self) -> i64 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EntryType {
    Market,
    Limit(f64),
}

/// Ephemeral output of the engine; the execution supervisor turns it into
/// a parent order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub decision_id: String,
    pub template: Template,
    pub side: Side,
    pub contracts: u32,
    pub entry: EntryType,
    pub stop_ticks: u32,
    pub target_ticks: u32,
    pub ttl_secs: u64,
}

/// Account and position state as seen at the start of the cycle.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub equity: f64,
    pub realized_pnl_today: f64,
    pub trades_today: u32,
    pub consecutive_losses: u32,
    /// Signed contracts currently held
    pub open_position: i64,
    pub open_stop_ticks: Option<u32>,
}

/// Read-only inputs for one cycle. Produced upstream; never recomputed.
#[derive(Debug, Clone)]
pub struct CycleInput<'a> {
    pub bar: &'a Bar,
    pub features: &'a FeatureVector,
    pub quality: SignalQuality,
    pub beliefs: &'a BeliefSnapshot,
    pub account: &'a AccountState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupScore {
    pub constraint_id: String,
    pub template: Template,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub decision_id: String,
    pub ts: u64,
    pub action: Action,
    pub template: Option<Template>,
    pub tier: CapitalTier,
    pub regime: RegimeBucket,
    pub setup_scores: Vec<SetupScore>,
    pub euc: Option<EucScore>,
    pub reasons: Vec<ReasonCode>,
    pub summary: String,
    #[serde(skip)]
    pub intent: Option<OrderIntent>,
    /// New protective stop distance when action is Modify
    pub modify_stop_ticks: Option<u32>,
}

impl DecisionRecord {
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub struct DecisionEngine {
    cfg: Config,
    clock: SessionClock,
    regime: RegimeTracker,
    decision_seq: u64,
}

impl DecisionEngine {
    pub fn new(cfg: Config) -> Self {
        let clock = SessionClock::from_config(&cfg);
        Self {
            cfg,
            clock,
            regime: RegimeTracker::new(RegimeConfig::default()),
            decision_seq: 0,
        }
    }

    pub fn regime(&self) -> RegimeBucket {
        self.regime.classify()
    }

    /// Run one decision cycle. Always returns a record; the caller persists
    /// it and routes the action.
    pub fn decide(
        &mut self,
        input: &CycleInput<'_>,
        kill_armed: bool,
        reliability: &ReliabilityBook,
    ) -> DecisionRecord {
        self.regime.on_bar(input.bar);
        self.decision_seq += 1;
        let decision_id = format!("D-{}-{}", input.bar.ts, self.decision_seq);
        let now_ts = input.bar.ts;
        let regime = self.regime.classify();
        let tier = CapitalTier::classify(input.account.equity);

        let mut record = DecisionRecord {
            decision_id: decision_id.clone(),
            ts: now_ts,
            action: Action::Skip,
            template: None,
            tier,
            regime,
            setup_scores: Vec::new(),
            euc: None,
            reasons: Vec::new(),
            summary: String::new(),
            intent: None,
            modify_stop_ticks: None,
        };

        // Malformed inputs are engine-internal errors, not gate failures.
        if !input.features.is_well_formed()
            || (!input.beliefs.is_empty() && !input.beliefs.is_well_formed())
            || !(input.bar.c.is_finite() && input.bar.c > 0.0)
        {
            record.action = Action::Halt;
            record.reasons.push(ReasonCode::InternalError);
            record.summary = "malformed cycle input; halting cycle".to_string();
            return record;
        }

        // Session-exit rule runs every cycle, independent of the gate chain,
        // and overrides any other decision while a position is open.
        if self.clock.in_flatten_window(now_ts) && input.account.open_position != 0 {
            record.action = Action::SessionExitFlatten;
            record.reasons.push(ReasonCode::SessionCloseWindow);
            record.summary = format!(
                "{} min to close with open position {}; forcing flatten",
                self.clock.minutes_to_close(now_ts),
                input.account.open_position
            );
            return record;
        }

        // Gates 1-4 need no candidate template.
        if let Err(fail) = gates::check_kill_switch(kill_armed)
            .and_then(|_| gates::check_constitutional(&self.cfg, input.account))
            .and_then(|_| gates::check_quality(&self.cfg, input, now_ts))
            .and_then(|_| gates::check_session(&self.clock, now_ts))
        {
            return self.skip(record, fail);
        }

        // Score every template against the belief vector, then pick the
        // best non-quarantined candidate.
        let time_bucket = TimeBucket::classify(
            SessionClock::minute_of_day(now_ts),
            self.clock.open_min(),
            self.clock.close_min(),
        );
        record.setup_scores = setup_scores(input.beliefs);
        let (candidate, saw_quarantined) =
            select_template(&record.setup_scores, reliability, regime, time_bucket);
        let Some(candidate) = candidate else {
            let reason = if saw_quarantined { ReasonCode::Quarantined } else { ReasonCode::NoTemplate };
            let fail = GateFailure { reason, gate: "template_selection", value: 0.0, threshold: 0.0 };
            return self.skip(record, fail);
        };
        record.template = Some(candidate.template);

        // Gates 5-8 evaluate the candidate.
        let params = candidate.template.params();
        let belief = input
            .beliefs
            .beliefs
            .iter()
            .find(|b| b.constraint_id == candidate.constraint_id);
        let (stability, decayed, probability) = match belief {
            Some(b) => (b.stability, b.decay_state == DecayState::Stale, b.probability),
            None => (0.0, true, 0.0),
        };
        let friction = self.friction_estimate();
        let expected_move = params.expected_move_ticks * self.cfg.tick_value;
        if let Err(fail) = gates::check_regime(candidate.template, regime)
            .and_then(|_| gates::check_tier(tier, candidate.template))
            .and_then(|_| gates::check_belief_stability(&self.cfg, stability, decayed))
            .and_then(|_| gates::check_friction(&self.cfg, friction, expected_move))
        {
            return self.skip(record, fail);
        }

        // Gate 9: template execution. EUC scoring plus sizing.
        let throttle = reliability.health(candidate.template, regime, time_bucket).throttle;
        let expected_return = params.target_ticks as f64 * self.cfg.tick_size / input.bar.c;
        let inputs = EucInputs {
            expected_return,
            lower_bound_probability: probability * stability,
            dvs: input.quality.dvs,
            eqs: input.quality.eqs,
            belief_stability: stability,
            friction,
            expected_move,
        };
        let score = euc::score(&self.cfg, &inputs, throttle);
        record.euc = Some(score);

        let side = self.direction_for(candidate.template);

        // With a position on, the engine only manages it: exit against a
        // strong opposite setup, tighten the stop on a tighter same-side
        // setup, otherwise hold.
        if input.account.open_position != 0 {
            let holding = if input.account.open_position > 0 { Side::Long } else { Side::Short };
            if side == holding.opposite() && score.passes() {
                record.action = Action::Exit;
                record.summary = format!(
                    "opposite {} setup scored {:.4} above bar; exiting {} position",
                    candidate.template.as_str(),
                    score.score,
                    holding.as_str()
                );
                return record;
            }
            if side == holding {
                if let Some(open_stop) = input.account.open_stop_ticks {
                    if params.stop_ticks + 1 < open_stop {
                        record.action = Action::Modify;
                        record.modify_stop_ticks = Some(params.stop_ticks);
                        record.summary = format!(
                            "tightening stop {} -> {} ticks on fresh {} signal",
                            open_stop,
                            params.stop_ticks,
                            candidate.template.as_str()
                        );
                        return record;
                    }
                }
            }
            record.action = Action::Hold;
            record.summary = "position open; no management action required".to_string();
            return record;
        }

        if !score.passes() {
            let fail = GateFailure {
                reason: ReasonCode::EucTooLow,
                gate: "euc_score",
                value: score.score,
                threshold: score.effective_threshold,
            };
            return self.skip(record, fail);
        }

        let contracts = size_contracts(&self.cfg, tier, input.account.equity, params.stop_ticks);
        if contracts == 0 {
            let fail = GateFailure {
                reason: ReasonCode::RiskLimit,
                gate: "position_size",
                value: params.stop_ticks as f64 * self.cfg.tick_value,
                threshold: tier
                    .limits()
                    .max_risk_per_trade
                    .min(self.cfg.max_risk_per_trade)
                    .min(input.account.equity * self.cfg.max_equity_risk_fraction),
            };
            return self.skip(record, fail);
        }

        record.action = Action::Enter;
        record.summary = format!(
            "{} {} x{} (score {:.4} > {:.4}, tier {}, regime {})",
            side.as_str(),
            candidate.template.as_str(),
            contracts,
            score.score,
            score.effective_threshold,
            tier.as_str(),
            regime.as_str()
        );
        record.intent = Some(OrderIntent {
            decision_id,
            template: candidate.template,
            side,
            contracts,
            entry: EntryType::Market,
            stop_ticks: params.stop_ticks,
            target_ticks: params.target_ticks,
            ttl_secs: self.cfg.order_ttl_secs,
        });
        record
    }

    fn skip(&self, mut record: DecisionRecord, fail: GateFailure) -> DecisionRecord {
        record.action = Action::Skip;
        record.summary = format!(
            "gate {} failed ({}: {:.4} vs {:.4})",
            fail.gate,
            fail.reason.as_str(),
            fail.value,
            fail.threshold
        );
        record.reasons.push(fail.reason);
        record
    }

    /// Round-trip cost estimate in currency per contract: crossing the
    /// spread, expected slippage both ways, commission both ways.
    fn friction_estimate(&self) -> f64 {
        (self.cfg.est_spread_ticks + 2.0 * self.cfg.est_slippage_ticks) * self.cfg.tick_value
            + 2.0 * self.cfg.commission_per_contract
    }

    fn direction_for(&self, template: Template) -> Side {
        let trend_up = self.regime.trend_sign() >= 0;
        let with_trend = template.params().with_trend;
        match (trend_up, with_trend) {
            (true, true) | (false, false) => Side::Long,
            (true, false) | (false, true) => Side::Short,
        }
    }
}

/// Per-constraint setup scores: belief probability weighted by template
/// quality, one entry per template whose constraint is present.
fn setup_scores(beliefs: &BeliefSnapshot) -> Vec<SetupScore> {
    let mut scores = Vec::new();
    for template in Template::all() {
        if let Some(b) = beliefs
            .beliefs
            .iter()
            .find(|b| b.constraint_id == template.constraint_id())
        {
            scores.push(SetupScore {
                constraint_id: b.constraint_id.clone(),
                template,
                score: b.probability * template.params().quality,
            });
        }
    }
    scores
}

struct Candidate {
    template: Template,
    constraint_id: String,
}

/// Best-scoring template whose reliability key is not quarantined. Returns
/// whether any candidate was dropped for quarantine so the skip reason can
/// say so.
fn select_template(
    scores: &[SetupScore],
    reliability: &ReliabilityBook,
    regime: RegimeBucket,
    time_bucket: TimeBucket,
) -> (Option<Candidate>, bool) {
    let mut saw_quarantined = false;
    let mut best: Option<&SetupScore> = None;
    for s in scores {
        if reliability.health(s.template, regime, time_bucket).quarantined {
            saw_quarantined = true;
            continue;
        }
        if best.map(|b| s.score > b.score).unwrap_or(true) {
            best = Some(s);
        }
    }
    (
        best.map(|s| Candidate { template: s.template, constraint_id: s.constraint_id.clone() }),
        saw_quarantined,
    )
}

/// Risk-based sizing: contracts bounded by risk-in-currency from the stop
/// distance against the tier cap, the constitutional cap, and the equity
/// fraction cap. Zero when a single contract already exceeds the budget.
fn size_contracts(cfg: &Config, tier: CapitalTier, equity: f64, stop_ticks: u32) -> u32 {
    let risk_per_contract = stop_ticks as f64 * cfg.tick_value;
    if risk_per_contract <= 0.0 {
        return 0;
    }
    let cap = tier
        .limits()
        .max_risk_per_trade
        .min(cfg.max_risk_per_trade)
        .min(equity * cfg.max_equity_risk_fraction);
    let n = (cap / risk_per_contract).floor() as u32;
    n.min(tier.limits().max_contracts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beliefs::ConstraintBelief;
    use crate::learning::reliability::ReliabilityBook;

    fn cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.session_open_min = 13 * 60 + 30;
        cfg.session_close_min = 20 * 60;
        cfg.flatten_before_close_min = 5;
        cfg.blackouts = vec![];
        cfg.max_daily_loss = 400.0;
        cfg.max_trades_per_day = 6;
        cfg.max_consecutive_losses = 3;
        cfg.min_dvs = 0.7;
        cfg.min_eqs = 0.6;
        cfg.min_belief_stability = 0.5;
        cfg.max_snapshot_age_secs = 120;
        cfg.max_friction_ratio = 0.3;
        cfg.euc_threshold = 0.00003;
        cfg.uncertainty_scale = 0.001;
        cfg.tick_size = 0.25;
        cfg.tick_value = 0.5;
        cfg.commission_per_contract = 0.74;
        cfg.est_spread_ticks = 1.0;
        cfg.est_slippage_ticks = 0.5;
        cfg.max_risk_per_trade = 150.0;
        cfg.max_equity_risk_fraction = 0.01;
        cfg.order_ttl_secs = 180;
        cfg
    }

    // 15:00 UTC, mid-session
    fn session_ts() -> u64 {
        15 * 3600
    }

    fn bar(ts: u64) -> Bar {
        Bar { ts, o: 15000.0, h: 15010.0, l: 14995.0, c: 15005.0, v: 2500.0 }
    }

    fn beliefs(ts: u64, probability: f64, stability: f64) -> BeliefSnapshot {
        BeliefSnapshot {
            fetch_ts: ts,
            beliefs: vec![
                ConstraintBelief {
                    constraint_id: "range_reversion".to_string(),
                    probability,
                    stability,
                    decay_state: DecayState::Fresh,
                },
                ConstraintBelief {
                    constraint_id: "breakout_confirmation".to_string(),
                    probability: probability * 0.6,
                    stability,
                    decay_state: DecayState::Fresh,
                },
            ],
        }
    }

    fn account(equity: f64) -> AccountState {
        AccountState {
            equity,
            realized_pnl_today: 0.0,
            trades_today: 0,
            consecutive_losses: 0,
            open_position: 0,
            open_stop_ticks: None,
        }
    }

    fn engine_with_warm_regime(cfg: Config) -> DecisionEngine {
        let mut engine = DecisionEngine::new(cfg);
        // Calm flat tape so K2 range fade is regime-legal.
        for i in 0..40 {
            engine.regime.on_bar(&bar(session_ts() - (40 - i) * 60));
        }
        engine
    }

    fn decide(
        engine: &mut DecisionEngine,
        input_bar: &Bar,
        quality: SignalQuality,
        snapshot: &BeliefSnapshot,
        acct: &AccountState,
        armed: bool,
    ) -> DecisionRecord {
        let features = FeatureVector { values: vec![0.1; 4], reliability: vec![1.0; 4] };
        let input = CycleInput {
            bar: input_bar,
            features: &features,
            quality,
            beliefs: snapshot,
            account: acct,
        };
        let book = ReliabilityBook::new_for_test();
        engine.decide(&input, armed, &book)
    }

    #[test]
    fn test_happy_path_enters() {
        let mut engine = engine_with_warm_regime(cfg());
        let b = bar(session_ts());
        let snap = beliefs(session_ts(), 0.8, 0.9);
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            true,
        );
        assert_eq!(rec.action, Action::Enter, "summary: {}", rec.summary);
        let intent = rec.intent.unwrap();
        assert_eq!(intent.template, Template::K2RangeFade);
        assert!(intent.contracts >= 1);
        assert!(rec.euc.is_some());
    }

    #[test]
    fn test_kill_switch_skips_first() {
        let mut engine = engine_with_warm_regime(cfg());
        let b = bar(session_ts());
        let snap = beliefs(session_ts(), 0.8, 0.9);
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            false,
        );
        assert_eq!(rec.action, Action::Skip);
        assert_eq!(rec.reasons, vec![ReasonCode::KillSwitch]);
        assert!(rec.euc.is_none());
    }

    #[test]
    fn test_gate_ordering_earliest_failure_wins() {
        // Fails gate 3 (DVS) AND gate 7 (stability): the reported reason
        // must be gate 3 and no EUC may be computed.
        let mut engine = engine_with_warm_regime(cfg());
        let b = bar(session_ts());
        let snap = beliefs(session_ts(), 0.8, 0.1);
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.2, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            true,
        );
        assert_eq!(rec.action, Action::Skip);
        assert_eq!(rec.reasons, vec![ReasonCode::DvsBelowMin]);
        assert!(rec.euc.is_none());
    }

    #[test]
    fn test_euc_too_low_skip() {
        let mut cfg = cfg();
        cfg.euc_threshold = 0.5; // unreachable bar
        let mut engine = engine_with_warm_regime(cfg);
        let b = bar(session_ts());
        let snap = beliefs(session_ts(), 0.8, 0.9);
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            true,
        );
        assert_eq!(rec.action, Action::Skip);
        assert_eq!(rec.reasons, vec![ReasonCode::EucTooLow]);
        assert!(rec.euc.is_some());
    }

    #[test]
    fn test_session_exit_overrides_positive_score() {
        let mut engine = engine_with_warm_regime(cfg());
        // 19:56 UTC: 4 minutes before the 20:00 close.
        let ts = 19 * 3600 + 56 * 60;
        let b = bar(ts);
        let snap = beliefs(ts, 0.9, 0.95);
        let mut acct = account(10_000.0);
        acct.open_position = 2;
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &acct,
            true,
        );
        assert_eq!(rec.action, Action::SessionExitFlatten);
        assert_eq!(rec.reasons, vec![ReasonCode::SessionCloseWindow]);
    }

    #[test]
    fn test_flatten_window_without_position_is_skip() {
        let mut engine = engine_with_warm_regime(cfg());
        let ts = 19 * 3600 + 56 * 60;
        let b = bar(ts);
        let snap = beliefs(ts, 0.9, 0.95);
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            true,
        );
        assert_eq!(rec.action, Action::Skip);
        assert_eq!(rec.reasons, vec![ReasonCode::SessionCloseWindow]);
    }

    #[test]
    fn test_malformed_beliefs_halt() {
        let mut engine = engine_with_warm_regime(cfg());
        let b = bar(session_ts());
        let snap = BeliefSnapshot {
            fetch_ts: session_ts(),
            beliefs: vec![ConstraintBelief {
                constraint_id: "range_reversion".to_string(),
                probability: f64::NAN,
                stability: 0.9,
                decay_state: DecayState::Fresh,
            }],
        };
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            true,
        );
        assert_eq!(rec.action, Action::Halt);
        assert_eq!(rec.reasons, vec![ReasonCode::InternalError]);
    }

    #[test]
    fn test_no_matching_constraint_is_no_template() {
        let mut engine = engine_with_warm_regime(cfg());
        let b = bar(session_ts());
        let snap = BeliefSnapshot {
            fetch_ts: session_ts(),
            beliefs: vec![ConstraintBelief {
                constraint_id: "unknown_constraint".to_string(),
                probability: 0.9,
                stability: 0.9,
                decay_state: DecayState::Fresh,
            }],
        };
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            true,
        );
        assert_eq!(rec.action, Action::Skip);
        assert_eq!(rec.reasons, vec![ReasonCode::NoTemplate]);
    }

    #[test]
    fn test_sizing_caps_to_zero_for_tiny_equity() {
        let cfg = cfg();
        // 16-tick stop at 0.5/tick = $8 risk per contract; 1% of $500 is
        // $5, so even one contract exceeds the equity-fraction budget.
        let n = size_contracts(&cfg, CapitalTier::S, 500.0, 16);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_sizing_floors_to_integer() {
        let cfg = cfg();
        // Tier A cap 150, constitutional 150, equity fraction 0.01 * 20000 =
        // 200 -> cap 150; 16-tick stop = $8/contract -> 18 contracts, but
        // tier A allows at most 3.
        let n = size_contracts(&cfg, CapitalTier::A, 20_000.0, 16);
        assert_eq!(n, 3);
    }

    #[test]
    fn test_every_cycle_emits_record() {
        let mut engine = engine_with_warm_regime(cfg());
        let b = bar(session_ts());
        let snap = BeliefSnapshot::default();
        let rec = decide(
            &mut engine,
            &b,
            SignalQuality { dvs: 0.95, eqs: 0.9 },
            &snap,
            &account(10_000.0),
            true,
        );
        // Empty snapshot -> stale-inputs skip, but a record is still built.
        assert_eq!(rec.action, Action::Skip);
        assert!(!rec.summary.is_empty());
        assert!(rec.to_payload().is_object());
    }
}
