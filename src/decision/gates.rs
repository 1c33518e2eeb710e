//! The ordered gate hierarchy.
//!
//! Gates run strictly in spec order and fail closed: the first failing
//! layer names the reason, and nothing downstream (template scoring, EUC,
//! sizing) executes. Missing or stale inputs fail the data-quality layer,
//! never default.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::logging::log_gate;
use crate::regime::RegimeBucket;

use super::session::SessionClock;
use super::templates::Template;
use super::tiers::CapitalTier;
use super::{AccountState, CycleInput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    KillSwitch,
    DailyLossLimit,
    TradeCountLimit,
    ConsecutiveLossLimit,
    DvsBelowMin,
    EqsBelowMin,
    StaleInputs,
    OutsideSession,
    Blackout,
    SessionCloseWindow,
    RegimeLockout,
    TierTemplateDenied,
    TierStopLimit,
    BeliefUnstable,
    FrictionTooHigh,
    EucTooLow,
    Quarantined,
    NoTemplate,
    RiskLimit,
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::KillSwitch => "KILL_SWITCH",
            ReasonCode::DailyLossLimit => "DAILY_LOSS_LIMIT",
            ReasonCode::TradeCountLimit => "TRADE_COUNT_LIMIT",
            ReasonCode::ConsecutiveLossLimit => "CONSECUTIVE_LOSS_LIMIT",
            ReasonCode::DvsBelowMin => "DVS_BELOW_MIN",
            ReasonCode::EqsBelowMin => "EQS_BELOW_MIN",
            ReasonCode::StaleInputs => "STALE_INPUTS",
            ReasonCode::OutsideSession => "OUTSIDE_SESSION",
            ReasonCode::Blackout => "BLACKOUT",
            ReasonCode::SessionCloseWindow => "SESSION_CLOSE_WINDOW",
            ReasonCode::RegimeLockout => "REGIME_LOCKOUT",
            ReasonCode::TierTemplateDenied => "TIER_TEMPLATE_DENIED",
            ReasonCode::TierStopLimit => "TIER_STOP_LIMIT",
            ReasonCode::BeliefUnstable => "BELIEF_UNSTABLE",
            ReasonCode::FrictionTooHigh => "FRICTION_TOO_HIGH",
            ReasonCode::EucTooLow => "EUC_TOO_LOW",
            ReasonCode::Quarantined => "QUARANTINED",
            ReasonCode::NoTemplate => "NO_TEMPLATE",
            ReasonCode::RiskLimit => "RISK_LIMIT",
            ReasonCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// A failed gate, with the metric and threshold that failed it.
#[derive(Debug, Clone, Serialize)]
pub struct GateFailure {
    pub reason: ReasonCode,
    pub gate: &'static str,
    pub value: f64,
    pub threshold: f64,
}

impl GateFailure {
    fn new(reason: ReasonCode, gate: &'static str, value: f64, threshold: f64) -> Self {
        log_gate(gate, "fail", value, threshold);
        Self { reason, gate, value, threshold }
    }
}

/// Gate 1: process-wide kill switch.
pub fn check_kill_switch(armed: bool) -> Result<(), GateFailure> {
    if armed {
        Ok(())
    } else {
        Err(GateFailure::new(ReasonCode::KillSwitch, "kill_switch", 1.0, 0.0))
    }
}

/// Gate 2: constitutional hard limits.
pub fn check_constitutional(cfg: &Config, account: &AccountState) -> Result<(), GateFailure> {
    if account.realized_pnl_today <= -cfg.max_daily_loss {
        return Err(GateFailure::new(
            ReasonCode::DailyLossLimit,
            "daily_loss",
            account.realized_pnl_today,
            -cfg.max_daily_loss,
        ));
    }
    if account.trades_today >= cfg.max_trades_per_day {
        return Err(GateFailure::new(
            ReasonCode::TradeCountLimit,
            "trades_per_day",
            account.trades_today as f64,
            cfg.max_trades_per_day as f64,
        ));
    }
    if account.consecutive_losses >= cfg.max_consecutive_losses {
        return Err(GateFailure::new(
            ReasonCode::ConsecutiveLossLimit,
            "consecutive_losses",
            account.consecutive_losses as f64,
            cfg.max_consecutive_losses as f64,
        ));
    }
    Ok(())
}

/// Gate 3: data / execution quality, including input staleness.
pub fn check_quality(cfg: &Config, input: &CycleInput<'_>, now_ts: u64) -> Result<(), GateFailure> {
    if input.quality.dvs < cfg.min_dvs {
        return Err(GateFailure::new(
            ReasonCode::DvsBelowMin,
            "dvs",
            input.quality.dvs,
            cfg.min_dvs,
        ));
    }
    if input.quality.eqs < cfg.min_eqs {
        return Err(GateFailure::new(
            ReasonCode::EqsBelowMin,
            "eqs",
            input.quality.eqs,
            cfg.min_eqs,
        ));
    }
    if input.beliefs.is_stale(now_ts, cfg.max_snapshot_age_secs) || input.beliefs.is_empty() {
        return Err(GateFailure::new(
            ReasonCode::StaleInputs,
            "belief_snapshot_age",
            input.beliefs.fetch_ts as f64,
            cfg.max_snapshot_age_secs as f64,
        ));
    }
    Ok(())
}

/// Gate 4: session windows and blackouts.
pub fn check_session(clock: &SessionClock, now_ts: u64) -> Result<(), GateFailure> {
    let minute = SessionClock::minute_of_day(now_ts) as f64;
    if !clock.in_session(now_ts) {
        return Err(GateFailure::new(
            ReasonCode::OutsideSession,
            "session_window",
            minute,
            clock.open_min() as f64,
        ));
    }
    if clock.in_blackout(now_ts) {
        return Err(GateFailure::new(ReasonCode::Blackout, "blackout", minute, 0.0));
    }
    if clock.in_flatten_window(now_ts) {
        return Err(GateFailure::new(
            ReasonCode::SessionCloseWindow,
            "session_close",
            clock.minutes_to_close(now_ts) as f64,
            clock.close_min() as f64,
        ));
    }
    Ok(())
}

/// Gate 5: regime lockout for the candidate template.
pub fn check_regime(template: Template, regime: RegimeBucket) -> Result<(), GateFailure> {
    if template.allowed_in(regime) {
        Ok(())
    } else {
        Err(GateFailure::new(ReasonCode::RegimeLockout, "regime_lockout", 0.0, 0.0))
    }
}

/// Gate 6: capital tier whitelist and stop-distance cap.
pub fn check_tier(tier: CapitalTier, template: Template) -> Result<(), GateFailure> {
    if !tier.allows(template) {
        return Err(GateFailure::new(ReasonCode::TierTemplateDenied, "tier_template", 0.0, 0.0));
    }
    let limits = tier.limits();
    let stop = template.params().stop_ticks;
    if stop > limits.max_stop_ticks {
        return Err(GateFailure::new(
            ReasonCode::TierStopLimit,
            "tier_stop_ticks",
            stop as f64,
            limits.max_stop_ticks as f64,
        ));
    }
    Ok(())
}

/// Gate 7: belief stability of the dominant constraint.
pub fn check_belief_stability(cfg: &Config, stability: f64, decayed: bool) -> Result<(), GateFailure> {
    if decayed || stability < cfg.min_belief_stability {
        return Err(GateFailure::new(
            ReasonCode::BeliefUnstable,
            "belief_stability",
            stability,
            cfg.min_belief_stability,
        ));
    }
    Ok(())
}

/// Gate 8: estimated round-trip friction relative to the expected move.
pub fn check_friction(cfg: &Config, friction: f64, expected_move: f64) -> Result<(), GateFailure> {
    let ratio = if expected_move > 0.0 { friction / expected_move } else { f64::INFINITY };
    if ratio > cfg.max_friction_ratio {
        return Err(GateFailure::new(
            ReasonCode::FrictionTooHigh,
            "friction_ratio",
            ratio,
            cfg.max_friction_ratio,
        ));
    }
    Ok(())
}
