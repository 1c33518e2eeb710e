//! Post-trade attribution: decompose each closed trade into edge, luck,
//! and execution contributions, all computed from information captured at
//! decision time plus the realized fill path. Nothing here looks at later
//! market data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::euc::EucScore;
use crate::decision::templates::Template;
use crate::decision::Side;
use crate::regime::{RegimeBucket, TimeBucket};

/// Closed attribution codes. Precedence is top-down in `classify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributionCode {
    /// Clean win: edge expressed with little adversity
    A0,
    /// Lucky win: deep adverse excursion before the target printed
    A1,
    /// Grind win: neither clean nor lucky
    A2,
    /// Clean loss: hypothesis wrong, stopped without drama
    A3,
    /// Unlucky loss: near-miss of the target before reversal
    A4,
    /// Execution drag dominated the outcome
    A5,
    /// Exogenous shock during the hold
    A6,
    /// Near-miss-then-reverse path
    A7,
    /// Entry quality was already degraded at decision time
    A8,
    /// Unclassified
    A9,
}

impl AttributionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionCode::A0 => "A0",
            AttributionCode::A1 => "A1",
            AttributionCode::A2 => "A2",
            AttributionCode::A3 => "A3",
            AttributionCode::A4 => "A4",
            AttributionCode::A5 => "A5",
            AttributionCode::A6 => "A6",
            AttributionCode::A7 => "A7",
            AttributionCode::A8 => "A8",
            AttributionCode::A9 => "A9",
        }
    }
}

/// Everything the learning loop needs about one round trip. Entry-time
/// fields are the snapshot captured when the decision was made, never
/// recomputed with hindsight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub trade_id: String,
    pub decision_id: String,
    pub template: Template,
    pub regime: RegimeBucket,
    pub time_bucket: TimeBucket,
    pub side: Side,
    pub contracts: u32,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_ts: u64,
    pub exit_ts: u64,
    /// After commission
    pub realized_pnl: f64,
    pub commission: f64,
    pub stop_ticks: u32,
    pub target_ticks: u32,
    pub expected_slippage_ticks: f64,
    pub realized_slippage_ticks: f64,
    pub spread_ticks_at_entry: f64,
    pub bracket_attach_ms: u64,
    /// Maximum favorable excursion during the hold, in ticks
    pub mfe_ticks: f64,
    /// Maximum adverse excursion during the hold, in ticks
    pub mae_ticks: f64,
    pub exogenous_shock: bool,
    pub entry_probability: f64,
    pub entry_stability: f64,
    pub entry_dvs: f64,
    pub entry_eqs: f64,
    pub euc_at_entry: EucScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribution {
    pub trade_id: String,
    pub decision_id: String,
    pub code: AttributionCode,
    pub edge: f64,
    pub luck: f64,
    pub execution: f64,
    pub learning_weight: f64,
}

impl Attribution {
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Ex-ante quality of the entry: constraint probability x template quality
/// x stability haircut. Tier-gate pass is implied (a filled trade cleared
/// the tier gate), so the factor is 1.
pub fn edge_score(outcome: &TradeOutcome) -> f64 {
    clamp01(
        outcome.entry_probability
            * outcome.template.params().quality
            * outcome.entry_stability,
    )
}

/// Outcome surprise given the entry hypothesis. A win that survived a deep
/// adverse excursion was lucky; a loss that nearly reached the target was
/// unlucky; exogenous shocks raise either. Direct paths score low.
pub fn luck_score(outcome: &TradeOutcome) -> f64 {
    let adverse_ratio = if outcome.stop_ticks > 0 {
        clamp01(outcome.mae_ticks / outcome.stop_ticks as f64)
    } else {
        0.0
    };
    let favorable_ratio = if outcome.target_ticks > 0 {
        clamp01(outcome.mfe_ticks / outcome.target_ticks as f64)
    } else {
        0.0
    };
    let shock = if outcome.exogenous_shock { 0.4 } else { 0.0 };
    let path = if outcome.realized_pnl >= 0.0 {
        0.6 * adverse_ratio
    } else {
        0.6 * favorable_ratio
    };
    clamp01(path + shock)
}

/// Fidelity of fills to intent: slippage, spread, and bracket-attach
/// latency, each clamped to [0,1] and averaged.
pub fn execution_score(outcome: &TradeOutcome) -> f64 {
    let slip = if outcome.realized_slippage_ticks <= outcome.expected_slippage_ticks {
        1.0
    } else if outcome.realized_slippage_ticks > 0.0 {
        clamp01(outcome.expected_slippage_ticks / outcome.realized_slippage_ticks)
    } else {
        1.0
    };
    let spread = clamp01(1.0 - (outcome.spread_ticks_at_entry - 1.0) / 4.0);
    let latency = clamp01(1.0 - outcome.bracket_attach_ms as f64 / 2000.0);
    (slip + spread + latency) / 3.0
}

fn classify(outcome: &TradeOutcome, luck: f64, execution: f64) -> AttributionCode {
    let favorable_ratio = if outcome.target_ticks > 0 {
        clamp01(outcome.mfe_ticks / outcome.target_ticks as f64)
    } else {
        0.0
    };
    if outcome.exogenous_shock {
        return AttributionCode::A6;
    }
    if outcome.realized_pnl < 0.0 && favorable_ratio >= 0.8 {
        return AttributionCode::A7;
    }
    if execution < 0.4 {
        return AttributionCode::A5;
    }
    if outcome.entry_dvs < 0.75 || outcome.entry_eqs < 0.65 {
        return AttributionCode::A8;
    }
    if outcome.realized_pnl >= 0.0 {
        if luck >= 0.6 {
            AttributionCode::A1
        } else if luck < 0.3 && execution > 0.7 {
            AttributionCode::A0
        } else {
            AttributionCode::A2
        }
    } else if luck >= 0.6 {
        AttributionCode::A4
    } else if luck < 0.3 {
        AttributionCode::A3
    } else {
        AttributionCode::A9
    }
}

/// Full decomposition. Pure and deterministic: the same outcome always
/// yields the same attribution, which keeps the downstream event id stable.
pub fn attribute(outcome: &TradeOutcome) -> Attribution {
    let edge = edge_score(outcome);
    let luck = luck_score(outcome);
    let execution = execution_score(outcome);
    let learning_weight = clamp01((1.0 - luck) * execution);
    Attribution {
        trade_id: outcome.trade_id.clone(),
        decision_id: outcome.decision_id.clone(),
        code: classify(outcome, luck, execution),
        edge,
        luck,
        execution,
        learning_weight,
    }
}
