//! Reliability tracking per (template, regime bucket, time bucket).
//!
//! Updates are symmetric: a win and a loss of equal learning weight move
//! the confidence parameter by equal and opposite magnitude. Confidence is
//! capped below 1.0 and decays toward neutral when a key goes unconfirmed,
//! so nothing ratchets toward certainty.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::templates::Template;
use crate::regime::{RegimeBucket, TimeBucket};

const NEUTRAL_CONFIDENCE: f64 = 0.5;
/// Expectancy and win-rate quarantine triggers need a minimum sample; the
/// consecutive-loss trigger does not.
const MIN_TRADES_FOR_STATS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReliabilityKey {
    pub template: Template,
    pub regime: RegimeBucket,
    pub time_bucket: TimeBucket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityMetrics {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    /// Learning-weighted mean PnL per trade
    pub expectancy: f64,
    pub sharpe_like: f64,
    /// Positive = consecutive wins, negative = consecutive losses
    pub streak: i32,
    pub throttle: u8,
    pub quarantined: bool,
    pub confidence: f64,
    pub last_update_ts: u64,
    weighted_pnl_sum: f64,
    weight_sum: f64,
    pnl_sum: f64,
    pnl_sq_sum: f64,
}

impl Default for ReliabilityMetrics {
    fn default() -> Self {
        Self {
            trades: 0,
            wins: 0,
            losses: 0,
            win_rate: 0.0,
            expectancy: 0.0,
            sharpe_like: 0.0,
            streak: 0,
            throttle: 0,
            quarantined: false,
            confidence: NEUTRAL_CONFIDENCE,
            last_update_ts: 0,
            weighted_pnl_sum: 0.0,
            weight_sum: 0.0,
            pnl_sum: 0.0,
            pnl_sq_sum: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub throttle: u8,
    pub quarantined: bool,
}

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    pub win_rate_floor: f64,
    pub confidence_cap: f64,
    /// Confidence delta per unit learning weight
    pub step: f64,
    /// Fractional decay toward neutral per idle day
    pub decay_per_day: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            win_rate_floor: 0.35,
            confidence_cap: 0.95,
            step: 0.05,
            decay_per_day: 0.02,
        }
    }
}

#[derive(Debug)]
pub struct ReliabilityBook {
    cfg: ReliabilityConfig,
    entries: HashMap<ReliabilityKey, ReliabilityMetrics>,
}

impl ReliabilityBook {
    pub fn new(cfg: ReliabilityConfig) -> Self {
        Self { cfg, entries: HashMap::new() }
    }

    pub fn new_for_test() -> Self {
        Self::new(ReliabilityConfig::default())
    }

    /// Read path for the decision engine. Unseen keys are healthy.
    pub fn health(&self, template: Template, regime: RegimeBucket, time_bucket: TimeBucket) -> Health {
        let key = ReliabilityKey { template, regime, time_bucket };
        match self.entries.get(&key) {
            Some(m) => Health { throttle: m.throttle, quarantined: m.quarantined },
            None => Health { throttle: 0, quarantined: false },
        }
    }

    pub fn metrics(&self, key: &ReliabilityKey) -> Option<&ReliabilityMetrics> {
        self.entries.get(key)
    }

    /// Apply one closed trade. `pnl` is realized currency after commission;
    /// `learning_weight` caps this trade's influence.
    pub fn record(
        &mut self,
        key: ReliabilityKey,
        pnl: f64,
        learning_weight: f64,
        now_ts: u64,
    ) -> &ReliabilityMetrics {
        let cfg = self.cfg.clone();
        let m = self.entries.entry(key).or_default();
        let weight = learning_weight.clamp(0.0, 1.0);

        m.trades += 1;
        if pnl >= 0.0 {
            m.wins += 1;
            m.streak = if m.streak > 0 { m.streak + 1 } else { 1 };
        } else {
            m.losses += 1;
            m.streak = if m.streak < 0 { m.streak - 1 } else { -1 };
        }
        m.win_rate = m.wins as f64 / m.trades as f64;

        m.weighted_pnl_sum += weight * pnl;
        m.weight_sum += weight;
        m.expectancy = if m.weight_sum > 0.0 { m.weighted_pnl_sum / m.weight_sum } else { 0.0 };

        m.pnl_sum += pnl;
        m.pnl_sq_sum += pnl * pnl;
        let n = m.trades as f64;
        let mean = m.pnl_sum / n;
        let var = (m.pnl_sq_sum / n - mean * mean).max(0.0);
        m.sharpe_like = if var > 0.0 { mean / var.sqrt() } else { 0.0 };

        // Symmetric confidence move: equal weight, opposite sign, equal
        // magnitude. The cap keeps certainty bounded.
        let sign = if pnl >= 0.0 { 1.0 } else { -1.0 };
        m.confidence = (m.confidence + sign * cfg.step * weight).clamp(0.0, cfg.confidence_cap);

        // Quarantine / re-enable / throttle ladder.
        if m.quarantined {
            if m.streak >= 2 && m.expectancy > 0.0 {
                m.quarantined = false;
            }
        } else if m.streak <= -2
            || (m.trades >= MIN_TRADES_FOR_STATS && m.expectancy < 0.0)
            || (m.trades >= MIN_TRADES_FOR_STATS && m.win_rate < cfg.win_rate_floor)
        {
            m.quarantined = true;
        }
        m.throttle = if m.quarantined {
            2
        } else if m.trades >= MIN_TRADES_FOR_STATS && m.expectancy < 0.0 {
            2
        } else if m.streak <= -1 {
            1
        } else {
            0
        };

        m.last_update_ts = now_ts;
        m
    }

    /// Decay every key's confidence toward neutral based on idle time.
    /// Unconfirmed beliefs weaken; they never strengthen on their own.
    pub fn decay(&mut self, now_ts: u64) {
        let per_day = self.cfg.decay_per_day;
        for m in self.entries.values_mut() {
            if m.last_update_ts == 0 || now_ts <= m.last_update_ts {
                continue;
            }
            let idle_days = (now_ts - m.last_update_ts) as f64 / 86_400.0;
            let pull = (per_day * idle_days).min(1.0);
            m.confidence += (NEUTRAL_CONFIDENCE - m.confidence) * pull;
        }
    }

    /// Full snapshot for persistence as a ReliabilitySnapshot event.
    pub fn snapshot_payload(&self) -> Value {
        let mut entries: Vec<Value> = self
            .entries
            .iter()
            .map(|(k, m)| {
                serde_json::json!({
                    "key": {
                        "template": k.template,
                        "regime": k.regime,
                        "time_bucket": k.time_bucket,
                    },
                    "metrics": serde_json::to_value(m).unwrap_or(Value::Null),
                })
            })
            .collect();
        // Deterministic order so the snapshot payload hashes stably.
        entries.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        serde_json::json!({ "entries": entries })
    }

    /// Restore from a persisted snapshot payload. Unknown or malformed
    /// entries are skipped rather than trusted.
    pub fn restore(&mut self, payload: &Value) {
        let Some(entries) = payload.get("entries").and_then(|e| e.as_array()) else {
            return;
        };
        for entry in entries {
            let Some(key_val) = entry.get("key") else { continue };
            let Some(metrics_val) = entry.get("metrics") else { continue };
            let key: Result<ReliabilityKey, _> = serde_json::from_value(key_val.clone());
            let metrics: Result<ReliabilityMetrics, _> = serde_json::from_value(metrics_val.clone());
            if let (Ok(key), Ok(metrics)) = (key, metrics) {
                self.entries.insert(key, metrics);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
