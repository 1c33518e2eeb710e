//! Edge / Uncertainty / Cost scoring.
//!
//! `score = edge - uncertainty - cost`; a trade is taken only when the
//! score clears the effective threshold. The uncertainty curve is a
//! tunable, monotonic function of quality degradation, not a fixed
//! contract; tests assert monotonicity and bounds rather than exact
//! values.

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EucInputs {
    /// Expected favorable move as a return fraction (target vs entry)
    pub expected_return: f64,
    /// Conservative lower bound on the constraint probability
    pub lower_bound_probability: f64,
    pub dvs: f64,
    pub eqs: f64,
    pub belief_stability: f64,
    /// Estimated round-trip cost (spread + slippage + commission), currency
    pub friction: f64,
    /// Expected favorable move in currency terms
    pub expected_move: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EucScore {
    pub edge: f64,
    pub uncertainty: f64,
    pub cost: f64,
    pub score: f64,
    /// Threshold after the throttle multiplier for this template/regime
    pub effective_threshold: f64,
}

impl EucScore {
    pub fn passes(&self) -> bool {
        self.score > self.effective_threshold
    }
}

/// Monotonically increasing as any quality metric degrades. Each input is
/// clamped to [0,1] before weighting so degenerate upstream values cannot
/// flip the sign.
pub fn uncertainty(cfg: &Config, dvs: f64, eqs: f64, stability: f64) -> f64 {
    let d = 1.0 - dvs.clamp(0.0, 1.0);
    let e = 1.0 - eqs.clamp(0.0, 1.0);
    let s = 1.0 - stability.clamp(0.0, 1.0);
    cfg.uncertainty_scale * (cfg.w_dvs * d + cfg.w_eqs * e + cfg.w_stability * s)
}

pub fn effective_threshold(cfg: &Config, throttle_level: u8) -> f64 {
    cfg.euc_threshold * (1.0 + cfg.throttle_step * throttle_level as f64)
}

pub fn score(cfg: &Config, inputs: &EucInputs, throttle_level: u8) -> EucScore {
    let edge = inputs.expected_return * inputs.lower_bound_probability.clamp(0.0, 1.0);
    let uncertainty = uncertainty(cfg, inputs.dvs, inputs.eqs, inputs.belief_stability);
    let cost = if inputs.expected_move > 0.0 {
        // Cost term is expressed in the same return units as edge.
        (inputs.friction / inputs.expected_move) * inputs.expected_return.abs()
    } else {
        f64::INFINITY
    };
    let score = edge - uncertainty - cost;
    EucScore {
        edge,
        uncertainty,
        cost,
        score,
        effective_threshold: effective_threshold(cfg, throttle_level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.euc_threshold = 0.0015;
        cfg.uncertainty_scale = 0.01;
        cfg.w_dvs = 0.4;
        cfg.w_eqs = 0.3;
        cfg.w_stability = 0.3;
        cfg.throttle_step = 0.5;
        cfg
    }

    #[test]
    fn test_spec_threshold_cases() {
        // edge=0.006, uncertainty=0.003, cost=0.001 -> score 0.002
        let score = EucScore {
            edge: 0.006,
            uncertainty: 0.003,
            cost: 0.001,
            score: 0.002,
            effective_threshold: 0.0015,
        };
        assert!(score.passes());

        let raised = EucScore { effective_threshold: 0.003, ..score };
        assert!(!raised.passes());
    }

    #[test]
    fn test_uncertainty_monotonic_in_each_input() {
        let cfg = cfg();
        let steps: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        for pair in steps.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            // Degrading any single input must never reduce uncertainty.
            assert!(uncertainty(&cfg, lo, 1.0, 1.0) >= uncertainty(&cfg, hi, 1.0, 1.0));
            assert!(uncertainty(&cfg, 1.0, lo, 1.0) >= uncertainty(&cfg, 1.0, hi, 1.0));
            assert!(uncertainty(&cfg, 1.0, 1.0, lo) >= uncertainty(&cfg, 1.0, 1.0, hi));
        }
    }

    #[test]
    fn test_uncertainty_bounds() {
        let cfg = cfg();
        assert_eq!(uncertainty(&cfg, 1.0, 1.0, 1.0), 0.0);
        let worst = uncertainty(&cfg, 0.0, 0.0, 0.0);
        assert!(worst > 0.0);
        assert!(worst <= cfg.uncertainty_scale * (cfg.w_dvs + cfg.w_eqs + cfg.w_stability) + 1e-12);
        // Out-of-range inputs clamp instead of exploding.
        assert_eq!(uncertainty(&cfg, -5.0, 2.0, 1.0), uncertainty(&cfg, 0.0, 1.0, 1.0));
    }

    #[test]
    fn test_throttle_raises_the_bar() {
        let cfg = cfg();
        let t0 = effective_threshold(&cfg, 0);
        let t1 = effective_threshold(&cfg, 1);
        let t2 = effective_threshold(&cfg, 2);
        assert!(t0 < t1 && t1 < t2);
        assert!((t0 - cfg.euc_threshold).abs() < 1e-12);
    }

    #[test]
    fn test_zero_expected_move_never_passes() {
        let cfg = cfg();
        let inputs = EucInputs {
            expected_return: 0.01,
            lower_bound_probability: 0.9,
            dvs: 1.0,
            eqs: 1.0,
            belief_stability: 1.0,
            friction: 5.0,
            expected_move: 0.0,
        };
        let s = score(&cfg, &inputs, 0);
        assert!(!s.passes());
    }

    #[test]
    fn test_score_composition() {
        let cfg = cfg();
        let inputs = EucInputs {
            expected_return: 0.008,
            lower_bound_probability: 0.75,
            dvs: 1.0,
            eqs: 1.0,
            belief_stability: 1.0,
            friction: 2.0,
            expected_move: 40.0,
        };
        let s = score(&cfg, &inputs, 0);
        assert!((s.edge - 0.006).abs() < 1e-12);
        assert_eq!(s.uncertainty, 0.0);
        assert!(s.cost > 0.0);
        assert!((s.score - (s.edge - s.uncertainty - s.cost)).abs() < 1e-12);
        assert!(s.passes());
    }
}
