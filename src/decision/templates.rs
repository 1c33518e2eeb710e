//! Trade setup templates.
//!
//! Templates are a closed enumeration: adding one is a compile-time change
//! that every exhaustive match in the codebase has to acknowledge.

use serde::{Deserialize, Serialize};

use crate::regime::RegimeBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Template {
    /// Pullback entry in an established trend
    #[serde(rename = "K1")]
    K1PullbackTrend,
    /// Fade at the edge of a balanced range
    #[serde(rename = "K2")]
    K2RangeFade,
    /// Entry on retest of a confirmed breakout level
    #[serde(rename = "K3")]
    K3BreakoutRetest,
    /// Reversal after a failed auction / exhaustion print
    #[serde(rename = "K4")]
    K4ExhaustionReversal,
}

#[derive(Debug, Clone, Copy)]
pub struct TemplateParams {
    pub stop_ticks: u32,
    pub target_ticks: u32,
    pub expected_move_ticks: f64,
    /// Ex-ante quality factor in [0,1], used by edge scoring
    pub quality: f64,
    /// True when the setup trades with the prevailing trend
    pub with_trend: bool,
}

impl Template {
    pub fn all() -> [Template; 4] {
        [
            Template::K1PullbackTrend,
            Template::K2RangeFade,
            Template::K3BreakoutRetest,
            Template::K4ExhaustionReversal,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Template::K1PullbackTrend => "K1",
            Template::K2RangeFade => "K2",
            Template::K3BreakoutRetest => "K3",
            Template::K4ExhaustionReversal => "K4",
        }
    }

    /// The belief constraint this template trades on.
    pub fn constraint_id(&self) -> &'static str {
        match self {
            Template::K1PullbackTrend => "trend_continuation",
            Template::K2RangeFade => "range_reversion",
            Template::K3BreakoutRetest => "breakout_confirmation",
            Template::K4ExhaustionReversal => "exhaustion_reversal",
        }
    }

    pub fn params(&self) -> TemplateParams {
        match self {
            Template::K1PullbackTrend => TemplateParams {
                stop_ticks: 16,
                target_ticks: 32,
                expected_move_ticks: 28.0,
                quality: 0.8,
                with_trend: true,
            },
            Template::K2RangeFade => TemplateParams {
                stop_ticks: 12,
                target_ticks: 20,
                expected_move_ticks: 18.0,
                quality: 0.7,
                with_trend: false,
            },
            Template::K3BreakoutRetest => TemplateParams {
                stop_ticks: 20,
                target_ticks: 44,
                expected_move_ticks: 36.0,
                quality: 0.75,
                with_trend: true,
            },
            Template::K4ExhaustionReversal => TemplateParams {
                stop_ticks: 24,
                target_ticks: 40,
                expected_move_ticks: 34.0,
                quality: 0.6,
                with_trend: false,
            },
        }
    }

    /// Regime lockouts. A template not listed for the current bucket is not
    /// a candidate this cycle.
    pub fn allowed_in(&self, regime: RegimeBucket) -> bool {
        match regime {
            // Nothing trades into a shock print.
            RegimeBucket::Shock => false,
            RegimeBucket::Volatile => matches!(self, Template::K4ExhaustionReversal),
            RegimeBucket::Trending => {
                matches!(self, Template::K1PullbackTrend | Template::K3BreakoutRetest)
            }
            RegimeBucket::Calm => matches!(
                self,
                Template::K2RangeFade | Template::K3BreakoutRetest
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_are_unique() {
        let ids: std::collections::HashSet<_> =
            Template::all().iter().map(|t| t.constraint_id()).collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_shock_locks_out_everything() {
        for t in Template::all() {
            assert!(!t.allowed_in(RegimeBucket::Shock));
        }
    }

    #[test]
    fn test_trending_allows_with_trend_setups() {
        assert!(Template::K1PullbackTrend.allowed_in(RegimeBucket::Trending));
        assert!(Template::K3BreakoutRetest.allowed_in(RegimeBucket::Trending));
        assert!(!Template::K2RangeFade.allowed_in(RegimeBucket::Trending));
    }

    #[test]
    fn test_params_are_sane() {
        for t in Template::all() {
            let p = t.params();
            assert!(p.stop_ticks > 0);
            assert!(p.target_ticks > p.stop_ticks);
            assert!(p.quality > 0.0 && p.quality <= 1.0);
        }
    }
}
