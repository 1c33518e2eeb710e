//! Capital tiers: account-equity brackets that bound which templates may
//! trade and how much risk a single trade may carry.

use serde::{Deserialize, Serialize};

use super::templates::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapitalTier {
    S,
    A,
    B,
}

#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub max_stop_ticks: u32,
    pub max_risk_per_trade: f64,
    pub max_contracts: u32,
}

impl CapitalTier {
    pub fn classify(equity: f64) -> Self {
        if equity < 5_000.0 {
            CapitalTier::S
        } else if equity < 25_000.0 {
            CapitalTier::A
        } else {
            CapitalTier::B
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapitalTier::S => "S",
            CapitalTier::A => "A",
            CapitalTier::B => "B",
        }
    }

    pub fn allows(&self, template: Template) -> bool {
        match self {
            // Smallest accounts only take the tight-stop range fade.
            CapitalTier::S => matches!(template, Template::K2RangeFade),
            CapitalTier::A => !matches!(template, Template::K4ExhaustionReversal),
            CapitalTier::B => true,
        }
    }

    pub fn limits(&self) -> TierLimits {
        match self {
            CapitalTier::S => TierLimits {
                max_stop_ticks: 16,
                max_risk_per_trade: 50.0,
                max_contracts: 1,
            },
            CapitalTier::A => TierLimits {
                max_stop_ticks: 24,
                max_risk_per_trade: 150.0,
                max_contracts: 3,
            },
            CapitalTier::B => TierLimits {
                max_stop_ticks: 40,
                max_risk_per_trade: 400.0,
                max_contracts: 10,
            },
        }
    }
}
