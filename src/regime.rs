//! Market regime bucketing from rolling bar statistics.
//!
//! The decision engine uses the bucket for lockout checks and the learning
//! loop uses it as one axis of the reliability key, so classification has
//! to be cheap, causal, and deterministic for a given bar sequence.

use serde::{Deserialize, Serialize};

use crate::beliefs::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeBucket {
    Calm,
    Trending,
    Volatile,
    Shock,
}

impl RegimeBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeBucket::Calm => "calm",
            RegimeBucket::Trending => "trending",
            RegimeBucket::Volatile => "volatile",
            RegimeBucket::Shock => "shock",
        }
    }
}

/// Session phase, used as the time axis of the reliability key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    Open,
    Mid,
    Close,
}

impl TimeBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::Open => "open",
            TimeBucket::Mid => "mid",
            TimeBucket::Close => "close",
        }
    }

    /// Session thirds by minute-of-day.
    pub fn classify(minute_of_day: u32, open_min: u32, close_min: u32) -> Self {
        if close_min <= open_min {
            return TimeBucket::Mid;
        }
        let span = close_min - open_min;
        let offset = minute_of_day.saturating_sub(open_min).min(span);
        if offset < span / 3 {
            TimeBucket::Open
        } else if offset < 2 * span / 3 {
            TimeBucket::Mid
        } else {
            TimeBucket::Close
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegimeConfig {
    pub ema_fast: u32,
    pub ema_slow: u32,
    pub vol_high: f64,
    pub vol_shock: f64,
    pub trend_th: f64,
    pub warmup_bars: u32,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            ema_fast: 8,
            ema_slow: 34,
            vol_high: 1.6,
            vol_shock: 3.0,
            trend_th: 0.0015,
            warmup_bars: 30,
        }
    }
}

/// Streaming classifier. Welford running moments for bar-range volatility
/// plus an EMA pair for trend direction/strength.
#[derive(Debug, Clone)]
pub struct RegimeTracker {
    cfg: RegimeConfig,
    ema_fast: f64,
    ema_slow: f64,
    range_n: u64,
    range_mean: f64,
    range_m2: f64,
    last_range: f64,
    bars_seen: u32,
}

impl RegimeTracker {
    pub fn new(cfg: RegimeConfig) -> Self {
        Self {
            cfg,
            ema_fast: 0.0,
            ema_slow: 0.0,
            range_n: 0,
            range_mean: 0.0,
            range_m2: 0.0,
            last_range: 0.0,
            bars_seen: 0,
        }
    }

    pub fn on_bar(&mut self, bar: &Bar) {
        let alpha_fast = 2.0 / (self.cfg.ema_fast as f64 + 1.0);
        let alpha_slow = 2.0 / (self.cfg.ema_slow as f64 + 1.0);
        self.ema_fast = if self.ema_fast == 0.0 {
            bar.c
        } else {
            alpha_fast * bar.c + (1.0 - alpha_fast) * self.ema_fast
        };
        self.ema_slow = if self.ema_slow == 0.0 {
            bar.c
        } else {
            alpha_slow * bar.c + (1.0 - alpha_slow) * self.ema_slow
        };

        let range = if bar.c > 0.0 { (bar.h - bar.l) / bar.c } else { 0.0 };
        self.last_range = range;
        self.range_n += 1;
        let delta = range - self.range_mean;
        self.range_mean += delta / self.range_n as f64;
        let delta2 = range - self.range_mean;
        self.range_m2 += delta * delta2;

        self.bars_seen = self.bars_seen.saturating_add(1);
    }

    pub fn warmed_up(&self) -> bool {
        self.bars_seen >= self.cfg.warmup_bars
    }

    pub fn vol_ratio(&self) -> f64 {
        if self.range_mean > 0.0 {
            self.last_range / self.range_mean
        } else {
            1.0
        }
    }

    /// +1 when the fast EMA is at or above the slow EMA, -1 otherwise.
    pub fn trend_sign(&self) -> i8 {
        if self.ema_fast >= self.ema_slow {
            1
        } else {
            -1
        }
    }

    pub fn trend_strength(&self) -> f64 {
        if self.ema_slow > 0.0 {
            (self.ema_fast - self.ema_slow).abs() / self.ema_slow
        } else {
            0.0
        }
    }

    pub fn classify(&self) -> RegimeBucket {
        let vol = self.vol_ratio();
        if vol >= self.cfg.vol_shock {
            return RegimeBucket::Shock;
        }
        if vol >= self.cfg.vol_high {
            return RegimeBucket::Volatile;
        }
        if self.trend_strength() >= self.cfg.trend_th {
            RegimeBucket::Trending
        } else {
            RegimeBucket::Calm
        }
    }
}
