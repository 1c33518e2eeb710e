use sha2::{Digest, Sha256};

#[derive(Clone, Debug)]
pub struct Config {
    pub stream_id: String,
    pub instrument: String,
    pub account_id: String,
    pub sqlite_path: String,
    pub bar_secs: u64,
    pub initial_equity: f64,
    /// Contract economics
    pub tick_size: f64,
    pub tick_value: f64,
    pub commission_per_contract: f64,
    /// Constitutional hard limits
    pub max_risk_per_trade: f64,
    pub max_daily_loss: f64,
    pub max_trades_per_day: u32,
    pub max_consecutive_losses: u32,
    /// Quality gate floors
    pub min_dvs: f64,
    pub min_eqs: f64,
    pub min_belief_stability: f64,
    pub max_snapshot_age_secs: u64,
    /// Friction gate: round-trip cost / expected move must stay below this
    pub max_friction_ratio: f64,
    pub est_spread_ticks: f64,
    pub est_slippage_ticks: f64,
    /// EUC scoring
    pub euc_threshold: f64,
    pub uncertainty_scale: f64,
    pub w_dvs: f64,
    pub w_eqs: f64,
    pub w_stability: f64,
    pub throttle_step: f64,
    /// Sizing
    pub max_equity_risk_fraction: f64,
    /// Session windows (minutes of day, UTC)
    pub session_open_min: u32,
    pub session_close_min: u32,
    pub flatten_before_close_min: u32,
    pub blackouts: Vec<(u32, u32)>,
    /// Execution supervision
    pub order_ttl_secs: u64,
    pub ack_timeout_ms: u64,
    pub reconcile_secs: u64,
    pub reconcile_tolerance: i64,
    pub cancel_max_retries: u32,
    /// Learning loop
    pub win_rate_floor: f64,
    pub reliability_decay_per_day: f64,
    pub confidence_cap: f64,
    pub reliability_step: f64,
    /// Simulated venue
    pub sim_slippage_ticks: f64,
    pub sim_timeout_rate: f64,
    pub sim_dup_fill_rate: f64,
    pub sim_drop_fill_rate: f64,
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parse "570-600,720-735" into minute-of-day windows.
fn parse_blackouts(raw: &str) -> Vec<(u32, u32)> {
    raw.split(',')
        .filter_map(|span| {
            let (a, b) = span.split_once('-')?;
            let start: u32 = a.trim().parse().ok()?;
            let end: u32 = b.trim().parse().ok()?;
            if start < end { Some((start, end)) } else { None }
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            stream_id: std::env::var("STREAM_ID").unwrap_or_else(|_| "mnq-live".to_string()),
            instrument: std::env::var("INSTRUMENT").unwrap_or_else(|_| "MNQ".to_string()),
            account_id: std::env::var("ACCOUNT_ID").unwrap_or_else(|_| "sim-1".to_string()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./tradegate.sqlite".to_string()),
            bar_secs: env_u64("BAR_SECS", 60),
            initial_equity: env_f64("INITIAL_EQUITY", 10_000.0),
            tick_size: env_f64("TICK_SIZE", 0.25),
            tick_value: env_f64("TICK_VALUE", 0.5),
            commission_per_contract: env_f64("COMMISSION", 0.74),
            max_risk_per_trade: env_f64("MAX_RISK_TRADE", 150.0),
            max_daily_loss: env_f64("MAX_DAILY_LOSS", 400.0),
            max_trades_per_day: env_u32("MAX_TRADES_DAY", 6),
            max_consecutive_losses: env_u32("MAX_CONSEC_LOSSES", 3),
            min_dvs: env_f64("MIN_DVS", 0.7),
            min_eqs: env_f64("MIN_EQS", 0.6),
            min_belief_stability: env_f64("MIN_BELIEF_STABILITY", 0.5),
            max_snapshot_age_secs: env_u64("MAX_SNAPSHOT_AGE_SECS", 120),
            max_friction_ratio: env_f64("MAX_FRICTION_RATIO", 0.3),
            est_spread_ticks: env_f64("EST_SPREAD_TICKS", 1.0),
            est_slippage_ticks: env_f64("EST_SLIPPAGE_TICKS", 0.5),
            euc_threshold: env_f64("EUC_THRESHOLD", 0.00003),
            uncertainty_scale: env_f64("U_SCALE", 0.001),
            w_dvs: env_f64("W_DVS", 0.4),
            w_eqs: env_f64("W_EQS", 0.3),
            w_stability: env_f64("W_STABILITY", 0.3),
            throttle_step: env_f64("THROTTLE_STEP", 0.5),
            max_equity_risk_fraction: env_f64("MAX_EQUITY_RISK_FRAC", 0.01),
            session_open_min: env_u32("SESSION_OPEN_MIN", 13 * 60 + 30),
            session_close_min: env_u32("SESSION_CLOSE_MIN", 20 * 60),
            flatten_before_close_min: env_u32("FLATTEN_BEFORE_CLOSE_MIN", 5),
            blackouts: std::env::var("BLACKOUTS")
                .map(|v| parse_blackouts(&v))
                .unwrap_or_default(),
            order_ttl_secs: env_u64("ORDER_TTL_SECS", 180),
            ack_timeout_ms: env_u64("ACK_TIMEOUT_MS", 3000),
            reconcile_secs: env_u64("RECONCILE_SECS", 30),
            reconcile_tolerance: std::env::var("RECONCILE_TOLERANCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            cancel_max_retries: env_u32("CANCEL_MAX_RETRIES", 5),
            win_rate_floor: env_f64("WIN_RATE_FLOOR", 0.35),
            reliability_decay_per_day: env_f64("RELIABILITY_DECAY_DAY", 0.02),
            confidence_cap: env_f64("CONFIDENCE_CAP", 0.95),
            reliability_step: env_f64("RELIABILITY_STEP", 0.05),
            sim_slippage_ticks: env_f64("SIM_SLIPPAGE_TICKS", 0.5),
            sim_timeout_rate: env_f64("SIM_TIMEOUT_RATE", 0.0),
            sim_dup_fill_rate: env_f64("SIM_DUP_FILL_RATE", 0.0),
            sim_drop_fill_rate: env_f64("SIM_DROP_FILL_RATE", 0.0),
        }
    }

    /// Deterministic hash over every decision-relevant parameter. Stamped on
    /// each event so replays can detect config drift.
    pub fn config_hash(&self) -> String {
        let blackouts = self
            .blackouts
            .iter()
            .map(|(a, b)| format!("{}-{}", a, b))
            .collect::<Vec<_>>()
            .join(",");
        let fields = [
            format!("ack_timeout_ms={}", self.ack_timeout_ms),
            format!("bar_secs={}", self.bar_secs),
            format!("blackouts={}", blackouts),
            format!("commission={}", self.commission_per_contract),
            format!("confidence_cap={}", self.confidence_cap),
            format!("est_slippage_ticks={}", self.est_slippage_ticks),
            format!("est_spread_ticks={}", self.est_spread_ticks),
            format!("euc_threshold={}", self.euc_threshold),
            format!("flatten_before_close_min={}", self.flatten_before_close_min),
            format!("instrument={}", self.instrument),
            format!("max_consecutive_losses={}", self.max_consecutive_losses),
            format!("max_daily_loss={}", self.max_daily_loss),
            format!("max_equity_risk_fraction={}", self.max_equity_risk_fraction),
            format!("max_friction_ratio={}", self.max_friction_ratio),
            format!("max_risk_per_trade={}", self.max_risk_per_trade),
            format!("max_snapshot_age_secs={}", self.max_snapshot_age_secs),
            format!("max_trades_per_day={}", self.max_trades_per_day),
            format!("min_belief_stability={}", self.min_belief_stability),
            format!("min_dvs={}", self.min_dvs),
            format!("min_eqs={}", self.min_eqs),
            format!("order_ttl_secs={}", self.order_ttl_secs),
            format!("reconcile_tolerance={}", self.reconcile_tolerance),
            format!("reliability_decay_per_day={}", self.reliability_decay_per_day),
            format!("reliability_step={}", self.reliability_step),
            format!("session_close_min={}", self.session_close_min),
            format!("session_open_min={}", self.session_open_min),
            format!("throttle_step={}", self.throttle_step),
            format!("tick_size={}", self.tick_size),
            format!("tick_value={}", self.tick_value),
            format!("uncertainty_scale={}", self.uncertainty_scale),
            format!("w_dvs={}", self.w_dvs),
            format!("w_eqs={}", self.w_eqs),
            format!("w_stability={}", self.w_stability),
            format!("win_rate_floor={}", self.win_rate_floor),
        ];
        let mut hasher = Sha256::new();
        for f in &fields {
            hasher.update(f.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize()[..16])
    }

    pub fn sleep_until_next_bar(&self, now_ts: u64) -> u64 {
        let next = ((now_ts / self.bar_secs) + 1) * self.bar_secs;
        next.saturating_sub(now_ts)
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_hash_deterministic() {
        let cfg = Config::from_env();
        assert_eq!(cfg.config_hash(), cfg.config_hash());
    }

    #[test]
    fn test_config_hash_changes_with_params() {
        let cfg = Config::from_env();
        let mut other = cfg.clone();
        other.euc_threshold += 0.001;
        assert_ne!(cfg.config_hash(), other.config_hash());
    }

    #[test]
    fn test_parse_blackouts() {
        let spans = parse_blackouts("570-600,720-735");
        assert_eq!(spans, vec![(570, 600), (720, 735)]);
    }

    #[test]
    fn test_parse_blackouts_rejects_inverted() {
        let spans = parse_blackouts("600-570");
        assert!(spans.is_empty());
    }

    #[test]
    fn test_sleep_until_next_bar() {
        let mut cfg = Config::from_env();
        cfg.bar_secs = 60;
        assert_eq!(cfg.sleep_until_next_bar(60), 60);
        assert_eq!(cfg.sleep_until_next_bar(61), 59);
        assert_eq!(cfg.sleep_until_next_bar(119), 1);
    }
}
