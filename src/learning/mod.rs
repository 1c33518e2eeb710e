//! The learning loop: post-trade attribution plus reliability updates.
//!
//! Consumes TradeOutcome records exactly once, writes Attribution and
//! ReliabilitySnapshot events, and mutates the shared reliability book the
//! decision engine reads on the next cycle. The loop never calls the
//! decision engine; the event store mediates the cycle.

pub mod attribution;
pub mod reliability;

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};

use crate::config::Config;
use crate::events::{Event, EventKind};
use crate::logging::{json_log, obj, v_num, v_str, Domain};
use crate::store::EventStore;

use attribution::{attribute, Attribution, TradeOutcome};
use reliability::{ReliabilityBook, ReliabilityKey};

/// Deterministic RFC3339 rendering of an epoch-seconds timestamp, used so
/// replays mint identical event ids.
pub fn ts_rfc3339(ts: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

pub struct LearningLoop {
    stream_id: String,
    config_hash: String,
    book: Arc<RwLock<ReliabilityBook>>,
}

impl LearningLoop {
    pub fn new(cfg: &Config, book: Arc<RwLock<ReliabilityBook>>) -> Self {
        Self {
            stream_id: cfg.stream_id.clone(),
            config_hash: cfg.config_hash(),
            book,
        }
    }

    pub fn book(&self) -> Arc<RwLock<ReliabilityBook>> {
        self.book.clone()
    }

    /// Process one closed trade. Idempotent: recomputing from the same
    /// TradeOutcome yields the same attribution event id, and a second call
    /// is a no-op for both the store and the reliability book.
    pub fn on_trade_closed(
        &self,
        outcome: &TradeOutcome,
        store: &mut EventStore,
    ) -> Result<Attribution> {
        let attribution = attribute(outcome);
        let ts = ts_rfc3339(outcome.exit_ts);
        let event = Event::new(
            &self.stream_id,
            &ts,
            EventKind::AttributionRecorded,
            attribution.to_payload(),
            &self.config_hash,
        );

        if store.contains(&event.id)? {
            json_log(
                Domain::Learn,
                "attribution_replay",
                obj(&[
                    ("trade_id", v_str(&outcome.trade_id)),
                    ("event_id", v_str(&event.id)),
                    ("status", v_str("already_applied")),
                ]),
            );
            return Ok(attribution);
        }
        store.append(&event)?;

        let key = ReliabilityKey {
            template: outcome.template,
            regime: outcome.regime,
            time_bucket: outcome.time_bucket,
        };
        {
            let mut book = self
                .book
                .write()
                .map_err(|_| anyhow!("reliability book lock poisoned"))?;
            book.record(key, outcome.realized_pnl, attribution.learning_weight, outcome.exit_ts);
            book.decay(outcome.exit_ts);

            let snapshot = Event::new(
                &self.stream_id,
                &ts,
                EventKind::ReliabilitySnapshot,
                book.snapshot_payload(),
                &self.config_hash,
            );
            store.append(&snapshot)?;
        }

        json_log(
            Domain::Learn,
            "trade_attributed",
            obj(&[
                ("trade_id", v_str(&outcome.trade_id)),
                ("code", v_str(attribution.code.as_str())),
                ("edge", v_num(attribution.edge)),
                ("luck", v_num(attribution.luck)),
                ("execution", v_num(attribution.execution)),
                ("learning_weight", v_num(attribution.learning_weight)),
                ("pnl", v_num(outcome.realized_pnl)),
            ]),
        );
        Ok(attribution)
    }
}
