//! Replay a stream from the event store and print the derived state.
//!
//! Usage: SQLITE_PATH=./tradegate.sqlite STREAM_ID=mnq-live replay

use anyhow::Result;
use serde_json::json;

use tradegate::config::Config;
use tradegate::replay::replay;
use tradegate::store::EventStore;

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let mut store = EventStore::open(&cfg.sqlite_path)?;
    store.init()?;

    let state = replay(&store, &cfg.stream_id, &cfg.config_hash())?;
    let out = json!({
        "stream_id": state.stream_id,
        "config_hash": state.config_hash,
        "events_folded": state.events_folded,
        "decisions": state.decisions,
        "orders_submitted": state.orders_submitted,
        "fills": state.fills,
        "trades_closed": state.trades_closed,
        "attributions": state.attributions,
        "halts": state.halts,
        "realized_pnl": state.realized_pnl,
        "kill_state": state.kill_state.as_str(),
        "last_event_id": state.last_event_id,
        "state_hash": state.state_hash,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
