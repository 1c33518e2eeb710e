use std::io::{self, BufRead, BufReader};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;

use tradegate::adapter::sim::{FaultProfile, SimulatedVenue};
use tradegate::config::{now_ts, Config};
use tradegate::exec::ExecutionSupervisor;
use tradegate::learning::reliability::{ReliabilityBook, ReliabilityConfig};
use tradegate::logging::{json_log, obj, v_num, v_str, Domain};
use tradegate::runner::{CycleRecord, Runner};
use tradegate::store::{DuplicateEventError, EventStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    json_log(
        Domain::System,
        "startup",
        obj(&[
            ("stream_id", v_str(&cfg.stream_id)),
            ("instrument", v_str(&cfg.instrument)),
            ("config_hash", v_str(&cfg.config_hash())),
        ]),
    );

    let mut store = EventStore::open(&cfg.sqlite_path)?;
    store.init()?;

    let (events_tx, events_rx) = mpsc::channel(256);
    let venue = Arc::new(SimulatedVenue::new(
        &cfg,
        FaultProfile::from_config(&cfg),
        events_tx,
    ));
    json_log(Domain::System, "adapter", obj(&[("venue", v_str("simulated"))]));

    let supervisor = ExecutionSupervisor::new(cfg.clone(), venue.clone());
    let book = Arc::new(RwLock::new(ReliabilityBook::new(ReliabilityConfig {
        win_rate_floor: cfg.win_rate_floor,
        confidence_cap: cfg.confidence_cap,
        step: cfg.reliability_step,
        decay_per_day: cfg.reliability_decay_per_day,
    })));
    let mut runner = Runner::new(cfg.clone(), store, supervisor, book, events_rx);
    runner.startup(now_ts()).await?;

    // Cycle feed: JSONL, one CycleRecord per line, from CYCLE_FEED or stdin.
    // Live market plumbing lives outside this binary.
    let reader: Box<dyn BufRead> = match std::env::var("CYCLE_FEED") {
        Ok(path) => Box::new(BufReader::new(std::fs::File::open(&path)?)),
        Err(_) => Box::new(BufReader::new(io::stdin())),
    };

    let mut cycles: u64 = 0;
    let mut halted_fatal = false;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let cycle: CycleRecord = match serde_json::from_str(&line) {
            Ok(cycle) => cycle,
            Err(err) => {
                json_log(
                    Domain::Market,
                    "feed_malformed",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                continue;
            }
        };
        venue.set_mark(cycle.bar.c, cycle.bar.ts).await;

        if halted_fatal {
            // New decisions are halted; adapter events keep flowing into
            // the book of record.
            if let Err(err) = runner.drain_adapter_events().await {
                json_log(
                    Domain::System,
                    "halted_drain_error",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
            }
            continue;
        }

        match runner.run_cycle(&cycle).await {
            Ok(record) => {
                cycles += 1;
                if cycles % 60 == 0 {
                    json_log(
                        Domain::System,
                        "heartbeat",
                        obj(&[
                            ("cycles", json!(cycles)),
                            ("last_action", v_str(&format!("{:?}", record.action))),
                            ("position", json!(runner.supervisor().expected_position())),
                        ]),
                    );
                }
            }
            Err(err) => {
                let fatal = err.downcast_ref::<DuplicateEventError>().is_some();
                json_log(
                    Domain::System,
                    if fatal { "store_corruption" } else { "cycle_error" },
                    obj(&[
                        ("error", v_str(&err.to_string())),
                        ("action", v_str("halt_new_decisions")),
                    ]),
                );
                halted_fatal = true;
            }
        }
    }

    json_log(
        Domain::System,
        "shutdown",
        obj(&[
            ("cycles", v_num(cycles as f64)),
            ("halted", serde_json::Value::Bool(halted_fatal)),
        ]),
    );
    Ok(())
}
