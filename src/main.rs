use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use trial_indexer::config::Config;
use trial_indexer::decoder::{decode_transaction, TransactionLogs};
use trial_indexer::logging::{log, obj, v_str, v_u64, Domain, Level};
use trial_indexer::pipeline::Pipeline;
use trial_indexer::queue::{Dispatcher, Job, WorkQueue};
use trial_indexer::storage::StateStore;

fn open_input(path: Option<&str>) -> Result<Box<dyn BufRead>> {
    Ok(match path {
        Some(p) => Box::new(BufReader::new(
            File::open(p).with_context(|| format!("opening input {}", p))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store = StateStore::new(&cfg.sqlite_path)
        .with_context(|| format!("opening {}", cfg.sqlite_path))?;
    store.init()?;
    let store = Arc::new(store);

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("workers", v_u64(cfg.queue_workers as u64)),
            ("fee_split", v_str(cfg.fee_split.as_str())),
        ]),
    );

    let queue = WorkQueue::new(cfg.retry.clone(), cfg.queue_workers);
    let handle = queue.handle();
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        Arc::new(handle.clone()),
        cfg.fee_split,
    ));
    let worker = queue.start(pipeline.clone());
    pipeline.recover_outbox()?;

    let input = open_input(cfg.input_path.as_deref())?;
    let mut transactions = 0u64;
    let mut decoded = 0u64;
    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let tx: TransactionLogs = match serde_json::from_str(&line) {
            Ok(tx) => tx,
            Err(e) => {
                log(
                    Level::Warn,
                    Domain::System,
                    "bad_input_line",
                    obj(&[("line", v_u64(line_no as u64)), ("msg", v_str(&e.to_string()))]),
                );
                continue;
            }
        };
        let events = decode_transaction(&tx);
        transactions += 1;
        decoded += events.len() as u64;
        if events.is_empty() {
            continue;
        }
        handle.dispatch(Job::StoreTransaction {
            signature: tx.signature,
            events,
        })?;
    }

    handle.wait_idle().await;
    worker.abort();

    let stats = handle.stats();
    let global = store.global_stats()?;
    let dead = handle.dead_letters();
    log(
        Level::Info,
        Domain::System,
        "summary",
        obj(&[
            ("transactions", v_u64(transactions)),
            ("events_decoded", v_u64(decoded)),
            ("raw_events", v_u64(store.count_raw_events()?)),
            ("plays", v_u64(global.plays)),
            ("total_wagered", v_str(&global.total_wagered.to_string())),
            ("total_payout", v_str(&global.total_payout.to_string())),
            ("queue", json!(stats)),
            ("dead_letters", serde_json::to_value(&dead)?),
        ]),
    );

    Ok(())
}
