//! Offline decoder: reads JSON-lines transactions and prints every decoded
//! event as one JSON object per line. Touches no storage.
//!
//! Usage: decode [transactions.jsonl]   (stdin when omitted)

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};

use anyhow::{Context, Result};

use trial_indexer::decoder::{decode_transaction, TransactionLogs};

fn main() -> Result<()> {
    let path = std::env::args().nth(1);
    let input: Box<dyn BufRead> = match &path {
        Some(p) => Box::new(BufReader::new(
            File::open(p).with_context(|| format!("opening {}", p))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut events = 0usize;
    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let tx: TransactionLogs = serde_json::from_str(&line)
            .with_context(|| format!("line {}: not a transaction", line_no + 1))?;
        for event in decode_transaction(&tx) {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
            events += 1;
        }
    }
    eprintln!("decoded {} events", events);
    Ok(())
}
