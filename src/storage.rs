//! SQLite persistence for raw events and the derived domain model.
//!
//! Every natural key is a PRIMARY KEY and every create is `INSERT OR
//! IGNORE`, so duplicate deliveries collapse in the database rather than in
//! a racy read-then-write. Interpretations run inside one IMMEDIATE
//! transaction together with their `interpretations` marker row; a failed
//! prerequisite check rolls the marker back.
//!
//! Follow-up jobs go through the `outbox` table: a stage writes the job in
//! the same transaction as its effect, and the row is deleted only once the
//! dispatcher accepted it. A failed dispatch leaves the row for the next
//! delivery of the same event to pick up.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use crate::error::{PipelineError, PipelineResult};
use crate::events::{EventKind, EventPayload, Provenance, RawEvent};
use crate::fixed_point::parse_amount;
use crate::order::parse_order_index;
use crate::queue::Job;
use crate::model::{
    Fee, GameInstance, GameResult, GlobalStats, OutcomeConfig, Pool, Trial, TrialResolution,
    UserStats,
};

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS raw_events (
        order_index TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        signature TEXT NOT NULL,
        slot INTEGER NOT NULL,
        instruction_index INTEGER NOT NULL,
        inner_instruction_index INTEGER NOT NULL,
        block_time INTEGER,
        payload TEXT NOT NULL,
        stored_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_raw_events_signature ON raw_events(signature);

    CREATE TABLE IF NOT EXISTS interpretations (
        order_index TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        interpreted_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        job TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_source ON outbox(source);

    CREATE TABLE IF NOT EXISTS pools (
        address TEXT PRIMARY KEY,
        manager TEXT NOT NULL,
        host_fee_percent INTEGER NOT NULL,
        pool_fee_percent INTEGER NOT NULL,
        min_multiplier INTEGER NOT NULL,
        max_multiplier INTEGER NOT NULL,
        order_index TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outcome_configs (
        hash TEXT PRIMARY KEY,
        q TEXT NOT NULL,
        k TEXT NOT NULL,
        extra_data_hash TEXT NOT NULL,
        host_fee_percent INTEGER NOT NULL,
        pool_fee_percent INTEGER NOT NULL,
        order_index TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS trials (
        trial_id INTEGER PRIMARY KEY,
        pool TEXT NOT NULL,
        user TEXT NOT NULL,
        multiplier INTEGER NOT NULL,
        qk_with_config_hash TEXT NOT NULL,
        order_index TEXT NOT NULL,
        result_index INTEGER,
        result_k TEXT,
        delta_amount TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_trials_user ON trials(user);

    CREATE TABLE IF NOT EXISTS game_instances (
        trial_id INTEGER PRIMARY KEY,
        qk_with_config_hash TEXT NOT NULL,
        user TEXT NOT NULL,
        result TEXT,
        created_at INTEGER NOT NULL,
        resolved_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS fees (
        order_index TEXT PRIMARY KEY,
        trial_id INTEGER NOT NULL,
        pool TEXT NOT NULL,
        fee_amount INTEGER NOT NULL,
        host_percent TEXT NOT NULL,
        pool_percent TEXT NOT NULL,
        host_amount TEXT NOT NULL,
        pool_amount TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_stats (
        user TEXT PRIMARY KEY,
        bets INTEGER NOT NULL,
        wins INTEGER NOT NULL,
        losses INTEGER NOT NULL,
        total_wagered TEXT NOT NULL,
        total_payout TEXT NOT NULL,
        last_trial_id INTEGER,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS global_stats (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        plays INTEGER NOT NULL,
        total_wagered TEXT NOT NULL,
        total_payout TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    RawEvents,
    Interpretations,
    Outbox,
    Pools,
    OutcomeConfigs,
    Trials,
    GameInstances,
    Fees,
    UserStats,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::RawEvents => "raw_events",
            Table::Interpretations => "interpretations",
            Table::Outbox => "outbox",
            Table::Pools => "pools",
            Table::OutcomeConfigs => "outcome_configs",
            Table::Trials => "trials",
            Table::GameInstances => "game_instances",
            Table::Fees => "fees",
            Table::UserStats => "user_stats",
        }
    }
}

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    pub fn new(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn in_memory() -> PipelineResult<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    pub fn init(&self) -> PipelineResult<()> {
        self.lock().execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction already rolled back; the connection is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` inside one IMMEDIATE transaction; commits only on `Ok`.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> PipelineResult<T>,
    ) -> PipelineResult<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Claims `order_index` for interpretation and applies `f` atomically
    /// with the claim. Returns `false` without calling `f` when the event was
    /// already interpreted.
    pub fn interpret_once(
        &self,
        order_index: &str,
        kind: EventKind,
        f: impl FnOnce(&Transaction<'_>) -> PipelineResult<()>,
    ) -> PipelineResult<bool> {
        self.write(|tx| {
            let claimed = tx.execute(
                "INSERT OR IGNORE INTO interpretations (order_index, kind, interpreted_at)
                 VALUES (?1, ?2, ?3)",
                params![order_index, kind.as_str(), now_ts()],
            )?;
            if claimed == 0 {
                return Ok(false);
            }
            f(tx)?;
            Ok(true)
        })
    }

    // -------------------------------------------------------------------------
    // Raw events
    // -------------------------------------------------------------------------

    /// Inserts unless the order index is already present. A new row queues
    /// its interpret job in the outbox under the event's order index.
    /// Returns whether a row was written.
    pub fn insert_raw_event(&self, event: &RawEvent) -> PipelineResult<bool> {
        let p = &event.provenance;
        if parse_order_index(&event.order_index)
            != Some((p.slot, p.instruction_index, p.inner_instruction_index))
        {
            return Err(PipelineError::OrderIndexMismatch(event.order_index.clone()));
        }
        let payload = serde_json::to_string(&event.event)?;
        self.write(|tx| {
            let written = tx.execute(
                "INSERT OR IGNORE INTO raw_events (
                    order_index, kind, signature, slot, instruction_index,
                    inner_instruction_index, block_time, payload, stored_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.order_index,
                    event.kind().as_str(),
                    p.signature,
                    p.slot as i64,
                    p.instruction_index,
                    p.inner_instruction_index,
                    p.block_time,
                    payload,
                    now_ts(),
                ],
            )?;
            if written == 1 {
                enqueue_job(tx, &event.order_index, &Job::interpret(event))?;
            }
            Ok(written == 1)
        })
    }

    pub fn raw_event(&self, order_index: &str) -> PipelineResult<Option<RawEvent>> {
        load_raw_event(&self.lock(), order_index)
    }

    pub fn is_interpreted(&self, order_index: &str) -> PipelineResult<bool> {
        let found: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM interpretations WHERE order_index = ?1",
                params![order_index],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Follow-up jobs written under `source` and not yet dispatched.
    pub fn pending_jobs(&self, source: &str) -> PipelineResult<Vec<Job>> {
        Ok(load_pending_jobs(&self.lock(), source)?
            .into_iter()
            .map(|(_, job)| job)
            .collect())
    }

    pub fn pending_sources(&self) -> PipelineResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT source FROM outbox ORDER BY source")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count(&self, table: Table) -> PipelineResult<u64> {
        let n: i64 = self.lock().query_row(
            &format!("SELECT COUNT(*) FROM {}", table.name()),
            [],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn count_raw_events(&self) -> PipelineResult<u64> {
        self.count(Table::RawEvents)
    }

    // -------------------------------------------------------------------------
    // Domain reads
    // -------------------------------------------------------------------------

    pub fn pool(&self, address: &str) -> PipelineResult<Option<Pool>> {
        load_pool(&self.lock(), address)
    }

    pub fn outcome_config(&self, hash: &str) -> PipelineResult<Option<OutcomeConfig>> {
        load_outcome_config(&self.lock(), hash)
    }

    pub fn trial(&self, trial_id: u64) -> PipelineResult<Option<Trial>> {
        load_trial(&self.lock(), trial_id)
    }

    pub fn game_instance(&self, trial_id: u64) -> PipelineResult<Option<GameInstance>> {
        load_game_instance(&self.lock(), trial_id)
    }

    pub fn fee(&self, order_index: &str) -> PipelineResult<Option<Fee>> {
        load_fee(&self.lock(), order_index)
    }

    pub fn user_stats(&self, user: &str) -> PipelineResult<Option<UserStats>> {
        load_user_stats(&self.lock(), user)
    }

    pub fn global_stats(&self) -> PipelineResult<GlobalStats> {
        load_global_stats(&self.lock())
    }
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn u128_json(values: &[u128]) -> String {
    serde_json::Value::Array(
        values
            .iter()
            .map(|v| serde_json::Value::String(v.to_string()))
            .collect(),
    )
    .to_string()
}

fn parse_u128_json(column: &'static str, text: &str) -> PipelineResult<Vec<u128>> {
    let raw: Vec<String> = serde_json::from_str(text)?;
    raw.iter()
        .map(|s| parse_u128(column, s))
        .collect()
}

fn parse_u128(column: &'static str, text: &str) -> PipelineResult<u128> {
    text.parse().map_err(|_| PipelineError::CorruptValue {
        column,
        value: text.to_string(),
    })
}

// =============================================================================
// Row-level helpers, usable inside a transaction
// =============================================================================

pub fn load_raw_event(conn: &Connection, order_index: &str) -> PipelineResult<Option<RawEvent>> {
    let row = conn
        .query_row(
            "SELECT signature, slot, instruction_index, inner_instruction_index, block_time,
                    payload, kind
             FROM raw_events WHERE order_index = ?1",
            params![order_index],
            |r| {
                Ok((
                    Provenance {
                        signature: r.get(0)?,
                        slot: r.get::<_, i64>(1)? as u64,
                        instruction_index: r.get(2)?,
                        inner_instruction_index: r.get(3)?,
                        block_time: r.get(4)?,
                    },
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((provenance, payload, kind)) => {
            let event: EventPayload = serde_json::from_str(&payload)?;
            if EventKind::parse(&kind) != Some(event.kind()) {
                return Err(PipelineError::CorruptValue {
                    column: "raw_events.kind",
                    value: kind,
                });
            }
            Ok(Some(RawEvent {
                order_index: order_index.to_string(),
                provenance,
                event,
            }))
        }
        None => Ok(None),
    }
}

pub fn enqueue_job(conn: &Connection, source: &str, job: &Job) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO outbox (source, job, created_at) VALUES (?1, ?2, ?3)",
        params![source, serde_json::to_string(job)?, now_ts()],
    )?;
    Ok(())
}

/// Outbox rows for `source` in insertion order, with their row ids.
pub fn load_pending_jobs(conn: &Connection, source: &str) -> PipelineResult<Vec<(i64, Job)>> {
    let mut stmt = conn.prepare("SELECT id, job FROM outbox WHERE source = ?1 ORDER BY id")?;
    let rows = stmt
        .query_map(params![source], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(id, text)| -> PipelineResult<(i64, Job)> {
            Ok((id, serde_json::from_str(&text)?))
        })
        .collect()
}

pub fn complete_job(conn: &Connection, id: i64) -> PipelineResult<()> {
    conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn insert_pool(conn: &Connection, pool: &Pool) -> PipelineResult<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO pools (
            address, manager, host_fee_percent, pool_fee_percent,
            min_multiplier, max_multiplier, order_index
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            pool.address,
            pool.manager,
            pool.host_fee_percent as i64,
            pool.pool_fee_percent as i64,
            pool.min_multiplier as i64,
            pool.max_multiplier as i64,
            pool.order_index,
        ],
    )?;
    Ok(n == 1)
}

pub fn load_pool(conn: &Connection, address: &str) -> PipelineResult<Option<Pool>> {
    Ok(conn
        .query_row(
            "SELECT address, manager, host_fee_percent, pool_fee_percent,
                    min_multiplier, max_multiplier, order_index
             FROM pools WHERE address = ?1",
            params![address],
            |r| {
                Ok(Pool {
                    address: r.get(0)?,
                    manager: r.get(1)?,
                    host_fee_percent: r.get::<_, i64>(2)? as u64,
                    pool_fee_percent: r.get::<_, i64>(3)? as u64,
                    min_multiplier: r.get::<_, i64>(4)? as u64,
                    max_multiplier: r.get::<_, i64>(5)? as u64,
                    order_index: r.get(6)?,
                })
            },
        )
        .optional()?)
}

pub fn insert_outcome_config(conn: &Connection, cfg: &OutcomeConfig) -> PipelineResult<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO outcome_configs (
            hash, q, k, extra_data_hash, host_fee_percent, pool_fee_percent, order_index
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            cfg.hash,
            u128_json(&cfg.q),
            u128_json(&cfg.k),
            cfg.extra_data_hash,
            cfg.host_fee_percent as i64,
            cfg.pool_fee_percent as i64,
            cfg.order_index,
        ],
    )?;
    Ok(n == 1)
}

pub fn load_outcome_config(conn: &Connection, hash: &str) -> PipelineResult<Option<OutcomeConfig>> {
    let row = conn
        .query_row(
            "SELECT q, k, extra_data_hash, host_fee_percent, pool_fee_percent, order_index
             FROM outcome_configs WHERE hash = ?1",
            params![hash],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)? as u64,
                    r.get::<_, i64>(4)? as u64,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((q, k, extra_data_hash, host_fee_percent, pool_fee_percent, order_index)) = row else {
        return Ok(None);
    };
    Ok(Some(OutcomeConfig {
        hash: hash.to_string(),
        q: parse_u128_json("outcome_configs.q", &q)?,
        k: parse_u128_json("outcome_configs.k", &k)?,
        extra_data_hash,
        host_fee_percent,
        pool_fee_percent,
        order_index,
    }))
}

pub fn insert_trial(conn: &Connection, trial: &Trial) -> PipelineResult<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO trials (
            trial_id, pool, user, multiplier, qk_with_config_hash, order_index
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            trial.trial_id as i64,
            trial.pool,
            trial.user,
            trial.multiplier as i64,
            trial.qk_with_config_hash,
            trial.order_index,
        ],
    )?;
    Ok(n == 1)
}

type TrialRow = (
    String,
    String,
    i64,
    String,
    String,
    Option<u32>,
    Option<String>,
    Option<String>,
);

fn trial_row(r: &Row<'_>) -> rusqlite::Result<TrialRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

pub fn load_trial(conn: &Connection, trial_id: u64) -> PipelineResult<Option<Trial>> {
    let row = conn
        .query_row(
            "SELECT pool, user, multiplier, qk_with_config_hash, order_index,
                    result_index, result_k, delta_amount
             FROM trials WHERE trial_id = ?1",
            params![trial_id as i64],
            trial_row,
        )
        .optional()?;
    let Some((pool, user, multiplier, hash, order_index, result_index, result_k, delta)) = row
    else {
        return Ok(None);
    };
    let resolution = match (result_index, result_k, delta) {
        (Some(result_index), Some(result_k), Some(delta)) => Some(TrialResolution {
            result_index,
            result_k: parse_u128("trials.result_k", &result_k)?,
            delta_amount: parse_amount("trials.delta_amount", &delta)?,
        }),
        _ => None,
    };
    Ok(Some(Trial {
        trial_id,
        pool,
        user,
        multiplier: multiplier as u64,
        qk_with_config_hash: hash,
        order_index,
        resolution,
    }))
}

/// Writes the resolution only if the trial has none. Returns whether it did.
pub fn resolve_trial(
    conn: &Connection,
    trial_id: u64,
    resolution: &TrialResolution,
) -> PipelineResult<bool> {
    let n = conn.execute(
        "UPDATE trials SET result_index = ?2, result_k = ?3, delta_amount = ?4
         WHERE trial_id = ?1 AND result_index IS NULL",
        params![
            trial_id as i64,
            resolution.result_index,
            resolution.result_k.to_string(),
            resolution.delta_amount.to_string(),
        ],
    )?;
    Ok(n == 1)
}

pub fn insert_game_instance(conn: &Connection, game: &GameInstance) -> PipelineResult<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO game_instances (trial_id, qk_with_config_hash, user, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![game.trial_id as i64, game.qk_with_config_hash, game.user, now_ts()],
    )?;
    Ok(n == 1)
}

pub fn load_game_instance(conn: &Connection, trial_id: u64) -> PipelineResult<Option<GameInstance>> {
    let row = conn
        .query_row(
            "SELECT qk_with_config_hash, user, result FROM game_instances WHERE trial_id = ?1",
            params![trial_id as i64],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((qk_with_config_hash, user, result)) = row else {
        return Ok(None);
    };
    let result = match result {
        Some(text) => Some(serde_json::from_str::<GameResult>(&text)?),
        None => None,
    };
    Ok(Some(GameInstance { trial_id, qk_with_config_hash, user, result }))
}

pub fn set_game_result(conn: &Connection, trial_id: u64, result: &GameResult) -> PipelineResult<()> {
    conn.execute(
        "UPDATE game_instances SET result = ?2, resolved_at = ?3 WHERE trial_id = ?1",
        params![trial_id as i64, serde_json::to_string(result)?, now_ts()],
    )?;
    Ok(())
}

pub fn insert_fee(conn: &Connection, fee: &Fee) -> PipelineResult<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO fees (
            order_index, trial_id, pool, fee_amount,
            host_percent, pool_percent, host_amount, pool_amount
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            fee.order_index,
            fee.trial_id as i64,
            fee.pool,
            fee.fee_amount as i64,
            fee.host_percent.to_string(),
            fee.pool_percent.to_string(),
            fee.host_amount.to_string(),
            fee.pool_amount.to_string(),
        ],
    )?;
    Ok(n == 1)
}

pub fn load_fee(conn: &Connection, order_index: &str) -> PipelineResult<Option<Fee>> {
    let row = conn
        .query_row(
            "SELECT trial_id, pool, fee_amount, host_percent, pool_percent, host_amount, pool_amount
             FROM fees WHERE order_index = ?1",
            params![order_index],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((trial_id, pool, fee_amount, host_pct, pool_pct, host_amt, pool_amt)) = row else {
        return Ok(None);
    };
    Ok(Some(Fee {
        order_index: order_index.to_string(),
        trial_id: trial_id as u64,
        pool,
        fee_amount: fee_amount as u64,
        host_percent: parse_u128("fees.host_percent", &host_pct)?,
        pool_percent: parse_u128("fees.pool_percent", &pool_pct)?,
        host_amount: parse_amount("fees.host_amount", &host_amt)?,
        pool_amount: parse_amount("fees.pool_amount", &pool_amt)?,
    }))
}

pub fn load_user_stats(conn: &Connection, user: &str) -> PipelineResult<Option<UserStats>> {
    let row = conn
        .query_row(
            "SELECT bets, wins, losses, total_wagered, total_payout, last_trial_id
             FROM user_stats WHERE user = ?1",
            params![user],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<i64>>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((bets, wins, losses, wagered, payout, last_trial_id)) = row else {
        return Ok(None);
    };
    Ok(Some(UserStats {
        user: user.to_string(),
        bets: bets as u64,
        wins: wins as u64,
        losses: losses as u64,
        total_wagered: parse_amount("user_stats.total_wagered", &wagered)?,
        total_payout: parse_amount("user_stats.total_payout", &payout)?,
        last_trial_id: last_trial_id.map(|v| v as u64),
    }))
}

pub fn save_user_stats(conn: &Connection, stats: &UserStats) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO user_stats (
            user, bets, wins, losses, total_wagered, total_payout, last_trial_id, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(user) DO UPDATE SET
            bets = excluded.bets,
            wins = excluded.wins,
            losses = excluded.losses,
            total_wagered = excluded.total_wagered,
            total_payout = excluded.total_payout,
            last_trial_id = excluded.last_trial_id,
            updated_at = excluded.updated_at",
        params![
            stats.user,
            stats.bets as i64,
            stats.wins as i64,
            stats.losses as i64,
            stats.total_wagered.to_string(),
            stats.total_payout.to_string(),
            stats.last_trial_id.map(|v| v as i64),
            now_ts(),
        ],
    )?;
    Ok(())
}

pub fn load_global_stats(conn: &Connection) -> PipelineResult<GlobalStats> {
    let row = conn
        .query_row(
            "SELECT plays, total_wagered, total_payout FROM global_stats WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((plays, wagered, payout)) = row else {
        return Ok(GlobalStats::default());
    };
    Ok(GlobalStats {
        plays: plays as u64,
        total_wagered: parse_amount("global_stats.total_wagered", &wagered)?,
        total_payout: parse_amount("global_stats.total_payout", &payout)?,
    })
}

pub fn save_global_stats(conn: &Connection, stats: &GlobalStats) -> PipelineResult<()> {
    conn.execute(
        "INSERT INTO global_stats (id, plays, total_wagered, total_payout, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            plays = excluded.plays,
            total_wagered = excluded.total_wagered,
            total_payout = excluded.total_payout,
            updated_at = excluded.updated_at",
        params![
            stats.plays as i64,
            stats.total_wagered.to_string(),
            stats.total_payout.to_string(),
            now_ts(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PoolRegistered, Pubkey};
    use crate::fixed_point::Amount;

    fn store() -> StateStore {
        let s = StateStore::in_memory().unwrap();
        s.init().unwrap();
        s
    }

    fn pool_event(slot: u64) -> RawEvent {
        RawEvent::new(
            Provenance {
                signature: "sig".into(),
                slot,
                instruction_index: 0,
                inner_instruction_index: 0,
                block_time: None,
            },
            EventPayload::PoolRegistered(PoolRegistered {
                pool: Pubkey::new([1u8; 32]),
                manager: Pubkey::new([2u8; 32]),
                host_fee_percent: u64::MAX,
                pool_fee_percent: 0,
                min_multiplier: 1,
                max_multiplier: 2,
            }),
        )
    }

    #[test]
    fn test_raw_event_insert_is_idempotent() {
        let s = store();
        let ev = pool_event(10);
        assert!(s.insert_raw_event(&ev).unwrap());
        assert!(!s.insert_raw_event(&ev).unwrap());
        assert_eq!(s.count(Table::RawEvents).unwrap(), 1);
        assert_eq!(s.raw_event(&ev.order_index).unwrap(), Some(ev.clone()));
        assert_eq!(s.pending_jobs(&ev.order_index).unwrap(), vec![Job::interpret(&ev)]);
    }

    #[test]
    fn test_raw_event_with_foreign_order_index_is_rejected() {
        let s = store();
        let mut ev = pool_event(10);
        ev.order_index = crate::order::order_index(11, 0, 0);
        let err = s.insert_raw_event(&ev).unwrap_err();
        assert!(matches!(err, PipelineError::OrderIndexMismatch(_)));
        assert!(!err.is_retryable());
        assert_eq!(s.count(Table::RawEvents).unwrap(), 0);
    }

    #[test]
    fn test_kind_column_must_match_payload() {
        let s = store();
        let ev = pool_event(12);
        s.insert_raw_event(&ev).unwrap();
        s.write(|tx| {
            tx.execute(
                "UPDATE raw_events SET kind = 'fee_charged' WHERE order_index = ?1",
                params![ev.order_index],
            )?;
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            s.raw_event(&ev.order_index).unwrap_err(),
            PipelineError::CorruptValue { column: "raw_events.kind", .. }
        ));
    }

    #[test]
    fn test_outbox_rows_survive_until_completed() {
        let s = store();
        let job = Job::CreateGameInstance { trial_id: 7 };
        s.write(|tx| {
            enqueue_job(tx, "k1", &job)?;
            enqueue_job(tx, "k2", &Job::CreateGameInstance { trial_id: 8 })
        })
        .unwrap();
        assert_eq!(s.pending_sources().unwrap(), vec!["k1".to_string(), "k2".to_string()]);

        let pending = s.write(|tx| load_pending_jobs(tx, "k1")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, job);
        s.write(|tx| complete_job(tx, pending[0].0)).unwrap();
        assert!(s.pending_jobs("k1").unwrap().is_empty());
        assert_eq!(s.count(Table::Outbox).unwrap(), 1);
    }

    #[test]
    fn test_interpret_once_claims_and_rolls_back() {
        let s = store();
        let failed = s.interpret_once("k1", EventKind::PoolRegistered, |_| {
            Err(PipelineError::missing(crate::error::Prerequisite::Trial(1)))
        });
        assert!(failed.is_err());
        assert!(!s.is_interpreted("k1").unwrap());

        assert!(s.interpret_once("k1", EventKind::PoolRegistered, |_| Ok(())).unwrap());
        assert!(!s
            .interpret_once("k1", EventKind::PoolRegistered, |_| panic!("must not rerun"))
            .unwrap());
        assert!(s.is_interpreted("k1").unwrap());
    }

    #[test]
    fn test_u64_columns_survive_high_bit() {
        let s = store();
        let pool = Pool {
            address: "p".into(),
            manager: "m".into(),
            host_fee_percent: u64::MAX,
            pool_fee_percent: 1 << 63,
            min_multiplier: 0,
            max_multiplier: 7,
            order_index: "o".into(),
        };
        s.write(|tx| insert_pool(tx, &pool)).unwrap();
        assert_eq!(s.pool("p").unwrap(), Some(pool));
    }

    #[test]
    fn test_trial_resolves_once() {
        let s = store();
        let trial = Trial {
            trial_id: 9,
            pool: "p".into(),
            user: "u".into(),
            multiplier: 100,
            qk_with_config_hash: "h".into(),
            order_index: "o".into(),
            resolution: None,
        };
        s.write(|tx| insert_trial(tx, &trial)).unwrap();
        let first = TrialResolution {
            result_index: 0,
            result_k: 3,
            delta_amount: Amount::from(-5i64),
        };
        let second = TrialResolution { result_index: 1, ..first.clone() };
        assert!(s.write(|tx| resolve_trial(tx, 9, &first)).unwrap());
        assert!(!s.write(|tx| resolve_trial(tx, 9, &second)).unwrap());
        assert_eq!(s.trial(9).unwrap().unwrap().resolution, Some(first));
    }

    #[test]
    fn test_global_stats_default_then_saved() {
        let s = store();
        assert_eq!(s.global_stats().unwrap(), GlobalStats::default());
        let stats = GlobalStats {
            plays: 2,
            total_wagered: Amount::from(10u64),
            total_payout: Amount::from(4u64),
        };
        s.write(|tx| save_global_stats(tx, &stats)).unwrap();
        assert_eq!(s.global_stats().unwrap(), stats);
    }
}
