//! Program-log decoder.
//!
//! Scans a transaction's log lines for `Program data: <base64>`, matches the
//! 8-byte discriminator against the known event table and decodes the
//! little-endian payload. One on-chain trial registration expands into two
//! events: the outcome config it carries, then the trial itself, so the
//! config always sorts ahead of the trial that references it.
//!
//! Unknown discriminators are skipped. A malformed line is logged and skipped
//! without affecting the rest of the transaction.

use std::collections::HashMap;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::events::{
    EventPayload, FeeCharged, PoolRegistered, Provenance, Pubkey, QkWithConfigRegistered,
    RawEvent, TrialRegistered, TrialResolved,
};
use crate::logging::{log, obj, v_str, v_u64, Domain, Level};

pub const LOG_PREFIX: &str = "Program data: ";

const DISCRIMINATOR_LEN: usize = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("payload shorter than discriminator ({0} bytes)")]
    MissingDiscriminator(usize),
    #[error("unexpected end of payload reading {field}: need {needed} bytes, {remaining} left")]
    UnexpectedEof {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("q/k length mismatch: q has {q}, k has {k}")]
    LengthMismatch { q: usize, k: usize },
}

/// One transaction's logs as delivered by the chain-log fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogs {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    pub instruction_index: u32,
    pub logs: Vec<String>,
}

/// The on-chain trial registration before it is split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialRegisteredLog {
    pub trial_id: u64,
    pub pool: Pubkey,
    pub user: Pubkey,
    pub multiplier: u64,
    pub q: Vec<u128>,
    pub k: Vec<u128>,
    pub extra_data_hash: [u8; 32],
    pub host_fee_percent: u64,
    pub pool_fee_percent: u64,
}

/// Events as the program emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnChainEvent {
    PoolRegistered(PoolRegistered),
    TrialRegistered(TrialRegisteredLog),
    TrialResolved(TrialResolved),
    FeeCharged(FeeCharged),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WireKind {
    PoolRegistered,
    TrialRegistered,
    TrialResolved,
    FeeCharged,
}

impl WireKind {
    const ALL: [WireKind; 4] = [
        WireKind::PoolRegistered,
        WireKind::TrialRegistered,
        WireKind::TrialResolved,
        WireKind::FeeCharged,
    ];

    fn event_name(&self) -> &'static str {
        match self {
            WireKind::PoolRegistered => "PoolRegistered",
            WireKind::TrialRegistered => "TrialRegistered",
            WireKind::TrialResolved => "TrialResolved",
            WireKind::FeeCharged => "FeeCharged",
        }
    }
}

/// `sha256("event:<Name>")[..8]`
pub fn discriminator(event_name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("event:{}", event_name).as_bytes());
    let mut out = [0u8; DISCRIMINATOR_LEN];
    out.copy_from_slice(&digest[..DISCRIMINATOR_LEN]);
    out
}

fn discriminator_table() -> &'static HashMap<[u8; 8], WireKind> {
    static TABLE: OnceLock<HashMap<[u8; 8], WireKind>> = OnceLock::new();
    TABLE.get_or_init(|| {
        WireKind::ALL
            .iter()
            .map(|kind| (discriminator(kind.event_name()), *kind))
            .collect()
    })
}

/// Content hash of a payout table: `sha256(le128(q) ++ le128(k) ++ extra)`.
pub fn qk_config_hash(q: &[u128], k: &[u128], extra_data_hash: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    for v in q.iter().chain(k.iter()) {
        hasher.update(v.to_le_bytes());
    }
    hasher.update(extra_data_hash);
    hex::encode(hasher.finalize())
}

// =============================================================================
// Byte cursor
// =============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(DecodeError::UnexpectedEof { field, needed: n, remaining });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(field, 4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(field, 8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn u128(&mut self, field: &'static str) -> Result<u128, DecodeError> {
        let mut b = [0u8; 16];
        b.copy_from_slice(self.take(field, 16)?);
        Ok(u128::from_le_bytes(b))
    }

    fn bytes32(&mut self, field: &'static str) -> Result<[u8; 32], DecodeError> {
        let mut b = [0u8; 32];
        b.copy_from_slice(self.take(field, 32)?);
        Ok(b)
    }

    fn pubkey(&mut self, field: &'static str) -> Result<Pubkey, DecodeError> {
        self.bytes32(field).map(Pubkey::new)
    }

    fn vec_u128(&mut self, field: &'static str) -> Result<Vec<u128>, DecodeError> {
        let len = self.u32(field)? as usize;
        // Bounds-check the whole array before allocating it.
        let remaining = self.buf.len() - self.pos;
        let needed = len.saturating_mul(16);
        if remaining < needed {
            return Err(DecodeError::UnexpectedEof { field, needed, remaining });
        }
        (0..len).map(|_| self.u128(field)).collect()
    }
}

// =============================================================================
// Layouts
// =============================================================================

fn decode_payload(kind: WireKind, data: &[u8]) -> Result<OnChainEvent, DecodeError> {
    let mut r = Reader::new(data);
    let event = match kind {
        WireKind::PoolRegistered => OnChainEvent::PoolRegistered(PoolRegistered {
            pool: r.pubkey("pool")?,
            manager: r.pubkey("manager")?,
            host_fee_percent: r.u64("host_fee_percent")?,
            pool_fee_percent: r.u64("pool_fee_percent")?,
            min_multiplier: r.u64("min_multiplier")?,
            max_multiplier: r.u64("max_multiplier")?,
        }),
        WireKind::TrialRegistered => {
            let trial_id = r.u64("trial_id")?;
            let pool = r.pubkey("pool")?;
            let user = r.pubkey("user")?;
            let multiplier = r.u64("multiplier")?;
            let q = r.vec_u128("q")?;
            let k = r.vec_u128("k")?;
            if q.len() != k.len() {
                return Err(DecodeError::LengthMismatch { q: q.len(), k: k.len() });
            }
            OnChainEvent::TrialRegistered(TrialRegisteredLog {
                trial_id,
                pool,
                user,
                multiplier,
                q,
                k,
                extra_data_hash: r.bytes32("extra_data_hash")?,
                host_fee_percent: r.u64("host_fee_percent")?,
                pool_fee_percent: r.u64("pool_fee_percent")?,
            })
        }
        WireKind::TrialResolved => OnChainEvent::TrialResolved(TrialResolved {
            trial_id: r.u64("trial_id")?,
            result_index: r.u32("result_index")?,
        }),
        WireKind::FeeCharged => OnChainEvent::FeeCharged(FeeCharged {
            trial_id: r.u64("trial_id")?,
            pool: r.pubkey("pool")?,
            fee_amount: r.u64("fee_amount")?,
        }),
    };
    Ok(event)
}

/// Decodes one base64 body. `Ok(None)` means an unknown discriminator.
pub fn decode_program_data(body: &str) -> Result<Option<OnChainEvent>, DecodeError> {
    let bytes = STANDARD
        .decode(body.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))?;
    if bytes.len() < DISCRIMINATOR_LEN {
        return Err(DecodeError::MissingDiscriminator(bytes.len()));
    }
    let (disc, data) = bytes.split_at(DISCRIMINATOR_LEN);
    let mut key = [0u8; DISCRIMINATOR_LEN];
    key.copy_from_slice(disc);
    match discriminator_table().get(&key) {
        Some(kind) => decode_payload(*kind, data).map(Some),
        None => Ok(None),
    }
}

impl OnChainEvent {
    /// Domain events in the order they must be stored.
    pub fn into_payloads(self) -> Vec<EventPayload> {
        match self {
            OnChainEvent::PoolRegistered(ev) => vec![EventPayload::PoolRegistered(ev)],
            OnChainEvent::TrialRegistered(ev) => {
                let hash = qk_config_hash(&ev.q, &ev.k, &ev.extra_data_hash);
                vec![
                    EventPayload::QkWithConfigRegistered(QkWithConfigRegistered {
                        qk_with_config_hash: hash.clone(),
                        q: ev.q,
                        k: ev.k,
                        extra_data_hash: ev.extra_data_hash,
                        host_fee_percent: ev.host_fee_percent,
                        pool_fee_percent: ev.pool_fee_percent,
                    }),
                    EventPayload::TrialRegistered(TrialRegistered {
                        trial_id: ev.trial_id,
                        pool: ev.pool,
                        user: ev.user,
                        multiplier: ev.multiplier,
                        qk_with_config_hash: hash,
                    }),
                ]
            }
            OnChainEvent::TrialResolved(ev) => vec![EventPayload::TrialResolved(ev)],
            OnChainEvent::FeeCharged(ev) => vec![EventPayload::FeeCharged(ev)],
        }
    }

    /// Encodes to a `Program data:` log line, the inverse of the decoder.
    pub fn to_log_line(&self) -> String {
        let mut buf = Vec::new();
        match self {
            OnChainEvent::PoolRegistered(ev) => {
                buf.extend_from_slice(&discriminator(WireKind::PoolRegistered.event_name()));
                buf.extend_from_slice(ev.pool.as_bytes());
                buf.extend_from_slice(ev.manager.as_bytes());
                buf.extend_from_slice(&ev.host_fee_percent.to_le_bytes());
                buf.extend_from_slice(&ev.pool_fee_percent.to_le_bytes());
                buf.extend_from_slice(&ev.min_multiplier.to_le_bytes());
                buf.extend_from_slice(&ev.max_multiplier.to_le_bytes());
            }
            OnChainEvent::TrialRegistered(ev) => {
                buf.extend_from_slice(&discriminator(WireKind::TrialRegistered.event_name()));
                buf.extend_from_slice(&ev.trial_id.to_le_bytes());
                buf.extend_from_slice(ev.pool.as_bytes());
                buf.extend_from_slice(ev.user.as_bytes());
                buf.extend_from_slice(&ev.multiplier.to_le_bytes());
                for arr in [&ev.q, &ev.k] {
                    buf.extend_from_slice(&(arr.len() as u32).to_le_bytes());
                    for v in arr.iter() {
                        buf.extend_from_slice(&v.to_le_bytes());
                    }
                }
                buf.extend_from_slice(&ev.extra_data_hash);
                buf.extend_from_slice(&ev.host_fee_percent.to_le_bytes());
                buf.extend_from_slice(&ev.pool_fee_percent.to_le_bytes());
            }
            OnChainEvent::TrialResolved(ev) => {
                buf.extend_from_slice(&discriminator(WireKind::TrialResolved.event_name()));
                buf.extend_from_slice(&ev.trial_id.to_le_bytes());
                buf.extend_from_slice(&ev.result_index.to_le_bytes());
            }
            OnChainEvent::FeeCharged(ev) => {
                buf.extend_from_slice(&discriminator(WireKind::FeeCharged.event_name()));
                buf.extend_from_slice(&ev.trial_id.to_le_bytes());
                buf.extend_from_slice(ev.pool.as_bytes());
                buf.extend_from_slice(&ev.fee_amount.to_le_bytes());
            }
        }
        format!("{}{}", LOG_PREFIX, STANDARD.encode(buf))
    }
}

/// Decodes every event in one transaction. Inner-instruction indices are
/// handed out in decode order, so a split trial registration yields the
/// config at `n` and the trial at `n + 1`.
pub fn decode_transaction(tx: &TransactionLogs) -> Vec<RawEvent> {
    let mut out = Vec::new();
    let mut inner: u32 = 0;

    for (line_no, line) in tx.logs.iter().enumerate() {
        let Some(body) = line.strip_prefix(LOG_PREFIX) else {
            continue;
        };
        match decode_program_data(body) {
            Ok(Some(event)) => {
                for payload in event.into_payloads() {
                    let provenance = Provenance {
                        signature: tx.signature.clone(),
                        slot: tx.slot,
                        instruction_index: tx.instruction_index,
                        inner_instruction_index: inner,
                        block_time: tx.block_time,
                    };
                    inner += 1;
                    out.push(RawEvent::new(provenance, payload));
                }
            }
            Ok(None) => {
                log(
                    Level::Debug,
                    Domain::Decode,
                    "unknown_discriminator",
                    obj(&[("signature", v_str(&tx.signature)), ("line", v_u64(line_no as u64))]),
                );
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Decode,
                    "malformed_line",
                    obj(&[
                        ("signature", v_str(&tx.signature)),
                        ("slot", v_u64(tx.slot)),
                        ("line", v_u64(line_no as u64)),
                        ("msg", v_str(&err.to_string())),
                    ]),
                );
            }
        }
    }

    out
}
