//! Typed protocol events.
//!
//! One struct per event kind, a closed [`EventPayload`] union over them and
//! [`RawEvent`], the immutable stored form carrying provenance and its order
//! key. Amounts that may exceed 2^53 serialize as decimal strings so the
//! stored JSON never loses precision.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::order::order_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey(pub [u8; 32]);

impl Pubkey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl FromStr for Pubkey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec().map_err(|e| e.to_string())?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("pubkey must be 32 bytes, got {}", v.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PoolRegistered,
    QkWithConfigRegistered,
    TrialRegistered,
    TrialResolved,
    FeeCharged,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::PoolRegistered,
        EventKind::QkWithConfigRegistered,
        EventKind::TrialRegistered,
        EventKind::TrialResolved,
        EventKind::FeeCharged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PoolRegistered => "pool_registered",
            EventKind::QkWithConfigRegistered => "qk_with_config_registered",
            EventKind::TrialRegistered => "trial_registered",
            EventKind::TrialResolved => "trial_resolved",
            EventKind::FeeCharged => "fee_charged",
        }
    }

    /// Queue job name for interpreting this kind.
    pub fn job_name(&self) -> &'static str {
        match self {
            EventKind::PoolRegistered => "interpret.pool_registered",
            EventKind::QkWithConfigRegistered => "interpret.qk_with_config_registered",
            EventKind::TrialRegistered => "interpret.trial_registered",
            EventKind::TrialResolved => "interpret.trial_resolved",
            EventKind::FeeCharged => "interpret.fee_charged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRegistered {
    pub pool: Pubkey,
    pub manager: Pubkey,
    /// Fixed-point at SCALE, 10^18 == 100%.
    pub host_fee_percent: u64,
    pub pool_fee_percent: u64,
    pub min_multiplier: u64,
    pub max_multiplier: u64,
}

/// Synthetic event split off an on-chain trial registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QkWithConfigRegistered {
    pub qk_with_config_hash: String,
    #[serde(with = "decimal_vec")]
    pub q: Vec<u128>,
    #[serde(with = "decimal_vec")]
    pub k: Vec<u128>,
    #[serde(with = "hex32")]
    pub extra_data_hash: [u8; 32],
    pub host_fee_percent: u64,
    pub pool_fee_percent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRegistered {
    pub trial_id: u64,
    pub pool: Pubkey,
    pub user: Pubkey,
    pub multiplier: u64,
    pub qk_with_config_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialResolved {
    pub trial_id: u64,
    pub result_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeCharged {
    pub trial_id: u64,
    pub pool: Pubkey,
    pub fee_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    PoolRegistered(PoolRegistered),
    QkWithConfigRegistered(QkWithConfigRegistered),
    TrialRegistered(TrialRegistered),
    TrialResolved(TrialResolved),
    FeeCharged(FeeCharged),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PoolRegistered(_) => EventKind::PoolRegistered,
            EventPayload::QkWithConfigRegistered(_) => EventKind::QkWithConfigRegistered,
            EventPayload::TrialRegistered(_) => EventKind::TrialRegistered,
            EventPayload::TrialResolved(_) => EventKind::TrialResolved,
            EventPayload::FeeCharged(_) => EventKind::FeeCharged,
        }
    }
}

/// Where an event came from on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub signature: String,
    pub slot: u64,
    pub instruction_index: u32,
    pub inner_instruction_index: u32,
    #[serde(default)]
    pub block_time: Option<i64>,
}

/// A decoded event as persisted. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub order_index: String,
    pub provenance: Provenance,
    pub event: EventPayload,
}

impl RawEvent {
    pub fn new(provenance: Provenance, event: EventPayload) -> Self {
        let order_index = order_index(
            provenance.slot,
            provenance.instruction_index,
            provenance.inner_instruction_index,
        );
        Self { order_index, provenance, event }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

pub mod decimal_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[u128], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| v.to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u128>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| s.parse::<u128>().map_err(serde::de::Error::custom))
            .collect()
    }
}

pub mod hex32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pubkey_base58() {
        let key = Pubkey::new([0u8; 32]);
        assert_eq!(key.to_string(), "11111111111111111111111111111111");
        assert_eq!("11111111111111111111111111111111".parse::<Pubkey>().unwrap(), key);
        assert!("1111".parse::<Pubkey>().is_err());
    }

    #[test]
    fn test_raw_event_json_keeps_u128_precision() {
        let ev = RawEvent::new(
            Provenance {
                signature: "sig".to_string(),
                slot: 9,
                instruction_index: 1,
                inner_instruction_index: 0,
                block_time: Some(1_700_000_000),
            },
            EventPayload::QkWithConfigRegistered(QkWithConfigRegistered {
                qk_with_config_hash: "ab".to_string(),
                q: vec![u128::MAX],
                k: vec![2_500_000_000_000_000_000],
                extra_data_hash: [7u8; 32],
                host_fee_percent: 0,
                pool_fee_percent: 0,
            }),
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"]["kind"], "qk_with_config_registered");
        assert_eq!(json["event"]["payload"]["q"][0], u128::MAX.to_string());
        let back: RawEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.order_index, order_index(9, 1, 0));
    }

    #[test]
    fn test_kind_names_unique() {
        let mut names: Vec<_> = EventKind::ALL.iter().map(|k| k.job_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), EventKind::ALL.len());
        assert_eq!(EventKind::parse("fee_charged"), Some(EventKind::FeeCharged));
    }
}
