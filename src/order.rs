//! Total-order keys for decoded events.
//!
//! A key is `{slot:020}-{instruction:010}-{inner:010}`. Every component is
//! zero-padded to the width of its type's maximum, so comparing two keys as
//! strings gives the same answer as comparing the numeric triples.

const SLOT_WIDTH: usize = 20;
const INDEX_WIDTH: usize = 10;

pub fn order_index(slot: u64, instruction_index: u32, inner_instruction_index: u32) -> String {
    format!(
        "{:0sw$}-{:0iw$}-{:0iw$}",
        slot,
        instruction_index,
        inner_instruction_index,
        sw = SLOT_WIDTH,
        iw = INDEX_WIDTH
    )
}

/// Inverse of [`order_index`]. Rejects keys that were not produced by it.
pub fn parse_order_index(key: &str) -> Option<(u64, u32, u32)> {
    let mut parts = key.split('-');
    let slot = parts.next()?;
    let ix = parts.next()?;
    let inner = parts.next()?;
    if parts.next().is_some()
        || slot.len() != SLOT_WIDTH
        || ix.len() != INDEX_WIDTH
        || inner.len() != INDEX_WIDTH
    {
        return None;
    }
    if ![slot, ix, inner]
        .iter()
        .all(|p| p.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }
    Some((slot.parse().ok()?, ix.parse().ok()?, inner.parse().ok()?))
}
