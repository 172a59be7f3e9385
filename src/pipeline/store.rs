use crate::error::PipelineResult;
use crate::events::RawEvent;
use crate::logging::{log, obj, v_str, v_u64, Domain, Level};

use super::Pipeline;

impl Pipeline {
    /// Persists one raw event. A new row schedules exactly one interpret job;
    /// an existing row only re-sends an interpret job whose earlier dispatch
    /// failed. Returns whether the row was new.
    pub fn store_event(&self, event: &RawEvent) -> PipelineResult<bool> {
        let inserted = self.store.insert_raw_event(event)?;
        let sent = self.flush_outbox(&event.order_index)?;
        if inserted {
            log(
                Level::Debug,
                Domain::Store,
                "raw_event_stored",
                obj(&[
                    ("order_index", v_str(&event.order_index)),
                    ("kind", v_str(event.kind().as_str())),
                ]),
            );
        } else {
            log(
                Level::Debug,
                Domain::Store,
                "raw_event_duplicate",
                obj(&[("order_index", v_str(&event.order_index))]),
            );
            self.log_redispatch(&event.order_index, sent);
        }
        Ok(inserted)
    }

    /// Stores one transaction's events in decode order. The first failure
    /// aborts the batch so the queue redelivers the whole transaction;
    /// rows already written are skipped as duplicates on the next attempt.
    pub fn store_batch(&self, signature: &str, events: &[RawEvent]) -> PipelineResult<usize> {
        let mut stored = 0;
        for event in events {
            if self.store_event(event)? {
                stored += 1;
            }
        }
        log(
            Level::Info,
            Domain::Store,
            "transaction_stored",
            obj(&[
                ("signature", v_str(signature)),
                ("events", v_u64(events.len() as u64)),
                ("stored", v_u64(stored as u64)),
            ]),
        );
        Ok(stored)
    }
}
