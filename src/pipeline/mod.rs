//! The store → interpret → resolve pipeline.
//!
//! Each stage is a method on [`Pipeline`] that does its work against the
//! [`StateStore`] and records the next stage in the outbox in the same
//! transaction. The outbox is then flushed through the injected
//! [`Dispatcher`]. Stages never poll and never sleep; waiting on a
//! prerequisite is expressed as a retryable error and left to the queue.

mod fees;
mod game;
mod interpret;
mod resolve;
mod store;

use std::sync::Arc;

use crate::error::PipelineResult;
use crate::logging::{log, obj, v_str, v_u64, Domain, Level};
use crate::queue::{Dispatcher, Job, JobHandler};
use crate::storage::{self, StateStore};

pub use fees::{split_fee, FeeSplitPolicy};
pub use resolve::{record_play, record_global_play};

pub struct Pipeline {
    store: Arc<StateStore>,
    dispatcher: Arc<dyn Dispatcher>,
    fee_policy: FeeSplitPolicy,
}

impl Pipeline {
    pub fn new(
        store: Arc<StateStore>,
        dispatcher: Arc<dyn Dispatcher>,
        fee_policy: FeeSplitPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            fee_policy,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Dispatches every outbox job written under `source`. Rows are claimed
    /// and deleted in one IMMEDIATE transaction, so concurrent flushers of
    /// the same source hand each job to the dispatcher once. A dispatch
    /// error rolls the claim back and the rows stay pending.
    pub fn flush_outbox(&self, source: &str) -> PipelineResult<usize> {
        self.store.write(|tx| {
            let pending = storage::load_pending_jobs(tx, source)?;
            for (id, job) in &pending {
                self.dispatcher.dispatch(job.clone())?;
                storage::complete_job(tx, *id)?;
            }
            Ok(pending.len())
        })
    }

    /// Flushes every pending outbox row. Run once at startup to hand over
    /// jobs whose dispatch was interrupted by a crash.
    pub fn recover_outbox(&self) -> PipelineResult<usize> {
        let mut dispatched = 0;
        for source in self.store.pending_sources()? {
            dispatched += self.flush_outbox(&source)?;
        }
        if dispatched > 0 {
            log(
                Level::Info,
                Domain::Queue,
                "outbox_recovered",
                obj(&[("jobs", v_u64(dispatched as u64))]),
            );
        }
        Ok(dispatched)
    }

    fn log_redispatch(&self, source: &str, jobs: usize) {
        if jobs > 0 {
            log(
                Level::Warn,
                Domain::Queue,
                "pending_jobs_redispatched",
                obj(&[("source", v_str(source)), ("jobs", v_u64(jobs as u64))]),
            );
        }
    }

    /// Runs one job to completion. Each job name maps to exactly one stage.
    pub fn handle(&self, job: &Job) -> PipelineResult<()> {
        match job {
            Job::StoreTransaction { signature, events } => {
                self.store_batch(signature, events)?;
            }
            Job::Interpret { kind, order_index } => {
                self.interpret(*kind, order_index)?;
            }
            Job::CreateGameInstance { trial_id } => {
                self.create_game_instance(*trial_id)?;
            }
            Job::ResolveGameInstance { trial_id, result_index } => {
                self.resolve_game_instance(*trial_id, *result_index)?;
            }
        }
        Ok(())
    }
}

impl JobHandler for Pipeline {
    fn handle(&self, job: &Job) -> PipelineResult<()> {
        Pipeline::handle(self, job)
    }
}
