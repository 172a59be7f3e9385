//! Interpretation stage machine: one raw event in, domain rows out.
//!
//! | kind                        | requires              | creates        | then                  |
//! |-----------------------------|-----------------------|----------------|-----------------------|
//! | `pool_registered`           | -                     | `Pool`         | -                     |
//! | `qk_with_config_registered` | -                     | `OutcomeConfig`| -                     |
//! | `trial_registered`          | pool, outcome config  | `Trial`        | create game instance  |
//! | `trial_resolved`            | trial                 | marker         | resolve game instance |
//! | `fee_charged`               | trial                 | `Fee`          | -                     |
//!
//! The prerequisite checks, the writes and the follow-up's outbox row share
//! one transaction with the interpretation marker, so a missing prerequisite
//! leaves nothing behind and a committed interpretation never loses its
//! follow-up.

use rusqlite::Connection;

use crate::error::{PipelineError, PipelineResult, Prerequisite};
use crate::events::{
    EventKind, EventPayload, FeeCharged, PoolRegistered, QkWithConfigRegistered, RawEvent,
    TrialRegistered, TrialResolved,
};
use crate::logging::{log, obj, v_str, v_u64, Domain, Level, ProfileScope};
use crate::model::{Fee, OutcomeConfig, Pool, Trial};
use crate::queue::Job;
use crate::storage;

use super::fees::split_fee;
use super::Pipeline;

impl Pipeline {
    /// Interprets the raw event stored under `order_index`. Returns `false`
    /// if it had already been interpreted.
    pub fn interpret(&self, kind: EventKind, order_index: &str) -> PipelineResult<bool> {
        let raw = self
            .store
            .raw_event(order_index)?
            .ok_or_else(|| PipelineError::RawEventNotFound(order_index.to_string()))?;
        if raw.kind() != kind {
            return Err(PipelineError::KindMismatch {
                order_index: order_index.to_string(),
                expected: kind.as_str(),
                actual: raw.kind().as_str(),
            });
        }
        let _scope = ProfileScope::with_context(
            "interpret",
            &[("order_index", v_str(order_index)), ("kind", v_str(kind.as_str()))],
        );

        let applied = self.store.interpret_once(order_index, kind, |tx| {
            let follow_up = match &raw.event {
                EventPayload::PoolRegistered(ev) => self.apply_pool(tx, &raw, ev)?,
                EventPayload::QkWithConfigRegistered(ev) => self.apply_config(tx, &raw, ev)?,
                EventPayload::TrialRegistered(ev) => self.apply_trial(tx, &raw, ev)?,
                EventPayload::TrialResolved(ev) => self.apply_resolution(tx, ev)?,
                EventPayload::FeeCharged(ev) => self.apply_fee(tx, &raw, ev)?,
            };
            if let Some(job) = follow_up {
                storage::enqueue_job(tx, order_index, &job)?;
            }
            Ok(())
        });

        let applied = match applied {
            Err(PipelineError::MissingPrerequisite(missing)) => {
                log(
                    Level::Info,
                    Domain::Interpret,
                    "waiting_on_dependency",
                    obj(&[
                        ("order_index", v_str(order_index)),
                        ("kind", v_str(kind.as_str())),
                        ("missing", v_str(&missing.to_string())),
                    ]),
                );
                return Err(PipelineError::MissingPrerequisite(missing));
            }
            other => other?,
        };

        let sent = self.flush_outbox(order_index)?;
        if !applied {
            log(
                Level::Debug,
                Domain::Interpret,
                "already_interpreted",
                obj(&[("order_index", v_str(order_index))]),
            );
            self.log_redispatch(order_index, sent);
            return Ok(false);
        }

        log(
            Level::Info,
            Domain::Interpret,
            "event_interpreted",
            obj(&[
                ("order_index", v_str(order_index)),
                ("kind", v_str(kind.as_str())),
                ("follow_ups", v_u64(sent as u64)),
            ]),
        );
        Ok(true)
    }

    fn apply_pool(
        &self,
        tx: &Connection,
        raw: &RawEvent,
        ev: &PoolRegistered,
    ) -> PipelineResult<Option<Job>> {
        let pool = Pool {
            address: ev.pool.to_string(),
            manager: ev.manager.to_string(),
            host_fee_percent: ev.host_fee_percent,
            pool_fee_percent: ev.pool_fee_percent,
            min_multiplier: ev.min_multiplier,
            max_multiplier: ev.max_multiplier,
            order_index: raw.order_index.clone(),
        };
        if !storage::insert_pool(tx, &pool)? {
            log(
                Level::Debug,
                Domain::Interpret,
                "pool_exists",
                obj(&[
                    ("order_index", v_str(&raw.order_index)),
                    ("pool", v_str(&pool.address)),
                ]),
            );
        }
        Ok(None)
    }

    fn apply_config(
        &self,
        tx: &Connection,
        raw: &RawEvent,
        ev: &QkWithConfigRegistered,
    ) -> PipelineResult<Option<Job>> {
        let config = OutcomeConfig {
            hash: ev.qk_with_config_hash.clone(),
            q: ev.q.clone(),
            k: ev.k.clone(),
            extra_data_hash: hex::encode(ev.extra_data_hash),
            host_fee_percent: ev.host_fee_percent,
            pool_fee_percent: ev.pool_fee_percent,
            order_index: raw.order_index.clone(),
        };
        storage::insert_outcome_config(tx, &config)?;
        Ok(None)
    }

    fn apply_trial(
        &self,
        tx: &Connection,
        raw: &RawEvent,
        ev: &TrialRegistered,
    ) -> PipelineResult<Option<Job>> {
        let pool = ev.pool.to_string();
        if storage::load_pool(tx, &pool)?.is_none() {
            return Err(PipelineError::missing(Prerequisite::Pool(pool)));
        }
        if storage::load_outcome_config(tx, &ev.qk_with_config_hash)?.is_none() {
            return Err(PipelineError::missing(Prerequisite::OutcomeConfig(
                ev.qk_with_config_hash.clone(),
            )));
        }
        let trial = Trial {
            trial_id: ev.trial_id,
            pool,
            user: ev.user.to_string(),
            multiplier: ev.multiplier,
            qk_with_config_hash: ev.qk_with_config_hash.clone(),
            order_index: raw.order_index.clone(),
            resolution: None,
        };
        if storage::insert_trial(tx, &trial)? {
            Ok(Some(Job::CreateGameInstance { trial_id: ev.trial_id }))
        } else {
            log(
                Level::Warn,
                Domain::Interpret,
                "trial_exists",
                obj(&[
                    ("order_index", v_str(&raw.order_index)),
                    ("trial_id", v_u64(ev.trial_id)),
                ]),
            );
            Ok(None)
        }
    }

    fn apply_resolution(&self, tx: &Connection, ev: &TrialResolved) -> PipelineResult<Option<Job>> {
        if storage::load_trial(tx, ev.trial_id)?.is_none() {
            return Err(PipelineError::missing(Prerequisite::Trial(ev.trial_id)));
        }
        Ok(Some(Job::ResolveGameInstance {
            trial_id: ev.trial_id,
            result_index: ev.result_index,
        }))
    }

    fn apply_fee(
        &self,
        tx: &Connection,
        raw: &RawEvent,
        ev: &FeeCharged,
    ) -> PipelineResult<Option<Job>> {
        if storage::load_trial(tx, ev.trial_id)?.is_none() {
            return Err(PipelineError::missing(Prerequisite::Trial(ev.trial_id)));
        }
        let pool_address = ev.pool.to_string();
        let pool = if self.fee_policy.needs_pool() {
            match storage::load_pool(tx, &pool_address)? {
                Some(pool) => Some(pool),
                None => return Err(PipelineError::missing(Prerequisite::Pool(pool_address))),
            }
        } else {
            None
        };
        let (host_percent, pool_percent) = self.fee_policy.shares(pool.as_ref());
        let (host_amount, pool_amount) = split_fee(ev.fee_amount, host_percent)?;
        let fee = Fee {
            order_index: raw.order_index.clone(),
            trial_id: ev.trial_id,
            pool: pool_address,
            fee_amount: ev.fee_amount,
            host_percent,
            pool_percent,
            host_amount,
            pool_amount,
        };
        storage::insert_fee(tx, &fee)?;
        Ok(None)
    }
}
