//! Financial resolver.
//!
//! A resolution writes the trial result, the game instance result and both
//! stats rows in one IMMEDIATE transaction. The trial update is guarded by
//! `result_index IS NULL`, so a redelivered or conflicting resolution is a
//! no-op and stats are folded exactly once per trial.

use crate::error::{PipelineError, PipelineResult, Prerequisite};
use crate::fixed_point::{checked_add, settlement_delta, Amount};
use crate::logging::{log, obj, v_str, v_u64, Domain, Level, ProfileScope};
use crate::model::{GameResult, GlobalStats, TrialResolution, TrialState, UserStats};
use crate::storage;

use super::Pipeline;

impl Pipeline {
    /// Settles `trial_id` at outcome `result_index`. Returns the written
    /// result, or `None` if the trial had already been resolved.
    pub fn resolve_game_instance(
        &self,
        trial_id: u64,
        result_index: u32,
    ) -> PipelineResult<Option<GameResult>> {
        let _scope = ProfileScope::with_context("resolve", &[("trial_id", v_u64(trial_id))]);

        let outcome = self.store.write(|tx| {
            let trial = storage::load_trial(tx, trial_id)?
                .ok_or(PipelineError::UnknownTrial(trial_id))?;
            if trial.state() == TrialState::Resolved {
                let stored = trial.resolution.as_ref().map(|r| r.result_index);
                if let Some(stored) = stored.filter(|&i| i != result_index) {
                    log(
                        Level::Warn,
                        Domain::Resolve,
                        "conflicting_resolution",
                        obj(&[
                            ("trial_id", v_u64(trial_id)),
                            ("stored_index", v_u64(stored as u64)),
                            ("requested_index", v_u64(result_index as u64)),
                        ]),
                    );
                }
                return Ok(None);
            }

            let config = storage::load_outcome_config(tx, &trial.qk_with_config_hash)?
                .ok_or_else(|| {
                    PipelineError::missing(Prerequisite::OutcomeConfig(
                        trial.qk_with_config_hash.clone(),
                    ))
                })?;
            if storage::load_raw_event(tx, &trial.order_index)?.is_none() {
                return Err(PipelineError::RawEventNotFound(trial.order_index.clone()));
            }
            if storage::load_game_instance(tx, trial_id)?.is_none() {
                return Err(PipelineError::missing(Prerequisite::GameInstance(trial_id)));
            }

            let result_k = *config.k.get(result_index as usize).ok_or(
                PipelineError::ResultIndexOutOfRange {
                    trial_id,
                    index: result_index,
                    len: config.k.len(),
                },
            )?;
            let delta_amount = settlement_delta(result_k, trial.multiplier)?;

            let resolution = TrialResolution {
                result_index,
                result_k,
                delta_amount,
            };
            if !storage::resolve_trial(tx, trial_id, &resolution)? {
                return Ok(None);
            }

            let result = GameResult {
                result_index,
                result_k: result_k.to_string(),
                multiplier: trial.multiplier,
                delta_amount: delta_amount.to_string(),
                is_win: delta_amount > Amount::ZERO,
            };
            storage::set_game_result(tx, trial_id, &result)?;

            let mut user = storage::load_user_stats(tx, &trial.user)?
                .unwrap_or_else(|| UserStats::empty(&trial.user));
            record_play(&mut user, trial_id, trial.multiplier, delta_amount)?;
            storage::save_user_stats(tx, &user)?;

            let mut global = storage::load_global_stats(tx)?;
            record_global_play(&mut global, trial.multiplier, delta_amount)?;
            storage::save_global_stats(tx, &global)?;

            Ok(Some((result, trial.user)))
        })?;

        match outcome {
            Some((result, user)) => {
                log(
                    Level::Info,
                    Domain::Resolve,
                    "trial_resolved",
                    obj(&[
                        ("trial_id", v_u64(trial_id)),
                        ("user", v_str(&user)),
                        ("result_index", v_u64(result_index as u64)),
                        ("delta_amount", v_str(&result.delta_amount)),
                    ]),
                );
                Ok(Some(result))
            }
            None => {
                log(
                    Level::Debug,
                    Domain::Resolve,
                    "already_resolved",
                    obj(&[("trial_id", v_u64(trial_id))]),
                );
                Ok(None)
            }
        }
    }
}

/// Folds one settled trial into a bettor's running totals. Payout only
/// grows on a positive delta.
pub fn record_play(
    stats: &mut UserStats,
    trial_id: u64,
    wager: u64,
    delta: Amount,
) -> PipelineResult<()> {
    stats.bets += 1;
    if delta > Amount::ZERO {
        stats.wins += 1;
        stats.total_payout = checked_add(stats.total_payout, delta, "user payout")?;
    } else if delta < Amount::ZERO {
        stats.losses += 1;
    }
    stats.total_wagered = checked_add(stats.total_wagered, Amount::from(wager), "user wagered")?;
    stats.last_trial_id = Some(trial_id);
    Ok(())
}

pub fn record_global_play(stats: &mut GlobalStats, wager: u64, delta: Amount) -> PipelineResult<()> {
    stats.plays += 1;
    stats.total_wagered = checked_add(stats.total_wagered, Amount::from(wager), "global wagered")?;
    if delta > Amount::ZERO {
        stats.total_payout = checked_add(stats.total_payout, delta, "global payout")?;
    }
    Ok(())
}
