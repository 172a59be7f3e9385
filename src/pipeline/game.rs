use crate::error::{PipelineError, PipelineResult};
use crate::logging::{log, obj, v_u64, Domain, Level};
use crate::model::GameInstance;
use crate::storage;

use super::Pipeline;

impl Pipeline {
    /// Creates the game-side shadow of a registered trial. Returns `false`
    /// when it already exists.
    pub fn create_game_instance(&self, trial_id: u64) -> PipelineResult<bool> {
        let created = self.store.write(|tx| {
            // Only scheduled after the trial commits, so absence is corruption.
            let trial = storage::load_trial(tx, trial_id)?
                .ok_or(PipelineError::UnknownTrial(trial_id))?;
            let game = GameInstance {
                trial_id,
                qk_with_config_hash: trial.qk_with_config_hash,
                user: trial.user,
                result: None,
            };
            storage::insert_game_instance(tx, &game)
        })?;
        log(
            if created { Level::Info } else { Level::Debug },
            Domain::Resolve,
            if created { "game_instance_created" } else { "game_instance_exists" },
            obj(&[("trial_id", v_u64(trial_id))]),
        );
        Ok(created)
    }
}
