//! Checkpoint persistence
//!
//! A checkpoint is one JSON record holding the model parameters, optimizer state,
//! EMA shadow, step counter and the run's config. Files are written to a temporary
//! path and renamed into place, so a crash mid-write never damages the previous
//! checkpoint.
//!
//! Layout under an experiment directory:
//!
//! ```text
//! checkpoints/checkpoint_{save_step}.json   periodic snapshots
//! checkpoints/checkpoint_best.json          copy of the last best snapshot
//! checkpoints-meta/checkpoint.json          latest snapshot, used to resume
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{NasDiffError, Result};
use crate::models::{create_score_model, ExponentialMovingAverage, Parameterized, ScoreNetwork};
use crate::training::{Adam, TrainingState};
use crate::utils::RandomSource;

/// Serialized form of a [`TrainingState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step: u64,
    pub model: Vec<f64>,
    #[serde(default)]
    pub optimizer: Option<Adam>,
    #[serde(default)]
    pub ema: Option<ExponentialMovingAverage>,
    pub config: Config,
    #[serde(default)]
    pub save_step: Option<u64>,
    #[serde(default)]
    pub is_best: bool,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn from_state<M: Parameterized>(state: &TrainingState<M>, save_step: Option<u64>, is_best: bool) -> Self {
        Self {
            step: state.step,
            model: state.model.parameters().to_vec(),
            optimizer: Some(state.optimizer.clone()),
            ema: state.ema.clone(),
            config: state.config.clone(),
            save_step,
            is_best,
            saved_at: Utc::now(),
        }
    }

    /// Overwrite `state` with the persisted weights, optimizer, EMA and step
    ///
    /// The state keeps its own config; the record's config is provenance only.
    pub fn apply_to<M: Parameterized>(self, state: &mut TrainingState<M>) -> Result<()> {
        state.model.load_parameters(&self.model)?;
        if let Some(optimizer) = self.optimizer {
            state.optimizer = optimizer;
        }
        if state.ema.is_some() {
            if let Some(ema) = self.ema {
                state.ema = Some(ema);
            }
        }
        state.step = self.step;
        Ok(())
    }
}

fn write_atomic(path: &Path, record: &CheckpointRecord) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut f = File::create(&tmp)?;
    f.write_all(serde_json::to_string(record)?.as_bytes())?;
    f.flush()?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a checkpoint record, failing with `CheckpointNotFound` when absent
pub fn load_record(path: impl AsRef<Path>) -> Result<CheckpointRecord> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(NasDiffError::CheckpointNotFound(path.to_path_buf()));
    }
    let text = fs::read_to_string(path)?;
    let record = serde_json::from_str(&text)
        .map_err(|e| NasDiffError::SerializationError(format!("{}: {}", path.display(), e)))?;
    Ok(record)
}

/// Restore `state` from the checkpoint at `path`; a missing file is an error
pub fn restore_checkpoint<M: Parameterized>(path: impl AsRef<Path>, state: &mut TrainingState<M>) -> Result<()> {
    let record = load_record(&path)?;
    debug!(path = %path.as_ref().display(), step = record.step, "restored checkpoint");
    record.apply_to(state)
}

/// Restore `state` for resuming, returning the restored step
///
/// A missing checkpoint is not an error: the state is left as freshly built and
/// `None` is returned.
pub fn restore_for_resume<M: Parameterized>(
    path: impl AsRef<Path>,
    state: &mut TrainingState<M>,
) -> Result<Option<u64>> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no checkpoint found, starting from scratch");
        return Ok(None);
    }
    restore_checkpoint(path, state)?;
    info!(path = %path.display(), step = state.step, "resuming from checkpoint");
    Ok(Some(state.step))
}

/// A score network frozen at its EMA weights, with the config it was trained under
pub struct FrozenScoreModel {
    pub model: Box<dyn ScoreNetwork>,
    pub config: Config,
    pub step: u64,
}

/// Load a pretrained score network and swap in its EMA weights
pub fn load_frozen_score_model(path: impl AsRef<Path>) -> Result<FrozenScoreModel> {
    let record = load_record(&path)?;
    let mut rng = RandomSource::new(record.config.seed);
    let mut model = create_score_model(&record.config, &mut rng)?;
    model.load_parameters(&record.model)?;
    if let Some(ema) = &record.ema {
        ema.copy_to(&mut model)?;
    }
    info!(
        path = %path.as_ref().display(),
        step = record.step,
        sde = %record.config.training.sde,
        "loaded frozen score model"
    );
    Ok(FrozenScoreModel {
        model,
        config: record.config,
        step: record.step,
    })
}

/// Checkpoint locations of one experiment
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    checkpoint_dir: PathBuf,
    meta_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(exp_dir: impl AsRef<Path>) -> Self {
        let exp_dir = exp_dir.as_ref();
        Self {
            checkpoint_dir: exp_dir.join("checkpoints"),
            meta_path: exp_dir.join("checkpoints-meta").join("checkpoint.json"),
        }
    }

    /// Create both checkpoint directories
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.checkpoint_dir)?;
        if let Some(dir) = self.meta_path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Latest snapshot, the default resume source
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    pub fn checkpoint_path(&self, save_step: u64) -> PathBuf {
        self.checkpoint_dir.join(format!("checkpoint_{}.json", save_step))
    }

    pub fn best_path(&self) -> PathBuf {
        self.checkpoint_dir.join("checkpoint_best.json")
    }

    /// Persist `state` under `save_step`, refresh the latest snapshot and, when
    /// `is_best`, the best snapshot
    pub fn save_checkpoint<M: Parameterized>(
        &self,
        state: &TrainingState<M>,
        save_step: u64,
        is_best: bool,
    ) -> Result<PathBuf> {
        let record = CheckpointRecord::from_state(state, Some(save_step), is_best);
        let path = self.checkpoint_path(save_step);
        write_atomic(&path, &record)?;
        write_atomic(&self.meta_path, &record)?;
        if is_best {
            write_atomic(&self.best_path(), &record)?;
        }
        info!(step = state.step, save_step, is_best, path = %path.display(), "saved checkpoint");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GraphLinearScore;

    fn state() -> TrainingState<GraphLinearScore> {
        let config = Config::scorenet();
        let mut rng = RandomSource::new(3);
        let model = GraphLinearScore::new(7, 4, 0.1, &mut rng);
        TrainingState::new(model, &config, true).unwrap()
    }

    #[test]
    fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut saved = state();
        saved.step = 17;
        saved.model.parameters_mut()[0] = 42.0;
        store.save_checkpoint(&saved, 3, true).unwrap();

        assert!(store.checkpoint_path(3).exists());
        assert!(store.best_path().exists());
        assert!(store.meta_path().exists());

        let mut restored = state();
        restore_checkpoint(store.checkpoint_path(3), &mut restored).unwrap();
        assert_eq!(restored.step, 17);
        assert_eq!(restored.model.parameters()[0], 42.0);
        assert_eq!(restored.ema, saved.ema);
    }

    #[test]
    fn test_not_best_skips_best_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save_checkpoint(&state(), 1, false).unwrap();
        assert!(!store.best_path().exists());
        let record = load_record(store.meta_path()).unwrap();
        assert_eq!(record.save_step, Some(1));
        assert!(!record.is_best);
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let mut s = state();
        assert!(matches!(
            restore_checkpoint(&path, &mut s),
            Err(NasDiffError::CheckpointNotFound(_))
        ));
        assert_eq!(restore_for_resume(&path, &mut s).unwrap(), None);
        assert_eq!(s.step, 0);
    }

    #[test]
    fn test_frozen_model_uses_ema_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut s = state();
        s.model.parameters_mut()[0] = 9.0;
        store.save_checkpoint(&s, 1, false).unwrap();
        let frozen = load_frozen_score_model(store.checkpoint_path(1)).unwrap();
        assert_eq!(frozen.model.parameters(), s.ema.as_ref().unwrap().shadow());
    }
}
