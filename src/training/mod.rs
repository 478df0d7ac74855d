//! Training loops and their building blocks
//!
//! - [`TrainingState`]: model, optimizer, EMA and step counter owned by a loop
//! - [`losses`]: score and predictor step functions
//! - [`optim`]: Adam/AdamW and the warmup/clipping update policy
//! - [`scorenet`] and [`meta_surrogate`]: the two training loops

pub mod losses;
pub mod meta_surrogate;
pub mod optim;
pub mod scorenet;

pub use losses::{get_step_fn, get_step_fn_predictor, PredictorOutput, PredictorStepFn, Reduce, ScoreStepFn};
pub use meta_surrogate::meta_surrogate_train;
pub use optim::{get_optimizer, optimization_manager, Adam, OptimizeFn, Optimizer, OptimizerKind};
pub use scorenet::scorenet_train;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checkpoint::{restore_for_resume, CheckpointStore};
use crate::config::Config;
use crate::error::Result;
use crate::models::{ExponentialMovingAverage, Parameterized};
use crate::runner::set_exp_name;
use crate::tracking::Logger;

/// Everything a training loop mutates between checkpoints
#[derive(Debug, Clone)]
pub struct TrainingState<M> {
    pub model: M,
    pub optimizer: Adam,
    /// Shadow weights; the surrogate loop trains without one
    pub ema: Option<ExponentialMovingAverage>,
    /// Number of train steps applied so far
    pub step: u64,
    pub config: Config,
}

impl<M: Parameterized> TrainingState<M> {
    /// Fresh state at step 0 with the configured optimizer and, if asked, an EMA
    pub fn new(model: M, config: &Config, with_ema: bool) -> Result<Self> {
        let optimizer = optim::get_optimizer(config, model.num_parameters())?;
        let ema = with_ema.then(|| ExponentialMovingAverage::new(&model, config.model.ema_rate));
        Ok(Self {
            model,
            optimizer,
            ema,
            step: 0,
            config: config.clone(),
        })
    }
}

impl<M: Parameterized + Clone> TrainingState<M> {
    /// Copy of the model carrying the EMA weights (the live model when there is no EMA)
    pub fn ema_model(&self) -> Result<M> {
        let mut model = self.model.clone();
        if let Some(ema) = &self.ema {
            ema.copy_to(&mut model)?;
        }
        Ok(model)
    }
}

/// Direction in which an evaluation score improves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    Minimize,
    Maximize,
}

/// Best-checkpoint selection across evaluations
///
/// `is_best` is recomputed at every observation and is true exactly when the
/// observed score strictly beats every earlier one. NaN never improves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestTracker {
    objective: Objective,
    best: f64,
    is_best: bool,
}

impl BestTracker {
    /// Lower is better, starting from a 1e5 sentinel (test loss)
    pub fn minimize() -> Self {
        Self {
            objective: Objective::Minimize,
            best: 1e5,
            is_best: false,
        }
    }

    /// Higher is better, starting from a -1 sentinel (correlation)
    pub fn maximize() -> Self {
        Self {
            objective: Objective::Maximize,
            best: -1.0,
            is_best: false,
        }
    }

    /// Record an evaluation score, returning whether it is a new best
    pub fn observe(&mut self, value: f64) -> bool {
        let improved = match self.objective {
            Objective::Minimize => value < self.best,
            Objective::Maximize => value > self.best,
        };
        if improved {
            self.best = value;
        }
        self.is_best = improved;
        improved
    }

    pub fn is_best(&self) -> bool {
        self.is_best
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

/// Directories, metric log and checkpoint store of one training run
pub(crate) struct Experiment {
    pub logger: Logger,
    pub store: CheckpointStore,
    sample_dir: PathBuf,
}

impl Experiment {
    /// Create the experiment directory tree and record the config in the log
    pub(crate) fn open(config: &Config) -> Result<Self> {
        let exp_dir = set_exp_name(config)?;
        let logger = Logger::new(&exp_dir, true)?;
        logger.update_config(config)?;
        logger.write_str(&serde_json::to_string(config)?)?;
        logger.write_str(&"-".repeat(100))?;

        let sample_dir = exp_dir.join("samples");
        fs::create_dir_all(&sample_dir)?;
        let store = CheckpointStore::new(&exp_dir);
        store.ensure_dirs()?;
        Ok(Self {
            logger,
            store,
            sample_dir,
        })
    }

    /// Sample directory of the snapshot taken at `step`
    pub(crate) fn iter_sample_dir(&self, step: u64) -> PathBuf {
        self.sample_dir.join(format!("iter_{}", step))
    }

    /// Restore `state` when resuming is on, from the configured path or the latest snapshot
    pub(crate) fn resume<M: Parameterized>(&self, config: &Config, state: &mut TrainingState<M>) -> Result<()> {
        if !config.training.resume {
            return Ok(());
        }
        let path: &Path = config
            .training
            .resume_ckpt_path
            .as_deref()
            .unwrap_or_else(|| self.store.meta_path());
        restore_for_resume(path, state)?;
        Ok(())
    }
}

/// Checkpoint boundary: every `snapshot_freq` steps after step 0, and always the final step
pub fn is_snapshot_step(step: u64, snapshot_freq: u64, n_iters: u64) -> bool {
    (step != 0 && snapshot_freq != 0 && step % snapshot_freq == 0) || step == n_iters
}

/// What a finished loop reports back to its caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub initial_step: u64,
    pub final_step: u64,
    /// Loop steps at which a checkpoint was written
    pub checkpoint_steps: Vec<u64>,
    pub best_score: Option<f64>,
    pub last_loss: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimize_sentinel() {
        let mut tracker = BestTracker::minimize();
        assert!(!tracker.observe(1e5));
        assert!(tracker.observe(0.5));
        assert!(tracker.is_best());
        assert!(!tracker.observe(0.5));
        assert!(!tracker.is_best());
        assert!(tracker.observe(0.4));
        assert_eq!(tracker.best(), 0.4);
    }

    #[test]
    fn test_maximize_sentinel() {
        let mut tracker = BestTracker::maximize();
        assert!(!tracker.observe(-1.0));
        assert!(tracker.observe(-0.5));
        assert!(!tracker.observe(-0.7));
        assert_eq!(tracker.best(), -0.5);
    }

    #[test]
    fn test_nan_never_improves() {
        let mut tracker = BestTracker::maximize();
        assert!(!tracker.observe(f64::NAN));
        let mut tracker = BestTracker::minimize();
        assert!(!tracker.observe(f64::NAN));
        assert_eq!(tracker.best(), 1e5);
    }

    #[test]
    fn test_snapshot_steps_include_final_step() {
        let steps: Vec<u64> = (0..=250).filter(|&s| is_snapshot_step(s, 100, 250)).collect();
        assert_eq!(steps, vec![100, 200, 250]);
        assert!(is_snapshot_step(0, 100, 0));
    }
}
