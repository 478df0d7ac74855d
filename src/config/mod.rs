//! Run configuration
//!
//! A `Config` is loaded once per run and treated as read-only afterwards. It is
//! embedded into every checkpoint so a frozen model can later be checked against
//! the run that consumes it (see [`check_config`]).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NasDiffError, Result};

/// Top-level configuration tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task key, resolved by [`crate::runner::Task`] (`scorenet`, `meta_surrogate`)
    pub model_type: String,
    /// Seed for the run's single random source
    pub seed: u64,
    /// Experiment sub-directory name
    pub folder_name: String,
    /// Root directory for experiment outputs
    pub workdir: PathBuf,
    /// Frozen score network checkpoint (evaluation and guided sampling)
    pub scorenet_ckpt_path: Option<PathBuf>,
    pub training: TrainingSection,
    pub model: ModelSection,
    pub data: DataSection,
    pub optim: OptimSection,
    pub sampling: SamplingSection,
    pub eval: EvalSection,
}

/// Training loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    /// SDE kind (`vpsde` or `vesde`)
    pub sde: String,
    pub continuous: bool,
    /// Mean (true) or sum (false) over non-batch dimensions
    pub reduce_mean: bool,
    pub likelihood_weighting: bool,
    /// Last step index; the loop runs `initial_step..=n_iters`
    pub n_iters: u64,
    pub batch_size: usize,
    /// Batch size used for snapshot sampling
    pub eval_batch_size: usize,
    pub log_freq: u64,
    pub eval_freq: u64,
    pub snapshot_freq: u64,
    pub snapshot_sampling: bool,
    pub resume: bool,
    /// Checkpoint to resume from; defaults to the run's latest snapshot
    pub resume_ckpt_path: Option<PathBuf>,
    /// Predictor labels are computed on perturbed inputs
    pub noised: bool,
    /// Put live weights back after EMA snapshot sampling
    pub restore_weights_after_sampling: bool,
}

/// Model and noise schedule settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Architecture key for the model factory
    pub name: String,
    pub beta_min: f64,
    pub beta_max: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
    /// Number of discretization steps N
    pub num_scales: usize,
    pub ema_rate: f64,
    /// Hidden width of the score network
    pub hidden_dim: usize,
    /// Width of the per-sample task feature vector fed to the surrogate
    pub task_dim: usize,
    /// Sample count for guided sampling (defaults to `training.eval_batch_size`)
    pub num_sample: Option<usize>,
    /// Standard deviation of the initial weights
    pub init_scale: f64,
}

/// Dataset settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub name: String,
    /// JSON dataset file; without it the full search space is enumerated
    pub path: Option<PathBuf>,
    pub max_node: usize,
    pub n_vocab: usize,
    /// Scale one-hot inputs to [-1, 1]
    pub centered: bool,
    pub aug_mask_algo: String,
    /// Metadata columns used as surrogate targets
    pub label_list: Vec<String>,
    pub eval_ratio: f64,
    pub test_ratio: f64,
    pub shuffle: bool,
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimSection {
    pub optimizer: String,
    pub lr: f64,
    pub beta1: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub warmup: u64,
    /// Global gradient norm bound; negative disables clipping
    pub grad_clip: f64,
}

/// Sampler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSection {
    pub method: String,
    pub predictor: String,
    pub corrector: String,
    pub snr: f64,
    pub n_steps_each: usize,
    pub noise_removal: bool,
    pub classifier_scale: f64,
    /// Dataset tag for guided-sample label statistics
    pub check_dataname: String,
}

/// Standalone evaluation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSection {
    pub batch_size: usize,
    pub num_samples: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_type: "scorenet".to_string(),
            seed: 42,
            folder_name: "default".to_string(),
            workdir: PathBuf::from("results"),
            scorenet_ckpt_path: None,
            training: TrainingSection::default(),
            model: ModelSection::default(),
            data: DataSection::default(),
            optim: OptimSection::default(),
            sampling: SamplingSection::default(),
            eval: EvalSection::default(),
        }
    }
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            sde: "vpsde".to_string(),
            continuous: true,
            reduce_mean: false,
            likelihood_weighting: false,
            n_iters: 250_000,
            batch_size: 256,
            eval_batch_size: 512,
            log_freq: 50,
            eval_freq: 100,
            snapshot_freq: 10_000,
            snapshot_sampling: true,
            resume: false,
            resume_ckpt_path: None,
            noised: true,
            restore_weights_after_sampling: false,
        }
    }
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            name: "graph_linear_score".to_string(),
            beta_min: 0.1,
            beta_max: 5.0,
            sigma_min: 0.1,
            sigma_max: 5.0,
            num_scales: 1000,
            ema_rate: 0.9999,
            hidden_dim: 64,
            task_dim: 0,
            num_sample: None,
            init_scale: 0.02,
        }
    }
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            name: "NASBench201".to_string(),
            path: None,
            max_node: 8,
            n_vocab: 7,
            centered: true,
            aug_mask_algo: "floyd".to_string(),
            label_list: vec!["meta-acc".to_string()],
            eval_ratio: 0.05,
            test_ratio: 0.05,
            shuffle: true,
        }
    }
}

impl Default for OptimSection {
    fn default() -> Self {
        Self {
            optimizer: "Adam".to_string(),
            lr: 2e-4,
            beta1: 0.9,
            eps: 1e-8,
            weight_decay: 0.0,
            warmup: 1000,
            grad_clip: 1.0,
        }
    }
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            method: "pc".to_string(),
            predictor: "euler_maruyama".to_string(),
            corrector: "none".to_string(),
            snr: 0.16,
            n_steps_each: 1,
            noise_removal: true,
            classifier_scale: 1.0,
            check_dataname: "cifar10".to_string(),
        }
    }
}

impl Default for EvalSection {
    fn default() -> Self {
        Self {
            batch_size: 512,
            num_samples: 1000,
        }
    }
}

impl Config {
    /// Defaults for score network training
    pub fn scorenet() -> Self {
        Self::default()
    }

    /// Defaults for meta-surrogate training
    pub fn meta_surrogate() -> Self {
        let mut config = Self::default();
        config.model_type = "meta_surrogate".to_string();
        config.model.name = "linear_surrogate".to_string();
        config.training.n_iters = 10_000;
        config.training.snapshot_freq = 1_000;
        config.training.batch_size = 128;
        config.training.eval_batch_size = 256;
        config.optim.lr = 1e-3;
        config.optim.warmup = 0;
        config
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| NasDiffError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_folder_name(mut self, name: impl Into<String>) -> Self {
        self.folder_name = name.into();
        self
    }

    pub fn with_sde(mut self, sde: impl Into<String>) -> Self {
        self.training.sde = sde.into();
        self
    }

    pub fn with_iters(mut self, n_iters: u64) -> Self {
        self.training.n_iters = n_iters;
        self
    }

    pub fn with_scorenet_ckpt(mut self, path: impl Into<PathBuf>) -> Self {
        self.scorenet_ckpt_path = Some(path.into());
        self
    }

    /// Experiment directory, `<workdir>/tr_<model_type>/<folder_name>`
    pub fn exp_dir(&self) -> PathBuf {
        self.workdir
            .join(format!("tr_{}", self.model_type))
            .join(&self.folder_name)
    }

    /// Reject settings no run can execute with
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        for (name, value) in [
            ("training.log_freq", t.log_freq),
            ("training.eval_freq", t.eval_freq),
            ("training.snapshot_freq", t.snapshot_freq),
        ] {
            if value == 0 {
                return Err(NasDiffError::ConfigError(format!("{} must be positive", name)));
            }
        }
        for (name, value) in [
            ("training.batch_size", t.batch_size),
            ("training.eval_batch_size", t.eval_batch_size),
            ("eval.batch_size", self.eval.batch_size),
            ("model.num_scales", self.model.num_scales),
            ("data.max_node", self.data.max_node),
            ("data.n_vocab", self.data.n_vocab),
        ] {
            if value == 0 {
                return Err(NasDiffError::ConfigError(format!("{} must be positive", name)));
            }
        }
        if !t.continuous && t.likelihood_weighting {
            return Err(NasDiffError::ConfigError(
                "likelihood weighting is not supported for discrete-time training".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.model.ema_rate) {
            return Err(NasDiffError::ConfigError(format!(
                "model.ema_rate must lie in [0, 1], got {}",
                self.model.ema_rate
            )));
        }
        let split = self.data.eval_ratio + self.data.test_ratio;
        if self.data.eval_ratio < 0.0 || self.data.test_ratio < 0.0 || split >= 1.0 {
            return Err(NasDiffError::ConfigError(format!(
                "invalid data split: eval_ratio={}, test_ratio={}",
                self.data.eval_ratio, self.data.test_ratio
            )));
        }
        Ok(())
    }
}

/// Assert a frozen score model was trained under settings compatible with `current`
///
/// Seven fields must match exactly; the first mismatch is reported.
pub fn check_config(frozen: &Config, current: &Config) -> Result<()> {
    fn mismatch(field: &'static str, frozen: impl ToString, current: impl ToString) -> NasDiffError {
        NasDiffError::ConfigMismatch {
            field,
            frozen: frozen.to_string(),
            current: current.to_string(),
        }
    }

    if frozen.model.sigma_min != current.model.sigma_min {
        return Err(mismatch("model.sigma_min", frozen.model.sigma_min, current.model.sigma_min));
    }
    if frozen.model.sigma_max != current.model.sigma_max {
        return Err(mismatch("model.sigma_max", frozen.model.sigma_max, current.model.sigma_max));
    }
    if frozen.training.sde != current.training.sde {
        return Err(mismatch("training.sde", &frozen.training.sde, &current.training.sde));
    }
    if frozen.training.continuous != current.training.continuous {
        return Err(mismatch(
            "training.continuous",
            frozen.training.continuous,
            current.training.continuous,
        ));
    }
    if frozen.data.centered != current.data.centered {
        return Err(mismatch("data.centered", frozen.data.centered, current.data.centered));
    }
    if frozen.data.max_node != current.data.max_node {
        return Err(mismatch("data.max_node", frozen.data.max_node, current.data.max_node));
    }
    if frozen.data.n_vocab != current.data.n_vocab {
        return Err(mismatch("data.n_vocab", frozen.data.n_vocab, current.data.n_vocab));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roundtrip_through_json() {
        let config = Config::meta_surrogate();
        let json = config.to_json().unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"seed": 7, "training": {"sde": "vesde"}}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.training.sde, "vesde");
        assert_eq!(config.training.eval_freq, 100);
        assert_eq!(config.data.max_node, 8);
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let mut config = Config::default();
        config.training.snapshot_freq = 0;
        assert!(matches!(config.validate(), Err(NasDiffError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_discrete_likelihood_weighting() {
        let mut config = Config::default();
        config.training.continuous = false;
        config.training.likelihood_weighting = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_exp_dir_layout() {
        let config = Config::default().with_workdir("/tmp/runs").with_folder_name("a");
        assert_eq!(config.exp_dir(), PathBuf::from("/tmp/runs/tr_scorenet/a"));
    }

    #[test]
    fn test_check_config_identical_passes() {
        let a = Config::scorenet();
        let b = Config::meta_surrogate();
        assert!(check_config(&a, &b).is_ok());
    }

    #[test]
    fn test_check_config_each_field_raises() {
        let base = Config::default();
        let variants: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("model.sigma_min", Box::new(|c| c.model.sigma_min = 0.2)),
            ("model.sigma_max", Box::new(|c| c.model.sigma_max = 50.0)),
            ("training.sde", Box::new(|c| c.training.sde = "vesde".into())),
            ("training.continuous", Box::new(|c| c.training.continuous = false)),
            ("data.centered", Box::new(|c| c.data.centered = false)),
            ("data.max_node", Box::new(|c| c.data.max_node = 9)),
            ("data.n_vocab", Box::new(|c| c.data.n_vocab = 6)),
        ];
        for (name, mutate) in variants {
            let mut other = base.clone();
            mutate(&mut other);
            match check_config(&base, &other) {
                Err(NasDiffError::ConfigMismatch { field, .. }) => assert_eq!(field, name),
                other => panic!("expected mismatch on {}, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_check_config_ignores_unchecked_fields() {
        let base = Config::default();
        let mut other = base.clone();
        other.model.beta_max = 20.0;
        other.seed = 1;
        assert!(check_config(&base, &other).is_ok());
    }
}
