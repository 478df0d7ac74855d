//! Standalone evaluation of a trained score network
//!
//! Loads the frozen checkpoint named by `scorenet_ckpt_path`, rebuilds the SDE from
//! the config the network was trained under and draws `ceil(num_samples / batch_size)`
//! sample batches. The quantized architectures are truncated to exactly
//! `num_samples` and scored once, logged at step 1.

use tracing::info;

use crate::analysis::{quantize, ArchMetrics, SamplingArchMetrics};
use crate::checkpoint::load_frozen_score_model;
use crate::config::Config;
use crate::data::{aug_mask, get_dataset, ArchDescriptor, AugMaskAlgo, DataScaler};
use crate::error::{NasDiffError, Result};
use crate::runner::set_exp_name;
use crate::sampling::get_sampling_fn;
use crate::sde::build_sde;
use crate::tracking::Logger;
use crate::utils::RandomSource;

const SAMPLE: &[&str] = &["r_valid", "r_unique", "r_novel"];

/// Outcome of an evaluation run
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub metrics: ArchMetrics,
    pub rounds: usize,
    /// Exactly `eval.num_samples` descriptors
    pub archs: Vec<ArchDescriptor>,
}

/// Number of sampling rounds needed for `num_samples` at `batch_size` per round
pub fn num_sampling_rounds(num_samples: usize, batch_size: usize) -> usize {
    let batch_size = batch_size.max(1);
    (num_samples + batch_size - 1) / batch_size
}

/// Sample from and score the score network at `config.scorenet_ckpt_path`
pub fn scorenet_evaluate(config: &Config) -> Result<EvaluationReport> {
    config.validate()?;
    let ckpt_path = config
        .scorenet_ckpt_path
        .as_ref()
        .ok_or_else(|| NasDiffError::ConfigError("evaluation needs scorenet_ckpt_path".to_string()))?;
    let frozen = load_frozen_score_model(ckpt_path)?;
    let score_config = &frozen.config;
    let (sde, sampling_eps) = build_sde(score_config)?;

    let exp_dir = set_exp_name(config)?;
    let mut logger = Logger::new(&exp_dir, true)?;
    logger.update_config(config)?;
    logger.write_str(&serde_json::to_string(config)?)?;
    logger.write_str(&"-".repeat(100))?;
    let sample_dir = exp_dir.join("samples");

    let inverse_scaler = DataScaler::from_config(&config.data);
    let shape = (config.eval.batch_size, score_config.data.max_node, score_config.data.n_vocab);
    let sampling_fn = get_sampling_fn(config, sde, shape, inverse_scaler, sampling_eps)?;

    let (train_ds, _, _) = get_dataset(score_config)?;
    let sampling_metrics = SamplingArchMetrics::new(&train_ds);
    let algo: AugMaskAlgo = score_config.data.aug_mask_algo.parse()?;
    let mask = aug_mask(&train_ds.adj(), algo);

    let rounds = num_sampling_rounds(config.eval.num_samples, config.eval.batch_size);
    info!(rounds, num_samples = config.eval.num_samples, "starting sampling");
    let mut rng = RandomSource::new(config.seed);
    let mut archs = Vec::with_capacity(rounds * config.eval.batch_size);
    for round in 0..rounds {
        let out = sampling_fn.sample(&frozen.model, &mask, &mut rng)?;
        archs.extend(quantize(&out.samples));
        info!(round, n_steps = out.n_steps, "sampling round finished");
    }
    archs.truncate(config.eval.num_samples);

    let metrics = sampling_metrics.evaluate(&archs, Some(sample_dir.as_path()))?;
    logger.update("r_valid", metrics.r_valid);
    logger.update("r_unique", metrics.r_unique);
    logger.update("r_novel", metrics.r_novel);
    logger.write_log(&[("sample", SAMPLE)], 1)?;
    logger.save_log()?;
    info!(
        r_valid = metrics.r_valid,
        r_unique = metrics.r_unique,
        r_novel = metrics.r_novel,
        "evaluation finished"
    );
    Ok(EvaluationReport { metrics, rounds, archs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_cover_num_samples() {
        assert_eq!(num_sampling_rounds(37, 16), 3);
        assert_eq!(num_sampling_rounds(32, 16), 2);
        assert_eq!(num_sampling_rounds(0, 16), 0);
        assert_eq!(num_sampling_rounds(1, 512), 1);
    }

    #[test]
    fn test_missing_checkpoint_path() {
        let config = Config::scorenet();
        assert!(matches!(
            scorenet_evaluate(&config),
            Err(NasDiffError::ConfigError(_))
        ));
    }
}
