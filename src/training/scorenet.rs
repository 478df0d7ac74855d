//! Score network training loop
//!
//! Each step pulls a batch from the cyclic training loader and applies one train
//! step. Every `eval_freq` steps the EMA model is scored on the evaluation and test
//! loaders, and the mean test loss decides whether a checkpoint taken at that same
//! step is the best one. At every snapshot step the state is checkpointed and, if enabled, the EMA
//! model generates architectures that are scored for validity, uniqueness and
//! novelty.

use std::sync::Arc;

use ndarray::Array3;
use tracing::info;

use super::{is_snapshot_step, BestTracker, Experiment, ScoreStepFn, TrainingState, TrainingSummary};
use crate::analysis::{quantize, SamplingArchMetrics};
use crate::config::Config;
use crate::data::{get_dataset, AugMaskAlgo, CyclicLoader, DataLoader, DataScaler};
use crate::error::{NasDiffError, Result};
use crate::models::{create_score_model, ScoreNetwork};
use crate::sampling::{get_sampling_fn, SampleOutput, SamplingFn};
use crate::sde::build_sde;
use crate::tracking::Logger;
use crate::training::{get_step_fn, optimization_manager};
use crate::utils::RandomSource;

const TRAIN: &[&str] = &["training_loss"];
const EVAL: &[&str] = &["eval_loss"];
const TEST: &[&str] = &["test_loss"];
const SAMPLE: &[&str] = &["r_valid", "r_unique", "r_novel"];

/// Score every batch of `loader` with the eval step, logging each loss under `key`
fn eval_pass<M: ScoreNetwork + Clone>(
    step_fn: &ScoreStepFn,
    state: &TrainingState<M>,
    loader: &DataLoader,
    algo: AugMaskAlgo,
    scaler: &DataScaler,
    logger: &mut Logger,
    key: &str,
) -> Result<()> {
    for batch in loader.iter() {
        let batch = batch?.prepare(algo, scaler);
        let loss = step_fn.eval(state, &batch)?;
        info!(step = state.step, loss, "{}", key);
        logger.update(key, loss);
    }
    Ok(())
}

/// Sample with the EMA weights swapped into the live model
///
/// The swap is kept afterwards unless `restore` is set, so training continues from
/// the EMA weights by default.
fn sample_with_ema<M: ScoreNetwork>(
    state: &mut TrainingState<M>,
    sampling_fn: &SamplingFn,
    mask: &Array3<f64>,
    restore: bool,
    rng: &mut RandomSource,
) -> Result<SampleOutput> {
    let ema = state
        .ema
        .as_mut()
        .ok_or_else(|| NasDiffError::TrainingError("score network trains without EMA".to_string()))?;
    ema.store(&state.model);
    ema.copy_to(&mut state.model)?;
    let out = sampling_fn.sample(&state.model, mask, rng)?;
    if restore {
        ema.restore(&mut state.model)?;
    }
    Ok(out)
}

/// Train the score network described by `config`
pub fn scorenet_train(config: &Config) -> Result<TrainingSummary> {
    config.validate()?;
    let (sde, sampling_eps) = build_sde(config)?;
    let algo: AugMaskAlgo = config.data.aug_mask_algo.parse()?;
    let scaler = DataScaler::from_config(&config.data);
    let t = &config.training;
    let sampling_fn = if t.snapshot_sampling {
        let shape = (t.eval_batch_size, config.data.max_node, config.data.n_vocab);
        Some(get_sampling_fn(config, sde.clone(), shape, scaler, sampling_eps)?)
    } else {
        None
    };
    let mut rng = RandomSource::new(config.seed);
    let model = create_score_model(config, &mut rng)?;

    let mut exp = Experiment::open(config)?;
    let mut state = TrainingState::new(model, config, true)?;
    exp.resume(config, &mut state)?;
    let initial_step = state.step;

    let (train_ds, eval_ds, test_ds) = get_dataset(config)?;
    let train_ds = Arc::new(train_ds);
    let train_loader = DataLoader::new(Arc::clone(&train_ds), config.training.batch_size, config.data.shuffle);
    let eval_loader = DataLoader::new(Arc::new(eval_ds), config.training.eval_batch_size, false);
    let test_loader = DataLoader::new(Arc::new(test_ds), config.training.eval_batch_size, false);
    let mut train_iter = CyclicLoader::new(train_loader, &mut rng)?;

    let optimize_fn = optimization_manager(config);
    let train_step_fn = get_step_fn(
        sde.clone(),
        true,
        optimize_fn,
        t.reduce_mean,
        t.continuous,
        t.likelihood_weighting,
    )?;
    let eval_step_fn = get_step_fn(
        sde,
        false,
        optimize_fn,
        t.reduce_mean,
        t.continuous,
        t.likelihood_weighting,
    )?;

    let sampling_metrics = SamplingArchMetrics::new(&train_ds);

    info!(step = initial_step, n_iters = t.n_iters, "starting score network training");
    let mut tracker = BestTracker::minimize();
    let mut evaluated = false;
    let mut summary = TrainingSummary {
        initial_step,
        final_step: initial_step,
        ..Default::default()
    };

    for step in initial_step..=t.n_iters {
        let batch = train_iter.next_batch(&mut rng)?.prepare(algo, &scaler);
        let loss = train_step_fn.train(&mut state, &batch, &mut rng)?;
        exp.logger.update("training_loss", loss);
        summary.last_loss = Some(loss);
        if step % t.log_freq == 0 {
            info!(step, training_loss = loss, "train");
        }

        let is_eval_step = step % t.eval_freq == 0;
        if is_eval_step {
            eval_pass(&eval_step_fn, &state, &eval_loader, algo, &scaler, &mut exp.logger, "eval_loss")?;
            eval_pass(&eval_step_fn, &state, &test_loader, algo, &scaler, &mut exp.logger, "test_loss")?;
            if let Some(test_loss) = exp.logger.avg("test_loss") {
                tracker.observe(test_loss);
                evaluated = true;
            }
        }

        if is_snapshot_step(step, t.snapshot_freq, t.n_iters) {
            let save_step = step / t.snapshot_freq;
            // only a checkpoint taken right after an improving evaluation is the best one
            exp.store
                .save_checkpoint(&state, save_step, is_eval_step && tracker.is_best())?;
            summary.checkpoint_steps.push(step);

            if let Some(sampling_fn) = &sampling_fn {
                let out = sample_with_ema(
                    &mut state,
                    sampling_fn,
                    &batch.mask,
                    t.restore_weights_after_sampling,
                    &mut rng,
                )?;
                let arch_list = quantize(&out.samples);
                let metrics = sampling_metrics.evaluate(&arch_list, Some(exp.iter_sample_dir(step).as_path()))?;
                info!(
                    step,
                    n_steps = out.n_steps,
                    r_valid = metrics.r_valid,
                    r_unique = metrics.r_unique,
                    r_novel = metrics.r_novel,
                    "sampled architectures"
                );
                exp.logger.update("r_valid", metrics.r_valid);
                exp.logger.update("r_unique", metrics.r_unique);
                exp.logger.update("r_novel", metrics.r_novel);
            }
        }

        if is_eval_step {
            exp.logger
                .write_log(&[("train", TRAIN), ("eval", EVAL), ("test", TEST), ("sample", SAMPLE)], step)?;
        } else {
            exp.logger.write_log(&[("train", TRAIN)], step)?;
        }
        exp.logger.reset();
        summary.final_step = step;
    }

    exp.logger.save_log()?;
    summary.best_score = evaluated.then(|| tracker.best());
    info!(
        final_step = summary.final_step,
        checkpoints = summary.checkpoint_steps.len(),
        "score network training finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{aug_mask, cell_adjacency};
    use crate::models::{GraphLinearScore, Parameterized};
    use ndarray::Axis;

    fn drifted_state() -> (Config, TrainingState<GraphLinearScore>) {
        let mut config = Config::scorenet();
        config.model.num_scales = 5;
        let mut rng = RandomSource::new(4);
        let model = GraphLinearScore::new(7, 8, 0.05, &mut rng);
        let mut state = TrainingState::new(model, &config, true).unwrap();
        // live weights move away from the EMA shadow
        for p in state.model.parameters_mut() {
            *p += 0.5;
        }
        (config, state)
    }

    fn sampler(config: &Config) -> SamplingFn {
        let (sde, eps) = build_sde(config).unwrap();
        get_sampling_fn(config, sde, (2, 8, 7), DataScaler::new(true), eps).unwrap()
    }

    fn mask() -> Array3<f64> {
        aug_mask(&cell_adjacency().insert_axis(Axis(0)), AugMaskAlgo::Floyd)
    }

    #[test]
    fn test_sampling_keeps_ema_weights_by_default() {
        let (config, mut state) = drifted_state();
        let shadow = state.ema.as_ref().unwrap().shadow().to_vec();
        assert_ne!(state.model.parameters(), &shadow[..]);

        let out = sample_with_ema(&mut state, &sampler(&config), &mask(), false, &mut RandomSource::new(1)).unwrap();
        assert_eq!(out.samples.dim(), (2, 8, 7));
        assert_eq!(state.model.parameters(), &shadow[..]);
    }

    #[test]
    fn test_sampling_restores_live_weights() {
        let (config, mut state) = drifted_state();
        let live = state.model.parameters().to_vec();
        let shadow = state.ema.as_ref().unwrap().shadow().to_vec();

        sample_with_ema(&mut state, &sampler(&config), &mask(), true, &mut RandomSource::new(1)).unwrap();
        assert_eq!(state.model.parameters(), &live[..]);
        assert_eq!(state.ema.as_ref().unwrap().shadow(), &shadow[..]);
    }

    #[test]
    fn test_sampling_needs_ema() {
        let (config, state) = drifted_state();
        let mut state = TrainingState::new(state.model, &config, false).unwrap();
        assert!(matches!(
            sample_with_ema(&mut state, &sampler(&config), &mask(), false, &mut RandomSource::new(1)),
            Err(NasDiffError::TrainingError(_))
        ));
    }
}
