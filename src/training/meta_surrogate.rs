//! Meta-surrogate training loop
//!
//! Trains a performance predictor on labelled architectures. Model selection uses
//! the Pearson correlation between predictions and labels over the evaluation set;
//! a checkpoint is the best one only when taken at an evaluation that improved it.
//! Snapshot sampling steers a frozen, pretrained score network with the current
//! predictor through classifier guidance.

use std::sync::Arc;

use tracing::info;

use super::{is_snapshot_step, BestTracker, Experiment, PredictorStepFn, TrainingState, TrainingSummary};
use crate::analysis::{quantize, SamplingArchMetricsMeta};
use crate::checkpoint::load_frozen_score_model;
use crate::config::{check_config, Config};
use crate::data::{get_meta_dataset, AugMaskAlgo, CyclicLoader, DataLoader, DataScaler};
use crate::error::{NasDiffError, Result};
use crate::models::{create_surrogate_model, SurrogateNetwork};
use crate::sampling::{get_conditional_sampling_fn, Classifier};
use crate::sde::build_sde;
use crate::tracking::Logger;
use crate::training::{get_step_fn_predictor, optimization_manager};
use crate::utils::{pearson, spearman, RandomSource};

const TRAIN: &[&str] = &["training_loss"];
const EVAL: &[&str] = &["eval_loss", "eval_p_corr", "eval_s_corr"];
const SAMPLE: &[&str] = &["r_valid", "r_unique", "r_novel", "label_mean", "label_max"];

/// Correlations between predictions and labels over the whole evaluation loader
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationReport {
    pub pearson: f64,
    pub spearman: f64,
}

fn eval_pass<M: SurrogateNetwork + Clone>(
    step_fn: &PredictorStepFn,
    state: &TrainingState<M>,
    loader: &DataLoader,
    algo: AugMaskAlgo,
    scaler: &DataScaler,
    logger: &mut Logger,
) -> Result<CorrelationReport> {
    let mut preds = Vec::new();
    let mut labels = Vec::new();
    for batch in loader.iter() {
        let batch = batch?.prepare(algo, scaler);
        let out = step_fn.eval(state, &batch)?;
        preds.extend(out.pred.iter().copied());
        labels.extend(out.labels.iter().copied());
        info!(step = state.step, eval_loss = out.loss, "eval");
        logger.update("eval_loss", out.loss);
    }
    Ok(CorrelationReport {
        pearson: pearson(&preds, &labels),
        spearman: spearman(&preds, &labels),
    })
}

/// Train the meta-surrogate predictor described by `config`
pub fn meta_surrogate_train(config: &Config) -> Result<TrainingSummary> {
    config.validate()?;
    let (sde, sampling_eps) = build_sde(config)?;
    let algo: AugMaskAlgo = config.data.aug_mask_algo.parse()?;
    let t = &config.training;

    // Everything that can reject the config runs before the experiment directory exists.
    let frozen = if t.snapshot_sampling {
        let path = config.scorenet_ckpt_path.as_ref().ok_or_else(|| {
            NasDiffError::ConfigError("snapshot sampling needs scorenet_ckpt_path".to_string())
        })?;
        let frozen = load_frozen_score_model(path)?;
        check_config(&frozen.config, config)?;
        Some(frozen)
    } else {
        None
    };

    let scaler = DataScaler::from_config(&config.data);
    let sampling_fn = match &frozen {
        Some(_) => {
            let shape = (t.eval_batch_size, config.data.max_node, config.data.n_vocab);
            Some(get_conditional_sampling_fn(
                config,
                sde.clone(),
                shape,
                scaler,
                sampling_eps,
                config.model.num_sample,
            )?)
        }
        None => None,
    };
    let mut rng = RandomSource::new(config.seed);
    let model = create_surrogate_model(config, &mut rng)?;

    let mut exp = Experiment::open(config)?;
    let mut state = TrainingState::new(model, config, false)?;
    exp.resume(config, &mut state)?;
    let initial_step = state.step;

    let (train_ds, eval_ds, test_ds) = get_meta_dataset(config)?;
    let sampling_metrics =
        SamplingArchMetricsMeta::new(&train_ds, &[&train_ds, &eval_ds, &test_ds], &config.sampling.check_dataname);
    let train_loader = DataLoader::new(Arc::new(train_ds), t.batch_size, config.data.shuffle);
    let eval_loader = DataLoader::new(Arc::new(eval_ds), t.eval_batch_size, false);
    let mut train_iter = CyclicLoader::new(train_loader, &mut rng)?;

    let optimize_fn = optimization_manager(config);
    let train_step_fn = get_step_fn_predictor(
        sde.clone(),
        true,
        optimize_fn,
        t.reduce_mean,
        t.continuous,
        t.likelihood_weighting,
        config.data.label_list.clone(),
        t.noised,
    )?;
    let eval_step_fn = get_step_fn_predictor(
        sde,
        false,
        optimize_fn,
        t.reduce_mean,
        t.continuous,
        t.likelihood_weighting,
        config.data.label_list.clone(),
        t.noised,
    )?;

    info!(step = initial_step, n_iters = t.n_iters, "starting meta-surrogate training");
    let mut tracker = BestTracker::maximize();
    let mut evaluated = false;
    let mut summary = TrainingSummary {
        initial_step,
        final_step: initial_step,
        ..Default::default()
    };

    for step in initial_step..=t.n_iters {
        let batch = train_iter.next_batch(&mut rng)?.prepare(algo, &scaler);
        let out = train_step_fn.train(&mut state, &batch, &mut rng)?;
        exp.logger.update("training_loss", out.loss);
        summary.last_loss = Some(out.loss);
        if step % t.log_freq == 0 {
            info!(step, training_loss = out.loss, "train");
        }

        let is_eval_step = step % t.eval_freq == 0;
        if is_eval_step {
            let corr = eval_pass(&eval_step_fn, &state, &eval_loader, algo, &scaler, &mut exp.logger)?;
            info!(step, eval_p_corr = corr.pearson, eval_s_corr = corr.spearman, "eval");
            exp.logger.update("eval_p_corr", corr.pearson);
            exp.logger.update("eval_s_corr", corr.spearman);
            tracker.observe(corr.pearson);
            evaluated = true;
        }

        if is_snapshot_step(step, t.snapshot_freq, t.n_iters) {
            let save_step = step / t.snapshot_freq;
            exp.store
                .save_checkpoint(&state, save_step, is_eval_step && tracker.is_best())?;
            summary.checkpoint_steps.push(step);

            if let (Some(sampling_fn), Some(frozen)) = (&sampling_fn, &frozen) {
                let classifier = Classifier {
                    model: &state.model,
                    task: batch.task.as_ref(),
                };
                let out = sampling_fn.sample_guided(&frozen.model, &batch.mask, classifier, &mut rng)?;
                let arch_list = quantize(&out.samples);
                let (metrics, labels) =
                    sampling_metrics.evaluate(&arch_list, Some(exp.iter_sample_dir(step).as_path()))?;
                info!(
                    step,
                    r_valid = metrics.r_valid,
                    r_unique = metrics.r_unique,
                    r_novel = metrics.r_novel,
                    "sampled architectures"
                );
                exp.logger.update("r_valid", metrics.r_valid);
                exp.logger.update("r_unique", metrics.r_unique);
                exp.logger.update("r_novel", metrics.r_novel);
                if let Some(labels) = labels {
                    info!(
                        step,
                        dataset = sampling_metrics.check_dataname(),
                        mean = labels.mean,
                        max = labels.max,
                        "known labels of sampled architectures"
                    );
                    exp.logger.update("label_mean", labels.mean);
                    exp.logger.update("label_max", labels.max);
                }
            }
        }

        if is_eval_step {
            exp.logger
                .write_log(&[("train", TRAIN), ("eval", EVAL), ("sample", SAMPLE)], step)?;
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
        best_p_corr = tracker.best(),
        "meta-surrogate training finished"
    );
    Ok(summary)
}
