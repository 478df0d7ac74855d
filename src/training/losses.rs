//! Loss functions and one-step train/eval functions
//!
//! A step function is built once per loop with [`get_step_fn`] (score networks) or
//! [`get_step_fn_predictor`] (surrogates). Train-mode steps are the only code that
//! mutates a [`TrainingState`]: they compute the loss, back-propagate through the
//! model's vector-Jacobian product, apply the [`OptimizeFn`] policy, bump the step
//! counter by one and update the EMA. Eval-mode steps borrow the state immutably
//! and draw their noise from a stream derived from `(seed, step)`, so evaluating
//! the same state and batch twice gives the same loss.

use ndarray::{Array1, Array2, Array3, Axis};

use super::optim::OptimizeFn;
use super::TrainingState;
use crate::data::Batch;
use crate::error::{NasDiffError, Result};
use crate::models::{Parameterized, ScoreNetwork, SurrogateNetwork};
use crate::sde::{scale_per_sample, Sde};
use crate::utils::RandomSource;

/// Sub-stream tag for evaluation noise
const EVAL_STREAM: u64 = 0xE7A1_0000;

/// Reduction over the non-batch dimensions of a per-sample loss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduce {
    Mean,
    Sum,
}

impl Reduce {
    pub fn from_flag(reduce_mean: bool) -> Self {
        if reduce_mean {
            Self::Mean
        } else {
            Self::Sum
        }
    }

    /// Factor applied to a per-sample sum over `len` elements
    fn factor(self, len: usize) -> f64 {
        match self {
            Self::Mean => 1.0 / len.max(1) as f64,
            Self::Sum => 1.0,
        }
    }
}

/// Noise draw and perturbed inputs for one batch
struct Perturbed {
    x_t: Array3<f64>,
    z: Array3<f64>,
    t: Array1<f64>,
    std: Array1<f64>,
}

fn eval_rng<M>(state: &TrainingState<M>) -> RandomSource {
    RandomSource::derive(state.config.seed ^ EVAL_STREAM, state.step)
}

/// Denoising score matching with the noise-prediction parameterization
#[derive(Debug, Clone)]
pub struct ScoreLoss {
    sde: Sde,
    eps: f64,
    reduce: Reduce,
    continuous: bool,
    likelihood_weighting: bool,
}

impl ScoreLoss {
    pub fn new(sde: Sde, reduce: Reduce, continuous: bool, likelihood_weighting: bool) -> Result<Self> {
        if !continuous && likelihood_weighting {
            return Err(NasDiffError::ConfigError(
                "likelihood weighting is not supported for discrete-time training".to_string(),
            ));
        }
        Ok(Self {
            eps: sde.sampling_eps(),
            sde,
            reduce,
            continuous,
            likelihood_weighting,
        })
    }

    fn perturb(&self, x: &Array3<f64>, rng: &mut RandomSource) -> Perturbed {
        let b = x.len_of(Axis(0));
        let z = rng.normal_array3(x.dim());
        let (coeff, std, t) = if self.continuous {
            let t = rng.uniform_array1(b, self.eps, self.sde.t_max());
            let coeff = t.mapv(|ti| self.sde.marginal_mean_coeff(ti));
            let std = t.mapv(|ti| self.sde.marginal_std(ti));
            (coeff, std, t)
        } else {
            let n = self.sde.num_steps();
            let labels: Vec<usize> = (0..b).map(|_| rng.index(n)).collect();
            let coeff: Array1<f64> = labels.iter().map(|&l| self.sde.discrete_marginal(l).0).collect();
            let std: Array1<f64> = labels.iter().map(|&l| self.sde.discrete_marginal(l).1).collect();
            let t: Array1<f64> = labels.iter().map(|&l| self.sde.label_to_time(l)).collect();
            (coeff, std, t)
        };
        let x_t = scale_per_sample(x, &coeff) + scale_per_sample(&z, &std);
        Perturbed { x_t, z, t, std }
    }

    /// Batch loss and, when `with_grad`, its parameter gradient
    pub fn compute<M: ScoreNetwork + ?Sized>(
        &self,
        model: &M,
        batch: &Batch,
        rng: &mut RandomSource,
        with_grad: bool,
    ) -> Result<(f64, Option<Vec<f64>>)> {
        let b = batch.len();
        if b == 0 {
            return Err(NasDiffError::DataError("empty batch".to_string()));
        }
        let p = self.perturb(&batch.x, rng);
        let out = model.forward(&p.x_t, &batch.mask, &p.t)?;
        let err = &out - &p.z;

        // per-sample weight on the squared error: 1, or g(t)^2 / std^2
        let weight: Array1<f64> = if self.likelihood_weighting {
            p.t.iter()
                .zip(p.std.iter())
                .map(|(&ti, &s)| self.sde.diffusion(ti).powi(2) / (s * s))
                .collect()
        } else {
            Array1::ones(b)
        };
        let per_elem = batch.x.len() / b;
        let red = self.reduce.factor(per_elem);

        let sq = (&err * &err).sum_axis(Axis(2)).sum_axis(Axis(1));
        let loss = (&sq * &weight).sum() * red / b as f64;

        let grad = if with_grad {
            let coeff = weight.mapv(|w| 2.0 * w * red / b as f64);
            let upstream = scale_per_sample(&err, &coeff);
            Some(model.backward(&p.x_t, &batch.mask, &p.t, &upstream)?)
        } else {
            None
        };
        Ok((loss, grad))
    }
}

/// Whether a step function updates the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Train,
    Eval,
}

fn mode_of(train: bool) -> StepMode {
    if train {
        StepMode::Train
    } else {
        StepMode::Eval
    }
}

fn wrong_mode(expected: StepMode) -> NasDiffError {
    NasDiffError::TrainingError(format!("step function is not a {:?} step", expected))
}

/// One-step function for score networks
#[derive(Debug, Clone)]
pub struct ScoreStepFn {
    loss: ScoreLoss,
    mode: StepMode,
    optimize_fn: OptimizeFn,
}

/// Build the score-network step function
pub fn get_step_fn(
    sde: Sde,
    train: bool,
    optimize_fn: OptimizeFn,
    reduce_mean: bool,
    continuous: bool,
    likelihood_weighting: bool,
) -> Result<ScoreStepFn> {
    Ok(ScoreStepFn {
        loss: ScoreLoss::new(sde, Reduce::from_flag(reduce_mean), continuous, likelihood_weighting)?,
        mode: mode_of(train),
        optimize_fn,
    })
}

impl ScoreStepFn {
    pub fn mode(&self) -> StepMode {
        self.mode
    }

    /// Loss, backward pass, optimizer update, `step += 1`, EMA update
    pub fn train<M: ScoreNetwork>(
        &self,
        state: &mut TrainingState<M>,
        batch: &Batch,
        rng: &mut RandomSource,
    ) -> Result<f64> {
        if self.mode != StepMode::Train {
            return Err(wrong_mode(StepMode::Train));
        }
        let (loss, grad) = self.loss.compute(&state.model, batch, rng, true)?;
        let mut grad = grad.ok_or_else(|| NasDiffError::TrainingError("missing gradient".to_string()))?;
        self.optimize_fn.apply(
            &mut state.optimizer,
            state.model.parameters_mut(),
            &mut grad,
            state.step,
        )?;
        state.step += 1;
        if let Some(ema) = state.ema.as_mut() {
            ema.update(&state.model)?;
        }
        Ok(loss)
    }

    /// Loss under the EMA weights; leaves the state untouched
    pub fn eval<M: ScoreNetwork + Clone>(&self, state: &TrainingState<M>, batch: &Batch) -> Result<f64> {
        if self.mode != StepMode::Eval {
            return Err(wrong_mode(StepMode::Eval));
        }
        let model = state.ema_model()?;
        let mut rng = eval_rng(state);
        Ok(self.loss.compute(&model, batch, &mut rng, false)?.0)
    }
}

/// Supervised loss of a performance predictor
#[derive(Debug, Clone)]
pub struct PredictorLoss {
    sde: Sde,
    eps: f64,
    reduce: Reduce,
    label_list: Vec<String>,
    noised: bool,
}

/// Loss together with the predictions and targets it compared
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorOutput {
    pub loss: f64,
    pub pred: Array2<f64>,
    pub labels: Array2<f64>,
}

impl PredictorLoss {
    pub fn new(sde: Sde, reduce: Reduce, label_list: Vec<String>, noised: bool) -> Self {
        Self {
            eps: sde.sampling_eps(),
            sde,
            reduce,
            label_list,
            noised,
        }
    }

    pub fn compute<M: SurrogateNetwork + ?Sized>(
        &self,
        model: &M,
        batch: &Batch,
        rng: &mut RandomSource,
        with_grad: bool,
    ) -> Result<(PredictorOutput, Option<Vec<f64>>)> {
        let b = batch.len();
        if b == 0 {
            return Err(NasDiffError::DataError("empty batch".to_string()));
        }
        let labels = batch.labels(&self.label_list)?;
        let (x_in, t) = if self.noised {
            let t = rng.uniform_array1(b, self.eps, self.sde.t_max());
            let z = rng.normal_array3(batch.x.dim());
            let (mean, std) = self.sde.marginal_prob(&batch.x, &t);
            (mean + scale_per_sample(&z, &std), t)
        } else {
            (batch.x.clone(), Array1::from_elem(b, self.eps))
        };
        let pred = model.forward(&x_in, &batch.mask, batch.task.as_ref(), &t)?;
        let err = &pred - &labels;
        let red = self.reduce.factor(self.label_list.len());
        let loss = (&err * &err).sum() * red / b as f64;

        let grad = if with_grad {
            let upstream = err.mapv(|e| 2.0 * e * red / b as f64);
            Some(model.backward(&x_in, &batch.mask, batch.task.as_ref(), &t, &upstream)?)
        } else {
            None
        };
        Ok((PredictorOutput { loss, pred, labels }, grad))
    }
}

/// One-step function for surrogate predictors
#[derive(Debug, Clone)]
pub struct PredictorStepFn {
    loss: PredictorLoss,
    mode: StepMode,
    optimize_fn: OptimizeFn,
}

/// Build the predictor step function
///
/// `continuous` and `likelihood_weighting` are accepted for symmetry with
/// [`get_step_fn`]; the predictor loss is always a plain regression loss.
#[allow(clippy::too_many_arguments)]
pub fn get_step_fn_predictor(
    sde: Sde,
    train: bool,
    optimize_fn: OptimizeFn,
    reduce_mean: bool,
    continuous: bool,
    likelihood_weighting: bool,
    label_list: Vec<String>,
    noised: bool,
) -> Result<PredictorStepFn> {
    if !continuous && likelihood_weighting {
        return Err(NasDiffError::ConfigError(
            "likelihood weighting is not supported for discrete-time training".to_string(),
        ));
    }
    if label_list.is_empty() {
        return Err(NasDiffError::ConfigError("data.label_list is empty".to_string()));
    }
    Ok(PredictorStepFn {
        loss: PredictorLoss::new(sde, Reduce::from_flag(reduce_mean), label_list, noised),
        mode: mode_of(train),
        optimize_fn,
    })
}

impl PredictorStepFn {
    pub fn mode(&self) -> StepMode {
        self.mode
    }

    pub fn train<M: SurrogateNetwork>(
        &self,
        state: &mut TrainingState<M>,
        batch: &Batch,
        rng: &mut RandomSource,
    ) -> Result<PredictorOutput> {
        if self.mode != StepMode::Train {
            return Err(wrong_mode(StepMode::Train));
        }
        let (output, grad) = self.loss.compute(&state.model, batch, rng, true)?;
        let mut grad = grad.ok_or_else(|| NasDiffError::TrainingError("missing gradient".to_string()))?;
        self.optimize_fn.apply(
            &mut state.optimizer,
            state.model.parameters_mut(),
            &mut grad,
            state.step,
        )?;
        state.step += 1;
        if let Some(ema) = state.ema.as_mut() {
            ema.update(&state.model)?;
        }
        Ok(output)
    }

    pub fn eval<M: SurrogateNetwork + Clone>(
        &self,
        state: &TrainingState<M>,
        batch: &Batch,
    ) -> Result<PredictorOutput> {
        if self.mode != StepMode::Eval {
            return Err(wrong_mode(StepMode::Eval));
        }
        let model = state.ema_model()?;
        let mut rng = eval_rng(state);
        Ok(self.loss.compute(&model, batch, &mut rng, false)?.0)
    }
}
