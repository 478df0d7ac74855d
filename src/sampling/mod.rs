//! Predictor-corrector sampling of architecture tensors
//!
//! Starting from the SDE prior, the sampler walks `N` times from `T` down to `eps`.
//! At each time a corrector (Langevin MCMC or nothing) refines the state and then a
//! predictor (Euler-Maruyama, reverse diffusion or nothing) takes one step of the
//! reverse-time SDE. A conditional sampler adds classifier guidance: the gradient of
//! the surrogate's summed predictions is added to the score, scaled by
//! `classifier_scale`.

use std::str::FromStr;

use ndarray::{s, Array1, Array2, Array3, Axis};
use tracing::debug;

use crate::config::Config;
use crate::data::DataScaler;
use crate::error::{NasDiffError, Result};
use crate::models::{score_fn, ScoreNetwork, SurrogateNetwork};
use crate::sde::{scale_per_sample, Sde};
use crate::utils::RandomSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorKind {
    EulerMaruyama,
    ReverseDiffusion,
    None,
}

impl FromStr for PredictorKind {
    type Err = NasDiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "euler_maruyama" => Ok(Self::EulerMaruyama),
            "reverse_diffusion" => Ok(Self::ReverseDiffusion),
            "none" => Ok(Self::None),
            _ => Err(NasDiffError::ConfigError(format!("unknown predictor `{}`", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectorKind {
    Langevin,
    None,
}

impl FromStr for CorrectorKind {
    type Err = NasDiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "langevin" => Ok(Self::Langevin),
            "none" => Ok(Self::None),
            _ => Err(NasDiffError::ConfigError(format!("unknown corrector `{}`", s))),
        }
    }
}

/// Samples (after the inverse scaler) and the number of score evaluations
#[derive(Debug, Clone)]
pub struct SampleOutput {
    pub samples: Array3<f64>,
    pub n_steps: usize,
}

/// Classifier guidance settings of a conditional sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guidance {
    pub classifier_scale: f64,
}

/// Surrogate steering a conditional sample
pub struct Classifier<'a, C: SurrogateNetwork + ?Sized> {
    pub model: &'a C,
    /// Task context; row 0 is broadcast over the sample batch
    pub task: Option<&'a Array2<f64>>,
}

/// Configured sampler, built once per loop by [`get_sampling_fn`]
#[derive(Debug, Clone)]
pub struct SamplingFn {
    sde: Sde,
    shape: (usize, usize, usize),
    inverse_scaler: DataScaler,
    eps: f64,
    continuous: bool,
    predictor: PredictorKind,
    corrector: CorrectorKind,
    snr: f64,
    n_steps_each: usize,
    noise_removal: bool,
    guidance: Option<Guidance>,
}

/// Build an unconditional predictor-corrector sampler producing `shape` batches
pub fn get_sampling_fn(
    config: &Config,
    sde: Sde,
    shape: (usize, usize, usize),
    inverse_scaler: DataScaler,
    eps: f64,
) -> Result<SamplingFn> {
    let sampling = &config.sampling;
    if sampling.method.to_lowercase() != "pc" {
        return Err(NasDiffError::ConfigError(format!(
            "Sampling method {} unknown",
            sampling.method
        )));
    }
    Ok(SamplingFn {
        sde,
        shape,
        inverse_scaler,
        eps,
        continuous: config.training.continuous,
        predictor: sampling.predictor.parse()?,
        corrector: sampling.corrector.parse()?,
        snr: sampling.snr,
        n_steps_each: sampling.n_steps_each,
        noise_removal: sampling.noise_removal,
        guidance: None,
    })
}

/// Build a classifier-guided sampler; `num_sample` overrides the batch size of `shape`
pub fn get_conditional_sampling_fn(
    config: &Config,
    sde: Sde,
    shape: (usize, usize, usize),
    inverse_scaler: DataScaler,
    eps: f64,
    num_sample: Option<usize>,
) -> Result<SamplingFn> {
    let shape = (num_sample.unwrap_or(shape.0), shape.1, shape.2);
    let mut sampling_fn = get_sampling_fn(config, sde, shape, inverse_scaler, eps)?;
    sampling_fn.guidance = Some(Guidance {
        classifier_scale: config.sampling.classifier_scale,
    });
    Ok(sampling_fn)
}

/// Repeat row 0 of `x` to `batch` rows unless it already has that many
fn broadcast_rows3(x: &Array3<f64>, batch: usize) -> Result<Array3<f64>> {
    let (b, n, m) = x.dim();
    if b == batch {
        return Ok(x.clone());
    }
    if b == 0 {
        return Err(NasDiffError::DataError("empty sampling mask".to_string()));
    }
    let row = x.slice(s![0..1, .., ..]);
    Ok(row
        .broadcast((batch, n, m))
        .ok_or_else(|| NasDiffError::ShapeError {
            expected: format!("[{}, {}, {}]", batch, n, m),
            actual: format!("{:?}", x.dim()),
        })?
        .to_owned())
}

fn broadcast_rows2(x: &Array2<f64>, batch: usize) -> Result<Array2<f64>> {
    let (b, d) = x.dim();
    if b == batch {
        return Ok(x.clone());
    }
    if b == 0 {
        return Err(NasDiffError::DataError("empty task context".to_string()));
    }
    let row = x.slice(s![0..1, ..]);
    Ok(row
        .broadcast((batch, d))
        .ok_or_else(|| NasDiffError::ShapeError {
            expected: format!("[{}, {}]", batch, d),
            actual: format!("{:?}", x.dim()),
        })?
        .to_owned())
}

/// Mean over the batch of the per-sample L2 norm
fn mean_norm(x: &Array3<f64>) -> f64 {
    let b = x.len_of(Axis(0)).max(1);
    x.outer_iter().map(|v| v.mapv(|e| e * e).sum().sqrt()).sum::<f64>() / b as f64
}

impl SamplingFn {
    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn is_conditional(&self) -> bool {
        self.guidance.is_some()
    }

    /// Unconditional sample
    pub fn sample<M: ScoreNetwork + ?Sized>(
        &self,
        model: &M,
        mask: &Array3<f64>,
        rng: &mut RandomSource,
    ) -> Result<SampleOutput> {
        self.run::<M, dyn SurrogateNetwork>(model, mask, None, rng)
    }

    /// Classifier-guided sample; fails on an unconditional sampler
    pub fn sample_guided<M: ScoreNetwork + ?Sized, C: SurrogateNetwork + ?Sized>(
        &self,
        model: &M,
        mask: &Array3<f64>,
        classifier: Classifier<'_, C>,
        rng: &mut RandomSource,
    ) -> Result<SampleOutput> {
        if self.guidance.is_none() {
            return Err(NasDiffError::ConfigError(
                "classifier given to an unconditional sampler".to_string(),
            ));
        }
        self.run(model, mask, Some(classifier), rng)
    }

    fn run<M: ScoreNetwork + ?Sized, C: SurrogateNetwork + ?Sized>(
        &self,
        model: &M,
        mask: &Array3<f64>,
        classifier: Option<Classifier<'_, C>>,
        rng: &mut RandomSource,
    ) -> Result<SampleOutput> {
        let (batch, nodes, _) = self.shape;
        let mask = broadcast_rows3(mask, batch)?;
        if mask.dim() != (batch, nodes, nodes) {
            return Err(NasDiffError::ShapeError {
                expected: format!("mask [{}, {}, {}]", batch, nodes, nodes),
                actual: format!("{:?}", mask.dim()),
            });
        }
        let task = match classifier.as_ref().and_then(|c| c.task) {
            Some(task) => Some(broadcast_rows2(task, batch)?),
            None => None,
        };
        let guide = classifier.as_ref().map(|c| (c.model, task.as_ref()));

        let score = |x: &Array3<f64>, t: &Array1<f64>| -> Result<Array3<f64>> {
            let mut score = score_fn(model, &self.sde, self.continuous, x, &mask, t)?;
            if let (Some((classifier, task)), Some(g)) = (guide, self.guidance) {
                let ones = Array2::ones((batch, classifier.num_labels()));
                let grad = classifier.input_gradient(x, &mask, task, t, &ones)?;
                score.scaled_add(g.classifier_scale, &grad);
            }
            Ok(score)
        };

        let n = self.sde.num_steps();
        let mut x = self.sde.prior_sampling(self.shape, rng);
        let mut x_mean = x.clone();
        let t_max = self.sde.t_max();
        for i in 0..n {
            let t = if n > 1 {
                t_max + (self.eps - t_max) * i as f64 / (n - 1) as f64
            } else {
                t_max
            };
            let vec_t = Array1::from_elem(batch, t);
            let (cx, cm) = self.corrector_step(&score, x, &vec_t, rng)?;
            x = cx;
            x_mean = cm;
            let (px, pm) = self.predictor_step(&score, x, &vec_t, rng)?;
            x = px;
            x_mean = pm;
        }
        debug!(steps = n, batch, "sampling finished");

        let out = if self.noise_removal { x_mean } else { x };
        let corrector_steps = match self.corrector {
            CorrectorKind::Langevin => self.n_steps_each,
            CorrectorKind::None => 0,
        };
        Ok(SampleOutput {
            samples: self.inverse_scaler.inverse(out),
            n_steps: n * (corrector_steps + 1),
        })
    }

    fn predictor_step<F>(
        &self,
        score: &F,
        x: Array3<f64>,
        t: &Array1<f64>,
        rng: &mut RandomSource,
    ) -> Result<(Array3<f64>, Array3<f64>)>
    where
        F: Fn(&Array3<f64>, &Array1<f64>) -> Result<Array3<f64>>,
    {
        match self.predictor {
            PredictorKind::None => Ok((x.clone(), x)),
            PredictorKind::EulerMaruyama => {
                let dt = -1.0 / self.sde.num_steps() as f64;
                let s = score(&x, t)?;
                let (drift, diffusion) = self.sde.sde(&x, t);
                let g2 = diffusion.mapv(|g| g * g);
                let rev_drift = drift - scale_per_sample(&s, &g2);
                let x_mean = &x + &(rev_drift * dt);
                let z = rng.normal_array3(x.dim());
                let noise = scale_per_sample(&z, &diffusion.mapv(|g| g * (-dt).sqrt()));
                Ok((&x_mean + &noise, x_mean))
            }
            PredictorKind::ReverseDiffusion => {
                let s = score(&x, t)?;
                let (f, g) = self.sde.discretize(&x, t);
                let g2 = g.mapv(|v| v * v);
                let rev_f = f - scale_per_sample(&s, &g2);
                let x_mean = &x - &rev_f;
                let z = rng.normal_array3(x.dim());
                Ok((&x_mean + &scale_per_sample(&z, &g), x_mean))
            }
        }
    }

    fn corrector_step<F>(
        &self,
        score: &F,
        mut x: Array3<f64>,
        t: &Array1<f64>,
        rng: &mut RandomSource,
    ) -> Result<(Array3<f64>, Array3<f64>)>
    where
        F: Fn(&Array3<f64>, &Array1<f64>) -> Result<Array3<f64>>,
    {
        match self.corrector {
            CorrectorKind::None => Ok((x.clone(), x)),
            CorrectorKind::Langevin => {
                let alpha = t.get(0).map(|&ti| self.sde.langevin_alpha(ti)).unwrap_or(1.0);
                let mut x_mean = x.clone();
                for _ in 0..self.n_steps_each {
                    let grad = score(&x, t)?;
                    let noise = rng.normal_array3(x.dim());
                    let grad_norm = mean_norm(&grad);
                    let noise_norm = mean_norm(&noise);
                    let step_size = if grad_norm > 0.0 {
                        (self.snr * noise_norm / grad_norm).powi(2) * 2.0 * alpha
                    } else {
                        0.0
                    };
                    x_mean = &x + &(grad * step_size);
                    x = &x_mean + &(noise * (2.0 * step_size).sqrt());
                }
                Ok((x, x_mean))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{aug_mask, cell_adjacency, AugMaskAlgo};
    use crate::models::{GraphLinearScore, LinearSurrogate};
    use crate::sde::build_sde;

    fn small_config() -> Config {
        let mut config = Config::scorenet();
        config.model.num_scales = 20;
        config
    }

    fn mask() -> Array3<f64> {
        aug_mask(&cell_adjacency().insert_axis(Axis(0)), AugMaskAlgo::Floyd)
    }

    #[test]
    fn test_unconditional_shape_and_steps() {
        let mut config = small_config();
        config.sampling.corrector = "langevin".into();
        config.sampling.n_steps_each = 2;
        let (sde, eps) = build_sde(&config).unwrap();
        let f = get_sampling_fn(&config, sde, (5, 8, 7), DataScaler::new(true), eps).unwrap();
        let mut rng = RandomSource::new(0);
        let model = GraphLinearScore::new(7, 8, 0.05, &mut rng);
        let out = f.sample(&model, &mask(), &mut rng).unwrap();
        assert_eq!(out.samples.dim(), (5, 8, 7));
        assert_eq!(out.n_steps, 60);
        assert!(out.samples.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_reverse_diffusion_predictor() {
        let mut config = small_config().with_sde("vesde");
        config.sampling.predictor = "reverse_diffusion".into();
        let (sde, eps) = build_sde(&config).unwrap();
        let f = get_sampling_fn(&config, sde, (3, 8, 7), DataScaler::new(true), eps).unwrap();
        let mut rng = RandomSource::new(1);
        let model = GraphLinearScore::new(7, 8, 0.05, &mut rng);
        let out = f.sample(&model, &mask(), &mut rng).unwrap();
        assert_eq!(out.n_steps, 20);
    }

    #[test]
    fn test_guided_sampling_uses_num_sample() {
        let mut config = small_config();
        config.model.task_dim = 2;
        let (sde, eps) = build_sde(&config).unwrap();
        let f = get_conditional_sampling_fn(&config, sde, (16, 8, 7), DataScaler::new(true), eps, Some(4))
            .unwrap();
        assert_eq!(f.shape().0, 4);
        let mut rng = RandomSource::new(2);
        let model = GraphLinearScore::new(7, 8, 0.05, &mut rng);
        let surrogate = LinearSurrogate::new(7, 2, 1, 0.1, &mut rng);
        let task = Array2::from_elem((1, 2), 0.5);
        let out = f
            .sample_guided(&model, &mask(), Classifier { model: &surrogate, task: Some(&task) }, &mut rng)
            .unwrap();
        assert_eq!(out.samples.dim(), (4, 8, 7));
    }

    #[test]
    fn test_guidance_requires_conditional_sampler() {
        let config = small_config();
        let (sde, eps) = build_sde(&config).unwrap();
        let f = get_sampling_fn(&config, sde, (2, 8, 7), DataScaler::new(true), eps).unwrap();
        let mut rng = RandomSource::new(2);
        let model = GraphLinearScore::new(7, 8, 0.05, &mut rng);
        let surrogate = LinearSurrogate::new(7, 0, 1, 0.1, &mut rng);
        let classifier = Classifier { model: &surrogate, task: None };
        assert!(f.sample_guided(&model, &mask(), classifier, &mut rng).is_err());
    }

    #[test]
    fn test_unknown_kinds() {
        let mut config = small_config();
        config.sampling.predictor = "ancestral".into();
        let (sde, eps) = build_sde(&config).unwrap();
        assert!(get_sampling_fn(&config, sde.clone(), (1, 8, 7), DataScaler::new(true), eps).is_err());
        let mut config = small_config();
        config.sampling.method = "ode".into();
        assert!(get_sampling_fn(&config, sde, (1, 8, 7), DataScaler::new(true), eps).is_err());
    }
}
