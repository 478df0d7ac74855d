//! Noise schedules (forward SDEs)
//!
//! Two interchangeable schedules are supported:
//! - [`VpSde`] - variance preserving, `dx = -½β(t)x dt + √β(t) dw`
//! - [`VeSde`] - variance exploding, `dx = σ(t)√(2 ln(σmax/σmin)) dw`
//!
//! Both have a drift that is linear in `x`, so the primitives below work with
//! per-sample scalar coefficients applied to whole `[batch, node, vocab]` tensors.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};

use crate::config::{Config, ModelSection};
use crate::error::{NasDiffError, Result};
use crate::utils::RandomSource;

/// Supported SDE kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SdeKind {
    /// Variance preserving
    Vp,
    /// Variance exploding
    Ve,
}

impl SdeKind {
    /// Smallest time the sampler integrates down to
    pub fn sampling_eps(self) -> f64 {
        match self {
            Self::Vp => 1e-3,
            Self::Ve => 1e-5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vp => "vpsde",
            Self::Ve => "vesde",
        }
    }
}

impl FromStr for SdeKind {
    type Err = NasDiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vpsde" => Ok(Self::Vp),
            "vesde" => Ok(Self::Ve),
            _ => Err(NasDiffError::UnsupportedSde(s.to_string())),
        }
    }
}

impl fmt::Display for SdeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variance-preserving SDE with a linear β schedule
#[derive(Debug, Clone)]
pub struct VpSde {
    beta_0: f64,
    beta_1: f64,
    n: usize,
    discrete_betas: Vec<f64>,
    alphas: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_1m_alphas_cumprod: Vec<f64>,
}

impl VpSde {
    pub fn new(beta_min: f64, beta_max: f64, n: usize) -> Self {
        let discrete_betas = linspace(beta_min / n as f64, beta_max / n as f64, n);
        let alphas: Vec<f64> = discrete_betas.iter().map(|b| 1.0 - b).collect();
        let mut cumprod = 1.0;
        let mut sqrt_alphas_cumprod = Vec::with_capacity(n);
        let mut sqrt_1m_alphas_cumprod = Vec::with_capacity(n);
        for a in &alphas {
            cumprod *= a;
            sqrt_alphas_cumprod.push(cumprod.sqrt());
            sqrt_1m_alphas_cumprod.push((1.0 - cumprod).sqrt());
        }
        Self {
            beta_0: beta_min,
            beta_1: beta_max,
            n,
            discrete_betas,
            alphas,
            sqrt_alphas_cumprod,
            sqrt_1m_alphas_cumprod,
        }
    }

    fn beta(&self, t: f64) -> f64 {
        self.beta_0 + t * (self.beta_1 - self.beta_0)
    }

    fn log_mean_coeff(&self, t: f64) -> f64 {
        -0.25 * t * t * (self.beta_1 - self.beta_0) - 0.5 * t * self.beta_0
    }
}

/// Variance-exploding SDE with a geometric σ schedule
#[derive(Debug, Clone)]
pub struct VeSde {
    sigma_min: f64,
    sigma_max: f64,
    n: usize,
    discrete_sigmas: Vec<f64>,
}

impl VeSde {
    pub fn new(sigma_min: f64, sigma_max: f64, n: usize) -> Self {
        let discrete_sigmas = linspace(sigma_min.ln(), sigma_max.ln(), n)
            .into_iter()
            .map(f64::exp)
            .collect();
        Self {
            sigma_min,
            sigma_max,
            n,
            discrete_sigmas,
        }
    }

    fn sigma(&self, t: f64) -> f64 {
        self.sigma_min * (self.sigma_max / self.sigma_min).powf(t)
    }
}

/// A constructed noise schedule, shared read-only by training and sampling
#[derive(Debug, Clone)]
pub enum Sde {
    Vp(VpSde),
    Ve(VeSde),
}

impl Sde {
    /// Build the schedule of `kind` from the model section parameters
    pub fn new(kind: SdeKind, model: &ModelSection) -> Self {
        match kind {
            SdeKind::Vp => Self::Vp(VpSde::new(model.beta_min, model.beta_max, model.num_scales)),
            SdeKind::Ve => Self::Ve(VeSde::new(model.sigma_min, model.sigma_max, model.num_scales)),
        }
    }

    pub fn kind(&self) -> SdeKind {
        match self {
            Self::Vp(_) => SdeKind::Vp,
            Self::Ve(_) => SdeKind::Ve,
        }
    }

    /// Number of discretization steps N
    pub fn num_steps(&self) -> usize {
        match self {
            Self::Vp(s) => s.n,
            Self::Ve(s) => s.n,
        }
    }

    /// End of the time horizon
    pub fn t_max(&self) -> f64 {
        1.0
    }

    pub fn sampling_eps(&self) -> f64 {
        self.kind().sampling_eps()
    }

    /// Coefficient `a(t)` of the linear drift `f(x, t) = a(t)·x`
    pub fn drift_coeff(&self, t: f64) -> f64 {
        match self {
            Self::Vp(s) => -0.5 * s.beta(t),
            Self::Ve(_) => 0.0,
        }
    }

    /// Diffusion coefficient `g(t)`
    pub fn diffusion(&self, t: f64) -> f64 {
        match self {
            Self::Vp(s) => s.beta(t).sqrt(),
            Self::Ve(s) => s.sigma(t) * (2.0 * (s.sigma_max.ln() - s.sigma_min.ln())).sqrt(),
        }
    }

    /// Drift and diffusion of the forward SDE for a batch with per-sample times
    pub fn sde(&self, x: &Array3<f64>, t: &Array1<f64>) -> (Array3<f64>, Array1<f64>) {
        let drift = scale_per_sample(x, &t.mapv(|ti| self.drift_coeff(ti)));
        (drift, t.mapv(|ti| self.diffusion(ti)))
    }

    /// Coefficient applied to clean data in the perturbation kernel mean
    pub fn marginal_mean_coeff(&self, t: f64) -> f64 {
        match self {
            Self::Vp(s) => s.log_mean_coeff(t).exp(),
            Self::Ve(_) => 1.0,
        }
    }

    /// Standard deviation of the perturbation kernel at time `t`
    pub fn marginal_std(&self, t: f64) -> f64 {
        match self {
            Self::Vp(s) => (1.0 - (2.0 * s.log_mean_coeff(t)).exp()).sqrt(),
            Self::Ve(s) => s.sigma(t),
        }
    }

    /// Mean and std of `p_t(x_t | x_0)` for a batch
    pub fn marginal_prob(&self, x: &Array3<f64>, t: &Array1<f64>) -> (Array3<f64>, Array1<f64>) {
        let mean = scale_per_sample(x, &t.mapv(|ti| self.marginal_mean_coeff(ti)));
        (mean, t.mapv(|ti| self.marginal_std(ti)))
    }

    /// Mean coefficient and std of the discrete-time kernel at integer `label`
    pub fn discrete_marginal(&self, label: usize) -> (f64, f64) {
        match self {
            Self::Vp(s) => (s.sqrt_alphas_cumprod[label], s.sqrt_1m_alphas_cumprod[label]),
            Self::Ve(s) => (1.0, s.discrete_sigmas[label]),
        }
    }

    /// Discrete timestep index for a continuous time
    pub fn timestep(&self, t: f64) -> usize {
        let n = self.num_steps();
        // small offset keeps exact label times from truncating one step down
        ((t / self.t_max() * (n - 1) as f64 + 1e-9).max(0.0) as usize).min(n - 1)
    }

    /// Continuous time corresponding to a discrete label
    pub fn label_to_time(&self, label: usize) -> f64 {
        let n = self.num_steps();
        if n <= 1 {
            0.0
        } else {
            label as f64 / (n - 1) as f64 * self.t_max()
        }
    }

    /// Std used to turn network outputs into scores
    pub fn noise_std(&self, t: f64, continuous: bool) -> f64 {
        if continuous {
            self.marginal_std(t)
        } else {
            self.discrete_marginal(self.timestep(t)).1
        }
    }

    /// Sample from the prior `p_T`
    pub fn prior_sampling(&self, shape: (usize, usize, usize), rng: &mut RandomSource) -> Array3<f64> {
        let z = rng.normal_array3(shape);
        match self {
            Self::Vp(_) => z,
            Self::Ve(s) => z * s.sigma_max,
        }
    }

    /// One reverse-diffusion discretization step `(f, G)` at per-sample times
    pub fn discretize(&self, x: &Array3<f64>, t: &Array1<f64>) -> (Array3<f64>, Array1<f64>) {
        match self {
            Self::Vp(s) => {
                let steps = t.mapv(|ti| self.timestep(ti));
                let f_coeff = steps.mapv(|i| s.alphas[i].sqrt() - 1.0);
                let g = steps.mapv(|i| s.discrete_betas[i].sqrt());
                (scale_per_sample(x, &f_coeff), g)
            }
            Self::Ve(s) => {
                let g = t.mapv(|ti| {
                    let i = self.timestep(ti);
                    let sigma = s.discrete_sigmas[i];
                    let adjacent = if i == 0 { 0.0 } else { s.discrete_sigmas[i - 1] };
                    (sigma * sigma - adjacent * adjacent).sqrt()
                });
                (Array3::zeros(x.raw_dim()), g)
            }
        }
    }

    /// Step-size scale used by the Langevin corrector
    pub fn langevin_alpha(&self, t: f64) -> f64 {
        match self {
            Self::Vp(s) => s.alphas[self.timestep(t)],
            Self::Ve(_) => 1.0,
        }
    }
}

/// Construct the run's noise schedule and its sampling epsilon from config
pub fn build_sde(config: &Config) -> Result<(Sde, f64)> {
    let kind: SdeKind = config.training.sde.parse()?;
    let sde = Sde::new(kind, &config.model);
    Ok((sde, kind.sampling_eps()))
}

/// Multiply each sample `b` of a batch by `coeff[b]`
pub(crate) fn scale_per_sample(x: &Array3<f64>, coeff: &Array1<f64>) -> Array3<f64> {
    let mut out = x.clone();
    for (mut slab, &c) in out.outer_iter_mut().zip(coeff.iter()) {
        slab *= c;
    }
    out
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}
