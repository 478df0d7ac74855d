//! Optimizers and the update policy applied by train steps

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{Config, OptimSection};
use crate::error::{NasDiffError, Result};

/// Interface shared by the flat-vector optimizers
pub trait Optimizer {
    /// Apply one update to `params` using `grads`
    fn step(&mut self, params: &mut [f64], grads: &[f64]) -> Result<()>;

    fn set_lr(&mut self, lr: f64);

    fn lr(&self) -> f64;
}

/// Weight decay flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// L2 penalty folded into the gradient
    Adam,
    /// Decoupled weight decay
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = NasDiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::AdamW),
            _ => Err(NasDiffError::ConfigError(format!("Optimizer {} not supported yet", s))),
        }
    }
}

/// Adam over a flat parameter vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    t: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Adam {
    pub fn new(num_params: usize, lr: f64) -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            t: 0,
            m: vec![0.0; num_params],
            v: vec![0.0; num_params],
        }
    }

    pub fn with_kind(mut self, kind: OptimizerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_beta1(mut self, beta1: f64) -> Self {
        self.beta1 = beta1;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Number of updates applied so far
    pub fn steps(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [f64], grads: &[f64]) -> Result<()> {
        if params.len() != self.m.len() || grads.len() != self.m.len() {
            return Err(NasDiffError::ShapeError {
                expected: format!("{} parameters", self.m.len()),
                actual: format!("{} parameters, {} gradients", params.len(), grads.len()),
            });
        }
        self.t += 1;
        let t = self.t as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);

        for i in 0..params.len() {
            let mut g = grads[i];
            match self.kind {
                OptimizerKind::Adam => g += self.weight_decay * params[i],
                OptimizerKind::AdamW => params[i] -= self.lr * self.weight_decay * params[i],
            }
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
        }
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.lr
    }
}

/// Build the optimizer named in the config for a model with `num_params` weights
pub fn get_optimizer(config: &Config, num_params: usize) -> Result<Adam> {
    let optim = &config.optim;
    let kind: OptimizerKind = optim.optimizer.parse()?;
    Ok(Adam::new(num_params, optim.lr)
        .with_kind(kind)
        .with_beta1(optim.beta1)
        .with_epsilon(optim.eps)
        .with_weight_decay(optim.weight_decay))
}

/// Learning-rate warmup and gradient clipping applied before every optimizer step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizeFn {
    lr: f64,
    warmup: u64,
    grad_clip: f64,
}

impl OptimizeFn {
    pub fn new(optim: &OptimSection) -> Self {
        Self {
            lr: optim.lr,
            warmup: optim.warmup,
            grad_clip: optim.grad_clip,
        }
    }

    /// Learning rate used at `step`
    pub fn lr_at(&self, step: u64) -> f64 {
        if self.warmup > 0 {
            self.lr * (step as f64 / self.warmup as f64).min(1.0)
        } else {
            self.lr
        }
    }

    /// Clip, set the learning rate and step the optimizer; returns the pre-clip gradient norm
    pub fn apply<O: Optimizer>(
        &self,
        optimizer: &mut O,
        params: &mut [f64],
        grads: &mut [f64],
        step: u64,
    ) -> Result<f64> {
        let norm = grads.iter().map(|g| g * g).sum::<f64>().sqrt();
        if !norm.is_finite() {
            return Err(NasDiffError::TrainingError(format!(
                "non-finite gradient norm at step {}",
                step
            )));
        }
        if self.grad_clip >= 0.0 && norm > self.grad_clip {
            let scale = self.grad_clip / (norm + 1e-6);
            grads.iter_mut().for_each(|g| *g *= scale);
        }
        optimizer.set_lr(self.lr_at(step));
        optimizer.step(params, grads)?;
        Ok(norm)
    }
}

/// Update policy from the optimizer section
pub fn optimization_manager(config: &Config) -> OptimizeFn {
    OptimizeFn::new(&config.optim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adam_moves_against_gradient() {
        let mut adam = Adam::new(2, 0.1);
        let mut params = vec![1.0, -1.0];
        adam.step(&mut params, &[1.0, -1.0]).unwrap();
        // first bias-corrected step has magnitude ~lr
        assert!((params[0] - 0.9).abs() < 1e-6);
        assert!((params[1] + 0.9).abs() < 1e-6);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_adamw_decays_without_gradient() {
        let mut adam = Adam::new(1, 0.1)
            .with_kind(OptimizerKind::AdamW)
            .with_weight_decay(0.5);
        let mut params = vec![2.0];
        adam.step(&mut params, &[0.0]).unwrap();
        assert!((params[0] - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_optimizer() {
        let mut config = Config::scorenet();
        config.optim.optimizer = "lion".into();
        assert!(get_optimizer(&config, 3).unwrap_err().is_config_error());
    }

    #[test]
    fn test_warmup_schedule() {
        let mut config = Config::scorenet();
        config.optim.lr = 1.0;
        config.optim.warmup = 10;
        let f = optimization_manager(&config);
        assert_eq!(f.lr_at(0), 0.0);
        assert_eq!(f.lr_at(5), 0.5);
        assert_eq!(f.lr_at(50), 1.0);
    }

    #[test]
    fn test_gradient_clipping() {
        let mut config = Config::scorenet();
        config.optim.grad_clip = 1.0;
        config.optim.warmup = 0;
        let f = optimization_manager(&config);
        let mut adam = Adam::new(2, 1e-3);
        let mut params = vec![0.0, 0.0];
        let mut grads = vec![3.0, 4.0];
        let norm = f.apply(&mut adam, &mut params, &mut grads, 1).unwrap();
        assert_eq!(norm, 5.0);
        let clipped = (grads[0] * grads[0] + grads[1] * grads[1]).sqrt();
        assert!((clipped - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_length_mismatch() {
        let mut adam = Adam::new(2, 0.1);
        assert!(adam.step(&mut [0.0; 3], &[0.0; 3]).is_err());
    }
}
