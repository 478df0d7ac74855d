//! Exponential moving average of model parameters

use serde::{Deserialize, Serialize};

use super::Parameterized;
use crate::error::{NasDiffError, Result};

/// Shadow copy of a model's parameters, updated after every optimizer step
///
/// Early updates use a warm-up decay `min(decay, (1 + n) / (10 + n))` so the
/// shadow tracks the live weights closely at the start of training.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExponentialMovingAverage {
    decay: f64,
    num_updates: u64,
    shadow: Vec<f64>,
    #[serde(skip)]
    backup: Option<Vec<f64>>,
}

impl ExponentialMovingAverage {
    pub fn new<M: Parameterized + ?Sized>(model: &M, decay: f64) -> Self {
        Self {
            decay,
            num_updates: 0,
            shadow: model.parameters().to_vec(),
            backup: None,
        }
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn shadow(&self) -> &[f64] {
        &self.shadow
    }

    /// Fold the model's current parameters into the shadow
    pub fn update<M: Parameterized + ?Sized>(&mut self, model: &M) -> Result<()> {
        let params = model.parameters();
        self.check_len(params.len())?;
        self.num_updates += 1;
        let n = self.num_updates as f64;
        let decay = self.decay.min((1.0 + n) / (10.0 + n));
        let one_minus = 1.0 - decay;
        for (s, &p) in self.shadow.iter_mut().zip(params) {
            *s -= one_minus * (*s - p);
        }
        Ok(())
    }

    /// Stash the model's live parameters so [`restore`](Self::restore) can bring them back
    pub fn store<M: Parameterized + ?Sized>(&mut self, model: &M) {
        self.backup = Some(model.parameters().to_vec());
    }

    /// Load the shadow parameters into the model
    pub fn copy_to<M: Parameterized + ?Sized>(&self, model: &mut M) -> Result<()> {
        model.load_parameters(&self.shadow)
    }

    /// Put back the parameters saved by the last [`store`](Self::store)
    pub fn restore<M: Parameterized + ?Sized>(&mut self, model: &mut M) -> Result<()> {
        let backup = self
            .backup
            .take()
            .ok_or_else(|| NasDiffError::TrainingError("EMA restore without a stored copy".to_string()))?;
        model.load_parameters(&backup)
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.shadow.len() {
            return Err(NasDiffError::ShapeError {
                expected: format!("{} parameters", self.shadow.len()),
                actual: format!("{} parameters", len),
            });
        }
        Ok(())
    }
}
