//! Model factory and network interfaces
//!
//! Networks keep their weights in one flat parameter vector so the optimizer,
//! the EMA and the checkpoint store can treat every model the same way. Training
//! needs no autodiff: each network implements its own vector-Jacobian product.

pub mod ema;
pub mod score_net;
pub mod surrogate;

use std::str::FromStr;

use ndarray::{Array1, Array2, Array3, Axis};

use crate::config::Config;
use crate::error::{NasDiffError, Result};
use crate::sde::{scale_per_sample, Sde};
use crate::utils::RandomSource;

pub use ema::ExponentialMovingAverage;
pub use score_net::GraphLinearScore;
pub use surrogate::LinearSurrogate;

/// Access to a model's flat parameter vector
pub trait Parameterized {
    fn parameters(&self) -> &[f64];

    fn parameters_mut(&mut self) -> &mut [f64];

    fn num_parameters(&self) -> usize {
        self.parameters().len()
    }

    /// Overwrite all parameters, checking the length
    fn load_parameters(&mut self, params: &[f64]) -> Result<()> {
        let target = self.parameters_mut();
        if target.len() != params.len() {
            return Err(NasDiffError::ShapeError {
                expected: format!("{} parameters", target.len()),
                actual: format!("{} parameters", params.len()),
            });
        }
        target.copy_from_slice(params);
        Ok(())
    }
}

/// Denoising network of the score model
///
/// `forward` predicts the noise added to `x` at per-sample times `t`.
pub trait ScoreNetwork: Parameterized + Send + Sync {
    fn clone_box(&self) -> Box<dyn ScoreNetwork>;

    fn forward(&self, x: &Array3<f64>, mask: &Array3<f64>, t: &Array1<f64>) -> Result<Array3<f64>>;

    /// Gradient of `Σ upstream ⊙ forward(x, mask, t)` with respect to the parameters
    fn backward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        t: &Array1<f64>,
        upstream: &Array3<f64>,
    ) -> Result<Vec<f64>>;
}

/// Performance predictor over (possibly noised) architectures
pub trait SurrogateNetwork: Parameterized + Send + Sync {
    fn clone_box(&self) -> Box<dyn SurrogateNetwork>;

    fn num_labels(&self) -> usize;

    /// Predictions `[batch, labels]`
    fn forward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
    ) -> Result<Array2<f64>>;

    /// Gradient of `Σ upstream ⊙ forward(..)` with respect to the parameters
    fn backward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
        upstream: &Array2<f64>,
    ) -> Result<Vec<f64>>;

    /// Gradient of `Σ upstream ⊙ forward(..)` with respect to `x`
    fn input_gradient(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
        upstream: &Array2<f64>,
    ) -> Result<Array3<f64>>;
}

impl<T: Parameterized + ?Sized> Parameterized for Box<T> {
    fn parameters(&self) -> &[f64] {
        (**self).parameters()
    }

    fn parameters_mut(&mut self) -> &mut [f64] {
        (**self).parameters_mut()
    }
}

impl<T: ScoreNetwork + ?Sized> ScoreNetwork for Box<T> {
    fn clone_box(&self) -> Box<dyn ScoreNetwork> {
        (**self).clone_box()
    }

    fn forward(&self, x: &Array3<f64>, mask: &Array3<f64>, t: &Array1<f64>) -> Result<Array3<f64>> {
        (**self).forward(x, mask, t)
    }

    fn backward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        t: &Array1<f64>,
        upstream: &Array3<f64>,
    ) -> Result<Vec<f64>> {
        (**self).backward(x, mask, t, upstream)
    }
}

impl<T: SurrogateNetwork + ?Sized> SurrogateNetwork for Box<T> {
    fn clone_box(&self) -> Box<dyn SurrogateNetwork> {
        (**self).clone_box()
    }

    fn num_labels(&self) -> usize {
        (**self).num_labels()
    }

    fn forward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
    ) -> Result<Array2<f64>> {
        (**self).forward(x, mask, task, t)
    }

    fn backward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
        upstream: &Array2<f64>,
    ) -> Result<Vec<f64>> {
        (**self).backward(x, mask, task, t, upstream)
    }

    fn input_gradient(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
        upstream: &Array2<f64>,
    ) -> Result<Array3<f64>> {
        (**self).input_gradient(x, mask, task, t, upstream)
    }
}

impl Clone for Box<dyn ScoreNetwork> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

impl Clone for Box<dyn SurrogateNetwork> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

impl std::fmt::Debug for dyn ScoreNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScoreNetwork({} parameters)", self.num_parameters())
    }
}

impl std::fmt::Debug for dyn SurrogateNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SurrogateNetwork({} parameters)", self.num_parameters())
    }
}

/// Architectures known to the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    GraphLinearScore,
    LinearSurrogate,
}

impl FromStr for ModelKind {
    type Err = NasDiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "graph_linear_score" => Ok(Self::GraphLinearScore),
            "linear_surrogate" => Ok(Self::LinearSurrogate),
            _ => Err(NasDiffError::UnknownModel(s.to_string())),
        }
    }
}

/// A freshly created model of either family
#[derive(Debug, Clone)]
pub enum AnyModel {
    Score(GraphLinearScore),
    Surrogate(LinearSurrogate),
}

/// Build the model named by `config.model.name`
pub fn create_model(config: &Config, rng: &mut RandomSource) -> Result<AnyModel> {
    let kind: ModelKind = config.model.name.parse()?;
    let model = match kind {
        ModelKind::GraphLinearScore => AnyModel::Score(GraphLinearScore::new(
            config.data.n_vocab,
            config.model.hidden_dim,
            config.model.init_scale,
            rng,
        )),
        ModelKind::LinearSurrogate => AnyModel::Surrogate(LinearSurrogate::new(
            config.data.n_vocab,
            config.model.task_dim,
            config.data.label_list.len(),
            config.model.init_scale,
            rng,
        )),
    };
    Ok(model)
}

/// Build a score network, failing if the config names another family
pub fn create_score_model(config: &Config, rng: &mut RandomSource) -> Result<Box<dyn ScoreNetwork>> {
    match create_model(config, rng)? {
        AnyModel::Score(m) => Ok(Box::new(m)),
        AnyModel::Surrogate(_) => Err(NasDiffError::ConfigError(format!(
            "model `{}` is not a score network",
            config.model.name
        ))),
    }
}

/// Build a surrogate predictor, failing if the config names another family
pub fn create_surrogate_model(
    config: &Config,
    rng: &mut RandomSource,
) -> Result<Box<dyn SurrogateNetwork>> {
    match create_model(config, rng)? {
        AnyModel::Surrogate(m) => Ok(Box::new(m)),
        AnyModel::Score(_) => Err(NasDiffError::ConfigError(format!(
            "model `{}` is not a surrogate predictor",
            config.model.name
        ))),
    }
}

/// Score `∇ log p_t(x)` from a noise-predicting network
pub fn score_fn<M: ScoreNetwork + ?Sized>(
    model: &M,
    sde: &Sde,
    continuous: bool,
    x: &Array3<f64>,
    mask: &Array3<f64>,
    t: &Array1<f64>,
) -> Result<Array3<f64>> {
    let out = model.forward(x, mask, t)?;
    let inv_std = t.mapv(|ti| -1.0 / sde.noise_std(ti, continuous));
    Ok(scale_per_sample(&out, &inv_std))
}

/// Row-normalized mask `D⁻¹M` for each graph
pub(crate) fn propagation(mask: &Array3<f64>) -> Array3<f64> {
    let mut p = mask.clone();
    for mut m in p.outer_iter_mut() {
        for mut row in m.rows_mut() {
            let deg = row.sum().max(1.0);
            row /= deg;
        }
    }
    p
}

/// Mask-weighted neighbour mean `P[b] · x[b]`
pub(crate) fn neighbor_mean(x: &Array3<f64>, p: &Array3<f64>) -> Array3<f64> {
    let mut out = Array3::zeros(x.raw_dim());
    for ((xb, pb), mut ob) in x.outer_iter().zip(p.outer_iter()).zip(out.outer_iter_mut()) {
        ob.assign(&pb.dot(&xb));
    }
    out
}

/// Split the next `len` values off a parameter slice
pub(crate) fn take<'a>(rest: &mut &'a [f64], len: usize) -> &'a [f64] {
    let slice: &'a [f64] = *rest;
    let (head, tail) = slice.split_at(len);
    *rest = tail;
    head
}

/// Flatten `[batch, node, feat]` to `[batch * node, feat]`
pub(crate) fn flatten_nodes(x: &Array3<f64>) -> Result<Array2<f64>> {
    let (b, n, f) = x.dim();
    Ok(x.as_standard_layout().into_owned().into_shape((b * n, f))?)
}

/// Per-node copy of a per-sample vector
pub(crate) fn repeat_per_node(t: &Array1<f64>, nodes: usize) -> Array1<f64> {
    t.iter()
        .flat_map(|&v| std::iter::repeat(v).take(nodes))
        .collect()
}

/// Mean over the node axis `[batch, node, feat] -> [batch, feat]`
pub(crate) fn node_mean(x: &Array3<f64>) -> Array2<f64> {
    x.mean_axis(Axis(1))
        .unwrap_or_else(|| Array2::zeros((x.len_of(Axis(0)), x.len_of(Axis(2)))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_model_by_name() {
        let mut rng = RandomSource::new(0);
        let config = Config::scorenet();
        assert!(matches!(create_model(&config, &mut rng).unwrap(), AnyModel::Score(_)));
        let config = Config::meta_surrogate();
        assert!(matches!(create_model(&config, &mut rng).unwrap(), AnyModel::Surrogate(_)));
    }

    #[test]
    fn test_unknown_model_name() {
        let mut rng = RandomSource::new(0);
        let mut config = Config::scorenet();
        config.model.name = "cate".into();
        assert!(matches!(create_model(&config, &mut rng), Err(NasDiffError::UnknownModel(_))));
    }

    #[test]
    fn test_wrong_family_rejected() {
        let mut rng = RandomSource::new(0);
        assert!(create_surrogate_model(&Config::scorenet(), &mut rng).is_err());
        assert!(create_score_model(&Config::meta_surrogate(), &mut rng).is_err());
    }

    #[test]
    fn test_propagation_rows_sum_to_one() {
        let mut mask = Array3::zeros((1, 3, 3));
        mask[[0, 0, 0]] = 1.0;
        mask[[0, 0, 1]] = 1.0;
        mask[[0, 2, 2]] = 1.0;
        let p = propagation(&mask);
        assert_eq!(p[[0, 0, 1]], 0.5);
        assert_eq!(p.slice(ndarray::s![0, 1, ..]).sum(), 0.0);
        assert_eq!(p[[0, 2, 2]], 1.0);
    }

    #[test]
    fn test_load_parameters_checks_length() {
        let mut rng = RandomSource::new(0);
        let mut model = GraphLinearScore::new(7, 4, 0.1, &mut rng);
        assert!(model.load_parameters(&[0.0; 3]).is_err());
        let zeros = vec![0.0; model.num_parameters()];
        model.load_parameters(&zeros).unwrap();
        assert!(model.parameters().iter().all(|&v| v == 0.0));
    }
}
