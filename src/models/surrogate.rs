//! Linear performance predictor
//!
//! Pools each graph into a fixed feature vector (mean node features, mean
//! neighbourhood features, task context, time) and maps it linearly to the labels.
//! The model is differentiable in its input, which is what classifier guidance
//! needs.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

use super::{neighbor_mean, node_mean, propagation, take, Parameterized, SurrogateNetwork};
use crate::error::{NasDiffError, Result};
use crate::utils::RandomSource;

#[derive(Debug, Clone)]
pub struct LinearSurrogate {
    vocab: usize,
    task_dim: usize,
    num_labels: usize,
    params: Vec<f64>,
}

impl LinearSurrogate {
    pub fn new(
        vocab: usize,
        task_dim: usize,
        num_labels: usize,
        init_scale: f64,
        rng: &mut RandomSource,
    ) -> Self {
        let features = Self::feature_dim_for(vocab, task_dim);
        let mut params: Vec<f64> = rng
            .normal_array2((features, num_labels))
            .iter()
            .map(|v| v * init_scale)
            .collect();
        params.extend(std::iter::repeat(0.0).take(num_labels));
        Self {
            vocab,
            task_dim,
            num_labels,
            params,
        }
    }

    fn feature_dim_for(vocab: usize, task_dim: usize) -> usize {
        2 * vocab + task_dim + 1
    }

    pub fn feature_dim(&self) -> usize {
        Self::feature_dim_for(self.vocab, self.task_dim)
    }

    fn weights(&self) -> Result<(ArrayView2<'_, f64>, ArrayView1<'_, f64>)> {
        let mut rest = &self.params[..];
        let w = ArrayView2::from_shape(
            (self.feature_dim(), self.num_labels),
            take(&mut rest, self.feature_dim() * self.num_labels),
        )?;
        let b = ArrayView1::from(take(&mut rest, self.num_labels));
        Ok((w, b))
    }

    /// Pooled features `[batch, feature_dim]` and the propagation matrix
    fn features(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
    ) -> Result<(Array2<f64>, Array3<f64>)> {
        let (b, n, v) = x.dim();
        if v != self.vocab || mask.dim() != (b, n, n) || t.len() != b {
            return Err(NasDiffError::ShapeError {
                expected: format!("x [B, N, {}], mask [B, N, N], t [B]", self.vocab),
                actual: format!("x {:?}, mask {:?}, t [{}]", x.dim(), mask.dim(), t.len()),
            });
        }
        let p = propagation(mask);
        let mut phi = Array2::zeros((b, self.feature_dim()));
        phi.slice_mut(s![.., 0..v]).assign(&node_mean(x));
        phi.slice_mut(s![.., v..2 * v]).assign(&node_mean(&neighbor_mean(x, &p)));
        if self.task_dim > 0 {
            let task = task.ok_or_else(|| {
                NasDiffError::DataError(format!("predictor expects {} task features", self.task_dim))
            })?;
            if task.dim() != (b, self.task_dim) {
                return Err(NasDiffError::ShapeError {
                    expected: format!("task [{}, {}]", b, self.task_dim),
                    actual: format!("task {:?}", task.dim()),
                });
            }
            phi.slice_mut(s![.., 2 * v..2 * v + self.task_dim]).assign(task);
        }
        phi.column_mut(2 * v + self.task_dim).assign(t);
        Ok((phi, p))
    }

    fn check_upstream(&self, batch: usize, upstream: &Array2<f64>) -> Result<()> {
        if upstream.dim() != (batch, self.num_labels) {
            return Err(NasDiffError::ShapeError {
                expected: format!("[{}, {}]", batch, self.num_labels),
                actual: format!("{:?}", upstream.dim()),
            });
        }
        Ok(())
    }
}

impl Parameterized for LinearSurrogate {
    fn parameters(&self) -> &[f64] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [f64] {
        &mut self.params
    }
}

impl SurrogateNetwork for LinearSurrogate {
    fn clone_box(&self) -> Box<dyn SurrogateNetwork> {
        Box::new(self.clone())
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }

    fn forward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
    ) -> Result<Array2<f64>> {
        let (w, b) = self.weights()?;
        let (phi, _) = self.features(x, mask, task, t)?;
        Ok(phi.dot(&w) + &b)
    }

    fn backward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
        upstream: &Array2<f64>,
    ) -> Result<Vec<f64>> {
        self.check_upstream(x.len_of(Axis(0)), upstream)?;
        let (phi, _) = self.features(x, mask, task, t)?;
        let d_w = phi.t().dot(upstream);
        let d_b = upstream.sum_axis(Axis(0));
        Ok(d_w.iter().chain(d_b.iter()).copied().collect())
    }

    fn input_gradient(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        task: Option<&Array2<f64>>,
        t: &Array1<f64>,
        upstream: &Array2<f64>,
    ) -> Result<Array3<f64>> {
        let (batch, nodes, v) = x.dim();
        self.check_upstream(batch, upstream)?;
        let (w, _) = self.weights()?;
        let (_, p) = self.features(x, mask, task, t)?;
        let d_phi = upstream.dot(&w.t());
        let inv_n = 1.0 / nodes.max(1) as f64;

        let mut grad = Array3::zeros(x.raw_dim());
        for bi in 0..batch {
            let g_x = d_phi.slice(s![bi, 0..v]);
            let g_agg = d_phi.slice(s![bi, v..2 * v]);
            // node n feeds the pooled aggregate through column n of P
            let col_sums = p.slice(s![bi, .., ..]).sum_axis(Axis(0));
            for n in 0..nodes {
                let mut row = grad.slice_mut(s![bi, n, ..]);
                row.assign(&g_x);
                row.scaled_add(col_sums[n], &g_agg);
                row *= inv_n;
            }
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(rng: &mut RandomSource) -> (Array3<f64>, Array3<f64>, Array2<f64>, Array1<f64>) {
        let x = rng.normal_array3((2, 4, 3));
        let mut mask = Array3::zeros((2, 4, 4));
        for b in 0..2 {
            for i in 0..4 {
                mask[[b, i, i]] = 1.0;
                if i + 1 < 4 {
                    mask[[b, i, i + 1]] = 1.0;
                }
            }
        }
        let task = rng.normal_array2((2, 2));
        let t = Array1::from(vec![0.3, 0.8]);
        (x, mask, task, t)
    }

    #[test]
    fn test_forward_shape() {
        let mut rng = RandomSource::new(0);
        let model = LinearSurrogate::new(3, 2, 2, 0.1, &mut rng);
        let (x, mask, task, t) = inputs(&mut rng);
        let out = model.forward(&x, &mask, Some(&task), &t).unwrap();
        assert_eq!(out.dim(), (2, 2));
    }

    #[test]
    fn test_missing_task_rejected() {
        let mut rng = RandomSource::new(0);
        let model = LinearSurrogate::new(3, 2, 1, 0.1, &mut rng);
        let (x, mask, _, t) = inputs(&mut rng);
        assert!(model.forward(&x, &mask, None, &t).is_err());
    }

    #[test]
    fn test_input_gradient_matches_finite_differences() {
        let mut rng = RandomSource::new(4);
        let model = LinearSurrogate::new(3, 2, 2, 1.0, &mut rng);
        let (x, mask, task, t) = inputs(&mut rng);
        let upstream = rng.normal_array2((2, 2));
        let grad = model
            .input_gradient(&x, &mask, Some(&task), &t, &upstream)
            .unwrap();

        let objective = |x: &Array3<f64>| {
            (model.forward(x, &mask, Some(&task), &t).unwrap() * &upstream).sum()
        };
        let h = 1e-6;
        for idx in [[0, 0, 0], [0, 2, 1], [1, 3, 2], [1, 1, 0]] {
            let mut up = x.clone();
            up[idx] += h;
            let mut down = x.clone();
            down[idx] -= h;
            let numeric = (objective(&up) - objective(&down)) / (2.0 * h);
            assert!((numeric - grad[idx]).abs() < 1e-6, "{:?}", idx);
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut rng = RandomSource::new(5);
        let mut model = LinearSurrogate::new(3, 2, 2, 1.0, &mut rng);
        let (x, mask, task, t) = inputs(&mut rng);
        let upstream = rng.normal_array2((2, 2));
        let grad = model.backward(&x, &mask, Some(&task), &t, &upstream).unwrap();
        let h = 1e-6;
        for idx in 0..model.num_parameters() {
            let orig = model.params[idx];
            model.params[idx] = orig + h;
            let up = (model.forward(&x, &mask, Some(&task), &t).unwrap() * &upstream).sum();
            model.params[idx] = orig - h;
            let down = (model.forward(&x, &mask, Some(&task), &t).unwrap() * &upstream).sum();
            model.params[idx] = orig;
            assert!(((up - down) / (2.0 * h) - grad[idx]).abs() < 1e-6);
        }
    }
}
