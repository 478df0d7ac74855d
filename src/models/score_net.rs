//! Graph-aware denoising network
//!
//! Each node is mapped independently by a one-hidden-layer perceptron over its own
//! features, the mask-weighted mean of its neighbours and the diffusion time:
//!
//! ```text
//! h   = relu(x·W1 + (D⁻¹M x)·W2 + t·c1 + b1)
//! out = h·W3 + b3
//! ```

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

use super::{
    flatten_nodes, neighbor_mean, propagation, repeat_per_node, take, Parameterized, ScoreNetwork,
};
use crate::error::{NasDiffError, Result};
use crate::utils::RandomSource;

/// Per-node MLP with neighbourhood aggregation
#[derive(Debug, Clone)]
pub struct GraphLinearScore {
    vocab: usize,
    hidden: usize,
    params: Vec<f64>,
}

struct Weights<'a> {
    w1: ArrayView2<'a, f64>,
    w2: ArrayView2<'a, f64>,
    c1: ArrayView1<'a, f64>,
    b1: ArrayView1<'a, f64>,
    w3: ArrayView2<'a, f64>,
    b3: ArrayView1<'a, f64>,
}

/// Intermediate values kept for the backward pass
struct Activations {
    x: Array2<f64>,
    agg: Array2<f64>,
    t: Array1<f64>,
    pre: Array2<f64>,
    hidden: Array2<f64>,
}

impl GraphLinearScore {
    /// New network with normal weights of std `init_scale` and zero biases
    pub fn new(vocab: usize, hidden: usize, init_scale: f64, rng: &mut RandomSource) -> Self {
        let mut params = Vec::with_capacity(Self::param_count(vocab, hidden));
        params.extend(rng.normal_array2((vocab, hidden)).iter().map(|v| v * init_scale));
        params.extend(rng.normal_array2((vocab, hidden)).iter().map(|v| v * init_scale));
        params.extend(rng.normal_array2((1, hidden)).iter().map(|v| v * init_scale));
        params.extend(std::iter::repeat(0.0).take(hidden));
        params.extend(rng.normal_array2((hidden, vocab)).iter().map(|v| v * init_scale));
        params.extend(std::iter::repeat(0.0).take(vocab));
        Self { vocab, hidden, params }
    }

    fn param_count(vocab: usize, hidden: usize) -> usize {
        3 * vocab * hidden + 2 * hidden + vocab
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    fn weights(&self) -> Result<Weights<'_>> {
        let (v, h) = (self.vocab, self.hidden);
        let mut rest = &self.params[..];
        let w1 = ArrayView2::from_shape((v, h), take(&mut rest, v * h))?;
        let w2 = ArrayView2::from_shape((v, h), take(&mut rest, v * h))?;
        let c1 = ArrayView1::from(take(&mut rest, h));
        let b1 = ArrayView1::from(take(&mut rest, h));
        let w3 = ArrayView2::from_shape((h, v), take(&mut rest, h * v))?;
        let b3 = ArrayView1::from(take(&mut rest, v));
        Ok(Weights { w1, w2, c1, b1, w3, b3 })
    }

    fn check_input(&self, x: &Array3<f64>, mask: &Array3<f64>, t: &Array1<f64>) -> Result<()> {
        let (b, n, v) = x.dim();
        if v != self.vocab || mask.dim() != (b, n, n) || t.len() != b {
            return Err(NasDiffError::ShapeError {
                expected: format!("x [B, N, {}], mask [B, N, N], t [B]", self.vocab),
                actual: format!("x {:?}, mask {:?}, t [{}]", x.dim(), mask.dim(), t.len()),
            });
        }
        Ok(())
    }

    fn activations(&self, w: &Weights<'_>, x: &Array3<f64>, mask: &Array3<f64>, t: &Array1<f64>) -> Result<Activations> {
        self.check_input(x, mask, t)?;
        let nodes = x.len_of(Axis(1));
        let agg = neighbor_mean(x, &propagation(mask));
        let xf = flatten_nodes(x)?;
        let af = flatten_nodes(&agg)?;
        let tf = repeat_per_node(t, nodes);

        let mut pre = xf.dot(&w.w1) + af.dot(&w.w2);
        for (mut row, &ti) in pre.rows_mut().into_iter().zip(tf.iter()) {
            row.scaled_add(ti, &w.c1);
            row += &w.b1;
        }
        let hidden = pre.mapv(|v| v.max(0.0));
        Ok(Activations {
            x: xf,
            agg: af,
            t: tf,
            pre,
            hidden,
        })
    }
}

impl Parameterized for GraphLinearScore {
    fn parameters(&self) -> &[f64] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [f64] {
        &mut self.params
    }
}

impl ScoreNetwork for GraphLinearScore {
    fn clone_box(&self) -> Box<dyn ScoreNetwork> {
        Box::new(self.clone())
    }

    fn forward(&self, x: &Array3<f64>, mask: &Array3<f64>, t: &Array1<f64>) -> Result<Array3<f64>> {
        let w = self.weights()?;
        let act = self.activations(&w, x, mask, t)?;
        let out = act.hidden.dot(&w.w3) + &w.b3;
        Ok(out.into_shape(x.raw_dim())?)
    }

    fn backward(
        &self,
        x: &Array3<f64>,
        mask: &Array3<f64>,
        t: &Array1<f64>,
        upstream: &Array3<f64>,
    ) -> Result<Vec<f64>> {
        if upstream.dim() != x.dim() {
            return Err(NasDiffError::ShapeError {
                expected: format!("{:?}", x.dim()),
                actual: format!("{:?}", upstream.dim()),
            });
        }
        let w = self.weights()?;
        let act = self.activations(&w, x, mask, t)?;
        let up = flatten_nodes(upstream)?;

        let d_w3 = act.hidden.t().dot(&up);
        let d_b3 = up.sum_axis(Axis(0));

        let mut d_pre = up.dot(&w.w3.t());
        d_pre.zip_mut_with(&act.pre, |g, &p| {
            if p <= 0.0 {
                *g = 0.0;
            }
        });
        let d_w1 = act.x.t().dot(&d_pre);
        let d_w2 = act.agg.t().dot(&d_pre);
        let d_c1 = act.t.dot(&d_pre);
        let d_b1 = d_pre.sum_axis(Axis(0));

        let mut grad = Vec::with_capacity(self.params.len());
        grad.extend(d_w1.iter());
        grad.extend(d_w2.iter());
        grad.extend(d_c1.iter());
        grad.extend(d_b1.iter());
        grad.extend(d_w3.iter());
        grad.extend(d_b3.iter());
        Ok(grad)
    }
}
