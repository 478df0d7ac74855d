//! Graph batches, masks and scaling
//!
//! Loaders yield raw [`GraphBatch`]es. Before a step function sees them the loop
//! turns each into a [`Batch`] with [`GraphBatch::prepare`]: the attention mask is
//! derived from the adjacency and node features go through the [`DataScaler`].

pub mod loader;
pub mod nasbench201;

use std::collections::BTreeMap;
use std::str::FromStr;

use ndarray::{Array1, Array2, Array3, Axis};

use crate::config::DataSection;
use crate::error::{NasDiffError, Result};

pub use loader::{CyclicLoader, DataLoader};
pub use nasbench201::{
    cell_adjacency, get_dataset, get_meta_dataset, ArchDescriptor, ArchRecord, NasBench201Dataset,
    NUM_NODES, NUM_OPS, OPS,
};

/// Per-sample metadata carried alongside a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMeta {
    pub arch_strs: Vec<String>,
    /// Named measurements, one entry per sample (NaN when absent)
    pub values: BTreeMap<String, Array1<f64>>,
}

/// Batch as produced by a loader
#[derive(Debug, Clone, PartialEq)]
pub struct GraphBatch {
    /// Node features `[batch, node, vocab]`
    pub x: Array3<f64>,
    /// Adjacency `[batch, node, node]`
    pub adj: Array3<f64>,
    pub meta: Option<BatchMeta>,
    /// Task context `[batch, task_dim]`
    pub task: Option<Array2<f64>>,
}

/// Batch ready for a step function
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Array3<f64>,
    pub adj: Array3<f64>,
    /// Attention mask `[batch, node, node]`
    pub mask: Array3<f64>,
    pub meta: Option<BatchMeta>,
    pub task: Option<Array2<f64>>,
}

impl GraphBatch {
    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach the augmentation mask and scale node features
    pub fn prepare(self, algo: AugMaskAlgo, scaler: &DataScaler) -> Batch {
        let mask = aug_mask(&self.adj, algo);
        Batch {
            x: scaler.scale(self.x),
            adj: self.adj,
            mask,
            meta: self.meta,
            task: self.task,
        }
    }
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack the metadata columns named in `label_list` into `[batch, labels]`
    pub fn labels(&self, label_list: &[String]) -> Result<Array2<f64>> {
        let meta = self
            .meta
            .as_ref()
            .ok_or_else(|| NasDiffError::DataError("batch carries no metadata".to_string()))?;
        let mut labels = Array2::zeros((self.len(), label_list.len()));
        for (j, key) in label_list.iter().enumerate() {
            let column = meta
                .values
                .get(key)
                .ok_or_else(|| NasDiffError::DataError(format!("batch has no label `{}`", key)))?;
            if column.iter().any(|v| v.is_nan()) {
                return Err(NasDiffError::DataError(format!("label `{}` missing for some samples", key)));
            }
            labels.column_mut(j).assign(column);
        }
        Ok(labels)
    }
}

/// How the attention mask is derived from the adjacency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AugMaskAlgo {
    /// Adjacency plus self loops
    None,
    /// Reachability in either direction plus self loops
    Floyd,
}

impl FromStr for AugMaskAlgo {
    type Err = NasDiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "floyd" => Ok(Self::Floyd),
            _ => Err(NasDiffError::ConfigError(format!("unknown aug_mask_algo `{}`", s))),
        }
    }
}

/// Compute the attention mask for every graph in the batch
pub fn aug_mask(adj: &Array3<f64>, algo: AugMaskAlgo) -> Array3<f64> {
    let mut mask = Array3::zeros(adj.raw_dim());
    for (a, mut m) in adj.outer_iter().zip(mask.outer_iter_mut()) {
        let n = a.nrows();
        let mut reach: Vec<Vec<bool>> = (0..n)
            .map(|i| (0..n).map(|j| i == j || a[[i, j]] > 0.0).collect())
            .collect();
        if algo == AugMaskAlgo::Floyd {
            for k in 0..n {
                for i in 0..n {
                    if !reach[i][k] {
                        continue;
                    }
                    for j in 0..n {
                        if reach[k][j] {
                            reach[i][j] = true;
                        }
                    }
                }
            }
        }
        for i in 0..n {
            for j in 0..n {
                let on = match algo {
                    AugMaskAlgo::None => reach[i][j],
                    AugMaskAlgo::Floyd => reach[i][j] || reach[j][i],
                };
                m[[i, j]] = if on { 1.0 } else { 0.0 };
            }
        }
    }
    mask
}

/// Maps one-hot node features to model space and back
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataScaler {
    centered: bool,
}

impl DataScaler {
    pub fn new(centered: bool) -> Self {
        Self { centered }
    }

    pub fn from_config(data: &DataSection) -> Self {
        Self::new(data.centered)
    }

    /// `[0, 1] -> [-1, 1]` when centered
    pub fn scale(&self, x: Array3<f64>) -> Array3<f64> {
        if self.centered {
            x.mapv_into(|v| v * 2.0 - 1.0)
        } else {
            x
        }
    }

    /// Inverse of [`DataScaler::scale`]
    pub fn inverse(&self, x: Array3<f64>) -> Array3<f64> {
        if self.centered {
            x.mapv_into(|v| (v + 1.0) / 2.0)
        } else {
            x
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_adj() -> Array3<f64> {
        // 0 -> 1 -> 2
        let mut adj = Array3::zeros((1, 3, 3));
        adj[[0, 0, 1]] = 1.0;
        adj[[0, 1, 2]] = 1.0;
        adj
    }

    #[test]
    fn test_aug_mask_none_adds_self_loops() {
        let mask = aug_mask(&chain_adj(), AugMaskAlgo::None);
        assert_eq!(mask[[0, 0, 0]], 1.0);
        assert_eq!(mask[[0, 0, 1]], 1.0);
        assert_eq!(mask[[0, 1, 0]], 0.0);
        assert_eq!(mask[[0, 0, 2]], 0.0);
    }

    #[test]
    fn test_aug_mask_floyd_closure_is_symmetric() {
        let mask = aug_mask(&chain_adj(), AugMaskAlgo::Floyd);
        assert_eq!(mask[[0, 0, 2]], 1.0);
        assert_eq!(mask[[0, 2, 0]], 1.0);
        assert_eq!(mask.sum(), 9.0);
    }

    #[test]
    fn test_cell_mask_output_sees_everything() {
        let adj = cell_adjacency().insert_axis(Axis(0));
        let mask = aug_mask(&adj, AugMaskAlgo::Floyd);
        assert!(mask.slice(ndarray::s![0, 7, ..]).iter().all(|&v| v == 1.0));
        // parallel edge ops out of the input never reach each other
        assert_eq!(mask[[0, 1, 2]], 0.0);
    }

    #[test]
    fn test_scaler_inverse() {
        let scaler = DataScaler::new(true);
        let x = Array3::from_shape_vec((1, 1, 3), vec![0.0, 0.5, 1.0]).unwrap();
        let scaled = scaler.scale(x.clone());
        assert_eq!(scaled.as_slice().unwrap(), &[-1.0, 0.0, 1.0]);
        assert_eq!(scaler.inverse(scaled), x);
        assert_eq!(DataScaler::new(false).scale(x.clone()), x);
    }

    #[test]
    fn test_unknown_mask_algo() {
        assert!("long_range".parse::<AugMaskAlgo>().is_err());
        assert_eq!("Floyd".parse::<AugMaskAlgo>().unwrap(), AugMaskAlgo::Floyd);
    }
}
