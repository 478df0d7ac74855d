//! Mini-batch loaders
//!
//! [`DataLoader`] makes single passes over a dataset. [`CyclicLoader`] wraps the
//! training loader and replays it forever: when a pass runs out it silently starts
//! a new one (reshuffled when shuffling is on).

use std::sync::Arc;

use tracing::debug;

use super::nasbench201::NasBench201Dataset;
use super::GraphBatch;
use crate::error::{NasDiffError, Result};
use crate::utils::RandomSource;

/// Single-pass batch loader over a shared dataset
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<NasBench201Dataset>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub fn new(dataset: Arc<NasBench201Dataset>, batch_size: usize, shuffle: bool) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
        }
    }

    pub fn dataset(&self) -> &Arc<NasBench201Dataset> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per pass (the last one may be short)
    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Index lists for one pass
    pub fn batch_indices(&self, rng: &mut RandomSource) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            rng.shuffle(&mut order);
        }
        order.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    /// In-order pass, used for the evaluation and test loaders
    pub fn iter(&self) -> impl Iterator<Item = Result<GraphBatch>> + '_ {
        let n = self.dataset.len();
        (0..self.num_batches()).map(move |b| {
            let start = b * self.batch_size;
            let end = (start + self.batch_size).min(n);
            let indices: Vec<usize> = (start..end).collect();
            self.dataset.collate(&indices)
        })
    }
}

/// Infinite replay of a [`DataLoader`]
#[derive(Debug)]
pub struct CyclicLoader {
    loader: DataLoader,
    pass: Vec<Vec<usize>>,
    cursor: usize,
    restarts: u64,
}

impl CyclicLoader {
    pub fn new(loader: DataLoader, rng: &mut RandomSource) -> Result<Self> {
        if loader.dataset().is_empty() {
            return Err(NasDiffError::DataError("cannot cycle over an empty dataset".to_string()));
        }
        let pass = loader.batch_indices(rng);
        Ok(Self {
            loader,
            pass,
            cursor: 0,
            restarts: 0,
        })
    }

    /// Next batch, starting a fresh pass when the current one is exhausted
    pub fn next_batch(&mut self, rng: &mut RandomSource) -> Result<GraphBatch> {
        if self.cursor >= self.pass.len() {
            self.pass = self.loader.batch_indices(rng);
            self.cursor = 0;
            self.restarts += 1;
            debug!(restarts = self.restarts, "training loader exhausted, restarting");
        }
        let batch = self.loader.dataset().collate(&self.pass[self.cursor])?;
        self.cursor += 1;
        Ok(batch)
    }

    /// Number of times the underlying pass was re-created
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }
}
