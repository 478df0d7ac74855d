//! NAS-Bench-201 cell encoding and datasets
//!
//! A cell is encoded as an 8-node DAG: the input node, one node per edge
//! operation (six edges of the 4-node cell) and the output node. Node features
//! are one-hot over the 7-symbol vocabulary [`OPS`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};

use super::{GraphBatch, BatchMeta};
use crate::config::{Config, DataSection};
use crate::error::{NasDiffError, Result};
use crate::utils::RandomSource;

/// Node-type vocabulary
pub const OPS: [&str; 7] = [
    "input",
    "nor_conv_1x1",
    "nor_conv_3x3",
    "avg_pool_3x3",
    "skip_connect",
    "none",
    "output",
];

/// Number of nodes in an encoded cell
pub const NUM_NODES: usize = 8;

/// Vocabulary size
pub const NUM_OPS: usize = OPS.len();

const INPUT: usize = 0;
const OUTPUT: usize = 6;

/// Directed edges between encoded nodes
const EDGES: [(usize, usize); 10] = [
    (0, 1),
    (0, 2),
    (0, 4),
    (1, 3),
    (1, 5),
    (2, 6),
    (3, 6),
    (4, 7),
    (5, 7),
    (6, 7),
];

/// Stream id for the deterministic train/eval/test split
const SPLIT_STREAM: u64 = 0x5117;

/// Fixed adjacency matrix of the encoded cell
pub fn cell_adjacency() -> Array2<f64> {
    let mut adj = Array2::zeros((NUM_NODES, NUM_NODES));
    for &(src, dst) in EDGES.iter() {
        adj[[src, dst]] = 1.0;
    }
    adj
}

/// Discrete architecture: one vocabulary index per node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchDescriptor {
    pub node_types: Vec<usize>,
}

impl ArchDescriptor {
    pub fn new(node_types: Vec<usize>) -> Self {
        Self { node_types }
    }

    /// Parse an arch string such as
    /// `|nor_conv_3x3~0|+|none~0|avg_pool_3x3~1|+|skip_connect~0|none~1|nor_conv_1x1~2|`
    pub fn from_arch_str(arch_str: &str) -> Result<Self> {
        let bad = |why: &str| NasDiffError::DataError(format!("invalid arch string `{}`: {}", arch_str, why));

        let mut node_types = vec![INPUT];
        let groups: Vec<&str> = arch_str.split('+').collect();
        if groups.len() != 3 {
            return Err(bad("expected 3 cell nodes"));
        }
        for (node, group) in groups.iter().enumerate() {
            let tokens: Vec<&str> = group.trim_matches('|').split('|').collect();
            if tokens.len() != node + 1 {
                return Err(bad("wrong number of incoming edges"));
            }
            for (src, token) in tokens.iter().enumerate() {
                let (op, input) = token.split_once('~').ok_or_else(|| bad("missing `~`"))?;
                if input.parse::<usize>().ok() != Some(src) {
                    return Err(bad("edge inputs out of order"));
                }
                let idx = OPS[1..OUTPUT]
                    .iter()
                    .position(|&name| name == op)
                    .ok_or_else(|| bad("unknown operation"))?;
                node_types.push(idx + 1);
            }
        }
        node_types.push(OUTPUT);
        Ok(Self { node_types })
    }

    /// Structurally valid NAS-Bench-201 cell
    pub fn is_valid(&self) -> bool {
        self.node_types.len() == NUM_NODES
            && self.node_types[0] == INPUT
            && self.node_types[NUM_NODES - 1] == OUTPUT
            && self.node_types[1..NUM_NODES - 1]
                .iter()
                .all(|&t| t != INPUT && t != OUTPUT && t < NUM_OPS)
    }

    /// Arch string, or `None` when the descriptor is not a valid cell
    pub fn to_arch_str(&self) -> Option<String> {
        if !self.is_valid() {
            return None;
        }
        let op = |i: usize| OPS[self.node_types[i]];
        Some(format!(
            "|{}~0|+|{}~0|{}~1|+|{}~0|{}~1|{}~2|",
            op(1),
            op(2),
            op(3),
            op(4),
            op(5),
            op(6)
        ))
    }

    /// One-hot node features `[NUM_NODES, NUM_OPS]`
    pub fn one_hot(&self) -> Array2<f64> {
        let mut x = Array2::zeros((self.node_types.len(), NUM_OPS));
        for (i, &t) in self.node_types.iter().enumerate() {
            x[[i, t]] = 1.0;
        }
        x
    }
}

/// One dataset record as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchRecord {
    pub arch_str: String,
    /// Named per-architecture measurements (accuracies, meta labels)
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    /// Task context features for the surrogate
    #[serde(default)]
    pub task: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetFile {
    archs: Vec<ArchRecord>,
}

/// A split of NAS-Bench-201 cells
#[derive(Debug, Clone)]
pub struct NasBench201Dataset {
    records: Vec<ArchRecord>,
    archs: Vec<ArchDescriptor>,
    task_dim: usize,
}

impl NasBench201Dataset {
    /// Build a dataset from records, validating every arch string
    pub fn from_records(records: Vec<ArchRecord>, task_dim: usize) -> Result<Self> {
        let archs = records
            .iter()
            .map(|r| ArchDescriptor::from_arch_str(&r.arch_str))
            .collect::<Result<Vec<_>>>()?;
        for r in &records {
            if task_dim > 0 && r.task.len() != task_dim {
                return Err(NasDiffError::DataError(format!(
                    "record `{}` has {} task features, expected {}",
                    r.arch_str,
                    r.task.len(),
                    task_dim
                )));
            }
        }
        Ok(Self {
            records,
            archs,
            task_dim,
        })
    }

    /// Read records from a JSON file `{"archs": [...]}`
    pub fn from_file(path: impl AsRef<Path>, task_dim: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let file: DatasetFile = serde_json::from_str(&text)
            .map_err(|e| NasDiffError::DataError(format!("{}: {}", path.display(), e)))?;
        Self::from_records(file.archs, task_dim)
    }

    /// Every cell of the search space (5^6 architectures), without labels
    pub fn enumerate() -> Self {
        let mut records = Vec::with_capacity(15_625);
        let mut archs = Vec::with_capacity(15_625);
        for code in 0..5usize.pow(6) {
            let mut node_types = vec![INPUT];
            let mut rest = code;
            for _ in 0..6 {
                node_types.push(rest % 5 + 1);
                rest /= 5;
            }
            node_types.push(OUTPUT);
            let arch = ArchDescriptor::new(node_types);
            records.push(ArchRecord {
                arch_str: arch.to_arch_str().unwrap_or_default(),
                values: BTreeMap::new(),
                task: Vec::new(),
            });
            archs.push(arch);
        }
        Self {
            records,
            archs,
            task_dim: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ArchRecord] {
        &self.records
    }

    /// Arch strings of every record (novelty reference set)
    pub fn arch_strs(&self) -> HashSet<String> {
        self.records.iter().map(|r| r.arch_str.clone()).collect()
    }

    /// Map arch string to the value recorded under `key`
    pub fn label_lookup(&self, key: &str) -> HashMap<String, f64> {
        self.records
            .iter()
            .filter_map(|r| r.values.get(key).map(|&v| (r.arch_str.clone(), v)))
            .collect()
    }

    /// Fail unless every record carries every key in `label_list`
    pub fn require_labels(&self, label_list: &[String]) -> Result<()> {
        for r in &self.records {
            for key in label_list {
                if !r.values.contains_key(key) {
                    return Err(NasDiffError::DataError(format!(
                        "record `{}` is missing label `{}`",
                        r.arch_str, key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Adjacency shared by every cell, with a leading batch axis of 1
    pub fn adj(&self) -> Array3<f64> {
        cell_adjacency().insert_axis(ndarray::Axis(0))
    }

    /// Collate the records at `indices` into a batch
    pub fn collate(&self, indices: &[usize]) -> Result<GraphBatch> {
        let b = indices.len();
        let mut x = Array3::zeros((b, NUM_NODES, NUM_OPS));
        let mut adj = Array3::zeros((b, NUM_NODES, NUM_NODES));
        let cell_adj = cell_adjacency();
        let mut arch_strs = Vec::with_capacity(b);
        let mut keys: Vec<&String> = Vec::new();
        for &i in indices {
            if i >= self.len() {
                return Err(NasDiffError::DataError(format!(
                    "index {} out of range for dataset of {}",
                    i,
                    self.len()
                )));
            }
            for k in self.records[i].values.keys() {
                if !keys.contains(&k) {
                    keys.push(k);
                }
            }
        }

        let mut values: BTreeMap<String, Array1<f64>> = keys
            .iter()
            .map(|k| ((*k).clone(), Array1::from_elem(b, f64::NAN)))
            .collect();
        let mut task = (self.task_dim > 0).then(|| Array2::zeros((b, self.task_dim)));

        for (row, &i) in indices.iter().enumerate() {
            let record = &self.records[i];
            x.slice_mut(ndarray::s![row, .., ..]).assign(&self.archs[i].one_hot());
            adj.slice_mut(ndarray::s![row, .., ..]).assign(&cell_adj);
            arch_strs.push(record.arch_str.clone());
            for (k, &v) in &record.values {
                if let Some(col) = values.get_mut(k) {
                    col[row] = v;
                }
            }
            if let Some(task) = task.as_mut() {
                task.row_mut(row).assign(&Array1::from(record.task.clone()));
            }
        }

        Ok(GraphBatch {
            x,
            adj,
            meta: Some(BatchMeta { arch_strs, values }),
            task,
        })
    }

    fn subset(&self, indices: &[usize]) -> Self {
        Self {
            records: indices.iter().map(|&i| self.records[i].clone()).collect(),
            archs: indices.iter().map(|&i| self.archs[i].clone()).collect(),
            task_dim: self.task_dim,
        }
    }

    /// Seeded split into (train, eval, test)
    pub fn split(&self, data: &DataSection, seed: u64) -> (Self, Self, Self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        RandomSource::derive(seed, SPLIT_STREAM).shuffle(&mut order);
        let n = order.len();
        let n_eval = (n as f64 * data.eval_ratio).round() as usize;
        let n_test = ((n as f64 * data.test_ratio).round() as usize).min(n - n_eval);
        let (eval, rest) = order.split_at(n_eval);
        let (test, train) = rest.split_at(n_test);
        (self.subset(train), self.subset(eval), self.subset(test))
    }
}

fn check_encoding(config: &Config) -> Result<()> {
    if config.data.max_node != NUM_NODES || config.data.n_vocab != NUM_OPS {
        return Err(NasDiffError::ConfigError(format!(
            "{} cells have max_node={} and n_vocab={}, got {} and {}",
            config.data.name, NUM_NODES, NUM_OPS, config.data.max_node, config.data.n_vocab
        )));
    }
    Ok(())
}

/// Train/eval/test splits for score network training
pub fn get_dataset(config: &Config) -> Result<(NasBench201Dataset, NasBench201Dataset, NasBench201Dataset)> {
    check_encoding(config)?;
    let full = match &config.data.path {
        Some(path) => NasBench201Dataset::from_file(path, 0)?,
        None => NasBench201Dataset::enumerate(),
    };
    Ok(full.split(&config.data, config.seed))
}

/// Labelled train/eval/test splits for meta-surrogate training
pub fn get_meta_dataset(
    config: &Config,
) -> Result<(NasBench201Dataset, NasBench201Dataset, NasBench201Dataset)> {
    check_encoding(config)?;
    let path = config.data.path.as_ref().ok_or_else(|| {
        NasDiffError::ConfigError("meta-surrogate training needs a labelled data.path".to_string())
    })?;
    let full = NasBench201Dataset::from_file(path, config.model.task_dim)?;
    full.require_labels(&config.data.label_list)?;
    Ok(full.split(&config.data, config.seed))
}
