//! Validity, uniqueness and novelty of generated architectures

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{ArchDescriptor, NasBench201Dataset};
use crate::error::Result;

/// Quality rates of one batch of generated architectures
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArchMetrics {
    /// Fraction of structurally valid cells
    pub r_valid: f64,
    /// Distinct valid cells over valid cells
    pub r_unique: f64,
    /// Distinct valid cells absent from the training set over distinct valid cells
    pub r_novel: f64,
    pub num_samples: usize,
    pub num_valid: usize,
    pub num_unique: usize,
    pub num_novel: usize,
}

impl ArchMetrics {
    pub fn rates(&self) -> (f64, f64, f64) {
        (self.r_valid, self.r_unique, self.r_novel)
    }
}

/// Known label values among the generated valid cells
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelStats {
    /// Number of generated valid cells with a known label
    pub count: usize,
    pub mean: f64,
    pub max: f64,
}

#[derive(Serialize)]
struct SampleDump<'a> {
    metrics: &'a ArchMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a LabelStats>,
    archs: Vec<SampleEntry>,
}

#[derive(Serialize)]
struct SampleEntry {
    node_types: Vec<usize>,
    arch_str: Option<String>,
}

fn dump_samples(
    sample_dir: &Path,
    arch_list: &[ArchDescriptor],
    metrics: &ArchMetrics,
    labels: Option<&LabelStats>,
) -> Result<()> {
    fs::create_dir_all(sample_dir)?;
    let dump = SampleDump {
        metrics,
        labels,
        archs: arch_list
            .iter()
            .map(|a| SampleEntry {
                node_types: a.node_types.clone(),
                arch_str: a.to_arch_str(),
            })
            .collect(),
    };
    fs::write(sample_dir.join("samples.json"), serde_json::to_string_pretty(&dump)?)?;
    Ok(())
}

/// Scores generated cells against a training set
#[derive(Debug, Clone)]
pub struct SamplingArchMetrics {
    train_archs: HashSet<String>,
}

impl SamplingArchMetrics {
    pub fn new(train_ds: &NasBench201Dataset) -> Self {
        Self {
            train_archs: train_ds.arch_strs(),
        }
    }

    fn score(&self, arch_list: &[ArchDescriptor]) -> (ArchMetrics, Vec<String>) {
        let valid: Vec<String> = arch_list.iter().filter_map(|a| a.to_arch_str()).collect();
        let mut seen = HashSet::new();
        let unique: Vec<String> = valid.iter().filter(|s| seen.insert(s.to_string())).cloned().collect();
        let num_novel = unique.iter().filter(|s| !self.train_archs.contains(*s)).count();

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let metrics = ArchMetrics {
            r_valid: ratio(valid.len(), arch_list.len()),
            r_unique: ratio(unique.len(), valid.len()),
            r_novel: ratio(num_novel, unique.len()),
            num_samples: arch_list.len(),
            num_valid: valid.len(),
            num_unique: unique.len(),
            num_novel,
        };
        (metrics, valid)
    }

    /// Score `arch_list`; with a `sample_dir`, also write `samples.json` there
    pub fn evaluate(&self, arch_list: &[ArchDescriptor], sample_dir: Option<&Path>) -> Result<ArchMetrics> {
        let (metrics, _) = self.score(arch_list);
        if let Some(dir) = sample_dir {
            dump_samples(dir, arch_list, &metrics, None)?;
        }
        debug!(
            r_valid = metrics.r_valid,
            r_unique = metrics.r_unique,
            r_novel = metrics.r_novel,
            "scored samples"
        );
        Ok(metrics)
    }
}

/// [`SamplingArchMetrics`] plus statistics of a known label, e.g. a test accuracy
#[derive(Debug, Clone)]
pub struct SamplingArchMetricsMeta {
    base: SamplingArchMetrics,
    check_dataname: String,
    labels: HashMap<String, f64>,
}

impl SamplingArchMetricsMeta {
    /// Labels named `check_dataname` are looked up in every dataset of `labelled`
    pub fn new(train_ds: &NasBench201Dataset, labelled: &[&NasBench201Dataset], check_dataname: &str) -> Self {
        let mut labels = HashMap::new();
        for ds in labelled {
            labels.extend(ds.label_lookup(check_dataname));
        }
        Self {
            base: SamplingArchMetrics::new(train_ds),
            check_dataname: check_dataname.to_string(),
            labels,
        }
    }

    pub fn check_dataname(&self) -> &str {
        &self.check_dataname
    }

    pub fn evaluate(
        &self,
        arch_list: &[ArchDescriptor],
        sample_dir: Option<&Path>,
    ) -> Result<(ArchMetrics, Option<LabelStats>)> {
        let (metrics, valid) = self.base.score(arch_list);
        let known: Vec<f64> = valid.iter().filter_map(|s| self.labels.get(s).copied()).collect();
        let stats = (!known.is_empty()).then(|| LabelStats {
            count: known.len(),
            mean: known.iter().sum::<f64>() / known.len() as f64,
            max: known.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        });
        if let Some(dir) = sample_dir {
            dump_samples(dir, arch_list, &metrics, stats.as_ref())?;
        }
        Ok((metrics, stats))
    }
}
