//! Turning continuous samples into architectures and scoring them

pub mod metrics;

use ndarray::{Array3, Axis};
use rayon::prelude::*;

use crate::data::ArchDescriptor;

pub use metrics::{ArchMetrics, LabelStats, SamplingArchMetrics, SamplingArchMetricsMeta};

/// Argmax over the vocabulary axis of every node of every sample
pub fn quantize(samples: &Array3<f64>) -> Vec<ArchDescriptor> {
    let per_sample: Vec<_> = samples.outer_iter().collect();
    per_sample
        .into_par_iter()
        .map(|sample| {
            let node_types = sample
                .axis_iter(Axis(0))
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                        .0
                })
                .collect();
            ArchDescriptor::new(node_types)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_one_hot_roundtrip() {
        let arch = ArchDescriptor::new(vec![0, 2, 5, 3, 4, 5, 1, 6]);
        let x = arch.one_hot().insert_axis(Axis(0));
        let noisy = x.mapv(|v| v * 0.8 + 0.05);
        assert_eq!(quantize(&noisy), vec![arch]);
    }

    #[test]
    fn test_quantize_keeps_sample_order() {
        let a = ArchDescriptor::new(vec![0, 1, 1, 1, 1, 1, 1, 6]);
        let b = ArchDescriptor::new(vec![0, 4, 4, 4, 4, 4, 4, 6]);
        let mut x = Array3::zeros((2, 8, 7));
        x.index_axis_mut(Axis(0), 0).assign(&a.one_hot());
        x.index_axis_mut(Axis(0), 1).assign(&b.one_hot());
        assert_eq!(quantize(&x), vec![a, b]);
        let empty: Array3<f64> = Array3::zeros((0, 8, 7));
        assert!(quantize(&empty).is_empty());
    }
}
