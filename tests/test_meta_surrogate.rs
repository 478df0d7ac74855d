//! Integration tests for meta-surrogate training and guided sampling

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nasdiff::checkpoint::{load_record, CheckpointStore};
use nasdiff::config::Config;
use nasdiff::data::{ArchRecord, NasBench201Dataset};
use nasdiff::error::NasDiffError;
use nasdiff::runner;

// ============================================================================
// Helpers
// ============================================================================

fn write_labelled_dataset(dir: &Path, n: usize, task_dim: usize) -> PathBuf {
    let records: Vec<ArchRecord> = NasBench201Dataset::enumerate().records()[..n]
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let mut values = BTreeMap::new();
            values.insert("meta-acc".to_string(), (i % 7) as f64 / 7.0);
            values.insert("cifar10".to_string(), 80.0 + (i % 11) as f64);
            ArchRecord {
                arch_str: r.arch_str.clone(),
                values,
                task: vec![0.1 * (i % 3) as f64; task_dim],
            }
        })
        .collect();
    let path = dir.join("meta_archs.json");
    std::fs::write(&path, serde_json::json!({ "archs": records }).to_string()).unwrap();
    path
}

fn scorenet_checkpoint(dir: &Path) -> PathBuf {
    let mut config = Config::scorenet().with_workdir(dir).with_folder_name("score");
    config.data.path = Some(write_labelled_dataset(dir, 30, 0));
    config.model.num_scales = 10;
    config.model.hidden_dim = 8;
    config.training.batch_size = 8;
    config.training.eval_batch_size = 8;
    config.training.n_iters = 10;
    config.training.snapshot_freq = 10;
    config.training.snapshot_sampling = false;
    runner::train(&config).unwrap();
    CheckpointStore::new(config.exp_dir()).checkpoint_path(1)
}

fn meta_config(dir: &Path, task_dim: usize) -> Config {
    let mut config = Config::meta_surrogate().with_workdir(dir).with_folder_name("meta");
    config.data.path = Some(write_labelled_dataset(dir, 50, task_dim));
    config.data.eval_ratio = 0.2;
    config.data.test_ratio = 0.1;
    config.model.num_scales = 10;
    config.model.task_dim = task_dim;
    config.training.batch_size = 8;
    config.training.eval_batch_size = 8;
    config.training.eval_freq = 5;
    config.training.log_freq = 5;
    config.training.snapshot_freq = 10;
    config.training.n_iters = 20;
    config.training.snapshot_sampling = false;
    config
}

// ============================================================================
// Training
// ============================================================================

#[test]
fn test_meta_surrogate_tracks_correlation() {
    let dir = tempfile::tempdir().unwrap();
    let config = meta_config(dir.path(), 2);
    let summary = runner::train(&config).unwrap();
    assert_eq!(summary.checkpoint_steps, vec![10, 20]);
    let best = summary.best_score.unwrap();
    assert!(best >= -1.0 && best <= 1.0);

    let store = CheckpointStore::new(config.exp_dir());
    let record = load_record(store.meta_path()).unwrap();
    assert!(record.ema.is_none());
    assert_eq!(record.step, 21);
}

#[test]
fn test_first_correlation_beats_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = meta_config(dir.path(), 2);
    config.training.n_iters = 0;
    let summary = runner::train(&config).unwrap();
    assert_eq!(summary.checkpoint_steps, vec![0]);

    let best = load_record(CheckpointStore::new(config.exp_dir()).best_path()).unwrap();
    assert!(best.is_best);
    assert_eq!(best.step, 1);
}

#[test]
fn test_snapshot_between_evaluations_is_not_best() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = meta_config(dir.path(), 2);
    config.training.n_iters = 3;
    let summary = runner::train(&config).unwrap();
    assert_eq!(summary.checkpoint_steps, vec![3]);

    let store = CheckpointStore::new(config.exp_dir());
    assert!(!store.best_path().exists());
    assert!(!load_record(store.meta_path()).unwrap().is_best);
}

#[test]
fn test_score_model_name_rejected_before_any_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = meta_config(dir.path(), 0);
    config.model.name = "graph_linear_score".into();
    assert!(runner::train(&config).unwrap_err().is_config_error());
    assert!(!config.exp_dir().exists());
}

#[test]
fn test_missing_labels_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = meta_config(dir.path(), 0);
    config.data.label_list = vec!["imagenet".to_string()];
    assert!(matches!(runner::train(&config), Err(NasDiffError::DataError(_))));
}

// ============================================================================
// Guided sampling with a frozen score network
// ============================================================================

#[test]
fn test_guided_snapshot_sampling() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = scorenet_checkpoint(dir.path());
    let mut config = meta_config(dir.path(), 2).with_scorenet_ckpt(&ckpt);
    config.training.snapshot_sampling = true;
    config.model.num_sample = Some(6);
    config.training.n_iters = 10;

    let summary = runner::train(&config).unwrap();
    assert_eq!(summary.checkpoint_steps, vec![10]);
    let samples = config.exp_dir().join("samples").join("iter_10").join("samples.json");
    let dump: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(samples).unwrap()).unwrap();
    assert_eq!(dump["archs"].as_array().unwrap().len(), 6);
}

#[test]
fn test_snapshot_sampling_requires_checkpoint_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = meta_config(dir.path(), 0);
    config.training.snapshot_sampling = true;
    let err = runner::train(&config).unwrap_err();
    assert!(matches!(err, NasDiffError::ConfigError(_)));
}

#[test]
fn test_frozen_config_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = scorenet_checkpoint(dir.path());
    let mut config = meta_config(dir.path(), 0).with_scorenet_ckpt(&ckpt);
    config.training.snapshot_sampling = true;
    config.data.centered = false;

    match runner::train(&config) {
        Err(NasDiffError::ConfigMismatch { field, .. }) => assert_eq!(field, "data.centered"),
        other => panic!("expected ConfigMismatch, got {:?}", other),
    }
    assert!(!config.exp_dir().exists());
}

#[test]
fn test_missing_frozen_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = meta_config(dir.path(), 0).with_scorenet_ckpt(dir.path().join("none.json"));
    config.training.snapshot_sampling = true;
    assert!(matches!(
        runner::train(&config),
        Err(NasDiffError::CheckpointNotFound(_))
    ));
}
