//! Integration tests for standalone evaluation of a trained score network

use std::path::{Path, PathBuf};

use nasdiff::checkpoint::CheckpointStore;
use nasdiff::config::Config;
use nasdiff::data::NasBench201Dataset;
use nasdiff::error::NasDiffError;
use nasdiff::runner;
use nasdiff::tracking::LogEntry;

fn trained_checkpoint(dir: &Path) -> (Config, PathBuf) {
    let records: Vec<_> = NasBench201Dataset::enumerate().records()[..30].to_vec();
    let data_path = dir.join("archs.json");
    std::fs::write(&data_path, serde_json::json!({ "archs": records }).to_string()).unwrap();

    let mut config = Config::scorenet().with_workdir(dir).with_folder_name("train");
    config.data.path = Some(data_path);
    config.model.num_scales = 8;
    config.model.hidden_dim = 8;
    config.training.batch_size = 8;
    config.training.eval_batch_size = 8;
    config.training.n_iters = 5;
    config.training.snapshot_freq = 5;
    config.training.snapshot_sampling = false;
    runner::train(&config).unwrap();
    let ckpt = CheckpointStore::new(config.exp_dir()).checkpoint_path(1);
    (config, ckpt)
}

#[test]
fn test_sampling_rounds_and_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let (train_config, ckpt) = trained_checkpoint(dir.path());
    let mut config = train_config.with_folder_name("eval").with_scorenet_ckpt(ckpt);
    config.eval.num_samples = 37;
    config.eval.batch_size = 16;

    let report = runner::evaluate(&config).unwrap();
    assert_eq!(report.rounds, 3);
    assert_eq!(report.archs.len(), 37);
    assert_eq!(report.metrics.num_samples, 37);

    let exp = config.exp_dir();
    assert!(exp.join("samples").join("samples.json").exists());
    let history: Vec<LogEntry> =
        serde_json::from_str(&std::fs::read_to_string(exp.join("log.json")).unwrap()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].step, 1);
    assert!(history[0].get("sample", "r_valid").is_some());
}

#[test]
fn test_evaluate_missing_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::scorenet()
        .with_workdir(dir.path())
        .with_scorenet_ckpt(dir.path().join("missing.json"));
    assert!(matches!(
        runner::evaluate(&config),
        Err(NasDiffError::CheckpointNotFound(_))
    ));
}
