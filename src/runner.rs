//! Task registry
//!
//! `model_type` is resolved once into a [`Task`]; training and evaluation dispatch
//! on it.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::error::{NasDiffError, Result};
use crate::evaluation::{scorenet_evaluate, EvaluationReport};
use crate::training::{meta_surrogate_train, scorenet_train, TrainingSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Task {
    Scorenet,
    MetaSurrogate,
}

impl Task {
    pub fn as_str(self) -> &'static str {
        match self {
            Task::Scorenet => "scorenet",
            Task::MetaSurrogate => "meta_surrogate",
        }
    }

    /// Default configuration of the task
    pub fn default_config(self) -> Config {
        match self {
            Task::Scorenet => Config::scorenet(),
            Task::MetaSurrogate => Config::meta_surrogate(),
        }
    }
}

impl FromStr for Task {
    type Err = NasDiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scorenet" => Ok(Task::Scorenet),
            "meta_surrogate" => Ok(Task::MetaSurrogate),
            _ => Err(NasDiffError::UnknownTask(s.to_string())),
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create the experiment directory of `config` and return it
pub fn set_exp_name(config: &Config) -> Result<PathBuf> {
    let exp_dir = config.exp_dir();
    fs::create_dir_all(&exp_dir)?;
    info!(exp_dir = %exp_dir.display(), seed = config.seed, "experiment directory ready");
    Ok(exp_dir)
}

/// Run the training loop of `config.model_type`
pub fn train(config: &Config) -> Result<TrainingSummary> {
    match config.model_type.parse::<Task>()? {
        Task::Scorenet => scorenet_train(config),
        Task::MetaSurrogate => meta_surrogate_train(config),
    }
}

/// Run the evaluation of `config.model_type`; only score networks can be evaluated
pub fn evaluate(config: &Config) -> Result<EvaluationReport> {
    match config.model_type.parse::<Task>()? {
        Task::Scorenet => scorenet_evaluate(config),
        task => Err(NasDiffError::UnknownTask(format!("no evaluation for `{}`", task))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_parse() {
        assert_eq!("scorenet".parse::<Task>().unwrap(), Task::Scorenet);
        assert_eq!("meta_surrogate".parse::<Task>().unwrap(), Task::MetaSurrogate);
        assert!(matches!("tr_scorenet".parse::<Task>(), Err(NasDiffError::UnknownTask(_))));
    }

    #[test]
    fn test_unknown_task_fails_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::scorenet().with_workdir(dir.path());
        config.model_type = "autoencoder".into();
        assert!(matches!(train(&config), Err(NasDiffError::UnknownTask(_))));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_meta_surrogate_has_no_evaluation() {
        let config = Config::meta_surrogate();
        assert!(matches!(evaluate(&config), Err(NasDiffError::UnknownTask(_))));
    }

    #[test]
    fn test_set_exp_name_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::scorenet().with_workdir(dir.path()).with_folder_name("run1");
        let exp = set_exp_name(&config).unwrap();
        assert_eq!(exp, dir.path().join("tr_scorenet").join("run1"));
        assert!(exp.is_dir());
    }
}
