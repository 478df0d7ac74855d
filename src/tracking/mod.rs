//! Experiment metric log
//!
//! [`Logger`] accumulates scalar observations per key between writes, appends one
//! text line per [`Logger::write_log`] call to `log.txt` and keeps every written
//! entry so [`Logger::save_log`] can dump the full history to `log.json`.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;

/// Running average of a scalar
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: u64,
    pub avg: f64,
}

impl AverageMeter {
    pub fn update(&mut self, val: f64, n: u64) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        self.avg = self.sum / self.count as f64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Groups of keys written together, e.g. `[("train", &["training_loss"])]`
pub type Element<'a> = [(&'a str, &'a [&'a str])];

/// One written log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: u64,
    pub time: DateTime<Utc>,
    /// group -> key -> averaged value
    pub values: BTreeMap<String, BTreeMap<String, f64>>,
}

impl LogEntry {
    pub fn get(&self, group: &str, key: &str) -> Option<f64> {
        self.values.get(group).and_then(|g| g.get(key)).copied()
    }
}

/// Per-experiment metric logger
#[derive(Debug)]
pub struct Logger {
    log_dir: PathBuf,
    write_textfile: bool,
    logs: BTreeMap<String, AverageMeter>,
    history: Vec<LogEntry>,
}

impl Logger {
    /// Logger writing into `log_dir`, which is created if needed
    pub fn new(log_dir: impl Into<PathBuf>, write_textfile: bool) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;
        Ok(Self {
            log_dir,
            write_textfile,
            logs: BTreeMap::new(),
            history: Vec::new(),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Record one observation of `key`
    pub fn update(&mut self, key: &str, v: f64) {
        self.logs.entry(key.to_string()).or_default().update(v, 1);
    }

    pub fn get(&self, key: &str) -> Option<&AverageMeter> {
        self.logs.get(key)
    }

    /// Average of `key` since the last reset
    pub fn avg(&self, key: &str) -> Option<f64> {
        self.logs.get(key).map(|m| m.avg)
    }

    /// Write the averages of the keys in `element`; keys without observations are skipped
    pub fn write_log(&mut self, element: &Element<'_>, step: u64) -> Result<()> {
        let mut values = BTreeMap::new();
        for (group, keys) in element {
            let group_values: BTreeMap<String, f64> = keys
                .iter()
                .filter_map(|k| self.logs.get(*k).map(|m| (k.to_string(), m.avg)))
                .collect();
            if !group_values.is_empty() {
                values.insert(group.to_string(), group_values);
            }
        }
        let entry = LogEntry {
            step,
            time: Utc::now(),
            values,
        };
        if self.write_textfile {
            self.append_line(&format_entry(&entry))?;
        }
        self.history.push(entry);
        Ok(())
    }

    /// Clear the running averages
    pub fn reset(&mut self) {
        self.logs.clear();
    }

    /// Dump the written history to `log.json`
    pub fn save_log(&self) -> Result<()> {
        let path = self.log_dir.join("log.json");
        let mut f = File::create(path)?;
        f.write_all(serde_json::to_string_pretty(&self.history)?.as_bytes())?;
        Ok(())
    }

    /// Append a raw line to `log.txt`
    pub fn write_str(&self, s: &str) -> Result<()> {
        self.append_line(s)
    }

    /// Store the run configuration as `config.json`
    pub fn update_config(&self, config: &Config) -> Result<()> {
        fs::write(self.log_dir.join("config.json"), config.to_json()?)?;
        Ok(())
    }

    pub fn history(&self) -> &[LogEntry] {
        &self.history
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_dir.join("log.txt"))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }
}

fn format_entry(entry: &LogEntry) -> String {
    let mut line = format!("[{}] step {}", entry.time.format("%Y-%m-%d %H:%M:%S"), entry.step);
    for (group, values) in &entry.values {
        line.push_str(&format!(" | {}:", group));
        for (k, v) in values {
            line.push_str(&format!(" {} {:.5e}", k, v));
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_meter() {
        let mut m = AverageMeter::default();
        m.update(1.0, 1);
        m.update(3.0, 1);
        assert_eq!(m.avg, 2.0);
        assert_eq!(m.count, 2);
        m.reset();
        assert_eq!(m.count, 0);
    }

    #[test]
    fn test_write_log_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(dir.path(), true).unwrap();
        logger.update("training_loss", 2.0);
        logger.update("training_loss", 4.0);
        let train: &[&str] = &["training_loss"];
        let eval: &[&str] = &["eval_loss"];
        logger.write_log(&[("train", train), ("eval", eval)], 5).unwrap();
        logger.reset();
        assert!(logger.avg("training_loss").is_none());

        let entry = &logger.history()[0];
        assert_eq!(entry.step, 5);
        assert_eq!(entry.get("train", "training_loss"), Some(3.0));
        assert!(entry.values.get("eval").is_none());

        logger.write_str("done").unwrap();
        let text = fs::read_to_string(dir.path().join("log.txt")).unwrap();
        assert!(text.contains("step 5"));
        assert!(text.ends_with("done\n"));
    }

    #[test]
    fn test_save_log_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(dir.path().join("exp"), false).unwrap();
        logger.update("r_valid", 1.0);
        let sample: &[&str] = &["r_valid"];
        logger.write_log(&[("sample", sample)], 1).unwrap();
        logger.save_log().unwrap();
        logger.update_config(&Config::scorenet()).unwrap();

        let text = fs::read_to_string(dir.path().join("exp/log.json")).unwrap();
        let history: Vec<LogEntry> = serde_json::from_str(&text).unwrap();
        assert_eq!(history.len(), 1);
        assert!(dir.path().join("exp/config.json").exists());
        assert!(!dir.path().join("exp/log.txt").exists());
    }
}
