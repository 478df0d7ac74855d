//! nasdiff CLI Module
//!
//! Command-line interface for training, evaluation and config generation.

use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::Config;
use crate::runner::{self, Task};

// ─── Styling helpers ───────────────────────────────────────────────────────────

const W: usize = 58; // box inner width

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn line_box_top()    { println!("  {}", dim("┌─────────────────────────────────────────────────────────┐")); }
fn line_box_bottom() { println!("  {}", dim("└─────────────────────────────────────────────────────────┘")); }
fn line_box_sep()    { println!("  {}", dim("├─────────────────────────────────────────────────────────┤")); }

fn line_box(content: &str) {
    let visible_len = strip_ansi(content).chars().count();
    let pad = W.saturating_sub(visible_len);
    println!("  {}  {}{} {}", dim("│"), content, " ".repeat(pad), dim("│"));
}

fn line_box_center(content: &str) {
    let visible_len = strip_ansi(content).chars().count();
    let total_pad = W.saturating_sub(visible_len);
    let left = total_pad / 2;
    let right = total_pad - left;
    println!("  {}  {}{}{} {}", dim("│"), " ".repeat(left), content, " ".repeat(right), dim("│"));
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::new();
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' { in_escape = true; continue; }
        if in_escape { if c == 'm' { in_escape = false; } continue; }
        out.push(c);
    }
    out
}

fn kv(key: &str, val: &str) -> String {
    format!("{} {}", muted(&format!("{:<14}", key)), val.white())
}

fn step_ok(msg: &str) {
    println!("  {} {}", ok("✓"), msg);
}

fn step_run(msg: &str) {
    println!("  {} {}...", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("  {} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "nasdiff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Score-based diffusion over NAS-Bench-201 cells")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a score network or a meta-surrogate
    Train {
        /// JSON config file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the experiment root directory
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Override the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Resume from the latest checkpoint of the experiment
        #[arg(long)]
        resume: bool,
    },

    /// Sample from a trained score network and score the architectures
    Evaluate {
        /// JSON config file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the score network checkpoint
        #[arg(long)]
        ckpt: Option<PathBuf>,

        /// Override the number of samples
        #[arg(short, long)]
        num_samples: Option<usize>,
    },

    /// Print or write the default config of a task
    Config {
        /// Task (scorenet, meta_surrogate)
        #[arg(short, long, default_value = "scorenet")]
        task: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    step_run(&format!("Loading config {}", path.display()));
    let config = Config::from_file(path)?;
    step_ok(&format!("{} · {} · sde {}", config.model_type, config.model.name, config.training.sde));
    Ok(config)
}

// ─── Commands ──────────────────────────────────────────────────────────────────

pub fn cmd_train(
    config_path: &Path,
    workdir: Option<&Path>,
    seed: Option<u64>,
    resume: bool,
) -> anyhow::Result<()> {
    section("Train");

    let mut config = load_config(config_path)?;
    if let Some(workdir) = workdir {
        config.workdir = workdir.to_path_buf();
    }
    if let Some(seed) = seed {
        config.seed = seed;
    }
    config.training.resume |= resume;

    step_run(&format!("Training {} for {} steps", config.model_type.cyan(), config.training.n_iters));
    let start = Instant::now();
    let summary = runner::train(&config)?;
    step_done(&format!("{:?}", start.elapsed()));

    let best = summary
        .best_score
        .map(|v| format!("{:.5}", v))
        .unwrap_or_else(|| "-".to_string());
    let last = summary
        .last_loss
        .map(|v| format!("{:.5e}", v))
        .unwrap_or_else(|| "-".to_string());

    println!();
    line_box_top();
    line_box_center(&format!("{}", "Training summary".white().bold()));
    line_box_sep();
    line_box(&kv("Experiment", &config.exp_dir().display().to_string()));
    line_box(&kv("Steps", &format!("{} → {}", summary.initial_step, summary.final_step)));
    line_box(&kv("Checkpoints", &summary.checkpoint_steps.len().to_string()));
    line_box(&kv("Last loss", &last));
    line_box(&kv("Best score", &best));
    line_box_bottom();
    println!();

    Ok(())
}

pub fn cmd_evaluate(
    config_path: &Path,
    ckpt: Option<&Path>,
    num_samples: Option<usize>,
) -> anyhow::Result<()> {
    section("Evaluate");

    let mut config = load_config(config_path)?;
    if let Some(ckpt) = ckpt {
        config.scorenet_ckpt_path = Some(ckpt.to_path_buf());
    }
    if let Some(n) = num_samples {
        config.eval.num_samples = n;
    }

    step_run(&format!("Sampling {} architectures", config.eval.num_samples));
    let start = Instant::now();
    let report = runner::evaluate(&config)?;
    step_done(&format!("{} rounds in {:?}", report.rounds, start.elapsed()));

    let m = report.metrics;
    println!();
    line_box_top();
    line_box_center(&format!("{}", "Sample quality".white().bold()));
    line_box_sep();
    line_box(&kv("Valid", &format!("{:.4}  ({}/{})", m.r_valid, m.num_valid, m.num_samples)));
    line_box(&kv("Unique", &format!("{:.4}  ({})", m.r_unique, m.num_unique)));
    line_box(&kv("Novel", &format!("{:.4}  ({})", m.r_novel, m.num_novel)));
    line_box_bottom();
    println!();

    Ok(())
}

pub fn cmd_config(task: &str, output: Option<&Path>) -> anyhow::Result<()> {
    let task: Task = task.parse()?;
    let json = task.default_config().to_json()?;
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            step_ok(&format!("{} config written to {}", task, path.display()));
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub fn show_help() {
    section("Commands");

    let cmds: &[(&str, &str)] = &[
        ("nasdiff config -t scorenet -o s.json", "Write a default config"),
        ("nasdiff train -c s.json", "Train a score network"),
        ("nasdiff train -c m.json --resume", "Resume a run"),
        ("nasdiff evaluate -c s.json --ckpt ck.json", "Score generated cells"),
    ];
    for (cmd, desc) in cmds {
        println!("  {:<44} {}", accent(cmd), dim(desc));
    }
    println!();
}
