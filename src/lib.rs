//! nasdiff - Score-based diffusion over neural architecture graphs
//!
//! This crate trains and evaluates SDE-based generative models over NAS-Bench-201
//! cell graphs:
//! - Score network training with EMA, periodic evaluation and checkpointing
//! - Meta-surrogate training with correlation-based model selection
//! - Classifier-guided predictor-corrector sampling
//! - Validity, uniqueness and novelty metrics of generated architectures
//!
//! # Modules
//!
//! ## Core
//! - [`sde`] - Variance-preserving and variance-exploding noise schedules
//! - [`training`] - Step functions, optimizers and the two training loops
//! - [`sampling`] - Predictor-corrector sampler
//! - [`evaluation`] - Standalone sampling and scoring of a trained network
//!
//! ## Collaborators
//! - [`data`] - NAS-Bench-201 encoding, datasets and loaders
//! - [`models`] - Score and surrogate networks, EMA
//! - [`analysis`] - Quantization and architecture metrics
//! - [`checkpoint`] - Checkpoint persistence
//! - [`tracking`] - Experiment metric log
//!
//! ## Services
//! - [`runner`] - Task registry
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;
pub mod config;

// Core modules
pub mod sde;
pub mod training;
pub mod sampling;
pub mod evaluation;

// Collaborators
pub mod data;
pub mod models;
pub mod analysis;
pub mod checkpoint;
pub mod tracking;

// Utilities
pub mod utils;

// Services
pub mod runner;
pub mod cli;

pub use error::{NasDiffError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{NasDiffError, Result};

    // Configuration
    pub use crate::config::{check_config, Config};

    // Noise schedules
    pub use crate::sde::{build_sde, Sde, SdeKind};

    // Training
    pub use crate::training::{
        get_step_fn, get_step_fn_predictor, meta_surrogate_train, scorenet_train, BestTracker,
        TrainingState, TrainingSummary,
    };

    // Sampling and evaluation
    pub use crate::evaluation::{scorenet_evaluate, EvaluationReport};
    pub use crate::sampling::{get_conditional_sampling_fn, get_sampling_fn, SamplingFn};

    // Data and models
    pub use crate::data::{ArchDescriptor, NasBench201Dataset};
    pub use crate::models::{ScoreNetwork, SurrogateNetwork};

    // Metrics
    pub use crate::analysis::{quantize, ArchMetrics, SamplingArchMetrics};

    // Randomness
    pub use crate::utils::RandomSource;

    // Task registry
    pub use crate::runner::{evaluate, train, Task};
}
