//! Utility functions and types

pub mod random;
pub mod stats;

pub use random::RandomSource;
pub use stats::{mean, pearson, spearman};
