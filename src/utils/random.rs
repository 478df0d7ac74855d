//! Explicit random source
//!
//! Every component that draws random numbers takes a `&mut RandomSource`.
//! There is no process-wide generator: a run seeds one source at startup and
//! threads it through the loaders, step functions and samplers.

use ndarray::{Array1, Array2, Array3};
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Seeded pseudo-random generator shared by a single run
#[derive(Debug, Clone)]
pub struct RandomSource {
    seed: u64,
    rng: Xoshiro256PlusPlus,
}

impl RandomSource {
    /// Create a source seeded from a scalar seed
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Independent deterministic sub-stream of `seed`
    ///
    /// The same `(seed, stream)` pair always yields the same sequence.
    pub fn derive(seed: u64, stream: u64) -> Self {
        let mixed = seed ^ stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self {
            seed,
            rng: Xoshiro256PlusPlus::seed_from_u64(mixed),
        }
    }

    /// The seed this source was created from
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform sample in `[lo, hi)`
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.rng.gen::<f64>()
    }

    /// Vector of uniform samples in `[lo, hi)`
    pub fn uniform_array1(&mut self, n: usize, lo: f64, hi: f64) -> Array1<f64> {
        Array1::from_shape_simple_fn(n, || self.uniform(lo, hi))
    }

    /// Uniform integer in `0..n`
    pub fn index(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }

    /// Standard normal sample
    pub fn normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    pub fn normal_array2(&mut self, shape: (usize, usize)) -> Array2<f64> {
        Array2::from_shape_simple_fn(shape, || self.normal())
    }

    pub fn normal_array3(&mut self, shape: (usize, usize, usize)) -> Array3<f64> {
        Array3::from_shape_simple_fn(shape, || self.normal())
    }

    /// Shuffle a slice in place
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}
