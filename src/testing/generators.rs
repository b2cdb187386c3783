//! Seeded operand data generation

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::kernel::AttentionConfig;
use crate::reference::AttentionInputs;

/// Deterministic generator for test operand data
///
/// Each operand draws from its own derived seed, so changing one shape
/// never perturbs the data of another operand in the same case.
pub struct OperandGenerator {
    seed: u64,
}

impl OperandGenerator {
    /// Create a generator with a specific seed
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Uniform values in [-1, 1), `rows * cols` of them
    #[must_use]
    pub fn matrix(&self, stream: u64, rows: usize, cols: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(stream));
        (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    /// Full attention input set for one configuration
    ///
    /// Q, K, V from independent streams; dO is all-ones so the gradient
    /// chain is exercised without a second random distribution.
    #[must_use]
    pub fn attention_inputs(&self, config: &AttentionConfig) -> AttentionInputs {
        AttentionInputs {
            q: self.matrix(1, config.rows, config.head_dim),
            k: self.matrix(2, config.cols, config.head_dim),
            v: self.matrix(3, config.cols, config.head_dim),
            grad_o: vec![1.0; config.rows * config.head_dim],
        }
    }
}
