//! Physical layout conversion between row-major and transposed storage
//!
//! Each operand can independently live transposed on the device. The
//! transform is a plain index swap, applied to inputs before upload and to
//! outputs after readback. Applying it twice (with swapped dimensions)
//! returns the original array.

use serde::{Deserialize, Serialize};

use crate::precision::Operand;

/// Transpose a row-major `rows x cols` array into `cols x rows`
///
/// `out[c * rows + r] = inp[r * cols + c]`. O(rows * cols).
#[must_use]
pub fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(data.len(), rows * cols);
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

/// Convert a logical row-major array to its physical storage layout
#[must_use]
pub fn to_physical(data: &[f32], rows: usize, cols: usize, transposed: bool) -> Vec<f32> {
    if transposed {
        transpose(data, rows, cols)
    } else {
        data.to_vec()
    }
}

/// Convert a physical array back to the logical row-major layout
///
/// Inverse of [`to_physical`]: a transposed physical array has shape
/// `cols x rows`, so transposing with swapped dimensions restores it.
#[must_use]
pub fn to_logical(data: &[f32], rows: usize, cols: usize, transposed: bool) -> Vec<f32> {
    if transposed {
        transpose(data, cols, rows)
    } else {
        data.to_vec()
    }
}

/// Per-operand physical transpose flags for an attention problem
///
/// Four independent flags covering the Q, K, V, and O families. Gradients
/// share the flag of their base operand (dQ follows Q, dO follows O, and so
/// on); the per-row L and D vectors have no layout to transpose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeState {
    /// Q and dQ stored transposed
    pub q: bool,
    /// K and dK stored transposed
    pub k: bool,
    /// V and dV stored transposed
    pub v: bool,
    /// O and dO stored transposed
    pub o: bool,
}

impl TransposeState {
    /// No operand transposed
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether the given operand's physical storage is transposed
    #[must_use]
    pub fn flag(&self, operand: Operand) -> bool {
        match operand {
            Operand::Q | Operand::GradQ => self.q,
            Operand::K | Operand::GradK => self.k,
            Operand::V | Operand::GradV => self.v,
            Operand::O | Operand::GradO => self.o,
            _ => false,
        }
    }
}
