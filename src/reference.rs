//! CPU reference oracle
//!
//! Ground truth for the kernels under test: a numerically naive attention
//! implementation that materializes the full similarity matrix and
//! accumulates in f64. Slow and trustworthy, which is the point.
//!
//! The GEMM path needs no O(n^3) reference at all: the test matrix is the
//! 1-D Laplacian stencil, whose product with any B has the closed form
//! `C[i] = 2*B[i] - B[i-1] - B[i+1]` row-wise.

use crate::kernel::AttentionConfig;

/// Host-side input operands for one attention test case
#[derive(Debug, Clone)]
pub struct AttentionInputs {
    /// Query, rows x head_dim row-major
    pub q: Vec<f32>,
    /// Key, cols x head_dim row-major
    pub k: Vec<f32>,
    /// Value, cols x head_dim row-major
    pub v: Vec<f32>,
    /// Output gradient, rows x head_dim row-major
    pub grad_o: Vec<f32>,
}

/// Everything the oracle can say about one attention problem
#[derive(Debug, Clone)]
pub struct ReferenceOutputs {
    /// Forward output
    pub o: Vec<f32>,
    /// Log-sum-exp term per row
    pub l: Vec<f32>,
    /// dO . O term per row
    pub d: Vec<f32>,
    /// Gradient with respect to V
    pub grad_v: Vec<f32>,
    /// Gradient with respect to K
    pub grad_k: Vec<f32>,
    /// Gradient with respect to Q
    pub grad_q: Vec<f32>,
}

/// CPU reference engine interface
///
/// Injectable so the harness can be exercised with a stub oracle.
pub trait ReferenceEngine {
    /// Expected forward output for the configuration
    fn forward(&self, config: &AttentionConfig, inputs: &AttentionInputs) -> Vec<f32>;

    /// Expected normalization terms (log-sum-exp L, denominator term D)
    fn normalization(
        &self,
        config: &AttentionConfig,
        inputs: &AttentionInputs,
    ) -> (Vec<f32>, Vec<f32>);

    /// Expected gradients (dV, dK, dQ)
    fn gradients(
        &self,
        config: &AttentionConfig,
        inputs: &AttentionInputs,
    ) -> (Vec<f32>, Vec<f32>, Vec<f32>);

    /// Everything at once; implementations that share work may override
    fn all(&self, config: &AttentionConfig, inputs: &AttentionInputs) -> ReferenceOutputs {
        let o = self.forward(config, inputs);
        let (l, d) = self.normalization(config, inputs);
        let (grad_v, grad_k, grad_q) = self.gradients(config, inputs);
        ReferenceOutputs {
            o,
            l,
            d,
            grad_v,
            grad_k,
            grad_q,
        }
    }
}

/// The naive f64 oracle
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveReference;

impl NaiveReference {
    /// Compute all outputs for one problem in a single pass
    #[must_use]
    pub fn expected(config: &AttentionConfig, inputs: &AttentionInputs) -> ReferenceOutputs {
        let rows = config.rows;
        let cols = config.cols;
        let dim = config.head_dim;
        let scale = f64::from(config.softmax_scale());

        let at = |m: &[f32], r: usize, c: usize| f64::from(m[r * dim + c]);

        // Similarity matrix and row-stable softmax.
        let mut s = vec![0.0f64; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                let mut dot = 0.0f64;
                for x in 0..dim {
                    dot += at(&inputs.q, i, x) * at(&inputs.k, j, x);
                }
                s[i * cols + j] = dot * scale;
            }
        }

        let mut l = vec![0.0f32; rows];
        let mut p = vec![0.0f64; rows * cols];
        for i in 0..rows {
            let row = &s[i * cols..(i + 1) * cols];
            let m = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let sum: f64 = row.iter().map(|&x| (x - m).exp()).sum();
            let lse = m + sum.ln();
            l[i] = lse as f32;
            for j in 0..cols {
                p[i * cols + j] = (s[i * cols + j] - lse).exp();
            }
        }

        let mut o = vec![0.0f32; rows * dim];
        for i in 0..rows {
            for x in 0..dim {
                let mut acc = 0.0f64;
                for j in 0..cols {
                    acc += p[i * cols + j] * at(&inputs.v, j, x);
                }
                o[i * dim + x] = acc as f32;
            }
        }

        // D_i = dO_i . O_i, the denominator-derived term the backward
        // passes need to avoid recomputing the full softmax.
        let mut d = vec![0.0f32; rows];
        for i in 0..rows {
            let mut acc = 0.0f64;
            for x in 0..dim {
                acc += at(&inputs.grad_o, i, x) * f64::from(o[i * dim + x]);
            }
            d[i] = acc as f32;
        }

        let mut grad_v = vec![0.0f32; cols * dim];
        for j in 0..cols {
            for x in 0..dim {
                let mut acc = 0.0f64;
                for i in 0..rows {
                    acc += p[i * cols + j] * at(&inputs.grad_o, i, x);
                }
                grad_v[j * dim + x] = acc as f32;
            }
        }

        // dS = P * (dP - D) with dP = dO V^T.
        let mut ds = vec![0.0f64; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                let mut dp = 0.0f64;
                for x in 0..dim {
                    dp += at(&inputs.grad_o, i, x) * at(&inputs.v, j, x);
                }
                ds[i * cols + j] = p[i * cols + j] * (dp - f64::from(d[i]));
            }
        }

        let mut grad_q = vec![0.0f32; rows * dim];
        for i in 0..rows {
            for x in 0..dim {
                let mut acc = 0.0f64;
                for j in 0..cols {
                    acc += ds[i * cols + j] * at(&inputs.k, j, x);
                }
                grad_q[i * dim + x] = (acc * scale) as f32;
            }
        }

        let mut grad_k = vec![0.0f32; cols * dim];
        for j in 0..cols {
            for x in 0..dim {
                let mut acc = 0.0f64;
                for i in 0..rows {
                    acc += ds[i * cols + j] * at(&inputs.q, i, x);
                }
                grad_k[j * dim + x] = (acc * scale) as f32;
            }
        }

        ReferenceOutputs {
            o,
            l,
            d,
            grad_v,
            grad_k,
            grad_q,
        }
    }
}

impl ReferenceEngine for NaiveReference {
    fn forward(&self, config: &AttentionConfig, inputs: &AttentionInputs) -> Vec<f32> {
        Self::expected(config, inputs).o
    }

    fn normalization(
        &self,
        config: &AttentionConfig,
        inputs: &AttentionInputs,
    ) -> (Vec<f32>, Vec<f32>) {
        let out = Self::expected(config, inputs);
        (out.l, out.d)
    }

    fn gradients(
        &self,
        config: &AttentionConfig,
        inputs: &AttentionInputs,
    ) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let out = Self::expected(config, inputs);
        (out.grad_v, out.grad_k, out.grad_q)
    }

    fn all(&self, config: &AttentionConfig, inputs: &AttentionInputs) -> ReferenceOutputs {
        Self::expected(config, inputs)
    }
}

/// Dense n x n matrix for the 1-D Laplacian stencil
///
/// 2 on the diagonal, -1 on the first off-diagonals, 0 elsewhere. All
/// entries are exactly representable at every supported precision.
#[must_use]
pub fn laplacian_matrix(n: usize) -> Vec<f32> {
    let mut a = vec![0.0f32; n * n];
    for i in 0..n {
        a[i * n + i] = 2.0;
        if i > 0 {
            a[i * n + i - 1] = -1.0;
        }
        if i + 1 < n {
            a[i * n + i + 1] = -1.0;
        }
    }
    a
}

/// Closed-form expected product of the Laplacian with B (n x cols)
///
/// Each output row only touches three rows of B, so no O(n^3) reference
/// multiplication is needed to check a GEMM kernel against it.
#[must_use]
pub fn laplacian_expected(b: &[f32], n: usize, cols: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; n * cols];
    for i in 0..n {
        for j in 0..cols {
            let mut acc = 2.0 * f64::from(b[i * cols + j]);
            if i > 0 {
                acc -= f64::from(b[(i - 1) * cols + j]);
            }
            if i + 1 < n {
                acc -= f64::from(b[(i + 1) * cols + j]);
            }
            c[i * cols + j] = acc as f32;
        }
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_inputs(config: &AttentionConfig) -> AttentionInputs {
        let q_len = config.rows * config.head_dim;
        let kv_len = config.cols * config.head_dim;
        AttentionInputs {
            q: (0..q_len).map(|i| (i as f32 * 0.3).sin()).collect(),
            k: (0..kv_len).map(|i| (i as f32 * 0.7).cos()).collect(),
            v: (0..kv_len).map(|i| (i as f32 * 0.1).sin()).collect(),
            grad_o: vec![1.0; q_len],
        }
    }

    #[test]
    fn test_softmax_rows_are_convex_combinations() {
        // With V = all-ones, O must be all-ones exactly (up to rounding):
        // each output element is a softmax-weighted average of ones.
        let config = AttentionConfig::new(5, 9, 3);
        let mut inputs = tiny_inputs(&config);
        inputs.v = vec![1.0; config.cols * config.head_dim];
        let out = NaiveReference::expected(&config, &inputs);
        for &x in &out.o {
            assert!((x - 1.0).abs() < 1e-6, "got {x}");
        }
    }

    #[test]
    fn test_single_column_softmax_is_identity() {
        // cols = 1: the softmax weight is exactly 1, so O == V broadcast.
        let config = AttentionConfig::new(4, 1, 3);
        let inputs = tiny_inputs(&config);
        let out = NaiveReference::expected(&config, &inputs);
        for i in 0..config.rows {
            for x in 0..config.head_dim {
                assert!((out.o[i * 3 + x] - inputs.v[x]).abs() < 1e-6);
            }
        }
        // And dV collects all rows of dO.
        for x in 0..config.head_dim {
            assert!((out.grad_v[x] - config.rows as f32).abs() < 1e-5);
        }
    }

    #[test]
    fn test_l_term_matches_direct_logsumexp() {
        let config = AttentionConfig::new(3, 7, 2);
        let inputs = tiny_inputs(&config);
        let out = NaiveReference::expected(&config, &inputs);
        let scale = f64::from(config.softmax_scale());
        for i in 0..config.rows {
            let mut sum = 0.0f64;
            for j in 0..config.cols {
                let mut dot = 0.0f64;
                for x in 0..config.head_dim {
                    dot += f64::from(inputs.q[i * 2 + x]) * f64::from(inputs.k[j * 2 + x]);
                }
                sum += (dot * scale).exp();
            }
            assert!((f64::from(out.l[i]) - sum.ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gradient_row_sum_identity() {
        // Rows of dS sum to zero (softmax jacobian kills the mean), so
        // summing dQ over the head dim against constant K must vanish.
        let config = AttentionConfig::new(6, 11, 4);
        let mut inputs = tiny_inputs(&config);
        inputs.k = vec![0.5; config.cols * config.head_dim];
        let out = NaiveReference::expected(&config, &inputs);
        for &g in &out.grad_q {
            assert!(g.abs() < 1e-5, "got {g}");
        }
    }

    #[test]
    fn test_trait_and_batch_paths_agree() {
        let config = AttentionConfig::new(4, 6, 3);
        let inputs = tiny_inputs(&config);
        let engine = NaiveReference;
        let out = NaiveReference::expected(&config, &inputs);
        assert_eq!(engine.forward(&config, &inputs), out.o);
        let (l, d) = engine.normalization(&config, &inputs);
        assert_eq!(l, out.l);
        assert_eq!(d, out.d);
        let (dv, dk, dq) = engine.gradients(&config, &inputs);
        assert_eq!(dv, out.grad_v);
        assert_eq!(dk, out.grad_k);
        assert_eq!(dq, out.grad_q);
    }

    #[test]
    fn test_laplacian_matrix_structure() {
        let a = laplacian_matrix(4);
        assert_eq!(a[0], 2.0);
        assert_eq!(a[1], -1.0);
        assert_eq!(a[2], 0.0);
        assert_eq!(a[5], 2.0);
        assert_eq!(a[4], -1.0);
        assert_eq!(a[15], 2.0);
    }

    #[test]
    fn test_laplacian_closed_form_matches_dense_product() {
        let n = 9;
        let b: Vec<f32> = (0..n * n).map(|i| (i as f32 * 0.37).sin()).collect();
        let a = laplacian_matrix(n);
        // Dense reference product.
        let mut dense = vec![0.0f32; n * n];
        for i in 0..n {
            for j in 0..n {
                let mut acc = 0.0f64;
                for x in 0..n {
                    acc += f64::from(a[i * n + x]) * f64::from(b[x * n + j]);
                }
                dense[i * n + j] = acc as f32;
            }
        }
        let closed = laplacian_expected(&b, n, n);
        for (x, y) in dense.iter().zip(closed.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_laplacian_of_linear_ramp_vanishes_inside() {
        // Second difference of a linear function is zero away from the
        // boundary rows.
        let n = 8;
        let b: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let c = laplacian_expected(&b, n, 1);
        for i in 1..n - 1 {
            assert!(c[i].abs() < 1e-6);
        }
        assert!((c[0] - (-1.0)).abs() < 1e-6);
    }
}
