//! Performance profiling from device timestamps
//!
//! Each trial submits a batch of repeated dispatches and reads the
//! device-measured latency back. The profiler keeps the MAXIMUM throughput
//! observed across trials, not the mean: the best trial is closest to
//! steady-state achievable throughput, and warm-up or scheduling-jitter
//! outliers are discarded implicitly by never winning the max.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::kernel::{AttentionConfig, GemmConfig, KernelVariant};

/// Trial structure for one profiled configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Independent timed batches per configuration
    pub trials: usize,
    /// Repeated dispatch sequences within each batch
    pub dispatches_per_trial: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            trials: 8,
            dispatches_per_trial: 4,
        }
    }
}

/// Primitive operations per matrix element for one attention variant
///
/// The chain of computation grows through the backward passes: the
/// backward-key-value pass does the most work per element, then
/// backward-query, then forward.
#[must_use]
pub fn ops_per_element(variant: KernelVariant, head_dim: usize) -> u64 {
    let d = head_dim as u64;
    match variant {
        KernelVariant::Forward => 2 * d + 5,
        KernelVariant::BackwardQuery => 3 * d + 5,
        KernelVariant::BackwardKeyValue => 5 * d + 5,
        // GEMM throughput is counted in FLOPs over the full problem, not
        // per similarity-matrix element.
        KernelVariant::Gemm => 2 * d,
    }
}

/// Total instructions issued by one attention dispatch
#[must_use]
pub fn attention_ops(variant: KernelVariant, config: &AttentionConfig) -> u64 {
    ops_per_element(variant, config.head_dim) * config.rows as u64 * config.cols as u64
}

/// Total floating-point operations of one GEMM dispatch
#[must_use]
pub fn gemm_flops(config: &GemmConfig) -> u64 {
    2 * config.m as u64 * config.n as u64 * config.k as u64
}

/// De-noised throughput for one profiled configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    /// Best observed throughput, truncated to whole giga-units
    pub giga_per_second: u64,
    /// Latency of the best trial, seconds
    pub best_latency_seconds: f64,
    /// Operations counted per trial batch
    pub ops_per_trial: u64,
}

/// Run the trial loop and keep the best sample
///
/// `run_trial` must submit one full batch and return its device-measured
/// latency in seconds.
///
/// # Errors
///
/// Propagates the first trial failure; partial samples are discarded.
pub fn profile_max<F>(
    config: &ProfileConfig,
    ops_per_trial: u64,
    mut run_trial: F,
) -> Result<ThroughputSample>
where
    F: FnMut() -> Result<f64>,
{
    let mut best_rate = 0.0f64;
    let mut best_latency = f64::INFINITY;
    for trial in 0..config.trials.max(1) {
        let latency = run_trial()?;
        let rate = if latency > 0.0 {
            ops_per_trial as f64 / latency
        } else {
            0.0
        };
        debug!(trial, latency, rate, "profiled trial");
        if rate > best_rate {
            best_rate = rate;
            best_latency = latency;
        }
    }
    Ok(ThroughputSample {
        giga_per_second: (best_rate / 1e9) as u64,
        best_latency_seconds: if best_latency.is_finite() {
            best_latency
        } else {
            0.0
        },
        ops_per_trial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops_per_element_ordering() {
        for d in [1usize, 16, 64, 128] {
            let fwd = ops_per_element(KernelVariant::Forward, d);
            let bq = ops_per_element(KernelVariant::BackwardQuery, d);
            let bkv = ops_per_element(KernelVariant::BackwardKeyValue, d);
            assert!(bkv > bq);
            assert!(bq > fwd);
        }
    }

    #[test]
    fn test_attention_ops_scale_with_problem_area() {
        let small = AttentionConfig::new(8, 8, 4);
        let large = AttentionConfig::new(16, 16, 4);
        let variant = KernelVariant::Forward;
        assert_eq!(
            attention_ops(variant, &large),
            4 * attention_ops(variant, &small)
        );
    }

    #[test]
    fn test_gemm_flops_square() {
        let config = GemmConfig::square(10);
        assert_eq!(gemm_flops(&config), 2000);
    }

    #[test]
    fn test_profile_retains_maximum() {
        // Latencies improve then regress; the best (smallest) trial wins.
        let latencies = [4.0e-3, 1.0e-3, 2.0e-3];
        let mut iter = latencies.iter();
        let config = ProfileConfig {
            trials: 3,
            dispatches_per_trial: 1,
        };
        let sample = profile_max(&config, 2_000_000_000, || Ok(*iter.next().unwrap())).unwrap();
        // 2e9 ops / 1e-3 s = 2e12/s = 2000 giga-units.
        assert_eq!(sample.giga_per_second, 2000);
        assert!((sample.best_latency_seconds - 1.0e-3).abs() < 1e-9);
    }

    #[test]
    fn test_giga_truncation() {
        let config = ProfileConfig {
            trials: 1,
            dispatches_per_trial: 1,
        };
        // 1.9e9 ops in 1 s truncates to 1 giga-unit.
        let sample = profile_max(&config, 1_900_000_000, || Ok(1.0)).unwrap();
        assert_eq!(sample.giga_per_second, 1);
    }

    #[test]
    fn test_trial_failure_propagates() {
        let config = ProfileConfig::default();
        let result = profile_max(&config, 1, || {
            Err(crate::VerificarError::BackendFailure("lost".into()))
        });
        assert!(result.is_err());
    }
}
