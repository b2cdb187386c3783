//! Dispatch orchestration for attention and GEMM test cases
//!
//! One test case owns its buffers for exactly one dispatch-and-readback
//! cycle. Multi-variant attention cases issue their dispatches in program
//! order (forward, backward-query, backward-key-value) within a single
//! submitted batch, then block until the batch completes. The control flow
//! is deliberately single-threaded and synchronous: the GPU result and the
//! CPU reference are never racing.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Result, VerificarError};
use crate::gpu::backend::{BufferHandle, Dispatch, GpuBackend, GridSize};
use crate::kernel::{AttentionConfig, GemmConfig, KernelCompiler, KernelSpec, KernelVariant};
use crate::layout::{to_logical, to_physical};
use crate::precision::Operand;
use crate::reference::AttentionInputs;

/// Ceiling division used for grid sizing
///
/// # Errors
///
/// A zero granularity is a fatal configuration error for the test case.
pub fn ceil_div(target: usize, granularity: usize) -> Result<usize> {
    if granularity == 0 {
        return Err(VerificarError::InvalidGranularity);
    }
    Ok(target.div_ceil(granularity))
}

/// Tile-group grid for one kernel
///
/// The grid covers the kernel's parallelization dimension at its reported
/// block size; GEMM kernels additionally tile over columns of C.
///
/// # Errors
///
/// Propagates the zero-granularity configuration error.
pub fn grid_for(spec: &KernelSpec) -> Result<GridSize> {
    let block = spec.block_size as usize;
    let x = ceil_div(spec.parallelization_dim().max(1), block)?;
    let y = match &spec.descriptor {
        crate::kernel::KernelDescriptor::Gemm { config } => ceil_div(config.n.max(1), block)?,
        crate::kernel::KernelDescriptor::Attention { .. } => 1,
    };
    Ok(GridSize {
        x: x as u32,
        y: y as u32,
        z: 1,
    })
}

/// Outputs read back from the device after a full attention cycle
#[derive(Debug, Clone)]
pub struct AttentionDeviceOutputs {
    /// Forward output
    pub o: Vec<f32>,
    /// Log-sum-exp terms
    pub l: Vec<f32>,
    /// Denominator gradient terms
    pub d: Vec<f32>,
    /// Gradient with respect to V
    pub grad_v: Vec<f32>,
    /// Gradient with respect to K
    pub grad_k: Vec<f32>,
    /// Gradient with respect to Q
    pub grad_q: Vec<f32>,
}

/// Result of one attention dispatch-and-readback cycle
#[derive(Debug, Clone)]
pub struct AttentionRun {
    /// Device outputs in logical row-major layout
    pub outputs: AttentionDeviceOutputs,
    /// Device-measured latency of the three-dispatch batch, seconds
    pub latency_seconds: f64,
}

/// Result of one GEMM dispatch-and-readback cycle
#[derive(Debug, Clone)]
pub struct GemmRun {
    /// Output matrix C, row-major m x n
    pub c: Vec<f32>,
    /// Device-measured batch latency, seconds
    pub latency_seconds: f64,
}

fn host_operand(config: &AttentionConfig, inputs: &AttentionInputs, operand: Operand) -> Vec<f32> {
    match operand {
        Operand::Q => inputs.q.clone(),
        Operand::K => inputs.k.clone(),
        Operand::V => inputs.v.clone(),
        Operand::GradO => inputs.grad_o.clone(),
        _ => vec![0.0; config.operand_len(operand)],
    }
}

fn allocate_attention_buffers<B: GpuBackend>(
    backend: &mut B,
    config: &AttentionConfig,
    inputs: &AttentionInputs,
) -> Result<BTreeMap<Operand, BufferHandle>> {
    let mut handles = BTreeMap::new();
    for operand in Operand::ATTENTION {
        let precision = config.precisions.get(operand)?;
        let (rows, cols) = config.operand_shape(operand);
        let logical = host_operand(config, inputs, operand);
        let physical = to_physical(&logical, rows, cols, config.transposes.flag(operand));
        let handle = backend.allocate(&physical, precision)?;
        handles.insert(operand, handle);
    }
    Ok(handles)
}

fn attention_dispatch(
    spec: &KernelSpec,
    pipeline: crate::gpu::backend::PipelineHandle,
    handles: &BTreeMap<Operand, BufferHandle>,
) -> Result<Dispatch> {
    let buffers = Operand::ATTENTION
        .iter()
        .map(|op| (op.slot(), handles[op]))
        .collect();
    Ok(Dispatch {
        pipeline,
        buffers,
        grid: grid_for(spec)?,
        threadgroup_size: spec.threadgroup_size,
        threadgroup_memory_bytes: spec.threadgroup_memory_bytes,
    })
}

fn read_attention_operand<B: GpuBackend>(
    backend: &B,
    config: &AttentionConfig,
    handles: &BTreeMap<Operand, BufferHandle>,
    operand: Operand,
) -> Result<Vec<f32>> {
    let precision = config.precisions.get(operand)?;
    let (rows, cols) = config.operand_shape(operand);
    let physical = backend.readback(handles[&operand], precision, rows * cols)?;
    Ok(to_logical(
        &physical,
        rows,
        cols,
        config.transposes.flag(operand),
    ))
}

/// Run the full three-variant attention cycle for one test case
///
/// Compiles all three pipelines, uploads the operands at their assigned
/// precisions and layouts, submits one batch of three ordered dispatches,
/// waits, and reads every kernel-written operand back.
///
/// # Errors
///
/// Configuration errors (missing precision, zero granularity) abort this
/// case; compile and backend failures abort the run.
pub fn run_attention<B: GpuBackend, C: KernelCompiler>(
    backend: &mut B,
    compiler: &C,
    config: &AttentionConfig,
    inputs: &AttentionInputs,
) -> Result<AttentionRun> {
    // Validate every required operand has a precision before touching the
    // device, so a bad assignment cannot leak a half-built case.
    for variant in KernelVariant::ATTENTION_ORDER {
        for &operand in variant.required_operands() {
            config.precisions.get(operand)?;
        }
    }

    let handles = allocate_attention_buffers(backend, config, inputs)?;

    let mut dispatches = Vec::with_capacity(3);
    for variant in KernelVariant::ATTENTION_ORDER {
        let spec = compiler.attention_kernel(config, variant)?;
        let pipeline = backend.compile(&spec)?;
        debug!(
            variant = variant.name(),
            block = spec.block_size,
            grid_x = grid_for(&spec)?.x,
            "encoded attention dispatch"
        );
        dispatches.push(attention_dispatch(&spec, pipeline, &handles)?);
    }

    let batch = backend.submit(&dispatches)?;
    let timestamps = backend.wait(batch)?;

    let outputs = AttentionDeviceOutputs {
        o: read_attention_operand(backend, config, &handles, Operand::O)?,
        l: read_attention_operand(backend, config, &handles, Operand::L)?,
        d: read_attention_operand(backend, config, &handles, Operand::D)?,
        grad_v: read_attention_operand(backend, config, &handles, Operand::GradV)?,
        grad_k: read_attention_operand(backend, config, &handles, Operand::GradK)?,
        grad_q: read_attention_operand(backend, config, &handles, Operand::GradQ)?,
    };
    Ok(AttentionRun {
        outputs,
        latency_seconds: timestamps.latency_seconds(),
    })
}

/// Time one attention variant over repeated dispatches
///
/// Uploads the operands once, then submits `dispatches` copies of the
/// variant's dispatch as a single batch and returns the device-measured
/// batch latency. Used by the performance profiler.
///
/// # Errors
///
/// Same failure modes as [`run_attention`].
pub fn time_attention_variant<B: GpuBackend, C: KernelCompiler>(
    backend: &mut B,
    compiler: &C,
    config: &AttentionConfig,
    inputs: &AttentionInputs,
    variant: KernelVariant,
    dispatches: usize,
) -> Result<f64> {
    for &operand in variant.required_operands() {
        config.precisions.get(operand)?;
    }
    let handles = allocate_attention_buffers(backend, config, inputs)?;
    let spec = compiler.attention_kernel(config, variant)?;
    let pipeline = backend.compile(&spec)?;
    let dispatch = attention_dispatch(&spec, pipeline, &handles)?;
    let batch = backend.submit(&vec![dispatch; dispatches])?;
    Ok(backend.wait(batch)?.latency_seconds())
}

/// Run one GEMM dispatch-and-readback cycle
///
/// # Errors
///
/// Same failure taxonomy as [`run_attention`].
pub fn run_gemm<B: GpuBackend, C: KernelCompiler>(
    backend: &mut B,
    compiler: &C,
    config: &GemmConfig,
    a: &[f32],
    b: &[f32],
) -> Result<GemmRun> {
    let (handles, dispatch) = prepare_gemm(backend, compiler, config, a, b)?;
    let batch = backend.submit(&[dispatch])?;
    let timestamps = backend.wait(batch)?;
    let c_precision = config.precisions.get(Operand::C)?;
    let c = backend.readback(handles[2], c_precision, config.m * config.n)?;
    Ok(GemmRun {
        c,
        latency_seconds: timestamps.latency_seconds(),
    })
}

/// Time repeated GEMM dispatches as one batch
///
/// # Errors
///
/// Same failure taxonomy as [`run_gemm`].
pub fn time_gemm<B: GpuBackend, C: KernelCompiler>(
    backend: &mut B,
    compiler: &C,
    config: &GemmConfig,
    a: &[f32],
    b: &[f32],
    dispatches: usize,
) -> Result<f64> {
    let (_, dispatch) = prepare_gemm(backend, compiler, config, a, b)?;
    let batch = backend.submit(&vec![dispatch; dispatches])?;
    Ok(backend.wait(batch)?.latency_seconds())
}

fn prepare_gemm<B: GpuBackend, C: KernelCompiler>(
    backend: &mut B,
    compiler: &C,
    config: &GemmConfig,
    a: &[f32],
    b: &[f32],
) -> Result<([BufferHandle; 3], Dispatch)> {
    let a_precision = config.precisions.get(Operand::A)?;
    let b_precision = config.precisions.get(Operand::B)?;
    let c_precision = config.precisions.get(Operand::C)?;

    let a_physical = to_physical(a, config.m, config.k, config.transpose_a);
    let b_physical = to_physical(b, config.k, config.n, config.transpose_b);
    let a_buf = backend.allocate(&a_physical, a_precision)?;
    let b_buf = backend.allocate(&b_physical, b_precision)?;
    let c_buf = backend.allocate(&vec![0.0; config.m * config.n], c_precision)?;

    let spec = compiler.gemm_kernel(config)?;
    let pipeline = backend.compile(&spec)?;
    let dispatch = Dispatch {
        pipeline,
        buffers: Operand::GEMM
            .iter()
            .zip([a_buf, b_buf, c_buf])
            .map(|(operand, buffer)| (operand.slot(), buffer))
            .collect(),
        grid: grid_for(&spec)?,
        threadgroup_size: spec.threadgroup_size,
        threadgroup_memory_bytes: spec.threadgroup_memory_bytes,
    };
    Ok(([a_buf, b_buf, c_buf], dispatch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::emulated::EmulatedBackend;
    use crate::kernel::StubKernelCompiler;
    use crate::precision::{Precision, PrecisionAssignment};
    use crate::reference::{laplacian_expected, laplacian_matrix, NaiveReference};

    fn inputs_for(config: &AttentionConfig) -> AttentionInputs {
        let q_len = config.operand_len(Operand::Q);
        let kv_len = config.operand_len(Operand::K);
        AttentionInputs {
            q: (0..q_len).map(|i| (i as f32 * 0.13).sin()).collect(),
            k: (0..kv_len).map(|i| (i as f32 * 0.29).cos()).collect(),
            v: (0..kv_len).map(|i| (i as f32 * 0.41).sin()).collect(),
            grad_o: vec![1.0; q_len],
        }
    }

    #[test]
    fn test_ceil_div_bounds() {
        for target in [1usize, 7, 32, 100, 1023] {
            for granularity in [1usize, 2, 16, 64] {
                let groups = ceil_div(target, granularity).unwrap();
                assert!(groups * granularity >= target);
                assert!((groups - 1) * granularity < target);
            }
        }
    }

    #[test]
    fn test_ceil_div_zero_granularity_fatal_for_case() {
        let err = ceil_div(10, 0).unwrap_err();
        assert!(matches!(err, VerificarError::InvalidGranularity));
        assert!(!err.is_fatal_for_run());
    }

    #[test]
    fn test_full_cycle_matches_reference_f32() {
        let mut backend = EmulatedBackend::new();
        let config = AttentionConfig::new(8, 8, 2);
        let inputs = inputs_for(&config);
        let run = run_attention(&mut backend, &StubKernelCompiler, &config, &inputs).unwrap();
        let expected = NaiveReference::expected(&config, &inputs);

        for (device, oracle) in [
            (&run.outputs.o, &expected.o),
            (&run.outputs.l, &expected.l),
            (&run.outputs.d, &expected.d),
            (&run.outputs.grad_v, &expected.grad_v),
            (&run.outputs.grad_k, &expected.grad_k),
            (&run.outputs.grad_q, &expected.grad_q),
        ] {
            assert_eq!(device.len(), oracle.len());
            for (x, y) in device.iter().zip(oracle.iter()) {
                assert!((x - y).abs() < 2e-5, "{x} vs {y}");
            }
        }
        assert!(run.latency_seconds > 0.0);
    }

    #[test]
    fn test_transposed_operands_round_trip() {
        let mut backend = EmulatedBackend::new();
        let config = AttentionConfig::new(6, 10, 4).with_transposes(crate::layout::TransposeState {
            q: true,
            k: true,
            v: false,
            o: true,
        });
        let inputs = inputs_for(&config);
        let run = run_attention(&mut backend, &StubKernelCompiler, &config, &inputs).unwrap();
        let expected = NaiveReference::expected(&config, &inputs);
        for (x, y) in run.outputs.o.iter().zip(expected.o.iter()) {
            assert!((x - y).abs() < 2e-5);
        }
        for (x, y) in run.outputs.grad_q.iter().zip(expected.grad_q.iter()) {
            assert!((x - y).abs() < 2e-5);
        }
    }

    #[test]
    fn test_missing_precision_aborts_case_before_dispatch() {
        let mut backend = EmulatedBackend::new();
        let mut config = AttentionConfig::new(4, 4, 2);
        config.precisions = PrecisionAssignment::new();
        config.precisions.set(Operand::Q, Precision::F32);
        let inputs = inputs_for(&config);
        let err = run_attention(&mut backend, &StubKernelCompiler, &config, &inputs).unwrap_err();
        assert!(matches!(err, VerificarError::MissingPrecision { .. }));
    }

    #[test]
    fn test_gemm_laplacian_matches_closed_form() {
        let mut backend = EmulatedBackend::new();
        let n = 16;
        let config = GemmConfig::square(n);
        let a = laplacian_matrix(n);
        let b: Vec<f32> = (0..n * n).map(|i| (i as f32 * 0.17).sin()).collect();
        let run = run_gemm(&mut backend, &StubKernelCompiler, &config, &a, &b).unwrap();
        let expected = laplacian_expected(&b, n, n);
        for (x, y) in run.c.iter().zip(expected.iter()) {
            assert!((x - y).abs() < 2e-5);
        }
    }

    #[test]
    fn test_gemm_transpose_combinations_agree() {
        let n = 8;
        let a = laplacian_matrix(n);
        let b: Vec<f32> = (0..n * n).map(|i| (i as f32 * 0.7).cos()).collect();
        let expected = laplacian_expected(&b, n, n);
        for (ta, tb) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut backend = EmulatedBackend::new();
            let config = GemmConfig::square(n).with_transposes(ta, tb);
            let run = run_gemm(&mut backend, &StubKernelCompiler, &config, &a, &b).unwrap();
            for (x, y) in run.c.iter().zip(expected.iter()) {
                assert!((x - y).abs() < 2e-5, "ta={ta} tb={tb}");
            }
        }
    }

    #[test]
    fn test_timed_variant_reports_positive_latency() {
        let mut backend = EmulatedBackend::new();
        let config = AttentionConfig::new(16, 16, 4);
        let inputs = inputs_for(&config);
        let latency = time_attention_variant(
            &mut backend,
            &StubKernelCompiler,
            &config,
            &inputs,
            KernelVariant::Forward,
            3,
        )
        .unwrap();
        assert!(latency > 0.0);
    }
}
