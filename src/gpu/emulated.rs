//! CPU emulation of the GPU backend
//!
//! Executes compiled kernels on the host so the harness runs end to end
//! without a device. The emulation is honest about precision: buffers hold
//! the same encoded bytes a real device would, so every read observes the
//! quantization loss of its storage format. Arithmetic accumulates in f64,
//! matching a well-behaved kernel's register-resident accumulators.
//!
//! Forward attention runs the streaming online-softmax formulation; the
//! backward passes recompute probabilities from the stored L terms instead
//! of materializing the similarity matrix, mirroring how the kernels under
//! test are expected to work and keeping this path structurally independent
//! of the naive reference oracle.

use std::time::Instant;

use crate::error::{Result, VerificarError};
use crate::gpu::backend::{
    BatchHandle, BufferHandle, Dispatch, GpuBackend, PipelineHandle, Timestamps,
};
use crate::kernel::{AttentionConfig, GemmConfig, KernelDescriptor, KernelSpec, KernelVariant};
use crate::layout::{to_logical, to_physical};
use crate::precision::{self, Operand, Precision};

struct EmulatedBuffer {
    bytes: Vec<u8>,
    precision: Precision,
}

/// In-process backend executing dispatches on the CPU
#[derive(Default)]
pub struct EmulatedBackend {
    pipelines: Vec<KernelSpec>,
    buffers: Vec<EmulatedBuffer>,
    batches: Vec<Timestamps>,
    clock_ns: u64,
}

impl EmulatedBackend {
    /// New backend with an empty pipeline and buffer registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pipeline(&self, handle: PipelineHandle) -> Result<&KernelSpec> {
        self.pipelines
            .get(handle.0)
            .ok_or(VerificarError::UnknownHandle {
                kind: "pipeline",
                id: handle.0,
            })
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&EmulatedBuffer> {
        self.buffers
            .get(handle.0)
            .ok_or(VerificarError::UnknownHandle {
                kind: "buffer",
                id: handle.0,
            })
    }

    fn bound(dispatch: &Dispatch, slot: u32) -> Result<BufferHandle> {
        dispatch
            .buffers
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, h)| *h)
            .ok_or_else(|| {
                VerificarError::BackendFailure(format!("no buffer bound at slot {slot}"))
            })
    }

    fn read_logical(
        &self,
        handle: BufferHandle,
        rows: usize,
        cols: usize,
        transposed: bool,
    ) -> Result<Vec<f32>> {
        let buffer = self.buffer(handle)?;
        let physical = precision::decode(&buffer.bytes, buffer.precision, rows * cols)?;
        Ok(to_logical(&physical, rows, cols, transposed))
    }

    fn write_logical(
        &mut self,
        handle: BufferHandle,
        data: &[f32],
        rows: usize,
        cols: usize,
        transposed: bool,
    ) -> Result<()> {
        let precision = self.buffer(handle)?.precision;
        let physical = to_physical(data, rows, cols, transposed);
        let bytes = precision::encode(&physical, precision);
        self.buffers[handle.0].bytes = bytes;
        Ok(())
    }

    fn read_operand(
        &self,
        dispatch: &Dispatch,
        config: &AttentionConfig,
        operand: Operand,
    ) -> Result<Vec<f32>> {
        let (rows, cols) = config.operand_shape(operand);
        let handle = Self::bound(dispatch, operand.slot())?;
        self.read_logical(handle, rows, cols, config.transposes.flag(operand))
    }

    fn write_operand(
        &mut self,
        dispatch: &Dispatch,
        config: &AttentionConfig,
        operand: Operand,
        data: &[f32],
    ) -> Result<()> {
        let (rows, cols) = config.operand_shape(operand);
        let handle = Self::bound(dispatch, operand.slot())?;
        self.write_logical(handle, data, rows, cols, config.transposes.flag(operand))
    }

    fn execute(&mut self, dispatch: &Dispatch) -> Result<()> {
        let spec = self.pipeline(dispatch.pipeline)?.clone();
        match &spec.descriptor {
            KernelDescriptor::Attention { config, variant } => match variant {
                KernelVariant::Forward => self.attention_forward(dispatch, config),
                KernelVariant::BackwardQuery => self.attention_backward_query(dispatch, config),
                KernelVariant::BackwardKeyValue => {
                    self.attention_backward_key_value(dispatch, config)
                }
                KernelVariant::Gemm => Err(VerificarError::BackendFailure(
                    "gemm variant in attention descriptor".to_string(),
                )),
            },
            KernelDescriptor::Gemm { config } => self.gemm(dispatch, config),
        }
    }

    fn attention_forward(&mut self, dispatch: &Dispatch, config: &AttentionConfig) -> Result<()> {
        let q = self.read_operand(dispatch, config, Operand::Q)?;
        let k = self.read_operand(dispatch, config, Operand::K)?;
        let v = self.read_operand(dispatch, config, Operand::V)?;
        let dim = config.head_dim;
        let scale = f64::from(config.softmax_scale());

        let mut o = vec![0.0f32; config.rows * dim];
        let mut l = vec![0.0f32; config.rows];
        for i in 0..config.rows {
            let mut running_max = f64::NEG_INFINITY;
            let mut running_sum = 0.0f64;
            let mut acc = vec![0.0f64; dim];
            for j in 0..config.cols {
                let mut s = 0.0f64;
                for x in 0..dim {
                    s += f64::from(q[i * dim + x]) * f64::from(k[j * dim + x]);
                }
                s *= scale;
                if s > running_max {
                    let correction = (running_max - s).exp();
                    running_sum *= correction;
                    for a in &mut acc {
                        *a *= correction;
                    }
                    running_max = s;
                }
                let w = (s - running_max).exp();
                running_sum += w;
                for x in 0..dim {
                    acc[x] += w * f64::from(v[j * dim + x]);
                }
            }
            for x in 0..dim {
                o[i * dim + x] = (acc[x] / running_sum) as f32;
            }
            l[i] = (running_max + running_sum.ln()) as f32;
        }

        self.write_operand(dispatch, config, Operand::O, &o)?;
        self.write_operand(dispatch, config, Operand::L, &l)
    }

    fn attention_backward_query(
        &mut self,
        dispatch: &Dispatch,
        config: &AttentionConfig,
    ) -> Result<()> {
        let q = self.read_operand(dispatch, config, Operand::Q)?;
        let k = self.read_operand(dispatch, config, Operand::K)?;
        let v = self.read_operand(dispatch, config, Operand::V)?;
        let o = self.read_operand(dispatch, config, Operand::O)?;
        let l = self.read_operand(dispatch, config, Operand::L)?;
        let grad_o = self.read_operand(dispatch, config, Operand::GradO)?;
        let dim = config.head_dim;
        let scale = f64::from(config.softmax_scale());

        let mut d = vec![0.0f32; config.rows];
        let mut grad_q = vec![0.0f32; config.rows * dim];
        for i in 0..config.rows {
            let mut d_i = 0.0f64;
            for x in 0..dim {
                d_i += f64::from(grad_o[i * dim + x]) * f64::from(o[i * dim + x]);
            }
            d[i] = d_i as f32;

            let mut acc = vec![0.0f64; dim];
            for j in 0..config.cols {
                let mut s = 0.0f64;
                let mut dp = 0.0f64;
                for x in 0..dim {
                    s += f64::from(q[i * dim + x]) * f64::from(k[j * dim + x]);
                    dp += f64::from(grad_o[i * dim + x]) * f64::from(v[j * dim + x]);
                }
                let p = (s * scale - f64::from(l[i])).exp();
                let ds = p * (dp - d_i);
                for x in 0..dim {
                    acc[x] += ds * f64::from(k[j * dim + x]);
                }
            }
            for x in 0..dim {
                grad_q[i * dim + x] = (acc[x] * scale) as f32;
            }
        }

        self.write_operand(dispatch, config, Operand::D, &d)?;
        self.write_operand(dispatch, config, Operand::GradQ, &grad_q)
    }

    fn attention_backward_key_value(
        &mut self,
        dispatch: &Dispatch,
        config: &AttentionConfig,
    ) -> Result<()> {
        let q = self.read_operand(dispatch, config, Operand::Q)?;
        let k = self.read_operand(dispatch, config, Operand::K)?;
        let v = self.read_operand(dispatch, config, Operand::V)?;
        let l = self.read_operand(dispatch, config, Operand::L)?;
        let d = self.read_operand(dispatch, config, Operand::D)?;
        let grad_o = self.read_operand(dispatch, config, Operand::GradO)?;
        let dim = config.head_dim;
        let scale = f64::from(config.softmax_scale());

        let mut grad_v = vec![0.0f32; config.cols * dim];
        let mut grad_k = vec![0.0f32; config.cols * dim];
        for j in 0..config.cols {
            let mut v_acc = vec![0.0f64; dim];
            let mut k_acc = vec![0.0f64; dim];
            for i in 0..config.rows {
                let mut s = 0.0f64;
                let mut dp = 0.0f64;
                for x in 0..dim {
                    s += f64::from(q[i * dim + x]) * f64::from(k[j * dim + x]);
                    dp += f64::from(grad_o[i * dim + x]) * f64::from(v[j * dim + x]);
                }
                let p = (s * scale - f64::from(l[i])).exp();
                let ds = p * (dp - f64::from(d[i]));
                for x in 0..dim {
                    v_acc[x] += p * f64::from(grad_o[i * dim + x]);
                    k_acc[x] += ds * f64::from(q[i * dim + x]);
                }
            }
            for x in 0..dim {
                grad_v[j * dim + x] = v_acc[x] as f32;
                grad_k[j * dim + x] = (k_acc[x] * scale) as f32;
            }
        }

        self.write_operand(dispatch, config, Operand::GradV, &grad_v)?;
        self.write_operand(dispatch, config, Operand::GradK, &grad_k)
    }

    fn gemm(&mut self, dispatch: &Dispatch, config: &GemmConfig) -> Result<()> {
        let (m, n, k) = (config.m, config.n, config.k);
        let a_handle = Self::bound(dispatch, Operand::A.slot())?;
        let b_handle = Self::bound(dispatch, Operand::B.slot())?;
        let c_handle = Self::bound(dispatch, Operand::C.slot())?;
        let a = self.read_logical(a_handle, m, k, config.transpose_a)?;
        let b = self.read_logical(b_handle, k, n, config.transpose_b)?;

        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f64;
                for x in 0..k {
                    acc += f64::from(a[i * k + x]) * f64::from(b[x * n + j]);
                }
                c[i * n + j] = acc as f32;
            }
        }
        self.write_logical(c_handle, &c, m, n, false)
    }
}

impl GpuBackend for EmulatedBackend {
    fn device_name(&self) -> String {
        "emulated-cpu".to_string()
    }

    fn compile(&mut self, kernel: &KernelSpec) -> Result<PipelineHandle> {
        if kernel.source.trim().is_empty() {
            return Err(VerificarError::KernelCompile(
                "empty kernel source".to_string(),
            ));
        }
        if kernel.block_size == 0 || kernel.threadgroup_size == 0 {
            return Err(VerificarError::KernelCompile(format!(
                "degenerate tiling: block={} threadgroup={}",
                kernel.block_size, kernel.threadgroup_size
            )));
        }
        self.pipelines.push(kernel.clone());
        Ok(PipelineHandle(self.pipelines.len() - 1))
    }

    fn allocate(&mut self, data: &[f32], precision: Precision) -> Result<BufferHandle> {
        self.buffers.push(EmulatedBuffer {
            bytes: precision::encode(data, precision),
            precision,
        });
        Ok(BufferHandle(self.buffers.len() - 1))
    }

    fn submit(&mut self, dispatches: &[Dispatch]) -> Result<BatchHandle> {
        let start_ns = self.clock_ns;
        let started = Instant::now();
        for dispatch in dispatches {
            self.execute(dispatch)?;
        }
        let elapsed_ns = (started.elapsed().as_nanos() as u64).max(1);
        self.clock_ns += elapsed_ns;
        self.batches.push(Timestamps {
            start_ns,
            end_ns: self.clock_ns,
        });
        Ok(BatchHandle(self.batches.len() - 1))
    }

    fn wait(&mut self, batch: BatchHandle) -> Result<Timestamps> {
        // Execution already completed at submit; only the timestamps remain.
        self.batches
            .get(batch.0)
            .copied()
            .ok_or(VerificarError::UnknownHandle {
                kind: "batch",
                id: batch.0,
            })
    }

    fn readback(
        &self,
        buffer: BufferHandle,
        precision: Precision,
        count: usize,
    ) -> Result<Vec<f32>> {
        let stored = self.buffer(buffer)?;
        precision::decode(&stored.bytes, precision, count)
    }
}
