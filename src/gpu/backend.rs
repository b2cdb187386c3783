//! GpuBackend trait for abstracting device runtimes
//!
//! Enables swapping the real device for the CPU emulation in
//! [`crate::gpu::emulated`], so the harness itself is testable anywhere.

use crate::error::Result;
use crate::kernel::KernelSpec;
use crate::precision::Precision;

/// Opaque handle for a compiled pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub usize);

/// Opaque handle for a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

/// Opaque handle for a submitted batch of dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchHandle(pub usize);

/// Device-reported start/end timestamps for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    /// Batch start, device nanoseconds
    pub start_ns: u64,
    /// Batch end, device nanoseconds
    pub end_ns: u64,
}

impl Timestamps {
    /// Wall latency of the batch in seconds
    #[must_use]
    pub fn latency_seconds(&self) -> f64 {
        self.end_ns.saturating_sub(self.start_ns) as f64 / 1e9
    }
}

/// Dispatch grid in tile groups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSize {
    /// Groups along x
    pub x: u32,
    /// Groups along y
    pub y: u32,
    /// Groups along z
    pub z: u32,
}

/// One encoded dispatch within a batch
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Pipeline to run
    pub pipeline: PipelineHandle,
    /// Buffers bound at their fixed slot indices
    pub buffers: Vec<(u32, BufferHandle)>,
    /// Grid size in tile groups
    pub grid: GridSize,
    /// Threads per threadgroup
    pub threadgroup_size: u32,
    /// Threadgroup memory to reserve, bytes
    pub threadgroup_memory_bytes: u32,
}

/// Abstraction over GPU device runtimes
///
/// Dispatches are submitted as ordered batches and awaited synchronously;
/// the harness never keeps two batches in flight, so implementations may
/// reuse a single command queue. Compilation failure is unrecoverable for
/// the run: the kernel generator is the component under test and a retry
/// yields no new information.
pub trait GpuBackend {
    /// Human-readable device name for progress messages
    fn device_name(&self) -> String;

    /// Compile a kernel into a pipeline
    ///
    /// # Errors
    ///
    /// Returns [`crate::VerificarError::KernelCompile`] on failure; the
    /// caller must abort the run.
    fn compile(&mut self, kernel: &KernelSpec) -> Result<PipelineHandle>;

    /// Allocate a device buffer holding `data` encoded at `precision`
    ///
    /// # Errors
    ///
    /// Returns [`crate::VerificarError::BackendFailure`] if allocation or
    /// transfer fails.
    fn allocate(&mut self, data: &[f32], precision: Precision) -> Result<BufferHandle>;

    /// Submit an ordered batch of dispatches
    ///
    /// The dispatches execute in program order within one submitted unit of
    /// work. The call may return before the device finishes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::VerificarError::BackendFailure`] on submission
    /// failure, or an unknown-handle error if a dispatch references a
    /// pipeline or buffer this backend never produced.
    fn submit(&mut self, dispatches: &[Dispatch]) -> Result<BatchHandle>;

    /// Block until a batch completes, returning its device timestamps
    ///
    /// # Errors
    ///
    /// Returns an unknown-handle error for a batch this backend never
    /// issued.
    fn wait(&mut self, batch: BatchHandle) -> Result<Timestamps>;

    /// Read a buffer back as host f32 values
    ///
    /// # Errors
    ///
    /// Returns an unknown-handle error for a foreign buffer, or a length
    /// mismatch if `count` elements at `precision` do not match the
    /// buffer's contents.
    fn readback(
        &self,
        buffer: BufferHandle,
        precision: Precision,
        count: usize,
    ) -> Result<Vec<f32>>;
}
