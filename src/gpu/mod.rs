//! GPU backend abstraction and dispatch orchestration
//!
//! The backend trait mirrors what the harness needs from a device runtime:
//! compile a pipeline, allocate buffers at a storage precision, submit a
//! batch of dispatches, block until it completes, and read buffers back.
//! An emulated backend executes everything on the CPU so the full suite
//! runs without hardware.

pub mod backend;
pub mod emulated;
pub mod pipeline;

pub use backend::{
    BatchHandle, BufferHandle, Dispatch, GpuBackend, GridSize, PipelineHandle, Timestamps,
};
pub use emulated::EmulatedBackend;
pub use pipeline::{
    ceil_div, grid_for, run_attention, run_gemm, time_attention_variant, time_gemm,
    AttentionDeviceOutputs, AttentionRun, GemmRun,
};
