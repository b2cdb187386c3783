//! Kernel-under-test interface
//!
//! The kernel source generator is the component being verified. The harness
//! treats it as an opaque function: given a problem configuration and a
//! pass variant, it returns kernel source text plus the block tiling,
//! threadgroup sizing, and threadgroup memory footprint the dispatch layer
//! needs. A stub generator ships in-crate so the harness runs end to end
//! with the emulated backend.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::layout::TransposeState;
use crate::precision::{Operand, PrecisionAssignment};

/// The kernel pass being compiled and dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelVariant {
    /// Attention forward pass: writes O and L
    Forward,
    /// Attention backward pass for the query gradient: writes D and dQ
    BackwardQuery,
    /// Attention backward pass for key/value gradients: writes dV and dK
    BackwardKeyValue,
    /// General matrix multiplication: writes C
    Gemm,
}

impl KernelVariant {
    /// The three attention variants in dispatch program order
    pub const ATTENTION_ORDER: [KernelVariant; 3] = [
        KernelVariant::Forward,
        KernelVariant::BackwardQuery,
        KernelVariant::BackwardKeyValue,
    ];

    /// Operands this variant reads or writes
    ///
    /// Every listed operand must carry a precision assignment before the
    /// variant can be dispatched.
    #[must_use]
    pub fn required_operands(self) -> &'static [Operand] {
        match self {
            KernelVariant::Forward => &[
                Operand::Q,
                Operand::K,
                Operand::V,
                Operand::O,
                Operand::L,
            ],
            KernelVariant::BackwardQuery => &[
                Operand::Q,
                Operand::K,
                Operand::V,
                Operand::O,
                Operand::L,
                Operand::D,
                Operand::GradO,
                Operand::GradQ,
            ],
            KernelVariant::BackwardKeyValue => &[
                Operand::Q,
                Operand::K,
                Operand::V,
                Operand::L,
                Operand::D,
                Operand::GradO,
                Operand::GradV,
                Operand::GradK,
            ],
            KernelVariant::Gemm => &[Operand::A, Operand::B, Operand::C],
        }
    }

    /// Short name used in kernel source and progress messages
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            KernelVariant::Forward => "forward",
            KernelVariant::BackwardQuery => "backward_query",
            KernelVariant::BackwardKeyValue => "backward_key_value",
            KernelVariant::Gemm => "gemm",
        }
    }
}

/// Fully resolved attention problem configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Number of query rows
    pub rows: usize,
    /// Number of key/value columns
    pub cols: usize,
    /// Head dimension
    pub head_dim: usize,
    /// Per-operand storage precisions
    pub precisions: PrecisionAssignment,
    /// Per-operand physical transpose flags
    pub transposes: TransposeState,
}

impl AttentionConfig {
    /// New configuration with all operands at f32 and no transposes
    #[must_use]
    pub fn new(rows: usize, cols: usize, head_dim: usize) -> Self {
        Self {
            rows,
            cols,
            head_dim,
            precisions: PrecisionAssignment::attention_f32(),
            transposes: TransposeState::none(),
        }
    }

    /// Replace the precision assignment
    #[must_use]
    pub fn with_precisions(mut self, precisions: PrecisionAssignment) -> Self {
        self.precisions = precisions;
        self
    }

    /// Replace the transpose flags
    #[must_use]
    pub fn with_transposes(mut self, transposes: TransposeState) -> Self {
        self.transposes = transposes;
        self
    }

    /// Logical row-major shape (rows, cols) of one operand
    #[must_use]
    pub fn operand_shape(&self, operand: Operand) -> (usize, usize) {
        match operand {
            Operand::Q | Operand::O | Operand::GradO | Operand::GradQ => {
                (self.rows, self.head_dim)
            }
            Operand::K | Operand::V | Operand::GradV | Operand::GradK => {
                (self.cols, self.head_dim)
            }
            Operand::L | Operand::D => (self.rows, 1),
            // GEMM operands have no meaning in an attention problem.
            Operand::A | Operand::B | Operand::C => (0, 0),
        }
    }

    /// Element count of one operand
    #[must_use]
    pub fn operand_len(&self, operand: Operand) -> usize {
        let (r, c) = self.operand_shape(operand);
        r * c
    }

    /// Softmax scale factor applied to the similarity matrix
    #[must_use]
    pub fn softmax_scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }
}

/// Fully resolved GEMM problem configuration
///
/// Correctness runs use square problems (m = n = k); performance sweeps
/// relax that only by iterating distinct square sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmConfig {
    /// Rows of A and C
    pub m: usize,
    /// Columns of B and C
    pub n: usize,
    /// Columns of A / rows of B
    pub k: usize,
    /// A stored transposed
    pub transpose_a: bool,
    /// B stored transposed
    pub transpose_b: bool,
    /// Per-operand storage precisions
    pub precisions: PrecisionAssignment,
}

impl GemmConfig {
    /// Square problem with all operands at f32
    #[must_use]
    pub fn square(n: usize) -> Self {
        Self {
            m: n,
            n,
            k: n,
            transpose_a: false,
            transpose_b: false,
            precisions: PrecisionAssignment::gemm_f32(),
        }
    }

    /// Set the transpose flags
    #[must_use]
    pub fn with_transposes(mut self, transpose_a: bool, transpose_b: bool) -> Self {
        self.transpose_a = transpose_a;
        self.transpose_b = transpose_b;
        self
    }

    /// Replace the precision assignment
    #[must_use]
    pub fn with_precisions(mut self, precisions: PrecisionAssignment) -> Self {
        self.precisions = precisions;
        self
    }
}

/// Structured description of what a compiled kernel computes
///
/// Hardware backends compile [`KernelSpec::source`]; the emulated backend
/// interprets this descriptor instead. Both views are produced together by
/// the kernel generator, so they cannot drift apart within one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelDescriptor {
    /// One attention pass over a resolved configuration
    Attention {
        /// Problem configuration
        config: AttentionConfig,
        /// Which pass
        variant: KernelVariant,
    },
    /// One GEMM over a resolved configuration
    Gemm {
        /// Problem configuration
        config: GemmConfig,
    },
}

/// Output of the kernel generator for one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Generated kernel source text
    pub source: String,
    /// Structured equivalent of the source, for emulation
    pub descriptor: KernelDescriptor,
    /// Block size along the parallelization dimension
    ///
    /// The dispatch grid is `ceil_div(parallelization_dim, block_size)`
    /// tile groups.
    pub block_size: u32,
    /// Threads per threadgroup
    pub threadgroup_size: u32,
    /// Threadgroup memory footprint in bytes
    pub threadgroup_memory_bytes: u32,
}

impl KernelSpec {
    /// The dimension the kernel parallelizes over
    ///
    /// Forward and backward-query tile over rows; backward-key-value tiles
    /// over columns; GEMM tiles over rows of C.
    #[must_use]
    pub fn parallelization_dim(&self) -> usize {
        match &self.descriptor {
            KernelDescriptor::Attention { config, variant } => match variant {
                KernelVariant::Forward | KernelVariant::BackwardQuery => config.rows,
                KernelVariant::BackwardKeyValue => config.cols,
                KernelVariant::Gemm => 0,
            },
            KernelDescriptor::Gemm { config } => config.m,
        }
    }
}

/// The kernel generator under test
///
/// Injectable so the harness can run against a stub without the real
/// generator or a GPU toolchain present.
pub trait KernelCompiler {
    /// Generate one attention pass kernel
    ///
    /// # Errors
    ///
    /// Returns [`crate::VerificarError::KernelCompile`] if the generator
    /// cannot produce a kernel for the configuration. This aborts the run.
    fn attention_kernel(
        &self,
        config: &AttentionConfig,
        variant: KernelVariant,
    ) -> Result<KernelSpec>;

    /// Generate a GEMM kernel
    ///
    /// # Errors
    ///
    /// Same contract as [`Self::attention_kernel`].
    fn gemm_kernel(&self, config: &GemmConfig) -> Result<KernelSpec>;
}

/// Deterministic stand-in kernel generator
///
/// Produces a synthetic shader skeleton plus tiling numbers chosen the way
/// a real generator would: block size shrinks as the head dimension (and
/// with it the per-row register footprint) grows.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubKernelCompiler;

impl StubKernelCompiler {
    fn block_size_for(head_dim: usize) -> u32 {
        if head_dim <= 32 {
            64
        } else if head_dim <= 96 {
            32
        } else {
            16
        }
    }

    fn render_source(name: &str, block: u32, group: u32) -> String {
        format!(
            "// synthesized kernel: {name}\n\
             // block={block} threadgroup={group}\n\
             kernel void {name}(device const void* buffers [[buffer(0)]]) {{}}\n"
        )
    }
}

impl KernelCompiler for StubKernelCompiler {
    fn attention_kernel(
        &self,
        config: &AttentionConfig,
        variant: KernelVariant,
    ) -> Result<KernelSpec> {
        let block_size = Self::block_size_for(config.head_dim);
        let threadgroup_size = 128;
        // Two tile operands resident per pass at f32 width.
        let threadgroup_memory_bytes =
            (2 * block_size as usize * config.head_dim.max(1) * 4) as u32;
        Ok(KernelSpec {
            source: Self::render_source(variant.name(), block_size, threadgroup_size),
            descriptor: KernelDescriptor::Attention {
                config: config.clone(),
                variant,
            },
            block_size,
            threadgroup_size,
            threadgroup_memory_bytes,
        })
    }

    fn gemm_kernel(&self, config: &GemmConfig) -> Result<KernelSpec> {
        let block_size = 32;
        let threadgroup_size = 128;
        let threadgroup_memory_bytes = 2 * block_size * block_size * 4;
        Ok(KernelSpec {
            source: Self::render_source("gemm", block_size, threadgroup_size),
            descriptor: KernelDescriptor::Gemm {
                config: config.clone(),
            },
            block_size,
            threadgroup_size,
            threadgroup_memory_bytes,
        })
    }
}
