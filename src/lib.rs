//! # Verificar
//!
//! Verification and performance harness for GPU compute kernels.
//!
//! Verificar (Spanish: "to verify") checks flash-attention forward/backward
//! and GEMM kernels against a high-precision CPU oracle, across mixed
//! per-operand storage precisions (f32/f16/bf16) and memory layouts, and
//! profiles their sustained throughput.
//!
//! ## Features
//!
//! - **Injectable backends**: [`gpu::GpuBackend`] and [`kernel::KernelCompiler`]
//!   traits decouple the harness from any one device API
//! - **Honest precision modelling**: operand buffers are quantized through the
//!   same codec a device would use, so tolerance tiers reflect real storage loss
//! - **Full-scan checking**: every element is compared and counted; only the
//!   human-facing report is capped
//! - **Deterministic fixtures**: seeded generation makes every case replayable
//!
//! ## Example
//!
//! ```rust
//! use verificar::gpu::EmulatedBackend;
//! use verificar::kernel::StubKernelCompiler;
//! use verificar::suite::{MemorySink, TestOrchestrator};
//!
//! let mut sink = MemorySink::default();
//! let mut orchestrator = TestOrchestrator::new(EmulatedBackend::new(), StubKernelCompiler, 42);
//! let summary = orchestrator.run_gemm_correctness(&mut sink).unwrap();
//! assert_eq!(summary.cases_failed, 0);
//! assert!(sink.run_completed());
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32/f64 for shapes and rates is acceptable
#![allow(clippy::cast_possible_truncation)] // u128 -> u64 for synthetic timestamps is safe
#![allow(clippy::cast_sign_loss)] // fuzz dimension scaling stays non-negative
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections
#![allow(clippy::float_cmp)] // Allow float comparisons in tests
#![allow(clippy::manual_range_contains)] // Allow manual range checks

/// Element-wise correctness checking with tiered tolerances
pub mod check;
/// Error types for every harness failure mode
pub mod error;
/// Backend abstraction, CPU emulation, and dispatch orchestration
pub mod gpu;
/// Kernel variants, launch configuration, and compilation seam
pub mod kernel;
/// Row/column-major layout adaptation
pub mod layout;
/// Storage precisions, operand identities, and the quantization codec
pub mod precision;
/// Max-retaining throughput measurement
pub mod profile;
/// High-precision CPU oracle for attention and GEMM
pub mod reference;
/// Test orchestration: fixed suites, fuzzing, and progress reporting
pub mod suite;
/// Deterministic test fixtures
pub mod testing;

pub use check::{check, CheckOutcome, ToleranceTier};
pub use error::{Result, VerificarError};
pub use kernel::{AttentionConfig, GemmConfig, KernelVariant};
pub use precision::{Operand, Precision, PrecisionAssignment};
pub use suite::{SuiteSummary, TestOrchestrator};

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
