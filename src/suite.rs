//! Test orchestration
//!
//! Enumerates fixed and randomized test configurations, drives the
//! dispatch/check/profile cycle for each one, and streams timestamped
//! progress events to a caller-supplied sink. The orchestrator runs on a
//! single control thread; dispatches block synchronously, so no two cases
//! ever share buffers or race the reference computation.
//!
//! Message text is part of the observable interface: consumers treat any
//! occurrence of "error" or "failed" as a failure signal, and the run-end
//! event always contains the substring "complete".

use std::time::SystemTime;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::check::{check, CheckOutcome, ToleranceTier, MAX_REPORTED_ERRORS};
use crate::error::Result;
use crate::gpu::backend::GpuBackend;
use crate::gpu::pipeline::{run_attention, run_gemm, time_attention_variant, time_gemm};
use crate::kernel::{AttentionConfig, GemmConfig, KernelCompiler, KernelVariant};
use crate::layout::TransposeState;
use crate::precision::{Operand, Precision, PrecisionAssignment};
use crate::profile::{attention_ops, gemm_flops, profile_max, ProfileConfig, ThroughputSample};
use crate::reference::{laplacian_expected, laplacian_matrix, NaiveReference, ReferenceEngine};
use crate::testing::OperandGenerator;

/// One timestamped progress line
///
/// Append-only from the consumer's point of view; never mutated after
/// creation.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Wall-clock time the event was produced
    pub timestamp: SystemTime,
    /// Human-readable progress line
    pub message: String,
    /// Whether the line reports a failure
    pub is_error: bool,
}

impl ProgressEvent {
    fn now(message: String, is_error: bool) -> Self {
        Self {
            timestamp: SystemTime::now(),
            message,
            is_error,
        }
    }
}

/// Consumer of the progress stream
pub trait ProgressSink {
    /// Receive one event; called once per completed test case and once at
    /// run completion
    fn on_event(&mut self, event: ProgressEvent);
}

/// Sink collecting events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Vec<ProgressEvent>,
}

impl MemorySink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far, in order
    #[must_use]
    pub fn events(&self) -> &[ProgressEvent] {
        &self.events
    }

    /// Whether any event carried a failure signal
    ///
    /// Applies the textual contract consumers use: the error flag, or the
    /// substrings "error"/"failed" in any message.
    #[must_use]
    pub fn has_failure_signal(&self) -> bool {
        self.events.iter().any(|e| {
            let lower = e.message.to_lowercase();
            e.is_error || lower.contains("error") || lower.contains("failed")
        })
    }

    /// Whether a run-completion event has been received
    #[must_use]
    pub fn run_completed(&self) -> bool {
        self.events.iter().any(|e| e.message.contains("complete"))
    }
}

impl ProgressSink for MemorySink {
    fn on_event(&mut self, event: ProgressEvent) {
        self.events.push(event);
    }
}

/// Sink forwarding events to the tracing layer
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_event(&mut self, event: ProgressEvent) {
        if event.is_error {
            error!("{}", event.message);
        } else {
            info!("{}", event.message);
        }
    }
}

/// Orchestrator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No run in progress
    Idle,
    /// A run has started
    Running,
    /// Submitting GPU work for the current case
    Dispatching,
    /// Comparing device output against the oracle
    Checking,
    /// Timing repeated dispatches
    Profiling,
    /// Emitting the current case's result
    Reporting,
    /// The last run finished
    Completed,
}

/// Aggregated result of one correctness or fuzz run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteSummary {
    /// Cases attempted
    pub cases_run: usize,
    /// Cases with at least one mismatch or a configuration error
    pub cases_failed: usize,
    /// Total mismatches across all cases, uncapped
    pub total_errors: usize,
}

/// Randomized-mode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzConfig {
    /// Number of randomized cases to draw
    pub cases: usize,
    /// Upper bound for the row dimension
    pub max_rows: usize,
    /// Upper bound for the column dimension
    pub max_cols: usize,
    /// Upper bound for the head dimension
    pub max_head_dim: usize,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            cases: 32,
            max_rows: 512,
            max_cols: 512,
            max_head_dim: 64,
        }
    }
}

/// Throughput record for one attention variant at one shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttentionPerfRecord {
    /// Row dimension
    pub rows: usize,
    /// Column dimension
    pub cols: usize,
    /// Head dimension
    pub head_dim: usize,
    /// Profiled variant
    pub variant: KernelVariant,
    /// Best observed throughput
    pub sample: ThroughputSample,
}

/// Throughput record for one GEMM size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GemmPerfRecord {
    /// Square problem size
    pub n: usize,
    /// Best observed throughput
    pub sample: ThroughputSample,
}

/// Hand-chosen attention correctness shapes: boundary sizes, non-powers of
/// two, rectangular and adversarial aspect ratios
const ATTENTION_SHAPES: &[(usize, usize, usize)] = &[
    (1, 1, 1),
    (8, 8, 2),
    (7, 13, 3),
    (25, 10, 3),
    (10, 25, 3),
    (64, 64, 16),
    (33, 95, 11),
    (128, 128, 32),
    (777, 199, 16),
];

/// Shapes for the reduced-precision tier, kept moderate so the absolute
/// tolerance tables stay meaningful
const REDUCED_SHAPES: &[(usize, usize, usize)] = &[(8, 8, 2), (32, 32, 8), (64, 64, 16)];

/// GEMM correctness sizes (square problems)
const GEMM_SIZES: &[usize] = &[1, 2, 7, 16, 64, 129];

/// Literal transpose-state list for GEMM correctness
const GEMM_TRANSPOSES: &[(bool, bool)] = &[(false, false), (true, false), (false, true), (true, true)];

/// Mismatch count and capped element detail for one completed case
///
/// The count is uncapped; the detail keeps at most [`MAX_REPORTED_ERRORS`]
/// formatted entries across all compared operands.
#[derive(Debug, Default)]
struct CaseResult {
    errors: usize,
    details: Vec<String>,
}

impl CaseResult {
    fn absorb(&mut self, operand: Operand, outcome: &CheckOutcome) {
        self.errors += outcome.error_count;
        for entry in &outcome.report {
            if self.details.len() >= MAX_REPORTED_ERRORS {
                break;
            }
            self.details.push(format!(
                "{operand}[{}]: expected {}, actual {}, diff {}",
                entry.index, entry.expected, entry.actual, entry.difference
            ));
        }
    }
}

/// Drives test cases through the dispatch, check, and profile cycles
///
/// Generic over the backend, the kernel generator under test, and the
/// reference oracle, so every collaborator can be substituted in tests.
pub struct TestOrchestrator<B, C, R = NaiveReference> {
    backend: B,
    compiler: C,
    reference: R,
    seed: u64,
    state: RunState,
}

impl<B: GpuBackend, C: KernelCompiler> TestOrchestrator<B, C, NaiveReference> {
    /// Orchestrator with the built-in naive oracle
    pub fn new(backend: B, compiler: C, seed: u64) -> Self {
        Self::with_reference(backend, compiler, NaiveReference, seed)
    }
}

impl<B: GpuBackend, C: KernelCompiler, R: ReferenceEngine> TestOrchestrator<B, C, R> {
    /// Orchestrator with an explicit reference oracle
    pub fn with_reference(backend: B, compiler: C, reference: R, seed: u64) -> Self {
        Self {
            backend,
            compiler,
            reference,
            seed,
            state: RunState::Idle,
        }
    }

    /// Current state-machine position
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    fn emit(sink: &mut dyn ProgressSink, message: String, is_error: bool) {
        sink.on_event(ProgressEvent::now(message, is_error));
    }

    /// Emit the failure line for one case plus its capped element detail
    ///
    /// The uncapped count travels in the summary line for tooling; the
    /// detail lines carry the representative sample humans read.
    fn emit_failure(
        sink: &mut dyn ProgressSink,
        description: &str,
        result: &CaseResult,
    ) {
        Self::emit(
            sink,
            format!("{description} FAILED: {} errors", result.errors),
            true,
        );
        for detail in &result.details {
            Self::emit(sink, format!("  {detail}"), true);
        }
    }

    /// Run one attention case end to end, returning its mismatch count
    /// and the capped element-level detail
    fn attention_case(&mut self, case_seed: u64, config: &AttentionConfig) -> Result<CaseResult> {
        self.state = RunState::Dispatching;
        let generator = OperandGenerator::new(case_seed);
        let inputs = generator.attention_inputs(config);
        let run = run_attention(&mut self.backend, &self.compiler, config, &inputs)?;

        self.state = RunState::Checking;
        let expected = self.reference.all(config, &inputs);
        let tier = ToleranceTier::for_assignment(&config.precisions);
        let comparisons: [(Operand, &[f32], &[f32]); 6] = [
            (Operand::O, &expected.o, &run.outputs.o),
            (Operand::L, &expected.l, &run.outputs.l),
            (Operand::D, &expected.d, &run.outputs.d),
            (Operand::GradV, &expected.grad_v, &run.outputs.grad_v),
            (Operand::GradK, &expected.grad_k, &run.outputs.grad_k),
            (Operand::GradQ, &expected.grad_q, &run.outputs.grad_q),
        ];
        let mut result = CaseResult::default();
        for (operand, exp, act) in comparisons {
            let outcome = check(exp, act, tier.tolerance(operand));
            result.absorb(operand, &outcome);
        }

        self.state = RunState::Reporting;
        Ok(result)
    }

    fn describe(config: &AttentionConfig) -> String {
        let tier = match ToleranceTier::for_assignment(&config.precisions) {
            ToleranceTier::Full => "full",
            ToleranceTier::Half => "half",
            ToleranceTier::Truncated => "truncated",
        };
        format!(
            "attention {}x{}x{} tier={tier}",
            config.rows, config.cols, config.head_dim
        )
    }

    /// Drive an explicit list of attention configurations
    ///
    /// # Errors
    ///
    /// Returns the first run-fatal error (kernel compile or backend
    /// failure); per-case configuration errors are contained and counted.
    pub fn run_attention_cases(
        &mut self,
        configs: &[AttentionConfig],
        sink: &mut dyn ProgressSink,
    ) -> Result<SuiteSummary> {
        self.state = RunState::Running;
        let mut summary = SuiteSummary::default();
        for (index, config) in configs.iter().enumerate() {
            let case_seed = self.seed.wrapping_add(index as u64 * 1009);
            match self.attention_case(case_seed, config) {
                Ok(result) if result.errors == 0 => {
                    summary.cases_run += 1;
                    Self::emit(
                        sink,
                        format!("{} ok (0 mismatches)", Self::describe(config)),
                        false,
                    );
                }
                Ok(result) => {
                    summary.cases_run += 1;
                    summary.cases_failed += 1;
                    summary.total_errors += result.errors;
                    Self::emit_failure(sink, &Self::describe(config), &result);
                }
                Err(e) if e.is_fatal_for_run() => {
                    Self::emit(
                        sink,
                        format!("{} aborted run: {e}", Self::describe(config)),
                        true,
                    );
                    self.state = RunState::Idle;
                    return Err(e);
                }
                Err(e) => {
                    summary.cases_run += 1;
                    summary.cases_failed += 1;
                    Self::emit(
                        sink,
                        format!("{} failed configuration: {e}", Self::describe(config)),
                        true,
                    );
                }
            }
        }
        self.finish_correctness("attention correctness", &summary, sink);
        Ok(summary)
    }

    /// Fixed-case attention correctness sweep
    ///
    /// Covers the hand-chosen boundary shapes at full precision, then the
    /// reduced-precision tiers with f16 and bf16 inputs.
    ///
    /// # Errors
    ///
    /// Same containment policy as [`Self::run_attention_cases`].
    pub fn run_attention_correctness(
        &mut self,
        sink: &mut dyn ProgressSink,
    ) -> Result<SuiteSummary> {
        let mut configs = Vec::new();
        for &(rows, cols, head_dim) in ATTENTION_SHAPES {
            configs.push(AttentionConfig::new(rows, cols, head_dim));
        }
        for precision in [Precision::F16, Precision::BF16] {
            for &(rows, cols, head_dim) in REDUCED_SHAPES {
                configs.push(
                    AttentionConfig::new(rows, cols, head_dim)
                        .with_precisions(PrecisionAssignment::attention_inputs(precision)),
                );
            }
        }
        self.run_attention_cases(&configs, sink)
    }

    /// Randomized attention sweep
    ///
    /// Dimensions come from cubing a uniform sample before scaling, so
    /// small (and adversarially skewed) shapes are heavily oversampled;
    /// zero draws clamp up to 1. Input precisions and all four transpose
    /// flags are drawn independently per case.
    ///
    /// # Errors
    ///
    /// Same containment policy as [`Self::run_attention_cases`].
    pub fn run_attention_fuzz(
        &mut self,
        fuzz: &FuzzConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<SuiteSummary> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut configs = Vec::with_capacity(fuzz.cases);
        for _ in 0..fuzz.cases {
            let rows = skewed_dim(&mut rng, fuzz.max_rows);
            let cols = skewed_dim(&mut rng, fuzz.max_cols);
            let head_dim = skewed_dim(&mut rng, fuzz.max_head_dim);

            let mut precisions = PrecisionAssignment::attention_f32();
            for operand in [Operand::Q, Operand::K, Operand::V, Operand::GradO] {
                precisions.set(operand, random_precision(&mut rng));
            }
            let transposes = TransposeState {
                q: rng.gen_bool(0.5),
                k: rng.gen_bool(0.5),
                v: rng.gen_bool(0.5),
                o: rng.gen_bool(0.5),
            };
            configs.push(
                AttentionConfig::new(rows, cols, head_dim)
                    .with_precisions(precisions)
                    .with_transposes(transposes),
            );
        }
        self.run_attention_cases(&configs, sink)
    }

    /// Fixed-case GEMM correctness sweep over the Laplacian operator
    ///
    /// Square sizes times the literal transpose-state list at full
    /// precision, plus reduced-precision input cases. Expected output
    /// comes from the Laplacian closed form, not a second multiplication.
    ///
    /// # Errors
    ///
    /// Same containment policy as the attention sweeps.
    pub fn run_gemm_correctness(&mut self, sink: &mut dyn ProgressSink) -> Result<SuiteSummary> {
        self.state = RunState::Running;
        let mut configs = Vec::new();
        for &n in GEMM_SIZES {
            for &(ta, tb) in GEMM_TRANSPOSES {
                configs.push(GemmConfig::square(n).with_transposes(ta, tb));
            }
        }
        for precision in [Precision::F16, Precision::BF16] {
            for n in [16usize, 64] {
                configs.push(GemmConfig::square(n).with_precisions(PrecisionAssignment::gemm(
                    precision,
                    precision,
                    Precision::F32,
                )));
            }
        }

        let mut summary = SuiteSummary::default();
        for (index, config) in configs.iter().enumerate() {
            let case_seed = self.seed.wrapping_add(index as u64 * 2003);
            match self.gemm_case(case_seed, config) {
                Ok(result) if result.errors == 0 => {
                    summary.cases_run += 1;
                    Self::emit(
                        sink,
                        format!("{} ok (0 mismatches)", describe_gemm(config)),
                        false,
                    );
                }
                Ok(result) => {
                    summary.cases_run += 1;
                    summary.cases_failed += 1;
                    summary.total_errors += result.errors;
                    Self::emit_failure(sink, &describe_gemm(config), &result);
                }
                Err(e) if e.is_fatal_for_run() => {
                    Self::emit(
                        sink,
                        format!("{} aborted run: {e}", describe_gemm(config)),
                        true,
                    );
                    self.state = RunState::Idle;
                    return Err(e);
                }
                Err(e) => {
                    summary.cases_run += 1;
                    summary.cases_failed += 1;
                    Self::emit(
                        sink,
                        format!("{} failed configuration: {e}", describe_gemm(config)),
                        true,
                    );
                }
            }
        }
        self.finish_correctness("gemm correctness", &summary, sink);
        Ok(summary)
    }

    fn gemm_case(&mut self, case_seed: u64, config: &GemmConfig) -> Result<CaseResult> {
        self.state = RunState::Dispatching;
        let generator = OperandGenerator::new(case_seed);
        let a = laplacian_matrix(config.m);
        let b = generator.matrix(11, config.k, config.n);
        let run = run_gemm(&mut self.backend, &self.compiler, config, &a, &b)?;

        self.state = RunState::Checking;
        let expected = laplacian_expected(&b, config.m, config.n);
        let tier = ToleranceTier::for_assignment(&config.precisions);
        let outcome = check(&expected, &run.c, tier.tolerance(Operand::C));
        let mut result = CaseResult::default();
        result.absorb(Operand::C, &outcome);

        self.state = RunState::Reporting;
        Ok(result)
    }

    /// Attention throughput sweep over the given shapes
    ///
    /// Profiles every variant at every shape, reporting instructions per
    /// second truncated to whole giga-units.
    ///
    /// # Errors
    ///
    /// Any dispatch failure aborts the sweep; there is no per-record
    /// containment because profiling has no notion of a failed-but-counted
    /// case.
    pub fn run_attention_performance(
        &mut self,
        shapes: &[(usize, usize, usize)],
        profile: &ProfileConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<Vec<AttentionPerfRecord>> {
        self.state = RunState::Running;
        let mut records = Vec::new();
        for &(rows, cols, head_dim) in shapes {
            let config = AttentionConfig::new(rows, cols, head_dim);
            let inputs = OperandGenerator::new(self.seed).attention_inputs(&config);
            for variant in KernelVariant::ATTENTION_ORDER {
                self.state = RunState::Profiling;
                let ops_per_trial =
                    attention_ops(variant, &config) * profile.dispatches_per_trial as u64;
                let backend = &mut self.backend;
                let compiler = &self.compiler;
                let sample = profile_max(profile, ops_per_trial, || {
                    time_attention_variant(
                        backend,
                        compiler,
                        &config,
                        &inputs,
                        variant,
                        profile.dispatches_per_trial,
                    )
                })?;
                self.state = RunState::Reporting;
                Self::emit(
                    sink,
                    format!(
                        "attention {rows}x{cols}x{head_dim} {}: {} GINSTRS/s",
                        variant.name(),
                        sample.giga_per_second
                    ),
                    false,
                );
                records.push(AttentionPerfRecord {
                    rows,
                    cols,
                    head_dim,
                    variant,
                    sample,
                });
            }
        }
        Self::emit(
            sink,
            format!(
                "attention performance sweep complete: {} samples",
                records.len()
            ),
            false,
        );
        self.state = RunState::Completed;
        Ok(records)
    }

    /// GEMM throughput sweep over square sizes
    ///
    /// # Errors
    ///
    /// Same abort-on-failure policy as the attention sweep.
    pub fn run_gemm_performance(
        &mut self,
        sizes: &[usize],
        profile: &ProfileConfig,
        sink: &mut dyn ProgressSink,
    ) -> Result<Vec<GemmPerfRecord>> {
        self.state = RunState::Running;
        let mut records = Vec::new();
        for &n in sizes {
            let config = GemmConfig::square(n);
            let generator = OperandGenerator::new(self.seed);
            let a = laplacian_matrix(n);
            let b = generator.matrix(11, n, n);
            self.state = RunState::Profiling;
            let ops_per_trial = gemm_flops(&config) * profile.dispatches_per_trial as u64;
            let backend = &mut self.backend;
            let compiler = &self.compiler;
            let sample = profile_max(profile, ops_per_trial, || {
                time_gemm(
                    backend,
                    compiler,
                    &config,
                    &a,
                    &b,
                    profile.dispatches_per_trial,
                )
            })?;
            self.state = RunState::Reporting;
            Self::emit(
                sink,
                format!("gemm {n}x{n}x{n}: {} GFLOPS", sample.giga_per_second),
                false,
            );
            records.push(GemmPerfRecord { n, sample });
        }
        Self::emit(
            sink,
            format!("gemm performance sweep complete: {} samples", records.len()),
            false,
        );
        self.state = RunState::Completed;
        Ok(records)
    }

    fn finish_correctness(
        &mut self,
        label: &str,
        summary: &SuiteSummary,
        sink: &mut dyn ProgressSink,
    ) {
        if summary.total_errors == 0 && summary.cases_failed == 0 {
            Self::emit(
                sink,
                format!(
                    "{label} complete: {} cases passed, 0 mismatches",
                    summary.cases_run
                ),
                false,
            );
        } else {
            Self::emit(
                sink,
                format!(
                    "{label} complete: {} of {} cases failed, {} errors total",
                    summary.cases_failed, summary.cases_run, summary.total_errors
                ),
                true,
            );
        }
        self.state = RunState::Completed;
    }
}

fn describe_gemm(config: &GemmConfig) -> String {
    let tier = match ToleranceTier::for_assignment(&config.precisions) {
        ToleranceTier::Full => "full",
        ToleranceTier::Half => "half",
        ToleranceTier::Truncated => "truncated",
    };
    format!(
        "gemm {}x{}x{} A{}B{} tier={tier}",
        config.m,
        config.n,
        config.k,
        if config.transpose_a { "T" } else { "" },
        if config.transpose_b { "T" } else { "" },
    )
}

/// Draw a dimension with small sizes over-represented
///
/// Cubes a uniform [0,1) sample before scaling; edge cases live at small
/// dimensions, so they are deliberately oversampled. Zero clamps to 1.
fn skewed_dim(rng: &mut StdRng, max: usize) -> usize {
    let u: f64 = rng.gen();
    ((u * u * u * max as f64) as usize).max(1)
}

fn random_precision(rng: &mut StdRng) -> Precision {
    match rng.gen_range(0..3) {
        0 => Precision::F32,
        1 => Precision::F16,
        _ => Precision::BF16,
    }
}
