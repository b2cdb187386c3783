//! Element-wise correctness checking under precision-tiered tolerances
//!
//! The checker always walks the full array, counting every violation, but
//! the detailed report is capped at [`MAX_REPORTED_ERRORS`] entries. The
//! count/detail split is load-bearing: downstream tooling reads the full
//! count while humans read the capped sample, and neither side may be
//! collapsed into the other.

use serde::{Deserialize, Serialize};

use crate::precision::{Operand, PrecisionAssignment};

/// Maximum number of mismatches carried in a detailed report
pub const MAX_REPORTED_ERRORS: usize = 10;

/// Tight tolerance when every operand is stored at f32
pub const TIGHT_TOLERANCE: f32 = 2e-5;

/// One reported mismatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Element index in the flattened array
    pub index: usize,
    /// Value the reference oracle produced
    pub expected: f32,
    /// Value read back from the device
    pub actual: f32,
    /// Magnitude of the difference
    pub difference: f32,
}

/// Result of comparing one operand array
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Total violations found, uncapped
    pub error_count: usize,
    /// At most [`MAX_REPORTED_ERRORS`] representative mismatches
    pub report: Vec<ErrorEntry>,
}

impl CheckOutcome {
    /// Whether the comparison found no violations
    #[must_use]
    pub fn passed(&self) -> bool {
        self.error_count == 0
    }
}

/// Compare expected against actual under an absolute tolerance
///
/// A length mismatch is itself counted and reported as an error rather
/// than aborting, so the suite can continue; the overlapping prefix is
/// still compared. Elements where both sides are NaN or infinite agree by
/// degeneracy and are never flagged: the reference path can legitimately
/// produce non-finite values the kernel only reproduces in kind.
#[must_use]
pub fn check(expected: &[f32], actual: &[f32], tolerance: f32) -> CheckOutcome {
    let mut outcome = CheckOutcome::default();

    if expected.len() != actual.len() {
        outcome.error_count += 1;
        outcome.report.push(ErrorEntry {
            index: expected.len().min(actual.len()),
            expected: expected.len() as f32,
            actual: actual.len() as f32,
            difference: expected.len().abs_diff(actual.len()) as f32,
        });
    }

    for (index, (&e, &a)) in expected.iter().zip(actual.iter()).enumerate() {
        let both_degenerate = (e.is_nan() || e.is_infinite()) && (a.is_nan() || a.is_infinite());
        if both_degenerate {
            continue;
        }
        let difference = (e - a).abs();
        if difference.is_nan() || difference > tolerance {
            outcome.error_count += 1;
            if outcome.report.len() < MAX_REPORTED_ERRORS {
                outcome.report.push(ErrorEntry {
                    index,
                    expected: e,
                    actual: a,
                    difference,
                });
            }
        }
    }
    outcome
}

/// Tolerance tier selected from a test case's precision assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToleranceTier {
    /// All operands at f32
    Full,
    /// Worst operand stored at f16
    Half,
    /// Worst operand stored at bf16
    Truncated,
}

impl ToleranceTier {
    /// Pick the tier for a precision assignment
    ///
    /// The operand with the fewest mantissa bits sets the tier for the
    /// whole case.
    #[must_use]
    pub fn for_assignment(assignment: &PrecisionAssignment) -> Self {
        match assignment.worst_mantissa_bits() {
            23.. => ToleranceTier::Full,
            10..=22 => ToleranceTier::Half,
            _ => ToleranceTier::Truncated,
        }
    }

    /// Absolute tolerance for one operand in this tier
    ///
    /// The normalization terms L and D accumulate more rounding error per
    /// element than the main output, so their reduced-precision bounds are
    /// looser. Bounds widen monotonically as mantissa bits shrink.
    #[must_use]
    pub fn tolerance(self, operand: Operand) -> f32 {
        match self {
            ToleranceTier::Full => TIGHT_TOLERANCE,
            ToleranceTier::Half => match operand {
                Operand::O | Operand::C | Operand::GradV => 5e-3,
                Operand::GradK | Operand::GradQ => 2e-2,
                Operand::L => 1e-1,
                Operand::D => 1.5e-1,
                _ => 5e-3,
            },
            ToleranceTier::Truncated => match operand {
                Operand::O | Operand::GradV => 3e-2,
                // Truncation bias compounds across the three stencil taps.
                Operand::C => 5e-2,
                Operand::GradK | Operand::GradQ => 5e-2,
                Operand::L => 2e-1,
                Operand::D => 3e-1,
                _ => 3e-2,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::precision::Precision;

    #[test]
    fn test_exact_match_passes() {
        let data = vec![1.0, 2.0, 3.0];
        let outcome = check(&data, &data, TIGHT_TOLERANCE);
        assert!(outcome.passed());
        assert!(outcome.report.is_empty());
    }

    #[test]
    fn test_violation_counted_and_reported() {
        let expected = vec![1.0, 2.0, 3.0];
        let actual = vec![1.0, 2.5, 3.0];
        let outcome = check(&expected, &actual, 0.1);
        assert_eq!(outcome.error_count, 1);
        assert_eq!(outcome.report[0].index, 1);
        assert!((outcome.report[0].difference - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_report_capped_count_uncapped() {
        let expected = vec![0.0f32; 1000];
        let actual = vec![1.0f32; 1000];
        let outcome = check(&expected, &actual, 0.5);
        assert_eq!(outcome.error_count, 1000);
        assert_eq!(outcome.report.len(), MAX_REPORTED_ERRORS);
    }

    #[test]
    fn test_scan_continues_past_cap() {
        // Mismatches only at the front; matches after the cap must not be
        // miscounted once reporting stops.
        let mut expected = vec![0.0f32; 50];
        let actual = vec![1.0f32; 50];
        for e in expected.iter_mut().skip(20) {
            *e = 1.0;
        }
        let outcome = check(&expected, &actual, 0.5);
        assert_eq!(outcome.error_count, 20);
        assert_eq!(outcome.report.len(), MAX_REPORTED_ERRORS);
    }

    #[test]
    fn test_nan_agreement_not_flagged() {
        let expected = vec![f32::NAN, f32::INFINITY, 1.0];
        let actual = vec![f32::NAN, f32::NEG_INFINITY, 1.0];
        let outcome = check(&expected, &actual, 1e-5);
        assert!(outcome.passed());
    }

    #[test]
    fn test_nan_disagreement_flagged() {
        let expected = vec![f32::NAN];
        let actual = vec![1.0];
        let outcome = check(&expected, &actual, 1e-5);
        assert_eq!(outcome.error_count, 1);
    }

    #[test]
    fn test_infinity_against_finite_flagged() {
        let outcome = check(&[f32::INFINITY], &[1.0e10], 1e-5);
        assert_eq!(outcome.error_count, 1);
    }

    #[test]
    fn test_length_mismatch_reported_not_fatal() {
        let expected = vec![1.0, 2.0, 3.0];
        let actual = vec![1.0, 2.0];
        let outcome = check(&expected, &actual, 1e-5);
        assert_eq!(outcome.error_count, 1);
        assert_eq!(outcome.report.len(), 1);
        // Prefix still compared: add a prefix violation on top.
        let actual = vec![9.0, 2.0];
        let outcome = check(&expected, &actual, 1e-5);
        assert_eq!(outcome.error_count, 2);
    }

    #[test]
    fn test_tier_selection() {
        assert_eq!(
            ToleranceTier::for_assignment(&PrecisionAssignment::attention_f32()),
            ToleranceTier::Full
        );
        assert_eq!(
            ToleranceTier::for_assignment(&PrecisionAssignment::attention_inputs(Precision::F16)),
            ToleranceTier::Half
        );
        assert_eq!(
            ToleranceTier::for_assignment(&PrecisionAssignment::attention_inputs(Precision::BF16)),
            ToleranceTier::Truncated
        );
    }

    #[test]
    fn test_tolerances_loosen_monotonically() {
        for operand in Operand::ATTENTION {
            let full = ToleranceTier::Full.tolerance(operand);
            let half = ToleranceTier::Half.tolerance(operand);
            let truncated = ToleranceTier::Truncated.tolerance(operand);
            assert!(full <= half, "{operand}");
            assert!(half <= truncated, "{operand}");
        }
    }

    #[test]
    fn test_normalization_terms_looser_than_output() {
        for tier in [ToleranceTier::Half, ToleranceTier::Truncated] {
            assert!(tier.tolerance(Operand::L) > tier.tolerance(Operand::O));
            assert!(tier.tolerance(Operand::D) > tier.tolerance(Operand::O));
        }
    }
}
