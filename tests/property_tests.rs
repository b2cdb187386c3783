//! Property-based tests using proptest
//!
//! Tests mathematical invariants of the core harness modules:
//! - Precision codec round trips
//! - Layout transposition
//! - Grid sizing arithmetic
//! - Correctness-checker counting and report capping

use proptest::prelude::*;
use verificar::check::{check, MAX_REPORTED_ERRORS};
use verificar::gpu::ceil_div;
use verificar::layout::{to_logical, to_physical, transpose};
use verificar::precision::{decode, encode, quantize};
use verificar::Precision;

// ============================================================================
// CODEC PROPERTY TESTS
// ============================================================================

proptest! {
    /// f32 encoding is lossless at the bit level
    #[test]
    fn prop_f32_codec_bit_exact(
        values in prop::collection::vec(
            prop::num::f32::ANY.prop_filter("finite", |x| x.is_finite()),
            0..256
        )
    ) {
        let decoded = decode(&encode(&values, Precision::F32), Precision::F32, values.len())
            .expect("freshly encoded bytes decode");
        for (a, b) in values.iter().zip(decoded.iter()) {
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    /// f16 round trip stays within the format's relative error envelope
    #[test]
    fn prop_f16_roundtrip_bounded(
        values in prop::collection::vec(-1000.0f32..1000.0, 1..256)
    ) {
        let round = quantize(&values, Precision::F16).expect("codec round trip");
        for (a, b) in values.iter().zip(round.iter()) {
            // 10 mantissa bits: relative error under 2^-10, plus an
            // absolute floor for subnormal territory.
            let bound = a.abs() * 1e-3 + 1e-3;
            prop_assert!((a - b).abs() <= bound, "{} -> {}", a, b);
        }
    }

    /// bf16 truncation is idempotent: a second pass changes nothing
    #[test]
    fn prop_bf16_quantize_idempotent(
        values in prop::collection::vec(
            prop::num::f32::ANY.prop_filter("finite", |x| x.is_finite()),
            1..256
        )
    ) {
        let once = quantize(&values, Precision::BF16).expect("codec round trip");
        let twice = quantize(&once, Precision::BF16).expect("codec round trip");
        for (a, b) in once.iter().zip(twice.iter()) {
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    /// bf16 truncation never grows a value's magnitude
    #[test]
    fn prop_bf16_truncation_shrinks_toward_zero(
        values in prop::collection::vec(
            prop::num::f32::ANY.prop_filter("finite", |x| x.is_finite()),
            1..256
        )
    ) {
        let round = quantize(&values, Precision::BF16).expect("codec round trip");
        for (a, b) in values.iter().zip(round.iter()) {
            prop_assert!(b.abs() <= a.abs(), "{} -> {}", a, b);
            prop_assert_eq!(a.is_sign_negative(), b.is_sign_negative());
        }
    }
}

// ============================================================================
// LAYOUT PROPERTY TESTS
// ============================================================================

proptest! {
    /// Transposing twice (with swapped dimensions) is the identity
    #[test]
    fn prop_transpose_involution(rows in 1usize..32, cols in 1usize..32) {
        let data: Vec<f32> = (0..rows * cols).map(|i| i as f32 * 0.5).collect();
        let round = transpose(&transpose(&data, rows, cols), cols, rows);
        prop_assert_eq!(round, data);
    }

    /// Physical/logical conversion round-trips for either flag value
    #[test]
    fn prop_layout_roundtrip(
        rows in 1usize..24,
        cols in 1usize..24,
        transposed in any::<bool>()
    ) {
        let data: Vec<f32> = (0..rows * cols).map(|i| (i as f32 * 0.31).sin()).collect();
        let physical = to_physical(&data, rows, cols, transposed);
        let logical = to_logical(&physical, rows, cols, transposed);
        prop_assert_eq!(logical, data);
    }

    /// Every element survives transposition at the swapped index
    #[test]
    fn prop_transpose_moves_elements(rows in 1usize..16, cols in 1usize..16) {
        let data: Vec<f32> = (0..rows * cols).map(|i| i as f32).collect();
        let t = transpose(&data, rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                prop_assert_eq!(t[c * rows + r], data[r * cols + c]);
            }
        }
    }
}

// ============================================================================
// GRID SIZING PROPERTY TESTS
// ============================================================================

proptest! {
    /// Tile-group counts cover the target without a full spare group
    #[test]
    fn prop_ceil_div_minimal_cover(target in 1usize..100_000, granularity in 1usize..512) {
        let groups = ceil_div(target, granularity).expect("positive granularity");
        prop_assert!(groups * granularity >= target);
        prop_assert!((groups - 1) * granularity < target);
    }
}

// ============================================================================
// CHECKER PROPERTY TESTS
// ============================================================================

proptest! {
    /// The error count is exact while the report never exceeds its cap
    #[test]
    fn prop_check_count_exact_report_capped(
        len in 1usize..500,
        bad in prop::collection::hash_set(0usize..500, 0..40)
    ) {
        let expected = vec![0.0f32; len];
        let mut actual = vec![0.0f32; len];
        let injected: Vec<usize> = bad.into_iter().filter(|&i| i < len).collect();
        for &i in &injected {
            actual[i] = 1.0;
        }
        let outcome = check(&expected, &actual, 0.5);
        prop_assert_eq!(outcome.error_count, injected.len());
        prop_assert!(outcome.report.len() <= MAX_REPORTED_ERRORS);
        prop_assert_eq!(outcome.report.len(), injected.len().min(MAX_REPORTED_ERRORS));
    }

    /// Identical arrays always pass at any positive tolerance
    #[test]
    fn prop_check_identity_passes(
        values in prop::collection::vec(-100.0f32..100.0, 0..300),
        tolerance in 1e-9f32..1.0
    ) {
        let outcome = check(&values, &values, tolerance);
        prop_assert!(outcome.passed());
        prop_assert!(outcome.report.is_empty());
    }
}
