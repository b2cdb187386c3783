//! Storage precisions and the host/device buffer codec
//!
//! Operands are stored on the device at one of three precisions. The codec
//! narrows host `f32` data on upload and widens it back on readback; the
//! precision loss this introduces is deliberate and is absorbed by the
//! tolerance tiers in [`crate::check`], never corrected here.
//!
//! BF16 narrowing keeps the upper 16 bits of the `f32` bit pattern
//! (truncation, not round-to-nearest). The calibrated tolerance constants
//! assume truncation; switching to rounding would invalidate them.

use std::collections::BTreeMap;
use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VerificarError};

/// Device storage precision for one operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    /// 32-bit IEEE float, stored as-is
    F32,
    /// 16-bit IEEE half float
    F16,
    /// Truncated 16-bit float: the upper half of an f32 bit pattern
    BF16,
}

impl Precision {
    /// Bytes occupied by one element at this precision
    #[must_use]
    pub fn size_bytes(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 | Precision::BF16 => 2,
        }
    }

    /// Whether this precision loses information relative to f32
    #[must_use]
    pub fn is_reduced(self) -> bool {
        !matches!(self, Precision::F32)
    }

    /// Explicit mantissa bits of the format, for ordering tolerance tiers
    #[must_use]
    pub fn mantissa_bits(self) -> u32 {
        match self {
            Precision::F32 => 23,
            Precision::F16 => 10,
            Precision::BF16 => 7,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::F32 => write!(f, "f32"),
            Precision::F16 => write!(f, "f16"),
            Precision::BF16 => write!(f, "bf16"),
        }
    }
}

/// Logical operand names shared between the harness and the kernel generator
///
/// The attention operands bind to fixed slots 0..=9 in declaration order;
/// `A`, `B`, `C` are the GEMM operands with their own three-slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// Query matrix, rows x head_dim
    Q,
    /// Key matrix, cols x head_dim
    K,
    /// Value matrix, cols x head_dim
    V,
    /// Attention output, rows x head_dim
    O,
    /// Log-sum-exp normalization term, one per row
    L,
    /// Softmax-denominator gradient term (dO . O per row)
    D,
    /// Gradient of the output, rows x head_dim
    GradO,
    /// Gradient with respect to V, cols x head_dim
    GradV,
    /// Gradient with respect to K, cols x head_dim
    GradK,
    /// Gradient with respect to Q, rows x head_dim
    GradQ,
    /// GEMM left input, m x k
    A,
    /// GEMM right input, k x n
    B,
    /// GEMM output, m x n
    C,
}

impl Operand {
    /// All ten attention operands in slot order
    pub const ATTENTION: [Operand; 10] = [
        Operand::Q,
        Operand::K,
        Operand::V,
        Operand::O,
        Operand::L,
        Operand::D,
        Operand::GradO,
        Operand::GradV,
        Operand::GradK,
        Operand::GradQ,
    ];

    /// The three GEMM operands in slot order
    pub const GEMM: [Operand; 3] = [Operand::A, Operand::B, Operand::C];

    /// Fixed buffer slot index for this operand
    ///
    /// The slot contract is shared with the kernel generator and must not
    /// change: attention slots 0..=9 are Q,K,V,O,L,D,dO,dV,dK,dQ.
    #[must_use]
    pub fn slot(self) -> u32 {
        match self {
            Operand::Q | Operand::A => 0,
            Operand::K | Operand::B => 1,
            Operand::V | Operand::C => 2,
            Operand::O => 3,
            Operand::L => 4,
            Operand::D => 5,
            Operand::GradO => 6,
            Operand::GradV => 7,
            Operand::GradK => 8,
            Operand::GradQ => 9,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operand::Q => "Q",
            Operand::K => "K",
            Operand::V => "V",
            Operand::O => "O",
            Operand::L => "L",
            Operand::D => "D",
            Operand::GradO => "dO",
            Operand::GradV => "dV",
            Operand::GradK => "dK",
            Operand::GradQ => "dQ",
            Operand::A => "A",
            Operand::B => "B",
            Operand::C => "C",
        };
        write!(f, "{name}")
    }
}

/// Mapping from logical operand to its device storage precision
///
/// Every operand a dispatch references must have an entry; a missing entry
/// is a fatal configuration error for the test case, never a silent default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecisionAssignment {
    map: BTreeMap<Operand, Precision>,
}

impl PrecisionAssignment {
    /// Empty assignment
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All ten attention operands at f32
    #[must_use]
    pub fn attention_f32() -> Self {
        let mut assignment = Self::new();
        for operand in Operand::ATTENTION {
            assignment.set(operand, Precision::F32);
        }
        assignment
    }

    /// Attention assignment with the inputs (Q, K, V, dO) at `input` and
    /// everything written by the kernels kept at f32
    #[must_use]
    pub fn attention_inputs(input: Precision) -> Self {
        let mut assignment = Self::attention_f32();
        for operand in [Operand::Q, Operand::K, Operand::V, Operand::GradO] {
            assignment.set(operand, input);
        }
        assignment
    }

    /// All three GEMM operands at f32
    #[must_use]
    pub fn gemm_f32() -> Self {
        Self::gemm(Precision::F32, Precision::F32, Precision::F32)
    }

    /// GEMM assignment with explicit per-operand precisions
    #[must_use]
    pub fn gemm(a: Precision, b: Precision, c: Precision) -> Self {
        let mut assignment = Self::new();
        assignment.set(Operand::A, a);
        assignment.set(Operand::B, b);
        assignment.set(Operand::C, c);
        assignment
    }

    /// Assign a precision to one operand, replacing any previous entry
    pub fn set(&mut self, operand: Operand, precision: Precision) {
        self.map.insert(operand, precision);
    }

    /// Look up the precision for a required operand
    ///
    /// # Errors
    ///
    /// Returns [`VerificarError::MissingPrecision`] if the operand has no
    /// entry. Callers must abort the test case on this error.
    pub fn get(&self, operand: Operand) -> Result<Precision> {
        self.map
            .get(&operand)
            .copied()
            .ok_or(VerificarError::MissingPrecision { operand })
    }

    /// Whether any assigned operand uses a reduced precision
    #[must_use]
    pub fn any_reduced(&self) -> bool {
        self.map.values().any(|p| p.is_reduced())
    }

    /// Fewest mantissa bits across all assigned operands
    ///
    /// Drives tolerance tier selection: the worst-stored operand sets the
    /// tier for the whole case.
    #[must_use]
    pub fn worst_mantissa_bits(&self) -> u32 {
        self.map
            .values()
            .map(|p| p.mantissa_bits())
            .min()
            .unwrap_or(23)
    }
}

/// Encode a host f32 array into device bytes at the given precision
#[must_use]
pub fn encode(values: &[f32], precision: Precision) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * precision.size_bytes());
    match precision {
        Precision::F32 => {
            for v in values {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        Precision::F16 => {
            for v in values {
                bytes.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
            }
        }
        Precision::BF16 => {
            // Truncation: keep the upper 16 bits of the f32 pattern.
            for v in values {
                let upper = (v.to_bits() >> 16) as u16;
                bytes.extend_from_slice(&upper.to_le_bytes());
            }
        }
    }
    bytes
}

/// Decode device bytes back into host f32 values
///
/// # Errors
///
/// Returns [`VerificarError::LengthMismatch`] if the byte count does not
/// match `count` elements at the given precision.
pub fn decode(bytes: &[u8], precision: Precision, count: usize) -> Result<Vec<f32>> {
    let expected_bytes = count * precision.size_bytes();
    if bytes.len() != expected_bytes {
        return Err(VerificarError::LengthMismatch {
            expected: expected_bytes,
            actual: bytes.len(),
        });
    }
    let values = match precision {
        Precision::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Precision::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Precision::BF16 => bytes
            .chunks_exact(2)
            .map(|c| {
                let upper = u16::from_le_bytes([c[0], c[1]]);
                f32::from_bits(u32::from(upper) << 16)
            })
            .collect(),
    };
    Ok(values)
}

/// Round-trip a host array through the codec at one precision
///
/// Convenience for simulating what a kernel would observe after upload.
///
/// # Errors
///
/// Propagates decode errors, which cannot occur for freshly encoded bytes.
pub fn quantize(values: &[f32], precision: Precision) -> Result<Vec<f32>> {
    decode(&encode(values, precision), precision, values.len())
}
