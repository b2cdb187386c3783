//! Deterministic test fixtures
//!
//! Seeded operand generation for reproducible test cases: the same seed
//! always produces the same data, so the same comparison outcome.

mod generators;

pub use generators::OperandGenerator;
