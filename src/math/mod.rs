//! Miscellaneous math functions for general use

/// Free functions for handling angular units, wraparound,
/// and unit-in-the-last-place measures.
pub mod angular;

/// Exact rational arithmetic on 64 bit numerator/denominator pairs.
pub mod rational;

/// Compensated (Neumaier) summation.
pub mod sum;

pub use angular::{ulp, ulp_f32};
pub use sum::Accumulator;
