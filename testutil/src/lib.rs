/// Testing utilities for Gearlock
///
/// Provides:
/// - Test data generators
/// - Proptest strategies for validator parameters

pub mod generators;

pub use generators::*;
