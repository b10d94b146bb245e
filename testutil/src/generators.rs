/// Test data generators

use proptest::prelude::*;
use rand::Rng;

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Generate a random transaction payload
pub fn random_transaction() -> Vec<u8> {
    random_bytes(64)
}

/// Generate a batch of random transaction payloads
pub fn random_transactions(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|_| random_transaction()).collect()
}

/// Proptest strategy for a stake amount
pub fn stake_strategy() -> impl Strategy<Value = u64> {
    1u64..=1_000_000
}

/// Proptest strategy for a pressure angle in degrees
pub fn angle_strategy() -> impl Strategy<Value = f64> {
    0.0f64..=90.0
}

/// Proptest strategy for an efficiency factor
pub fn efficiency_strategy() -> impl Strategy<Value = f64> {
    0.0f64..=1.0
}

/// Proptest strategy for a positive network load
pub fn load_strategy() -> impl Strategy<Value = f64> {
    0.1f64..=1000.0
}

/// Proptest strategy for full validator parameters (stake, angle, efficiency)
pub fn validator_params_strategy() -> impl Strategy<Value = (u64, f64, f64)> {
    (stake_strategy(), angle_strategy(), efficiency_strategy())
}
