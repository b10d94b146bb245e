/// Torque model
///
/// Converts a validator's parameters plus the round's network load into
/// a torque value and a self-locking verdict:
///
///   torque  = stake × sin(β) × η / load
///   verdict = tan(φ) ≤ μ × sec(β)
///
/// β and η are clamped to their domains before use. β = 90° always
/// yields verdict = false: sec(β) is undefined there and the
/// configuration is physically degenerate.
///
/// Pure and deterministic; callable concurrently without
/// synchronization.

use crate::config::TorqueConfig;
use crate::registry::Validator;
use crate::types::TorqueReading;
use thiserror::Error;

/// Torque computation errors
///
/// Neither variant is fatal to a round: the caller treats the
/// validator as excluded for this round and moves on.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TorqueError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Numeric overflow in torque computation")]
    NumericOverflow,
}

pub type Result<T> = std::result::Result<T, TorqueError>;

/// Compute one validator's torque reading for this round
pub fn compute_torque(
    validator: &Validator,
    network_load: f64,
    config: &TorqueConfig,
) -> Result<TorqueReading> {
    if !network_load.is_finite() || network_load <= 0.0 {
        return Err(TorqueError::InvalidInput(format!(
            "network load must be a positive finite number, got {}",
            network_load
        )));
    }

    let beta_deg = validator.pressure_angle_deg.clamp(0.0, 90.0);
    let efficiency = validator.efficiency.clamp(0.0, 1.0);
    let beta = beta_deg.to_radians();

    let torque = validator.stake as f64 * beta.sin() * efficiency / network_load;
    if !torque.is_finite() {
        return Err(TorqueError::NumericOverflow);
    }

    Ok(TorqueReading {
        validator: validator.id,
        torque,
        self_lock_ok: self_locking(beta_deg, config),
    })
}

/// Self-locking verdict for a pressure angle (degrees, already clamped)
fn self_locking(beta_deg: f64, config: &TorqueConfig) -> bool {
    if beta_deg >= 90.0 {
        return false;
    }
    let phi = config.friction_angle_deg.to_radians();
    let beta = beta_deg.to_radians();
    // sec(β) = 1 / cos(β); cos(β) > 0 for β in [0°, 90°)
    phi.tan() <= config.friction_coefficient / beta.cos()
}
