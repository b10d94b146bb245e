/// Proposer selection
///
/// Computes a torque reading for every active validator in the round
/// snapshot, filters to self-locking validators at or above the minimum
/// proposer torque, and picks the strict maximum, breaking ties by
/// lowest id. Every node runs this against the same snapshot and load
/// sample and must arrive at the same proposer; determinism is the
/// whole point.

use crate::config::TorqueConfig;
use crate::registry::{Validator, ValidatorSnapshot};
use crate::torque::compute_torque;
use crate::types::TorqueReading;
use thiserror::Error;
use tracing::debug;

/// Below this many active validators the readings are computed
/// serially; above it the work is chunked across scoped threads.
const PARALLEL_THRESHOLD: usize = 64;

/// Selection errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No eligible proposer in this round")]
    NoEligibleProposer,
}

/// Result of a successful selection
#[derive(Clone, Debug)]
pub struct Selection {
    /// The winning reading (validator id + torque)
    pub proposer: TorqueReading,

    /// All readings that survived the eligibility filter, id order
    pub eligible: Vec<TorqueReading>,
}

/// Compute readings for every active validator in the snapshot
///
/// Validators whose computation fails (degenerate parameters, overflow)
/// are excluded for this round, never fatal. Output is id-sorted on
/// both the serial and parallel paths, so the two are interchangeable.
pub fn compute_readings(
    snapshot: &ValidatorSnapshot,
    network_load: f64,
    config: &TorqueConfig,
) -> Vec<TorqueReading> {
    let active: Vec<&Validator> = snapshot.active_validators().collect();

    let mut readings = if active.len() < PARALLEL_THRESHOLD {
        active
            .iter()
            .filter_map(|v| read_one(v, network_load, config))
            .collect::<Vec<_>>()
    } else {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let chunk_size = active.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = active
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .filter_map(|v| read_one(v, network_load, config))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().expect("torque worker panicked"))
                .collect()
        })
    };

    readings.sort_by_key(|r| r.validator);
    readings
}

fn read_one(
    validator: &Validator,
    network_load: f64,
    config: &TorqueConfig,
) -> Option<TorqueReading> {
    match compute_torque(validator, network_load, config) {
        Ok(reading) => Some(reading),
        Err(e) => {
            debug!(id = %validator.id, error = %e, "validator excluded this round");
            None
        }
    }
}

/// Pick the round's proposer from the snapshot
pub fn select_proposer(
    snapshot: &ValidatorSnapshot,
    network_load: f64,
    config: &TorqueConfig,
) -> Result<Selection, SelectionError> {
    let eligible: Vec<TorqueReading> = compute_readings(snapshot, network_load, config)
        .into_iter()
        .filter(|r| r.self_lock_ok && r.torque >= config.min_proposer_torque)
        .collect();

    // Maximum torque wins; the id-sorted scan makes the lowest id win
    // ties because later equal readings do not displace the leader.
    let proposer = eligible
        .iter()
        .copied()
        .fold(None::<TorqueReading>, |best, r| match best {
            Some(b) if r.torque > b.torque => Some(r),
            Some(b) => Some(b),
            None => Some(r),
        })
        .ok_or(SelectionError::NoEligibleProposer)?;

    Ok(Selection { proposer, eligible })
}
