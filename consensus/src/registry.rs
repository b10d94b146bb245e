/// Validator registry with snapshot isolation
///
/// The registry is the authoritative mapping of validators and their
/// parameters. Consensus never reads it directly: each round takes one
/// immutable, versioned snapshot, so external governance/slashing
/// updates landing mid-round cannot change an in-progress round's view.

use crate::types::ValidatorId;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Validator not found: {0}")]
    NotFound(ValidatorId),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A validator and its torque parameters
#[derive(Clone, Debug, PartialEq)]
pub struct Validator {
    pub id: ValidatorId,

    /// Stake in base units
    pub stake: u64,

    /// Pressure angle β in degrees, domain [0, 90]
    pub pressure_angle_deg: f64,

    /// Mechanical efficiency η, domain [0, 1]
    pub efficiency: f64,

    /// Inactive validators are excluded from selection and voting
    pub active: bool,

    /// Unix timestamp of last observed activity
    pub last_active: u64,
}

impl Validator {
    pub fn new(id: ValidatorId, stake: u64, pressure_angle_deg: f64, efficiency: f64) -> Self {
        Self {
            id,
            stake,
            pressure_angle_deg,
            efficiency,
            active: true,
            last_active: 0,
        }
    }
}

/// Immutable view of the validator set at a point in time
///
/// Validators are stored sorted by id so that every node iterates the
/// identical sequence when computing readings and tie-breaks.
#[derive(Clone, Debug)]
pub struct ValidatorSnapshot {
    version: u64,
    validators: Vec<Validator>,
}

impl ValidatorSnapshot {
    /// Registry version this snapshot was taken at
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All validators, active or not, in id order
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Active validators in id order
    pub fn active_validators(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter().filter(|v| v.active)
    }

    pub fn get(&self, id: ValidatorId) -> Option<&Validator> {
        self.validators
            .binary_search_by_key(&id, |v| v.id)
            .ok()
            .map(|i| &self.validators[i])
    }

    /// Whether `id` is present and active
    pub fn is_active(&self, id: ValidatorId) -> bool {
        self.get(id).map(|v| v.active).unwrap_or(false)
    }

    /// Snapshot with no validators; placeholder before the first round
    pub fn empty() -> Self {
        Self {
            version: 0,
            validators: Vec::new(),
        }
    }

    /// Build a snapshot directly from a validator list
    pub fn from_validators(version: u64, mut validators: Vec<Validator>) -> Self {
        validators.sort_by_key(|v| v.id);
        Self {
            version,
            validators,
        }
    }
}

/// Mutable validator registry
///
/// Mutation entry points are invoked only by external collaborators
/// (governance, slashing, liveness tracking); the registry itself
/// enforces no consensus logic.
#[derive(Debug, Default)]
pub struct ValidatorRegistry {
    version: u64,
    validators: BTreeMap<ValidatorId, Validator>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a validator
    pub fn upsert(&mut self, validator: Validator) {
        debug!(id = %validator.id, stake = validator.stake, "registry upsert");
        self.validators.insert(validator.id, validator);
        self.version += 1;
    }

    pub fn get(&self, id: ValidatorId) -> Result<&Validator> {
        self.validators.get(&id).ok_or(RegistryError::NotFound(id))
    }

    pub fn update_stake(&mut self, id: ValidatorId, stake: u64) -> Result<()> {
        let validator = self
            .validators
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        validator.stake = stake;
        self.version += 1;
        Ok(())
    }

    pub fn set_active(&mut self, id: ValidatorId, active: bool) -> Result<()> {
        let validator = self
            .validators
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        if validator.active != active {
            debug!(id = %id, active, "registry activity flag changed");
        }
        validator.active = active;
        self.version += 1;
        Ok(())
    }

    pub fn record_activity(&mut self, id: ValidatorId, timestamp: u64) -> Result<()> {
        let validator = self
            .validators
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        validator.last_active = timestamp;
        self.version += 1;
        Ok(())
    }

    /// Take an immutable snapshot of the current validator set
    ///
    /// BTreeMap iteration gives the id-sorted order the snapshot
    /// guarantees.
    pub fn snapshot(&self) -> Arc<ValidatorSnapshot> {
        Arc::new(ValidatorSnapshot {
            version: self.version,
            validators: self.validators.values().cloned().collect(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}
