/// Equivocation guard
///
/// Per-round ledger of which candidate each validator has already
/// supported. A validator's support is a single, non-divisible quantity
/// per round: the first admitted candidate binds it, an identical
/// re-admission is a legal no-op, a differing one is rejected.
///
/// Guard state never crosses a round boundary.

use crate::crypto::Hash;
use crate::types::ValidatorId;
use std::collections::HashMap;

/// Outcome of an admission check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// First support recorded for this validator
    Recorded,
    /// Validator already supports this exact candidate
    Duplicate,
}

/// Admission rejection: the validator already supports a different
/// candidate in this round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("self-lock violation: validator already supports a different candidate")]
pub struct SelfLockViolation {
    pub validator: ValidatorId,
    pub existing: Hash,
    pub attempted: Hash,
}

/// Per-round support ledger
#[derive(Debug, Default)]
pub struct EquivocationGuard {
    support: HashMap<ValidatorId, Hash>,
}

impl EquivocationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit (or reject) a validator's support for a candidate
    pub fn admit(
        &mut self,
        validator: ValidatorId,
        candidate: Hash,
    ) -> Result<Admission, SelfLockViolation> {
        match self.support.get(&validator) {
            None => {
                self.support.insert(validator, candidate);
                Ok(Admission::Recorded)
            }
            Some(existing) if *existing == candidate => Ok(Admission::Duplicate),
            Some(existing) => Err(SelfLockViolation {
                validator,
                existing: *existing,
                attempted: candidate,
            }),
        }
    }

    /// The candidate this validator currently supports, if any
    pub fn supported(&self, validator: ValidatorId) -> Option<Hash> {
        self.support.get(&validator).copied()
    }

    /// Number of validators with recorded support
    pub fn len(&self) -> usize {
        self.support.len()
    }

    pub fn is_empty(&self) -> bool {
        self.support.is_empty()
    }

    /// Clear all support; called at the round boundary
    pub fn reset(&mut self) {
        self.support.clear();
    }
}
