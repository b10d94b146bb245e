/// Torque-weighted vote aggregation
///
/// Accumulates accepted votes per candidate and evaluates the commit
/// threshold. Admission (equivocation check) and tally increment happen
/// under one lock so that two concurrent votes from the same validator
/// for different candidates can never both slip through.
///
/// Because the guard keeps any validator's torque from counting toward
/// two candidates, the committable torque across all candidates in one
/// round is bounded by total active torque — the quorum-intersection
/// argument, in torque units.

use crate::config::TorqueConfig;
use crate::crypto::Hash;
use crate::guard::EquivocationGuard;
use crate::registry::ValidatorSnapshot;
use crate::types::{ValidatorId, VoteRecord};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Vote rejection reasons
#[derive(Error, Debug, PartialEq)]
pub enum VoteError {
    #[error("Unknown validator: {0}")]
    UnknownValidator(ValidatorId),

    #[error("Invalid torque: {0}")]
    InvalidTorque(f64),

    #[error("Self-lock violation by {0}")]
    SelfLockViolation(ValidatorId),
}

/// Commit verdict for a candidate
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CommitStatus {
    Committed(f64),
    Pending(f64),
}

impl CommitStatus {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitStatus::Committed(_))
    }
}

/// Outcome of an accepted vote submission
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VoteOutcome {
    /// Vote counted; current commit status for its candidate
    Accepted(CommitStatus),
    /// Re-vote for the already-supported candidate; tally unchanged
    Duplicate,
}

#[derive(Debug, Default)]
struct AggregatorInner {
    guard: EquivocationGuard,
    /// Validators whose torque has been added to a tally
    voted: HashSet<ValidatorId>,
    tallies: HashMap<Hash, f64>,
    records: Vec<VoteRecord>,
    /// First candidate to cross the threshold; latched for the round
    winner: Option<Hash>,
    /// Tally at which each committed candidate crossed
    committed: HashMap<Hash, f64>,
    safety_violations: u64,
}

/// Per-round vote aggregator
///
/// Safe under concurrent invocation: all mutation is serialized behind
/// one internal lock.
pub struct VoteAggregator {
    snapshot: Arc<ValidatorSnapshot>,
    commit_threshold: f64,
    inner: Mutex<AggregatorInner>,
}

impl VoteAggregator {
    pub fn new(snapshot: Arc<ValidatorSnapshot>, config: &TorqueConfig) -> Self {
        Self {
            snapshot,
            commit_threshold: config.commit_threshold,
            inner: Mutex::new(AggregatorInner::default()),
        }
    }

    /// Record support without a tally contribution
    ///
    /// Used when a proposer's candidate is accepted: proposing binds
    /// the proposer to that candidate exactly like a vote would, but
    /// its torque only counts once it actually votes.
    pub fn register_support(
        &self,
        validator: ValidatorId,
        candidate: Hash,
    ) -> Result<(), VoteError> {
        let mut inner = self.inner.lock().expect("aggregator lock poisoned");
        inner
            .guard
            .admit(validator, candidate)
            .map(|_| ())
            .map_err(|_| VoteError::SelfLockViolation(validator))
    }

    /// Submit a vote
    ///
    /// Rejects unknown/inactive validators, non-positive torque, and
    /// equivocation. On acceptance the candidate's tally grows by the
    /// vote's torque and the commit threshold is re-evaluated.
    pub fn submit_vote(
        &self,
        validator: ValidatorId,
        candidate: Hash,
        torque: f64,
    ) -> Result<VoteOutcome, VoteError> {
        if !self.snapshot.is_active(validator) {
            return Err(VoteError::UnknownValidator(validator));
        }
        if !torque.is_finite() || torque <= 0.0 {
            return Err(VoteError::InvalidTorque(torque));
        }

        let mut inner = self.inner.lock().expect("aggregator lock poisoned");

        if inner.guard.admit(validator, candidate).is_err() {
            return Err(VoteError::SelfLockViolation(validator));
        }
        if !inner.voted.insert(validator) {
            // Support already tallied; identical re-votes are legal no-ops
            debug!(%validator, %candidate, "duplicate vote ignored");
            return Ok(VoteOutcome::Duplicate);
        }

        let tally = inner.tallies.entry(candidate).or_insert(0.0);
        *tally += torque;
        let tally = *tally;
        inner.records.push(VoteRecord {
            validator,
            candidate,
            torque,
        });

        if tally >= self.commit_threshold && !inner.committed.contains_key(&candidate) {
            inner.committed.insert(candidate, tally);
            match inner.winner {
                None => {
                    inner.winner = Some(candidate);
                    debug!(%candidate, tally, "candidate crossed commit threshold");
                }
                Some(winner) => {
                    // Cannot happen while Byzantine torque < 1/3 of the
                    // total; if it does, the fault assumption is broken
                    // at runtime. First winner stands.
                    inner.safety_violations += 1;
                    warn!(
                        first = %winner,
                        second = %candidate,
                        "second candidate crossed commit threshold in one round"
                    );
                }
            }
        }

        Ok(VoteOutcome::Accepted(self.status_locked(&inner, candidate)))
    }

    /// Current torque sum for a candidate
    pub fn tally(&self, candidate: Hash) -> f64 {
        let inner = self.inner.lock().expect("aggregator lock poisoned");
        inner.tallies.get(&candidate).copied().unwrap_or(0.0)
    }

    /// Commit verdict for a candidate
    ///
    /// Monotone and one-directional: once a candidate is committed, the
    /// verdict never reverts for the rest of the round.
    pub fn check_commit(&self, candidate: Hash) -> CommitStatus {
        let inner = self.inner.lock().expect("aggregator lock poisoned");
        self.status_locked(&inner, candidate)
    }

    fn status_locked(&self, inner: &AggregatorInner, candidate: Hash) -> CommitStatus {
        match inner.committed.get(&candidate) {
            Some(at) => CommitStatus::Committed(*at),
            None => {
                CommitStatus::Pending(inner.tallies.get(&candidate).copied().unwrap_or(0.0))
            }
        }
    }

    /// First candidate to cross the threshold this round, if any
    pub fn winner(&self) -> Option<Hash> {
        self.inner.lock().expect("aggregator lock poisoned").winner
    }

    /// Accepted vote records so far
    pub fn records(&self) -> Vec<VoteRecord> {
        self.inner
            .lock()
            .expect("aggregator lock poisoned")
            .records
            .clone()
    }

    /// Detected violations of the Byzantine-torque fault assumption
    pub fn safety_violations(&self) -> u64 {
        self.inner
            .lock()
            .expect("aggregator lock poisoned")
            .safety_violations
    }
}
