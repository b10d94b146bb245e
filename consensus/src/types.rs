/// Core Gearlock data structures
///
/// Candidates, torque readings, vote records, and round outcomes.
/// A candidate is immutable once created and identified solely by its
/// content hash.

use crate::crypto::{hash_data, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, totally ordered validator identity
///
/// The total order matters: proposer tie-breaks resolve to the lowest
/// id, and every node must agree on that order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ValidatorId(pub u64);

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A proposed block
///
/// References exactly one parent and carries an ordered transaction
/// sequence plus the proposer's identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub parent: Hash,
    pub transactions: Vec<Vec<u8>>,
    pub proposer: ValidatorId,
}

impl Candidate {
    pub fn new(parent: Hash, transactions: Vec<Vec<u8>>, proposer: ValidatorId) -> Self {
        Self {
            parent,
            transactions,
            proposer,
        }
    }

    /// Compute the content hash of this candidate
    pub fn hash(&self) -> Hash {
        let mut data = Vec::new();
        data.extend_from_slice(self.parent.as_bytes());
        data.extend_from_slice(&self.proposer.0.to_le_bytes());
        data.extend_from_slice(&(self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            data.extend_from_slice(&(tx.len() as u64).to_le_bytes());
            data.extend_from_slice(tx);
        }
        hash_data(&data)
    }

    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from network bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// One validator's torque for one round
///
/// Ephemeral: recomputed every round from the snapshot and the round's
/// network-load sample, never persisted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TorqueReading {
    pub validator: ValidatorId,
    pub torque: f64,
    pub self_lock_ok: bool,
}

/// An accepted vote
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub validator: ValidatorId,
    pub candidate: Hash,
    pub torque: f64,
}

impl VoteRecord {
    /// Serialize for network transmission
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from network bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Why a round aborted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// No validator survived the eligibility filter
    NoEligibleProposer,
    /// Proposal failed re-verification (wrong proposer, bad parent,
    /// or self-locking no longer holds)
    InvalidProposal,
    /// Proposal deadline expired with nothing received
    ProposalTimeout,
    /// Voting deadline expired with no candidate at threshold
    CommitTimeout,
    /// Externally requested abort (e.g. a newer round was observed)
    External(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NoEligibleProposer => write!(f, "no eligible proposer"),
            AbortReason::InvalidProposal => write!(f, "invalid proposal"),
            AbortReason::ProposalTimeout => write!(f, "proposal timeout"),
            AbortReason::CommitTimeout => write!(f, "commit timeout"),
            AbortReason::External(why) => write!(f, "external abort: {}", why),
        }
    }
}

/// Terminal result of one round
#[derive(Clone, Debug, PartialEq)]
pub enum RoundOutcome {
    Committed {
        round: u64,
        candidate: Candidate,
        total_torque: f64,
    },
    Aborted {
        round: u64,
        reason: AbortReason,
    },
}
