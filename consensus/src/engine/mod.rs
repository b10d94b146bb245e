/// Consensus engine - drives one round end to end
///
/// The engine ties together:
/// - ValidatorRegistry snapshots (one immutable snapshot per round)
/// - Network-load sampling (one positive scalar per round)
/// - Proposer selection (torque-scored, deterministic)
/// - Vote aggregation (torque-weighted, equivocation-guarded)
/// - The round phase machine (pure transitions; timers live here)
/// - A persistence/broadcast sink for finalized candidates
///
/// Exactly one round is live at a time. All round state sits behind a
/// single tokio mutex, so transitions, tally updates, and commit checks
/// are serialized; the pure torque step is the only part that runs in
/// parallel. Phase deadlines are armed as tasks that check a phase
/// epoch on expiry, so a deadline firing after the phase advanced is a
/// no-op rather than a spurious abort.

#[cfg(test)]
mod integration_tests;

use crate::aggregator::{CommitStatus, VoteAggregator, VoteError, VoteOutcome};
use crate::config::EngineConfig;
use crate::crypto::Hash;
use crate::registry::{ValidatorRegistry, ValidatorSnapshot};
use crate::round::{self, Effect, RoundEvent, RoundPhase};
use crate::selector;
use crate::torque::{compute_torque, TorqueError};
use crate::types::{AbortReason, Candidate, RoundOutcome, ValidatorId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Engine errors
///
/// None of these are fatal to the node; at worst a round aborts and the
/// external scheduler retries with a fresh round number.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A round is already in flight (phase {0})")]
    RoundInFlight(&'static str),

    #[error("Round {requested} is not newer than round {current}")]
    StaleRound { requested: u64, current: u64 },

    #[error("No proposal expected in phase {0}")]
    UnexpectedProposal(&'static str),

    #[error("Votes are not being collected in phase {0}")]
    NotCollectingVotes(&'static str),

    #[error("No round in flight")]
    NoRoundInFlight,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Proposal failed re-verification")]
    InvalidProposal,

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error(transparent)]
    Torque(#[from] TorqueError),
}

/// Observable engine events
///
/// Every phase transition and terminal outcome is published here; the
/// engine never aborts silently.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    PhaseChanged {
        round: u64,
        phase: &'static str,
    },
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

/// Read interface over the validator registry
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Arc<ValidatorSnapshot>;
}

#[async_trait]
impl SnapshotSource for tokio::sync::RwLock<ValidatorRegistry> {
    async fn snapshot(&self) -> Arc<ValidatorSnapshot> {
        self.read().await.snapshot()
    }
}

/// Network-load sampler; one positive scalar per round
#[async_trait]
pub trait LoadSampler: Send + Sync {
    async fn sample(&self) -> f64;
}

/// Constant-load sampler
pub struct FixedLoad(pub f64);

#[async_trait]
impl LoadSampler for FixedLoad {
    async fn sample(&self) -> f64 {
        self.0
    }
}

/// Sink error; delivery failures are logged, never fatal
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Persistence/broadcast sink for finalized candidates
#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn deliver(
        &self,
        round: u64,
        candidate: &Candidate,
        total_torque: f64,
    ) -> Result<(), SinkError>;
}

/// In-memory sink collecting finalized candidates
pub struct MemorySink {
    delivered: std::sync::Mutex<Vec<(u64, Candidate, f64)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            delivered: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<(u64, Candidate, f64)> {
        self.delivered.lock().expect("sink lock poisoned").clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommitSink for MemorySink {
    async fn deliver(
        &self,
        round: u64,
        candidate: &Candidate,
        total_torque: f64,
    ) -> Result<(), SinkError> {
        self.delivered
            .lock()
            .expect("sink lock poisoned")
            .push((round, candidate.clone(), total_torque));
        Ok(())
    }
}

/// All mutable state of the live round
struct RoundSlot {
    round: u64,
    phase: RoundPhase,
    /// Bumped on every phase change; armed deadlines carry the epoch
    /// they were armed at and no-op if it moved on
    epoch: u64,
    head: Hash,
    snapshot: Arc<ValidatorSnapshot>,
    load: f64,
    aggregator: Arc<VoteAggregator>,
    last_outcome: Option<RoundOutcome>,
}

struct EngineInner {
    config: EngineConfig,
    snapshots: Arc<dyn SnapshotSource>,
    sampler: Arc<dyn LoadSampler>,
    sink: Arc<dyn CommitSink>,
    slot: Mutex<RoundSlot>,
    events: broadcast::Sender<EngineEvent>,
}

/// The consensus engine handle; cheap to clone
#[derive(Clone)]
pub struct ConsensusEngine {
    inner: Arc<EngineInner>,
}

impl ConsensusEngine {
    pub fn new(
        config: EngineConfig,
        snapshots: Arc<dyn SnapshotSource>,
        sampler: Arc<dyn LoadSampler>,
        sink: Arc<dyn CommitSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let empty = Arc::new(ValidatorSnapshot::empty());
        let aggregator = Arc::new(VoteAggregator::new(Arc::clone(&empty), &config.torque));
        Self {
            inner: Arc::new(EngineInner {
                config,
                snapshots,
                sampler,
                sink,
                slot: Mutex::new(RoundSlot {
                    round: 0,
                    phase: RoundPhase::Idle,
                    epoch: 0,
                    head: Hash::zero(),
                    snapshot: empty,
                    load: 1.0,
                    aggregator,
                    last_outcome: None,
                }),
                events,
            }),
        }
    }

    /// Subscribe to phase transitions and terminal outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Start a new round
    ///
    /// Takes a fresh registry snapshot and load sample, runs proposer
    /// selection, and either arms the proposal deadline or aborts with
    /// `NoEligibleProposer`. Either way the caller gets `Ok`; the round
    /// outcome is observable on the event stream.
    pub async fn start_round(&self, round: u64) -> Result<(), EngineError> {
        let mut slot = self.inner.slot.lock().await;
        if !matches!(slot.phase, RoundPhase::Idle) {
            return Err(EngineError::RoundInFlight(slot.phase.name()));
        }
        if round <= slot.round {
            return Err(EngineError::StaleRound {
                requested: round,
                current: slot.round,
            });
        }

        let snapshot = self.inner.snapshots.snapshot().await;
        let load = self.inner.sampler.sample().await;
        slot.round = round;
        slot.snapshot = Arc::clone(&snapshot);
        slot.load = load;
        slot.last_outcome = None;
        info!(
            round,
            load,
            snapshot_version = snapshot.version(),
            "round started"
        );

        let effects = self.apply(&mut slot, RoundEvent::Start);
        debug_assert!(effects.is_empty());

        match selector::select_proposer(&snapshot, load, &self.inner.config.torque) {
            Ok(selection) => {
                info!(
                    round,
                    proposer = %selection.proposer.validator,
                    torque = selection.proposer.torque,
                    eligible = selection.eligible.len(),
                    "proposer selected"
                );
                slot.aggregator =
                    Arc::new(VoteAggregator::new(snapshot, &self.inner.config.torque));
                let effects =
                    self.apply(&mut slot, RoundEvent::ProposerSelected(selection.proposer));
                self.run_effects(&mut slot, effects).await;
            }
            Err(e) => {
                warn!(round, error = %e, "proposer selection failed");
                let effects = self.apply(&mut slot, RoundEvent::SelectionFailed);
                debug_assert!(effects.is_empty());
                self.settle(&mut slot);
            }
        }
        Ok(())
    }

    /// Submit the selected proposer's candidate
    ///
    /// The candidate is re-verified against the round snapshot: the
    /// engine recomputes the proposer's torque and self-locking verdict
    /// rather than trusting the value cached at selection time, and the
    /// candidate must reference the current chain head. A candidate
    /// from anyone but the selected proposer is a protocol violation:
    /// logged and discarded, the round keeps waiting for the real one.
    pub async fn submit_proposal(&self, candidate: Candidate) -> Result<(), EngineError> {
        let mut slot = self.inner.slot.lock().await;
        let expected = match &slot.phase {
            RoundPhase::BlockProposal { proposer } => proposer.validator,
            other => return Err(EngineError::UnexpectedProposal(other.name())),
        };

        if candidate.proposer != expected {
            warn!(
                round = slot.round,
                submitted_by = %candidate.proposer,
                expected = %expected,
                "candidate from non-selected proposer discarded"
            );
            return Err(EngineError::ProtocolViolation(format!(
                "candidate from {} but the selected proposer is {}",
                candidate.proposer, expected
            )));
        }

        let reading = slot
            .snapshot
            .get(expected)
            .and_then(|v| compute_torque(v, slot.load, &self.inner.config.torque).ok());
        let eligible = matches!(
            reading,
            Some(r) if r.self_lock_ok && r.torque >= self.inner.config.torque.min_proposer_torque
        );

        if !eligible || candidate.parent != slot.head {
            warn!(
                round = slot.round,
                proposer = %expected,
                parent = %candidate.parent,
                head = %slot.head,
                eligible,
                "proposal failed re-verification"
            );
            let effects = self.apply(&mut slot, RoundEvent::ProposalRejected);
            debug_assert!(effects.is_empty());
            self.settle(&mut slot);
            return Err(EngineError::InvalidProposal);
        }

        let hash = candidate.hash();
        // Proposing binds the proposer's support to this candidate.
        slot.aggregator.register_support(expected, hash)?;
        info!(round = slot.round, candidate = %hash, "proposal accepted");

        let effects = self.apply(&mut slot, RoundEvent::ProposalAccepted(candidate));
        self.run_effects(&mut slot, effects).await;
        Ok(())
    }

    /// Proposer-side failure (e.g. signing) reported by the transport
    pub async fn report_proposal_failure(&self, why: &str) -> Result<(), EngineError> {
        let mut slot = self.inner.slot.lock().await;
        if !matches!(slot.phase, RoundPhase::BlockProposal { .. }) {
            return Err(EngineError::UnexpectedProposal(slot.phase.name()));
        }
        warn!(round = slot.round, why, "proposer reported failure");
        let effects = self.apply(&mut slot, RoundEvent::ProposalRejected);
        debug_assert!(effects.is_empty());
        self.settle(&mut slot);
        Ok(())
    }

    /// Submit a vote
    ///
    /// The claimed torque from the wire is ignored: the engine
    /// recomputes the voter's torque from its own snapshot and load
    /// sample, so a malicious relay cannot forge voting power. The vote
    /// only counts if the voter's recomputed verdict self-locks.
    pub async fn submit_vote(
        &self,
        validator: ValidatorId,
        candidate: Hash,
        _claimed_torque: f64,
    ) -> Result<VoteOutcome, EngineError> {
        let mut slot = self.inner.slot.lock().await;
        let under_vote = match &slot.phase {
            RoundPhase::VoteCollection { candidate } => candidate.hash(),
            other => return Err(EngineError::NotCollectingVotes(other.name())),
        };

        let voter = slot
            .snapshot
            .get(validator)
            .ok_or(VoteError::UnknownValidator(validator))?;
        let reading = compute_torque(voter, slot.load, &self.inner.config.torque)?;
        if !reading.self_lock_ok {
            return Err(VoteError::SelfLockViolation(validator).into());
        }

        let outcome = slot
            .aggregator
            .submit_vote(validator, candidate, reading.torque)?;

        if candidate == under_vote {
            if let CommitStatus::Committed(total) = slot.aggregator.check_commit(candidate) {
                if slot.aggregator.winner() == Some(candidate) {
                    let effects = self.apply(
                        &mut slot,
                        RoundEvent::ThresholdReached {
                            total_torque: total,
                        },
                    );
                    self.run_effects(&mut slot, effects).await;
                }
            }
        }
        Ok(outcome)
    }

    /// Abort the in-flight round from any state
    ///
    /// Round state is discarded cleanly; no partial commit becomes
    /// visible. The abort is published on the event stream.
    pub async fn abort_round(&self, reason: AbortReason) -> Result<(), EngineError> {
        let mut slot = self.inner.slot.lock().await;
        if matches!(slot.phase, RoundPhase::Idle) {
            return Err(EngineError::NoRoundInFlight);
        }
        let effects = self.apply(&mut slot, RoundEvent::Abort(reason));
        debug_assert!(effects.is_empty());
        self.settle(&mut slot);
        Ok(())
    }

    /// Name of the current phase
    pub async fn phase(&self) -> &'static str {
        self.inner.slot.lock().await.phase.name()
    }

    /// Current round number (0 before the first round)
    pub async fn current_round(&self) -> u64 {
        self.inner.slot.lock().await.round
    }

    /// The validator the engine is waiting on for a proposal, if any
    pub async fn current_proposer(&self) -> Option<ValidatorId> {
        match &self.inner.slot.lock().await.phase {
            RoundPhase::BlockProposal { proposer } => Some(proposer.validator),
            _ => None,
        }
    }

    /// Current chain head (last committed candidate hash)
    pub async fn chain_head(&self) -> Hash {
        self.inner.slot.lock().await.head
    }

    /// Terminal outcome of the last concluded round
    pub async fn last_outcome(&self) -> Option<RoundOutcome> {
        self.inner.slot.lock().await.last_outcome.clone()
    }

    /// Running torque sum for a candidate in the live round
    pub async fn tally(&self, candidate: Hash) -> f64 {
        self.inner.slot.lock().await.aggregator.tally(candidate)
    }

    /// Detected fault-assumption violations in the live round
    pub async fn safety_violations(&self) -> u64 {
        self.inner.slot.lock().await.aggregator.safety_violations()
    }

    /// Apply one event to the phase machine, publishing the transition
    fn apply(&self, slot: &mut RoundSlot, event: RoundEvent) -> Vec<Effect> {
        let before = slot.phase.name();
        let current = std::mem::replace(&mut slot.phase, RoundPhase::Idle);
        let (next, effects) = round::transition(current, event);
        slot.phase = next;
        if slot.phase.name() != before {
            slot.epoch += 1;
            debug!(
                round = slot.round,
                from = before,
                to = slot.phase.name(),
                "phase transition"
            );
            let _ = self.inner.events.send(EngineEvent::PhaseChanged {
                round: slot.round,
                phase: slot.phase.name(),
            });
        }
        effects
    }

    async fn run_effects(&self, slot: &mut RoundSlot, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ArmProposalDeadline => {
                    self.arm_deadline(slot.epoch, self.inner.config.proposal_timeout);
                }
                Effect::ArmVoteDeadline => {
                    self.arm_deadline(slot.epoch, self.inner.config.vote_timeout);
                }
                Effect::Export {
                    candidate,
                    total_torque,
                } => {
                    if let Err(e) = self
                        .inner
                        .sink
                        .deliver(slot.round, &candidate, total_torque)
                        .await
                    {
                        // Delivery is retried externally; the commit
                        // itself already happened.
                        warn!(round = slot.round, error = %e, "commit sink delivery failed");
                    }
                    let effects = self.apply(slot, RoundEvent::Exported);
                    debug_assert!(effects.is_empty());
                    self.settle(slot);
                }
            }
        }
    }

    fn arm_deadline(&self, epoch: u64, timeout: Duration) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.deadline_expired(epoch).await;
        });
    }

    async fn deadline_expired(&self, epoch: u64) {
        let mut slot = self.inner.slot.lock().await;
        if slot.epoch != epoch {
            // Phase moved on before the deadline fired
            return;
        }
        debug!(round = slot.round, phase = slot.phase.name(), "deadline expired");
        let effects = self.apply(&mut slot, RoundEvent::DeadlineExpired);
        debug_assert!(effects.is_empty());
        self.settle(&mut slot);
    }

    /// Record and publish a terminal outcome, then reset to Idle
    fn settle(&self, slot: &mut RoundSlot) {
        match slot.phase.clone() {
            RoundPhase::Finalization {
                candidate,
                total_torque,
            } => {
                let hash = candidate.hash();
                info!(
                    round = slot.round,
                    candidate = %hash,
                    total_torque,
                    "round committed"
                );
                slot.head = hash;
                let _ = self.inner.events.send(EngineEvent::Committed {
                    round: slot.round,
                    candidate: candidate.clone(),
                    total_torque,
                });
                slot.last_outcome = Some(RoundOutcome::Committed {
                    round: slot.round,
                    candidate,
                    total_torque,
                });
                self.reset(slot);
            }
            RoundPhase::Aborted(reason) => {
                info!(round = slot.round, %reason, "round aborted");
                let _ = self.inner.events.send(EngineEvent::Aborted {
                    round: slot.round,
                    reason: reason.clone(),
                });
                slot.last_outcome = Some(RoundOutcome::Aborted {
                    round: slot.round,
                    reason,
                });
                self.reset(slot);
            }
            _ => {}
        }
    }

    fn reset(&self, slot: &mut RoundSlot) {
        slot.phase = RoundPhase::Idle;
        slot.epoch += 1;
        let _ = self.inner.events.send(EngineEvent::PhaseChanged {
            round: slot.round,
            phase: slot.phase.name(),
        });
    }
}
