/// Round phase state machine
///
/// One round walks Idle → TorqueCalculation → BlockProposal →
/// VoteCollection → BlockCommitment → Finalization, with an `Aborted`
/// terminal reachable from any non-terminal phase on deadline expiry,
/// selection failure, or an external abort.
///
/// The machine is pure: `transition(phase, event)` returns the next
/// phase plus the effects the orchestrator must perform (arm a
/// deadline, export the committed candidate). Timers, locks, and I/O
/// all live in the engine layer. Stale events — a deadline firing after
/// the phase already advanced — leave the phase unchanged.

use crate::types::{AbortReason, Candidate, TorqueReading};

/// Phase of the current round, carrying that phase's data
#[derive(Clone, Debug, PartialEq)]
pub enum RoundPhase {
    /// No round in flight
    Idle,
    /// Snapshot and load sample taken; readings being computed
    TorqueCalculation,
    /// Waiting for the selected proposer's candidate
    BlockProposal { proposer: TorqueReading },
    /// Candidate accepted; collecting torque-weighted votes
    VoteCollection { candidate: Candidate },
    /// Threshold crossed; candidate awaiting export
    BlockCommitment {
        candidate: Candidate,
        total_torque: f64,
    },
    /// Committed candidate handed to the sink; round is done
    Finalization {
        candidate: Candidate,
        total_torque: f64,
    },
    /// Terminal failure; control returns to the external scheduler
    Aborted(AbortReason),
}

impl RoundPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RoundPhase::Finalization { .. } | RoundPhase::Aborted(_)
        )
    }

    /// Short name for logging and events
    pub fn name(&self) -> &'static str {
        match self {
            RoundPhase::Idle => "idle",
            RoundPhase::TorqueCalculation => "torque_calculation",
            RoundPhase::BlockProposal { .. } => "block_proposal",
            RoundPhase::VoteCollection { .. } => "vote_collection",
            RoundPhase::BlockCommitment { .. } => "block_commitment",
            RoundPhase::Finalization { .. } => "finalization",
            RoundPhase::Aborted(_) => "aborted",
        }
    }
}

/// Events driving the machine
#[derive(Clone, Debug, PartialEq)]
pub enum RoundEvent {
    /// External round start
    Start,
    /// Proposer selection succeeded
    ProposerSelected(TorqueReading),
    /// No validator survived the eligibility filter
    SelectionFailed,
    /// The selected proposer's candidate passed re-verification
    ProposalAccepted(Candidate),
    /// The selected proposer's candidate failed re-verification
    ProposalRejected,
    /// The candidate under vote crossed the commit threshold
    ThresholdReached { total_torque: f64 },
    /// The committed candidate was delivered to the sink
    Exported,
    /// The armed deadline for the current phase expired
    DeadlineExpired,
    /// External abort from any state
    Abort(AbortReason),
}

/// Side effects the orchestrator must perform after a transition
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Arm the proposal-receipt deadline
    ArmProposalDeadline,
    /// Arm the vote-collection deadline
    ArmVoteDeadline,
    /// Deliver the committed candidate to the persistence/broadcast sink
    Export {
        candidate: Candidate,
        total_torque: f64,
    },
}

/// Apply one event to a phase
pub fn transition(phase: RoundPhase, event: RoundEvent) -> (RoundPhase, Vec<Effect>) {
    use RoundEvent as E;
    use RoundPhase as P;

    // External aborts preempt everything except the terminals.
    if let E::Abort(reason) = &event {
        if !phase.is_terminal() {
            return (P::Aborted(reason.clone()), vec![]);
        }
        return (phase, vec![]);
    }

    match (phase, event) {
        (P::Idle, E::Start) => (P::TorqueCalculation, vec![]),

        (P::TorqueCalculation, E::ProposerSelected(proposer)) => (
            P::BlockProposal { proposer },
            vec![Effect::ArmProposalDeadline],
        ),
        (P::TorqueCalculation, E::SelectionFailed) => {
            (P::Aborted(AbortReason::NoEligibleProposer), vec![])
        }

        (P::BlockProposal { .. }, E::ProposalAccepted(candidate)) => (
            P::VoteCollection { candidate },
            vec![Effect::ArmVoteDeadline],
        ),
        (P::BlockProposal { .. }, E::ProposalRejected) => {
            (P::Aborted(AbortReason::InvalidProposal), vec![])
        }
        (P::BlockProposal { .. }, E::DeadlineExpired) => {
            (P::Aborted(AbortReason::ProposalTimeout), vec![])
        }

        (P::VoteCollection { candidate }, E::ThresholdReached { total_torque }) => (
            P::BlockCommitment {
                candidate: candidate.clone(),
                total_torque,
            },
            vec![Effect::Export {
                candidate,
                total_torque,
            }],
        ),
        (P::VoteCollection { .. }, E::DeadlineExpired) => {
            (P::Aborted(AbortReason::CommitTimeout), vec![])
        }

        (
            P::BlockCommitment {
                candidate,
                total_torque,
            },
            E::Exported,
        ) => (
            P::Finalization {
                candidate,
                total_torque,
            },
            vec![],
        ),

        // Anything else is a stale or out-of-place event; hold the phase.
        (phase, _) => (phase, vec![]),
    }
}
