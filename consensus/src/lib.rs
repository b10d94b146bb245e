/// Gearlock Consensus Layer
///
/// This module implements torque-gated BFT consensus with:
/// - Deterministic torque scoring of validator voting power
/// - Self-locking eligibility for proposers and voters
/// - Torque-weighted commit with a fixed threshold
/// - Equivocation guarding within each round

pub mod aggregator;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod guard;
pub mod registry;
pub mod round;
pub mod selector;
pub mod torque;
pub mod types;

pub use config::{EngineConfig, TorqueConfig};
pub use crypto::Hash;
pub use engine::{CommitSink, ConsensusEngine, EngineError, EngineEvent};
pub use registry::{Validator, ValidatorRegistry, ValidatorSnapshot};
pub use types::{AbortReason, Candidate, RoundOutcome, TorqueReading, ValidatorId};
