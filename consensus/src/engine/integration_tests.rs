/// Integration tests for the consensus engine
///
/// Drives full rounds end to end: selection, proposal, voting,
/// commit export, timeouts, and misbehavior handling.

#[cfg(test)]
mod tests {
    use crate::aggregator::{CommitStatus, VoteError, VoteOutcome};
    use crate::config::{EngineConfig, TorqueConfig};
    use crate::crypto::{hash_data, Hash};
    use crate::engine::{
        CommitSink, ConsensusEngine, EngineError, EngineEvent, FixedLoad, MemorySink,
        SnapshotSource,
    };
    use crate::registry::{Validator, ValidatorRegistry};
    use crate::types::{AbortReason, Candidate, RoundOutcome, ValidatorId};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{broadcast, RwLock};

    // ===== Helpers =====

    /// Registry of validators that all clear the eligibility bar:
    /// stake 1000, 60 degrees, 0.9 efficiency at load 10 gives
    /// torque ~77.94, well past min_proposer_torque 8.0.
    fn strong_registry(count: u64) -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new();
        for id in 1..=count {
            registry.upsert(Validator::new(ValidatorId(id), 1000, 60.0, 0.9));
        }
        registry
    }

    /// Registry of validators that all miss the eligibility bar:
    /// stake 100, 45 degrees, full efficiency at load 10 gives
    /// torque ~7.07, under min_proposer_torque 8.0.
    fn weak_registry(count: u64) -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new();
        for id in 1..=count {
            registry.upsert(Validator::new(ValidatorId(id), 100, 45.0, 1.0));
        }
        registry
    }

    fn build_engine(
        registry: ValidatorRegistry,
        config: EngineConfig,
    ) -> (
        ConsensusEngine,
        Arc<MemorySink>,
        Arc<RwLock<ValidatorRegistry>>,
    ) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let registry = Arc::new(RwLock::new(registry));
        let sink = Arc::new(MemorySink::new());
        let engine = ConsensusEngine::new(
            config,
            registry.clone() as Arc<dyn SnapshotSource>,
            Arc::new(FixedLoad(10.0)),
            sink.clone() as Arc<dyn CommitSink>,
        );
        (engine, sink, registry)
    }

    fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(match event {
                EngineEvent::PhaseChanged { phase, .. } => phase.to_string(),
                EngineEvent::Committed { .. } => "round_committed".to_string(),
                EngineEvent::Aborted { .. } => "round_aborted".to_string(),
            });
        }
        names
    }

    fn candidate_for(parent: Hash, proposer: ValidatorId) -> Candidate {
        Candidate::new(parent, testutil::random_transactions(3), proposer)
    }

    // ===== Happy path =====

    #[tokio::test]
    async fn test_round_commits_end_to_end() {
        let (engine, sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());
        let mut events = engine.subscribe();

        engine.start_round(1).await.unwrap();
        assert_eq!(engine.phase().await, "block_proposal");
        assert_eq!(engine.current_round().await, 1);

        // Equal torque everywhere, so the lowest id wins selection.
        let proposer = engine.current_proposer().await.unwrap();
        assert_eq!(proposer, ValidatorId(1));

        let candidate = candidate_for(Hash::zero(), proposer);
        engine.submit_proposal(candidate.clone()).await.unwrap();
        assert_eq!(engine.phase().await, "vote_collection");

        // One recomputed vote at ~77.94 clears the 24.0 threshold.
        let outcome = engine
            .submit_vote(ValidatorId(2), candidate.hash(), 0.0)
            .await
            .unwrap();
        match outcome {
            VoteOutcome::Accepted(CommitStatus::Committed(total)) => {
                assert!((total - 77.94).abs() < 0.01);
            }
            other => panic!("expected committed vote, got {:?}", other),
        }

        assert_eq!(engine.phase().await, "idle");
        assert_eq!(engine.chain_head().await, candidate.hash());

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, 1);
        assert_eq!(delivered[0].1, candidate);
        assert!((delivered[0].2 - 77.94).abs() < 0.01);

        assert_eq!(
            drain_events(&mut events),
            vec![
                "torque_calculation",
                "block_proposal",
                "vote_collection",
                "block_commitment",
                "finalization",
                "round_committed",
                "idle",
            ]
        );

        match engine.last_outcome().await {
            Some(RoundOutcome::Committed { round, .. }) => assert_eq!(round, 1),
            other => panic!("expected committed outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rounds_chain_on_committed_head() {
        let (engine, sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(1).await.unwrap();
        let first = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(first.clone()).await.unwrap();
        engine
            .submit_vote(ValidatorId(2), first.hash(), 0.0)
            .await
            .unwrap();
        assert_eq!(engine.chain_head().await, first.hash());

        // The next round must build on the committed head.
        engine.start_round(2).await.unwrap();
        let second = candidate_for(first.hash(), ValidatorId(1));
        engine.submit_proposal(second.clone()).await.unwrap();
        engine
            .submit_vote(ValidatorId(3), second.hash(), 0.0)
            .await
            .unwrap();

        assert_eq!(engine.chain_head().await, second.hash());
        assert_eq!(sink.delivered().len(), 2);
    }

    // ===== Selection failure =====

    #[tokio::test]
    async fn test_underpowered_set_aborts_round() {
        let (engine, sink, _registry) = build_engine(weak_registry(4), EngineConfig::default());
        let mut events = engine.subscribe();

        engine.start_round(1).await.unwrap();

        assert_eq!(engine.phase().await, "idle");
        assert!(sink.delivered().is_empty());
        match engine.last_outcome().await {
            Some(RoundOutcome::Aborted { round, reason }) => {
                assert_eq!(round, 1);
                assert_eq!(reason, AbortReason::NoEligibleProposer);
            }
            other => panic!("expected aborted outcome, got {:?}", other),
        }
        assert_eq!(
            drain_events(&mut events),
            vec!["torque_calculation", "aborted", "round_aborted", "idle"]
        );
    }

    // ===== Deadlines =====

    #[tokio::test(start_paused = true)]
    async fn test_proposal_deadline_aborts_round() {
        let config = EngineConfig {
            proposal_timeout: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        let (engine, sink, _registry) = build_engine(strong_registry(4), config);

        engine.start_round(1).await.unwrap();
        assert_eq!(engine.phase().await, "block_proposal");

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.phase().await, "idle");
        assert!(sink.delivered().is_empty());
        match engine.last_outcome().await {
            Some(RoundOutcome::Aborted { reason, .. }) => {
                assert_eq!(reason, AbortReason::ProposalTimeout);
            }
            other => panic!("expected proposal-timeout abort, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_vote_deadline_aborts_round() {
        let config = EngineConfig {
            vote_timeout: Duration::from_millis(200),
            torque: TorqueConfig {
                // Unreachable threshold so votes never commit.
                commit_threshold: 10_000.0,
                ..TorqueConfig::default()
            },
            ..EngineConfig::default()
        };
        let (engine, sink, _registry) = build_engine(strong_registry(4), config);

        engine.start_round(1).await.unwrap();
        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();

        let outcome = engine
            .submit_vote(ValidatorId(2), candidate.hash(), 0.0)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            VoteOutcome::Accepted(CommitStatus::Pending(_))
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(engine.phase().await, "idle");
        assert!(sink.delivered().is_empty());
        match engine.last_outcome().await {
            Some(RoundOutcome::Aborted { reason, .. }) => {
                assert_eq!(reason, AbortReason::CommitTimeout);
            }
            other => panic!("expected commit-timeout abort, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_deadline_does_not_kill_next_round() {
        let config = EngineConfig {
            proposal_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        let (engine, _sink, _registry) = build_engine(strong_registry(4), config);

        // Round 1 commits well before its proposal deadline fires.
        engine.start_round(1).await.unwrap();
        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();
        engine
            .submit_vote(ValidatorId(2), candidate.hash(), 0.0)
            .await
            .unwrap();

        // Round 2 starts 100ms in, so its own deadline expires at
        // 600ms while round 1's leftover timer fires at 500ms.
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.start_round(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;

        // Round 1's stale deadline was a no-op.
        assert_eq!(engine.phase().await, "block_proposal");
        assert_eq!(engine.current_round().await, 2);
    }

    // ===== Misbehavior =====

    #[tokio::test]
    async fn test_candidate_from_wrong_proposer_is_discarded() {
        let (engine, _sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(1).await.unwrap();
        assert_eq!(engine.current_proposer().await, Some(ValidatorId(1)));

        let intruder = candidate_for(Hash::zero(), ValidatorId(3));
        let err = engine.submit_proposal(intruder).await.unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));

        // The round is still waiting for the real proposer.
        assert_eq!(engine.phase().await, "block_proposal");
        let genuine = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(genuine).await.unwrap();
        assert_eq!(engine.phase().await, "vote_collection");
    }

    #[tokio::test]
    async fn test_candidate_with_wrong_parent_aborts_round() {
        let (engine, sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(1).await.unwrap();
        let stale_parent = hash_data(b"not the chain head");
        let candidate = candidate_for(stale_parent, ValidatorId(1));

        let err = engine.submit_proposal(candidate).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidProposal));

        assert_eq!(engine.phase().await, "idle");
        assert!(sink.delivered().is_empty());
        match engine.last_outcome().await {
            Some(RoundOutcome::Aborted { reason, .. }) => {
                assert_eq!(reason, AbortReason::InvalidProposal);
            }
            other => panic!("expected invalid-proposal abort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_equivocating_vote_rejected_without_touching_tally() {
        let config = EngineConfig {
            torque: TorqueConfig {
                commit_threshold: 10_000.0,
                ..TorqueConfig::default()
            },
            ..EngineConfig::default()
        };
        let (engine, _sink, _registry) = build_engine(strong_registry(4), config);

        engine.start_round(1).await.unwrap();
        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();

        engine
            .submit_vote(ValidatorId(2), candidate.hash(), 0.0)
            .await
            .unwrap();
        let tally_before = engine.tally(candidate.hash()).await;

        // Same validator, different candidate hash.
        let conflicting = hash_data(b"conflicting candidate");
        let err = engine
            .submit_vote(ValidatorId(2), conflicting, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Vote(VoteError::SelfLockViolation(ValidatorId(2)))
        ));

        assert_eq!(engine.tally(candidate.hash()).await, tally_before);
        assert_eq!(engine.tally(conflicting).await, 0.0);
        assert_eq!(engine.phase().await, "vote_collection");
    }

    #[tokio::test]
    async fn test_proposer_cannot_vote_for_another_candidate() {
        let config = EngineConfig {
            torque: TorqueConfig {
                commit_threshold: 10_000.0,
                ..TorqueConfig::default()
            },
            ..EngineConfig::default()
        };
        let (engine, _sink, _registry) = build_engine(strong_registry(4), config);

        engine.start_round(1).await.unwrap();
        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();

        // Proposing bound v1's support to its own candidate.
        let conflicting = hash_data(b"rival candidate");
        let err = engine
            .submit_vote(ValidatorId(1), conflicting, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Vote(VoteError::SelfLockViolation(ValidatorId(1)))
        ));

        // Its vote for the proposed candidate still tallies.
        let outcome = engine
            .submit_vote(ValidatorId(1), candidate.hash(), 0.0)
            .await
            .unwrap();
        assert!(matches!(outcome, VoteOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn test_duplicate_vote_is_idempotent() {
        let config = EngineConfig {
            torque: TorqueConfig {
                commit_threshold: 10_000.0,
                ..TorqueConfig::default()
            },
            ..EngineConfig::default()
        };
        let (engine, _sink, _registry) = build_engine(strong_registry(4), config);

        engine.start_round(1).await.unwrap();
        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();

        engine
            .submit_vote(ValidatorId(2), candidate.hash(), 0.0)
            .await
            .unwrap();
        let tally_before = engine.tally(candidate.hash()).await;

        let outcome = engine
            .submit_vote(ValidatorId(2), candidate.hash(), 0.0)
            .await
            .unwrap();
        assert_eq!(outcome, VoteOutcome::Duplicate);
        assert_eq!(engine.tally(candidate.hash()).await, tally_before);
    }

    #[tokio::test]
    async fn test_claimed_torque_is_ignored() {
        let (engine, _sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(1).await.unwrap();
        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();

        // An inflated claim changes nothing; the engine recomputes.
        let outcome = engine
            .submit_vote(ValidatorId(2), candidate.hash(), 1_000_000.0)
            .await
            .unwrap();
        match outcome {
            VoteOutcome::Accepted(CommitStatus::Committed(total)) => {
                assert!((total - 77.94).abs() < 0.01);
            }
            other => panic!("expected recomputed commit, got {:?}", other),
        }
    }

    // ===== External control =====

    #[tokio::test]
    async fn test_external_abort_discards_round_state() {
        let (engine, sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(1).await.unwrap();
        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();

        engine
            .abort_round(AbortReason::External("newer round observed".into()))
            .await
            .unwrap();

        assert_eq!(engine.phase().await, "idle");
        assert_eq!(engine.chain_head().await, Hash::zero());
        assert!(sink.delivered().is_empty());

        // Aborting again has nothing to abort.
        let err = engine
            .abort_round(AbortReason::External("again".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoRoundInFlight));
    }

    #[tokio::test]
    async fn test_proposer_failure_report_aborts_round() {
        let (engine, _sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(1).await.unwrap();
        engine
            .report_proposal_failure("signing key unavailable")
            .await
            .unwrap();

        assert_eq!(engine.phase().await, "idle");
        match engine.last_outcome().await {
            Some(RoundOutcome::Aborted { reason, .. }) => {
                assert_eq!(reason, AbortReason::InvalidProposal);
            }
            other => panic!("expected invalid-proposal abort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_numbers_must_increase() {
        let (engine, _sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(5).await.unwrap();
        let err = engine.start_round(3).await.unwrap_err();
        assert!(matches!(err, EngineError::RoundInFlight(_)));

        engine
            .abort_round(AbortReason::External("test".into()))
            .await
            .unwrap();

        // Concluded rounds still pin the floor.
        let err = engine.start_round(5).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::StaleRound {
                requested: 5,
                current: 5
            }
        ));
        engine.start_round(6).await.unwrap();
    }

    #[tokio::test]
    async fn test_votes_rejected_outside_vote_collection() {
        let (engine, _sink, _registry) = build_engine(strong_registry(4), EngineConfig::default());

        let err = engine
            .submit_vote(ValidatorId(2), Hash::zero(), 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotCollectingVotes("idle")));

        engine.start_round(1).await.unwrap();
        let err = engine
            .submit_vote(ValidatorId(2), Hash::zero(), 0.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotCollectingVotes("block_proposal")
        ));
    }

    // ===== Snapshot isolation =====

    #[tokio::test]
    async fn test_registry_updates_do_not_leak_into_live_round() {
        let (engine, _sink, registry) = build_engine(strong_registry(4), EngineConfig::default());

        engine.start_round(1).await.unwrap();

        // Deactivation lands in the registry but not in the round's
        // snapshot; the round sees the world as it was at start.
        registry
            .write()
            .await
            .set_active(ValidatorId(2), false)
            .unwrap();
        registry
            .write()
            .await
            .update_stake(ValidatorId(3), 1)
            .unwrap();

        let candidate = candidate_for(Hash::zero(), ValidatorId(1));
        engine.submit_proposal(candidate.clone()).await.unwrap();
        let outcome = engine
            .submit_vote(ValidatorId(2), candidate.hash(), 0.0)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            VoteOutcome::Accepted(CommitStatus::Committed(_))
        ));

        // The next round picks up the new snapshot.
        engine.start_round(2).await.unwrap();
        let second = candidate_for(engine.chain_head().await, ValidatorId(1));
        engine.submit_proposal(second.clone()).await.unwrap();
        let err = engine
            .submit_vote(ValidatorId(2), second.hash(), 0.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Vote(VoteError::UnknownValidator(ValidatorId(2)))
        ));
    }
}
