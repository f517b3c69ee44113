// End-to-end consensus scenarios over the in-memory storage and a
// scripted node factory.

mod common;

use std::time::Duration;

use common::*;
use synod_common::{
    consensus::{ConsensusRound, Vote},
    time::get_current_time_in_seconds,
    transaction::{PendingTransaction, TransactionStatus, TriggeredOn},
};
use synod_daemon::core::storage::{ContractProvider, TransactionProvider};

fn round_labels(rounds: &[synod_common::consensus::ConsensusRoundRecord]) -> Vec<ConsensusRound> {
    rounds.iter().map(|record| record.round_label).collect()
}

// Scenario: deploy with N=3, R=2; leader and validators agree; after the
// window elapses the transaction finalizes.
#[tokio::test]
async fn happy_path_accepts_then_finalizes() {
    let factory = ScriptedFactory::new(vec![RoundScript::writing(vec![("x", "MQ==")])]);
    let (storage, engine) = setup(10, factory).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    let contract = tx.to_address;
    storage.insert_transaction(tx).await.unwrap();

    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();

    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Accepted);
    assert_eq!(
        round_labels(&tx.consensus_history.rounds),
        vec![ConsensusRound::Proposing]
    );

    // the contract account exists with the accepted state
    let account = storage.get_contract_account(&contract).await.unwrap().unwrap();
    assert_eq!(account.state.accepted.get("x").unwrap(), "MQ==");
    assert!(account.state.finalized.is_empty());

    // every persisted receipt is stripped
    let data = tx.consensus_data.as_ref().unwrap();
    for receipt in data.leader_receipts.iter().chain(data.validators.iter()) {
        assert!(receipt.contract_state.is_empty());
    }
    assert_eq!(data.validators.len(), 3);

    // push the acceptance timestamp past the window, then finalize
    let past = get_current_time_in_seconds() - 10_000;
    storage
        .set_transaction_timestamp_awaiting_finalization(&hash, Some(past))
        .await
        .unwrap();
    let finalized = engine.finalize_due_transactions().await.unwrap();
    assert_eq!(finalized, 1);

    assert_eq!(status_of(&storage, &hash).await, TransactionStatus::Finalized);
    let account = storage.get_contract_account(&contract).await.unwrap().unwrap();
    assert_eq!(account.state.finalized.get("x").unwrap(), "MQ==");

    // finalizing again is a no-op: the transaction left the window set
    let finalized = engine.finalize_due_transactions().await.unwrap();
    assert_eq!(finalized, 0);
}

// Scenario: round 1 yields 1 Agree / 2 DeterministicViolation, the leader
// rotates, round 2 agrees. History reads [Leader Rotation, Proposing].
#[tokio::test]
async fn rotation_then_acceptance() {
    let factory = ScriptedFactory::new(vec![
        RoundScript::with_votes(vec![
            ScriptedVote::Agree,
            ScriptedVote::DeterministicViolation,
            ScriptedVote::DeterministicViolation,
        ]),
        RoundScript::all_agree(),
    ]);
    let (storage, engine) = setup(10, factory).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();

    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Accepted);
    assert_eq!(
        round_labels(&tx.consensus_history.rounds),
        vec![ConsensusRound::LeaderRotation, ConsensusRound::Proposing]
    );
    assert_eq!(tx.rotation_count, 1);
}

// Scenario: every round fails to reach a majority; after R rotations the
// transaction lands Undetermined with R+1 history entries.
#[tokio::test]
async fn rotation_exhaustion_goes_undetermined() {
    let failing_round = || {
        RoundScript::with_votes(vec![
            ScriptedVote::Agree,
            ScriptedVote::DeterministicViolation,
            ScriptedVote::DeterministicViolation,
        ])
    };
    let factory = ScriptedFactory::new(vec![failing_round(), failing_round(), failing_round()]);
    let (storage, engine) = setup(12, factory).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();

    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Undetermined);
    assert_eq!(tx.consensus_history.rounds.len(), 3);
    assert_eq!(
        round_labels(&tx.consensus_history.rounds),
        vec![
            ConsensusRound::LeaderRotation,
            ConsensusRound::LeaderRotation,
            ConsensusRound::Undetermined,
        ]
    );
}

// Scenario: the leader's receipt carries VmError "timeout". No state
// mutation happens and an appeal is still possible.
#[tokio::test]
async fn leader_timeout_is_terminal_but_appealable() {
    let factory = ScriptedFactory::new(vec![RoundScript::leader_timeout()]);
    let (storage, engine) = setup(10, factory).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    let contract = tx.to_address;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();

    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::LeaderTimeout);
    assert_eq!(
        round_labels(&tx.consensus_history.rounds),
        vec![ConsensusRound::LeaderTimeout]
    );
    // the committee was parked for the appeal path
    assert_eq!(tx.leader_timeout_validators.len(), 3);
    // no contract was registered
    assert!(storage.get_contract_account(&contract).await.unwrap().is_none());

    // the appeal window is open
    engine.file_appeal(hash).await.unwrap();
    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert!(tx.appealed);
}

// Scenario: T1 and T2 accepted against the same contract; a successful
// appeal on T1 rolls the contract back to T1's snapshot and re-executes
// both in created_at order. The final state carries T2's write again.
#[tokio::test]
async fn successful_appeal_rolls_back_and_replays() {
    let factory = ScriptedFactory::new(vec![
        // T0 deploy, T1 writes x=1, T2 writes x=12
        RoundScript::all_agree(),
        RoundScript::writing(vec![("x", "MQ==")]),
        RoundScript::writing(vec![("x", "MTI=")]),
        // replays after the rollback
        RoundScript::writing(vec![("x", "MQ==")]),
        RoundScript::writing(vec![("x", "MTI=")]),
    ]);
    let (storage, engine) = setup(15, factory.clone()).await;

    let deploy = deploy_transaction(0, 100, 3, 2);
    let contract = deploy.to_address;
    storage.insert_transaction(deploy).await.unwrap();
    let t1 = run_transaction(contract, 1, 200, 3, 2);
    let t1_hash = t1.hash;
    storage.insert_transaction(t1).await.unwrap();
    let t2 = run_transaction(contract, 2, 300, 3, 2);
    let t2_hash = t2.hash;
    storage.insert_transaction(t2).await.unwrap();

    process_all_pending(&storage, &engine).await;
    assert_eq!(status_of(&storage, &t1_hash).await, TransactionStatus::Accepted);
    assert_eq!(status_of(&storage, &t2_hash).await, TransactionStatus::Accepted);
    let account = storage.get_contract_account(&contract).await.unwrap().unwrap();
    assert_eq!(account.state.accepted.get("x").unwrap(), "MTI=");

    // file and process a successful appeal against T1
    engine.file_appeal(t1_hash).await.unwrap();
    factory.queue_appeal_votes(vec![ScriptedVote::Disagree; 5]);
    engine.process_appeal(t1_hash).await.unwrap();

    // T1 and T2 are pending again, history preserved, consensus cleared
    let t1 = storage.get_transaction_by_hash(&t1_hash).await.unwrap().unwrap();
    assert_eq!(t1.status, TransactionStatus::Pending);
    assert!(t1.consensus_data.is_none());
    assert!(t1.contract_snapshot.is_none());
    assert!(!t1.consensus_history.rounds.is_empty());
    assert!(t1
        .consensus_history
        .rounds
        .iter()
        .any(|round| round.round_label == ConsensusRound::AppealSuccessful));
    assert_eq!(status_of(&storage, &t2_hash).await, TransactionStatus::Pending);

    // the contract was rolled back to T1's snapshot
    let account = storage.get_contract_account(&contract).await.unwrap().unwrap();
    assert!(account.state.accepted.get("x").is_none());

    // replay in created_at order restores the final state
    process_all_pending(&storage, &engine).await;
    assert_eq!(status_of(&storage, &t1_hash).await, TransactionStatus::Accepted);
    assert_eq!(status_of(&storage, &t2_hash).await, TransactionStatus::Accepted);
    let account = storage.get_contract_account(&contract).await.unwrap().unwrap();
    assert_eq!(account.state.accepted.get("x").unwrap(), "MTI=");

    // the status timeline shows the second Pending pass
    let t1 = storage.get_transaction_by_hash(&t1_hash).await.unwrap().unwrap();
    let pending_entries = t1
        .consensus_history
        .state_timestamps
        .iter()
        .filter(|entry| entry.state_name == TransactionStatus::Pending)
        .count();
    assert!(pending_entries >= 1);

    // replays ran in created_at order
    let order = factory.executed_order();
    let t1_replay = order.iter().rposition(|hash| *hash == t1_hash).unwrap();
    let t2_replay = order.iter().rposition(|hash| *hash == t2_hash).unwrap();
    assert!(t1_replay < t2_replay);
}

// A failed appeal keeps the transaction Accepted, bumps appeal_failed and
// extends the finality window.
#[tokio::test]
async fn failed_appeal_extends_the_window() {
    let factory = ScriptedFactory::new(vec![RoundScript::all_agree()]);
    let (storage, engine) = setup(12, factory.clone()).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();

    let before = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    let window_start = before.timestamp_awaiting_finalization.unwrap();

    engine.file_appeal(hash).await.unwrap();
    factory.queue_appeal_votes(vec![ScriptedVote::Agree; 5]);
    engine.process_appeal(hash).await.unwrap();

    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Accepted);
    assert!(!tx.appealed);
    assert_eq!(tx.appeal_failed, 1);
    assert!(tx.timestamp_awaiting_finalization.unwrap() >= window_start);
    assert!(tx
        .consensus_history
        .rounds
        .iter()
        .any(|round| round.round_label == ConsensusRound::AppealFailed));
    // the appeal validators joined the recorded set: 3 + 5
    assert_eq!(tx.consensus_data.unwrap().validators.len(), 8);
}

// Scenario: one validator hangs past the hard deadline. An Idle receipt is
// synthesized and the other votes drive the outcome without blocking.
#[tokio::test]
async fn hung_validator_yields_idle_receipt() {
    let factory = ScriptedFactory::new(vec![RoundScript::with_votes(vec![
        ScriptedVote::Agree,
        ScriptedVote::Agree,
        ScriptedVote::Hang(60_000),
    ])]);
    let (storage, engine) = {
        use synod_daemon::core::storage::ValidatorProvider;
        let storage = std::sync::Arc::new(synod_daemon::core::storage::MemoryStorage::new());
        for validator in validator_pool(10) {
            storage.register_validator(validator).await.unwrap();
        }
        let mut engine = synod_daemon::core::consensus::ConsensusEngine::new(
            storage.clone(),
            factory.clone() as std::sync::Arc<dyn synod_daemon::node::NodeFactory>,
            synod_daemon::event::EventBus::new(),
            std::sync::Arc::new(synod_daemon::genvm::ExecutorHealth::new(3)),
        );
        engine.set_validator_deadline(Duration::from_millis(200));
        (storage, std::sync::Arc::new(engine))
    };

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());

    let started = std::time::Instant::now();
    engine.process_transaction(hash).await.unwrap();
    // hard deadline, not the hung validator, bounds the wall clock
    assert!(started.elapsed() < Duration::from_secs(5));

    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Accepted);
    let data = tx.consensus_data.unwrap();
    let idle: Vec<_> = data
        .validators
        .iter()
        .filter(|receipt| receipt.vote == Some(Vote::Idle))
        .collect();
    assert_eq!(idle.len(), 1);
    assert_eq!(
        idle[0]
            .genvm_result
            .as_ref()
            .unwrap()
            .error_code
            .as_deref(),
        Some("CONSENSUS_VALIDATOR_EXEC_TIMEOUT")
    );
}

// A majority of Timeout votes concludes the round as ValidatorsTimeout
// without touching contract state.
#[tokio::test]
async fn validators_timeout_round() {
    let factory = ScriptedFactory::new(vec![RoundScript::with_votes(vec![
        ScriptedVote::Timeout,
        ScriptedVote::Timeout,
        ScriptedVote::Agree,
    ])]);
    let (storage, engine) = setup(10, factory).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    let contract = tx.to_address;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();

    assert_eq!(
        status_of(&storage, &hash).await,
        TransactionStatus::ValidatorsTimeout
    );
    assert!(storage.get_contract_account(&contract).await.unwrap().is_none());
}

// A transaction accepted with scheduled follow-ups inserts them as fresh
// pending transactions, linked through triggered_by_hash.
#[tokio::test]
async fn accepted_transaction_inserts_triggered_transactions() {
    let mut script = RoundScript::all_agree();
    script.pending = vec![PendingTransaction {
        address: synod_common::crypto::Address::new([0x77; 20]),
        calldata: synod_common::encoding::Base64Bytes::new(vec![9]),
        code: None,
        salt_nonce: 0,
        on: TriggeredOn::Accepted,
        value: 0,
    }];
    let factory = ScriptedFactory::new(vec![script]);
    let (storage, engine) = setup(10, factory).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    let contract = tx.to_address;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();

    let triggered: Vec<_> = storage
        .get_transactions_for_address(&contract)
        .await
        .unwrap()
        .into_iter()
        .filter(|tx| tx.triggered_by_hash == Some(hash))
        .collect();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].status, TransactionStatus::Pending);
    assert_eq!(triggered[0].from_address, contract);
}

// An undetermined transaction whose appeal set reaches agreement with the
// recorded leader re-enters the pipeline and accepts on the rerun.
#[tokio::test]
async fn undetermined_appeal_reopens_and_accepts() {
    let failing_round = || {
        RoundScript::with_votes(vec![
            ScriptedVote::Agree,
            ScriptedVote::DeterministicViolation,
            ScriptedVote::DeterministicViolation,
        ])
    };
    // three failing rounds, then the rerun agrees
    let factory = ScriptedFactory::new(vec![failing_round(), failing_round(), failing_round()]);
    let (storage, engine) = setup(15, factory.clone()).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    storage.insert_transaction(tx).await.unwrap();
    assert!(storage.atomic_claim(&hash).await.unwrap());
    engine.process_transaction(hash).await.unwrap();
    assert_eq!(status_of(&storage, &hash).await, TransactionStatus::Undetermined);

    engine.file_appeal(hash).await.unwrap();
    factory.queue_appeal_votes(vec![ScriptedVote::Agree; 5]);
    engine.process_appeal(hash).await.unwrap();

    let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert!(tx.appeal_undetermined);
    assert!(tx.consensus_data.is_none());

    process_all_pending(&storage, &engine).await;
    assert_eq!(status_of(&storage, &hash).await, TransactionStatus::Accepted);
}

// Canceling is admissible while Pending only; the claim then misses.
#[tokio::test]
async fn canceled_transaction_is_not_claimable() {
    let factory = ScriptedFactory::always_agree();
    let (storage, _engine) = setup(10, factory).await;

    let tx = deploy_transaction(0, 100, 3, 2);
    let hash = tx.hash;
    storage.insert_transaction(tx).await.unwrap();

    assert!(storage
        .update_transaction_status_conditional(
            &hash,
            TransactionStatus::Pending,
            TransactionStatus::Canceled,
        )
        .await
        .unwrap());
    assert!(!storage.atomic_claim(&hash).await.unwrap());
    assert_eq!(status_of(&storage, &hash).await, TransactionStatus::Canceled);
}
