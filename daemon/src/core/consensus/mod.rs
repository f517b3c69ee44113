// The per-transaction consensus state machine.
//
// Phase handlers inspect the transaction and its collaborator results and
// produce effect lists; the effect executor is the only thing that touches
// the store. Given identical collaborator return values the handlers
// produce identical effect lists.

mod appeal;
mod finality;
mod recovery;

use std::sync::Arc;

use futures::future::join_all;
use indexmap::IndexMap;
use log::{debug, info, warn};
use serde_json::json;

use synod_common::{
    consensus::{ConsensusData, ConsensusRound, ExecutionMode, ExecutionResultStatus, Receipt, Vote},
    contract::{ContractAccount, ContractSnapshot, ContractState},
    crypto::{Address, Hash},
    event::{EventScope, EventType, LogEvent},
    time::get_current_time_in_seconds,
    transaction::{
        PendingTransaction, Transaction, TransactionData, TransactionStatus, TransactionType,
        TriggeredOn,
    },
    validator::Validator,
};

use crate::{
    config,
    core::{
        effects::{Effect, EffectExecutor, StoreWrite},
        error::ConsensusError,
        storage::Storage,
    },
    event::EventBus,
    genvm::{
        error_codes::{GenVmErrorCode, CONSENSUS_VALIDATOR_EXEC_TIMEOUT},
        ExecutorHealth,
    },
    node::{make_idle_receipt, NodeError, NodeFactory, NodeRequest},
};

pub struct ConsensusEngine<S: Storage> {
    storage: Arc<S>,
    node_factory: Arc<dyn NodeFactory>,
    executor: EffectExecutor<S>,
    events: EventBus,
    health: Arc<ExecutorHealth>,
    validator_deadline: std::time::Duration,
}

// Outcome of one Proposing->Committing->Revealing pass
enum RoundOutcome {
    Accepted,
    Rotate,
    ValidatorsTimeout,
}

impl<S: Storage> ConsensusEngine<S> {
    pub fn new(
        storage: Arc<S>,
        node_factory: Arc<dyn NodeFactory>,
        events: EventBus,
        health: Arc<ExecutorHealth>,
    ) -> Self {
        let executor = EffectExecutor::new(storage.clone(), events.clone());
        ConsensusEngine {
            storage,
            node_factory,
            executor,
            events,
            health,
            validator_deadline: config::validator_hard_deadline(),
        }
    }

    // Override the hard per-validator deadline (tests use short ones)
    pub fn set_validator_deadline(&mut self, deadline: std::time::Duration) {
        self.validator_deadline = deadline;
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn health(&self) -> &Arc<ExecutorHealth> {
        &self.health
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // Entry point for a freshly claimed transaction. On error the
    // transaction is released back to Pending, history intact, for the
    // next sweep to retry.
    pub async fn process_transaction(&self, hash: Hash) -> Result<(), ConsensusError> {
        let transaction = self
            .storage
            .get_transaction_by_hash(&hash)
            .await?
            .ok_or(ConsensusError::TransactionNotFound(hash))?;
        if transaction.status != TransactionStatus::Activated {
            debug!(
                "transaction {} not activated (status {}), skipping",
                hash, transaction.status
            );
            return Ok(());
        }

        match self.run_cycle(transaction).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.release_after_failure(&hash, &err).await;
                Err(err)
            }
        }
    }

    async fn release_after_failure(&self, hash: &Hash, err: &ConsensusError) {
        warn!("releasing transaction {} after failure: {}", hash, err);
        if matches!(err, ConsensusError::Node(NodeError::InternalExecutor { .. })) {
            self.health.record_failure();
        }
        if let Err(release_err) = self
            .storage
            .update_transaction_status(hash, TransactionStatus::Pending, true)
            .await
        {
            warn!("could not release transaction {}: {}", hash, release_err);
        }
    }

    async fn run_cycle(&self, transaction: Transaction) -> Result<(), ConsensusError> {
        let hash = transaction.hash;

        // plain value transfers skip the executor entirely
        if transaction.tx_type == TransactionType::Send {
            return self.accept_transfer(&transaction).await;
        }

        // a call against a contract that never materialized is canceled
        if transaction.tx_type == TransactionType::RunContract
            && !self.storage.contract_exists(&transaction.to_address).await?
        {
            info!(
                "canceling {}: target contract {} does not exist",
                hash, transaction.to_address
            );
            return self
                .executor
                .execute(vec![Effect::StatusUpdate {
                    hash,
                    new_status: TransactionStatus::Canceled,
                    append_to_history: true,
                }])
                .await;
        }

        let all_validators = self.storage.get_all_validators().await?;
        if all_validators.is_empty() {
            return Err(ConsensusError::NoValidators);
        }

        // snapshot is captured once per accepted execution
        let (snapshot, mut entry_effects) = match &transaction.contract_snapshot {
            Some(snapshot) => (snapshot.clone(), Vec::new()),
            None => {
                let snapshot = self.capture_snapshot(&transaction).await?;
                (
                    snapshot.clone(),
                    vec![Effect::SetContractSnapshot {
                        hash,
                        snapshot: Some(snapshot),
                    }],
                )
            }
        };

        // the leader is selected on top of the N voting validators
        let committee_size = (transaction.num_of_initial_validators + 1)
            .max(1)
            .min(all_validators.len());
        let selection_round = transaction.consensus_history.rounds.len() as u64;
        let committee = crate::vrf::select_validators(
            &all_validators,
            committee_size,
            &hash,
            selection_round,
        )?;

        let mut leader = committee[0].clone();
        let mut remaining: Vec<Validator> = if transaction.leader_only {
            Vec::new()
        } else {
            committee[1..].to_vec()
        };
        let mut used_leaders: Vec<Address> =
            transaction.consensus_history.used_leader_addresses();
        let mut rotations = transaction.rotation_count;

        entry_effects.push(Effect::StatusUpdate {
            hash,
            new_status: TransactionStatus::Proposing,
            append_to_history: true,
        });
        self.executor.execute(entry_effects).await?;

        loop {
            // Proposing: the leader executes and defines the reference
            let leader_node = self.node_factory.make(NodeRequest {
                validator: leader.clone(),
                mode: ExecutionMode::Leader,
                contract_snapshot: snapshot.clone(),
                leader_receipt: None,
            });
            let mut leader_receipt = leader_node.exec_transaction(&transaction).await?;
            leader_receipt.vote = Some(Vote::NotVoted);
            self.health.record_success();

            if leader_receipt.is_timeout() {
                return self
                    .finish_leader_timeout(&transaction, leader_receipt, remaining)
                    .await;
            }

            if transaction.leader_only || remaining.is_empty() {
                return self
                    .finish_accepted(&transaction, leader_receipt, Vec::new(), IndexMap::new())
                    .await;
            }

            // Committing: all validators execute concurrently under the
            // hard per-call deadline
            self.executor
                .execute(vec![Effect::StatusUpdate {
                    hash,
                    new_status: TransactionStatus::Committing,
                    append_to_history: true,
                }])
                .await?;
            let receipts = self
                .run_validators(&transaction, &remaining, &leader_receipt, &snapshot)
                .await;

            // Revealing: votes are tallied
            self.executor
                .execute(vec![
                    Effect::StatusUpdate {
                        hash,
                        new_status: TransactionStatus::Revealing,
                        append_to_history: true,
                    },
                    Effect::SetTimestampLastVote { hash },
                ])
                .await?;

            let votes = collect_votes(&receipts);
            match tally_round(&receipts) {
                RoundOutcome::Accepted => {
                    return self
                        .finish_accepted(&transaction, leader_receipt, receipts, votes)
                        .await;
                }
                RoundOutcome::ValidatorsTimeout => {
                    return self
                        .finish_validators_timeout(&transaction, leader_receipt, receipts, votes)
                        .await;
                }
                RoundOutcome::Rotate => {
                    if rotations >= transaction.config_rotation_rounds {
                        return self
                            .finish_undetermined(&transaction, leader_receipt, receipts, votes)
                            .await;
                    }

                    used_leaders.push(leader.address);
                    let Some(next_leader_index) = remaining
                        .iter()
                        .position(|validator| !used_leaders.contains(&validator.address))
                    else {
                        return self
                            .finish_undetermined(&transaction, leader_receipt, receipts, votes)
                            .await;
                    };

                    self.executor
                        .execute(vec![
                            Effect::UpdateConsensusHistory {
                                hash,
                                round: ConsensusRound::LeaderRotation,
                                leader_receipts: vec![leader_receipt.clone()],
                                validator_results: receipts.clone(),
                                new_status: None,
                            },
                            Effect::IncreaseRotationCount { hash },
                            Effect::SendMessage {
                                event: LogEvent::new(
                                    "leader_rotation",
                                    EventType::Info,
                                    EventScope::Consensus,
                                    format!("rotating leader for {}", hash),
                                    json!({ "old_leader": leader.address }),
                                    Some(hash),
                                ),
                            },
                            Effect::StatusUpdate {
                                hash,
                                new_status: TransactionStatus::Proposing,
                                append_to_history: true,
                            },
                        ])
                        .await?;

                    leader = remaining.remove(next_leader_index);
                    rotations += 1;

                    // top up the committee from the untouched pool
                    let committee_addresses: Vec<Address> = remaining
                        .iter()
                        .map(|validator| validator.address)
                        .chain(std::iter::once(leader.address))
                        .collect();
                    let pool: Vec<Validator> = all_validators
                        .iter()
                        .filter(|validator| {
                            !used_leaders.contains(&validator.address)
                                && !committee_addresses.contains(&validator.address)
                        })
                        .cloned()
                        .collect();
                    if !pool.is_empty() {
                        let fresh = crate::vrf::select_validators(
                            &pool,
                            1,
                            &hash,
                            selection_round + rotations as u64,
                        )?;
                        remaining.extend(fresh);
                    }
                }
            }
        }
    }

    async fn capture_snapshot(
        &self,
        transaction: &Transaction,
    ) -> Result<ContractSnapshot, ConsensusError> {
        if transaction.is_deploy() {
            return Ok(ContractSnapshot::empty(
                transaction.to_address,
                transaction.value,
            ));
        }
        let account = self
            .storage
            .get_contract_account(&transaction.to_address)
            .await?
            .ok_or(ConsensusError::ContractNotFound(transaction.to_address))?;
        Ok(ContractSnapshot::from_account(&account))
    }

    // Validator fan-out with the hard deadline; hung or failed validators
    // yield synthesized Idle receipts so the round can still conclude
    pub(crate) async fn run_validators(
        &self,
        transaction: &Transaction,
        validators: &[Validator],
        leader_receipt: &Receipt,
        snapshot: &ContractSnapshot,
    ) -> Vec<Receipt> {
        let deadline = self.validator_deadline;
        let tasks = validators.iter().map(|validator| {
            let node = self.node_factory.make(NodeRequest {
                validator: validator.clone(),
                mode: ExecutionMode::Validator,
                contract_snapshot: snapshot.clone(),
                leader_receipt: Some(leader_receipt.clone()),
            });
            let transaction = transaction.clone();
            let validator = validator.clone();
            async move {
                match tokio::time::timeout(deadline, node.exec_transaction(&transaction)).await {
                    Ok(Ok(receipt)) => receipt,
                    Ok(Err(err)) => {
                        warn!(
                            "validator {} failed on {}: {}",
                            validator.address, transaction.hash, err
                        );
                        let code = match &err {
                            NodeError::InternalExecutor {
                                error_code: Some(code),
                                ..
                            } => code.clone(),
                            _ => GenVmErrorCode::InternalError.as_str().to_string(),
                        };
                        make_idle_receipt(&validator, transaction.data.calldata.clone(), &code)
                    }
                    Err(_) => {
                        warn!(
                            "validator {} exceeded the hard deadline on {}",
                            validator.address, transaction.hash
                        );
                        make_idle_receipt(
                            &validator,
                            transaction.data.calldata.clone(),
                            CONSENSUS_VALIDATOR_EXEC_TIMEOUT,
                        )
                    }
                }
            }
        });
        join_all(tasks).await
    }

    async fn accept_transfer(&self, transaction: &Transaction) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let now = get_current_time_in_seconds();
        self.executor
            .execute(vec![
                Effect::DBWrite {
                    hash,
                    write: StoreWrite::Transfer {
                        from: transaction.from_address,
                        to: transaction.to_address,
                        value: transaction.value,
                    },
                },
                Effect::UpdateConsensusHistory {
                    hash,
                    round: ConsensusRound::Accepted,
                    leader_receipts: Vec::new(),
                    validator_results: Vec::new(),
                    new_status: Some(TransactionStatus::Accepted),
                },
                Effect::SetTimestampAwaitingFinalization {
                    hash,
                    value: Some(now),
                },
                Effect::EmitRollupEvent {
                    name: "transaction_accepted".to_string(),
                    account: transaction.to_address,
                    hash,
                    extra: Vec::new(),
                },
            ])
            .await
    }

    pub(crate) async fn finish_accepted(
        &self,
        transaction: &Transaction,
        leader_receipt: Receipt,
        receipts: Vec<Receipt>,
        votes: IndexMap<Address, Vote>,
    ) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let now = get_current_time_in_seconds();

        let consensus_data = ConsensusData {
            votes,
            leader_receipts: vec![leader_receipt.clone()],
            validators: receipts.clone(),
        };

        let mut effects = vec![
            Effect::SetTransactionResult {
                hash,
                consensus_data: Some(consensus_data),
            },
            Effect::UpdateConsensusHistory {
                hash,
                round: ConsensusRound::Proposing,
                leader_receipts: vec![leader_receipt.clone()],
                validator_results: receipts,
                new_status: Some(TransactionStatus::Accepted),
            },
        ];

        // contract mutations only for successful executions
        if leader_receipt.execution_result == ExecutionResultStatus::Success {
            if transaction.is_deploy() {
                effects.push(Effect::RegisterContract {
                    account: ContractAccount {
                        address: transaction.to_address,
                        balance: transaction.value,
                        state: ContractState {
                            accepted: leader_receipt.contract_state.clone(),
                            finalized: Default::default(),
                        },
                    },
                });
            } else {
                effects.push(Effect::UpdateContractState {
                    address: transaction.to_address,
                    accepted: Some(leader_receipt.contract_state.clone()),
                    finalized: None,
                });
            }
        }

        effects.push(Effect::SetTimestampAwaitingFinalization {
            hash,
            value: Some(now),
        });
        effects.push(Effect::SetTimestampAppeal { hash, value: None });
        effects.push(Effect::EmitRollupEvent {
            name: "transaction_accepted".to_string(),
            account: transaction.to_address,
            hash,
            extra: Vec::new(),
        });

        // schedule follow-up transactions requested for acceptance
        effects.extend(
            self.triggered_transaction_effects(
                transaction,
                &leader_receipt.pending_transactions,
                TriggeredOn::Accepted,
            )
            .await?,
        );

        self.executor.execute(effects).await?;
        info!("transaction {} accepted", hash);
        Ok(())
    }

    async fn finish_validators_timeout(
        &self,
        transaction: &Transaction,
        leader_receipt: Receipt,
        receipts: Vec<Receipt>,
        votes: IndexMap<Address, Vote>,
    ) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let now = get_current_time_in_seconds();
        let consensus_data = ConsensusData {
            votes,
            leader_receipts: vec![leader_receipt.clone()],
            validators: receipts.clone(),
        };
        // no contract state mutation under a timeout status
        self.executor
            .execute(vec![
                Effect::SetTransactionResult {
                    hash,
                    consensus_data: Some(consensus_data),
                },
                Effect::UpdateConsensusHistory {
                    hash,
                    round: ConsensusRound::ValidatorsTimeout,
                    leader_receipts: vec![leader_receipt],
                    validator_results: receipts,
                    new_status: Some(TransactionStatus::ValidatorsTimeout),
                },
                Effect::SetTimestampAwaitingFinalization {
                    hash,
                    value: Some(now),
                },
            ])
            .await?;
        info!("transaction {} hit validators timeout", hash);
        Ok(())
    }

    async fn finish_leader_timeout(
        &self,
        transaction: &Transaction,
        leader_receipt: Receipt,
        remaining: Vec<Validator>,
    ) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let now = get_current_time_in_seconds();
        let consensus_data = ConsensusData {
            votes: IndexMap::new(),
            leader_receipts: vec![leader_receipt.clone()],
            validators: Vec::new(),
        };
        // no contract state mutation; the committee is retained so an
        // appeal can resume with the same validators
        self.executor
            .execute(vec![
                Effect::SetTransactionResult {
                    hash,
                    consensus_data: Some(consensus_data),
                },
                Effect::SetLeaderTimeoutValidators {
                    hash,
                    validators: remaining,
                },
                Effect::UpdateConsensusHistory {
                    hash,
                    round: ConsensusRound::LeaderTimeout,
                    leader_receipts: vec![leader_receipt],
                    validator_results: Vec::new(),
                    new_status: Some(TransactionStatus::LeaderTimeout),
                },
                Effect::SetTimestampAwaitingFinalization {
                    hash,
                    value: Some(now),
                },
            ])
            .await?;
        info!("transaction {} hit leader timeout", hash);
        Ok(())
    }

    async fn finish_undetermined(
        &self,
        transaction: &Transaction,
        leader_receipt: Receipt,
        receipts: Vec<Receipt>,
        votes: IndexMap<Address, Vote>,
    ) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let now = get_current_time_in_seconds();
        let consensus_data = ConsensusData {
            votes,
            leader_receipts: vec![leader_receipt.clone()],
            validators: receipts.clone(),
        };
        self.executor
            .execute(vec![
                Effect::SetTransactionResult {
                    hash,
                    consensus_data: Some(consensus_data),
                },
                Effect::UpdateConsensusHistory {
                    hash,
                    round: ConsensusRound::Undetermined,
                    leader_receipts: vec![leader_receipt],
                    validator_results: receipts,
                    new_status: Some(TransactionStatus::Undetermined),
                },
                Effect::SetTimestampAwaitingFinalization {
                    hash,
                    value: Some(now),
                },
            ])
            .await?;
        info!("transaction {} undetermined after rotations", hash);
        Ok(())
    }

    // Build insert effects for the follow-ups a contract scheduled
    pub(crate) async fn triggered_transaction_effects(
        &self,
        parent: &Transaction,
        pending: &[PendingTransaction],
        wanted: TriggeredOn,
    ) -> Result<Vec<Effect>, ConsensusError> {
        let relevant: Vec<&PendingTransaction> =
            pending.iter().filter(|p| p.on == wanted).collect();
        if relevant.is_empty() {
            return Ok(Vec::new());
        }

        let from = parent.to_address;
        let base_nonce = self.storage.get_transaction_count_for_address(&from).await?;
        let mut effects = Vec::with_capacity(relevant.len());
        for (offset, pending) in relevant.into_iter().enumerate() {
            let nonce = base_nonce + offset as u64;
            let (to, tx_type, data) = if pending.is_deploy() {
                let to = Address::derive_contract_address(&from, nonce ^ pending.salt_nonce);
                (
                    to,
                    TransactionType::DeployContract,
                    TransactionData {
                        calldata: pending.calldata.clone(),
                        contract_code: pending.code.clone(),
                    },
                )
            } else {
                (
                    pending.address,
                    TransactionType::RunContract,
                    TransactionData {
                        calldata: pending.calldata.clone(),
                        contract_code: None,
                    },
                )
            };

            let mut transaction = Transaction::new(
                from,
                to,
                data,
                pending.value,
                nonce,
                tx_type,
                chrono::Utc::now(),
            );
            transaction.leader_only = parent.leader_only;
            transaction.num_of_initial_validators = parent.num_of_initial_validators;
            transaction.config_rotation_rounds = parent.config_rotation_rounds;
            transaction.triggered_by_hash = Some(parent.hash);
            effects.push(Effect::InsertTriggeredTransaction { transaction });
        }
        Ok(effects)
    }

    pub(crate) fn effect_executor(&self) -> &EffectExecutor<S> {
        &self.executor
    }
}

pub(crate) fn collect_votes(receipts: &[Receipt]) -> IndexMap<Address, Vote> {
    receipts
        .iter()
        .map(|receipt| {
            (
                receipt.node_config.address,
                receipt.vote.unwrap_or(Vote::NotVoted),
            )
        })
        .collect()
}

pub(crate) fn strict_majority(count: usize, total: usize) -> bool {
    count * 2 > total
}

fn tally_round(receipts: &[Receipt]) -> RoundOutcome {
    let total = receipts.len();
    let agree = receipts
        .iter()
        .filter(|receipt| receipt.vote == Some(Vote::Agree))
        .count();
    let timed_out = receipts
        .iter()
        .filter(|receipt| receipt.vote == Some(Vote::Timeout))
        .count();

    if strict_majority(agree, total) {
        RoundOutcome::Accepted
    } else if strict_majority(timed_out, total) {
        RoundOutcome::ValidatorsTimeout
    } else {
        RoundOutcome::Rotate
    }
}

// Whether an appeal round re-confirmed the original outcome
pub(crate) fn appeal_confirms(receipts: &[Receipt]) -> bool {
    let agree = receipts
        .iter()
        .filter(|receipt| receipt.vote == Some(Vote::Agree))
        .count();
    strict_majority(agree, receipts.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_majority_is_strict() {
        assert!(!strict_majority(1, 2));
        assert!(strict_majority(2, 3));
        assert!(!strict_majority(2, 4));
        assert!(strict_majority(3, 4));
        assert!(!strict_majority(0, 0));
    }
}
