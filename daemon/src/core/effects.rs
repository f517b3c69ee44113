// Language-neutral record of the side effects produced by one state-machine
// step. The executor below is the only component allowed to mutate
// persistent state; it applies each effect in listed order and stops on the
// first failure so the worker can release the transaction.

use std::sync::Arc;

use log::{debug, trace};
use serde_json::{json, Value};

use synod_common::{
    consensus::{ConsensusData, ConsensusRound, Receipt},
    contract::{ContractAccount, StateMap},
    crypto::{Address, Hash},
    event::{EventScope, EventType, LogEvent},
    time::TimestampSeconds,
    transaction::{Transaction, TransactionStatus},
    validator::Validator,
};

use crate::{
    core::{error::ConsensusError, storage::Storage},
    event::EventBus,
};

#[derive(Clone, Debug)]
pub enum StoreWrite {
    ClearConsensusData,
    ClearContractSnapshot,
    ClearConsensusHistory,
    Transfer {
        from: Address,
        to: Address,
        value: u64,
    },
}

// The full set of effect kinds; adding a variant will not compile until the
// executor match below handles it.
#[derive(Clone, Debug)]
pub enum Effect {
    AddTimestamp {
        hash: Hash,
        state: TransactionStatus,
    },
    StatusUpdate {
        hash: Hash,
        new_status: TransactionStatus,
        append_to_history: bool,
    },
    SendMessage {
        event: LogEvent,
    },
    EmitRollupEvent {
        name: String,
        account: Address,
        hash: Hash,
        extra: Vec<Value>,
    },
    DBWrite {
        hash: Hash,
        write: StoreWrite,
    },
    RegisterContract {
        account: ContractAccount,
    },
    UpdateContractState {
        address: Address,
        accepted: Option<StateMap>,
        finalized: Option<StateMap>,
    },
    SetTransactionResult {
        hash: Hash,
        consensus_data: Option<ConsensusData>,
    },
    SetAppeal {
        hash: Hash,
        appealed: bool,
    },
    SetAppealUndetermined {
        hash: Hash,
        value: bool,
    },
    SetAppealLeaderTimeout {
        hash: Hash,
        value: bool,
    },
    SetAppealValidatorsTimeout {
        hash: Hash,
        value: bool,
    },
    SetAppealFailed {
        hash: Hash,
        count: u32,
    },
    SetAppealProcessingTime {
        hash: Hash,
    },
    ResetAppealProcessingTime {
        hash: Hash,
    },
    SetTimestampAppeal {
        hash: Hash,
        value: Option<TimestampSeconds>,
    },
    SetTimestampAwaitingFinalization {
        hash: Hash,
        value: Option<TimestampSeconds>,
    },
    SetTimestampLastVote {
        hash: Hash,
    },
    SetContractSnapshot {
        hash: Hash,
        snapshot: Option<synod_common::contract::ContractSnapshot>,
    },
    SetLeaderTimeoutValidators {
        hash: Hash,
        validators: Vec<Validator>,
    },
    ResetRotationCount {
        hash: Hash,
    },
    IncreaseRotationCount {
        hash: Hash,
    },
    UpdateConsensusHistory {
        hash: Hash,
        round: ConsensusRound,
        leader_receipts: Vec<Receipt>,
        validator_results: Vec<Receipt>,
        new_status: Option<TransactionStatus>,
    },
    InsertTriggeredTransaction {
        transaction: Transaction,
    },
}

pub struct EffectExecutor<S: Storage> {
    storage: Arc<S>,
    events: EventBus,
}

impl<S: Storage> EffectExecutor<S> {
    pub fn new(storage: Arc<S>, events: EventBus) -> Self {
        EffectExecutor { storage, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn execute(&self, effects: Vec<Effect>) -> Result<(), ConsensusError> {
        for effect in effects {
            self.execute_one(effect).await?;
        }
        Ok(())
    }

    async fn execute_one(&self, effect: Effect) -> Result<(), ConsensusError> {
        trace!("apply effect {:?}", effect);
        match effect {
            Effect::AddTimestamp { hash, state } => {
                self.storage.add_state_timestamp(&hash, state).await
            }
            Effect::StatusUpdate {
                hash,
                new_status,
                append_to_history,
            } => {
                self.storage
                    .update_transaction_status(&hash, new_status, append_to_history)
                    .await?;
                self.events.send_log(LogEvent::new(
                    "transaction_status_updated",
                    EventType::Info,
                    EventScope::Consensus,
                    format!("{} {}", new_status, hash),
                    json!({ "hash": hash, "new_status": new_status }),
                    Some(hash),
                ));
                Ok(())
            }
            Effect::SendMessage { event } => {
                self.events.send_log(event);
                Ok(())
            }
            Effect::EmitRollupEvent {
                name,
                account,
                hash,
                extra,
            } => {
                self.events.emit_rollup(name, account, hash, extra);
                Ok(())
            }
            Effect::DBWrite { hash, write } => match write {
                StoreWrite::ClearConsensusData => {
                    self.storage.set_transaction_result(&hash, None).await
                }
                StoreWrite::ClearContractSnapshot => {
                    self.storage
                        .set_transaction_contract_snapshot(&hash, None)
                        .await
                }
                StoreWrite::ClearConsensusHistory => {
                    self.storage.clear_consensus_history(&hash).await
                }
                StoreWrite::Transfer { from, to, value } => {
                    self.storage.transfer(&from, &to, value).await
                }
            },
            Effect::RegisterContract { account } => {
                debug!("registering contract {}", account.address);
                self.storage.register_contract(account).await
            }
            Effect::UpdateContractState {
                address,
                accepted,
                finalized,
            } => {
                self.storage
                    .update_contract_state(&address, accepted, finalized)
                    .await
            }
            Effect::SetTransactionResult {
                hash,
                consensus_data,
            } => {
                self.storage
                    .set_transaction_result(&hash, consensus_data)
                    .await
            }
            Effect::SetAppeal { hash, appealed } => {
                self.storage.set_transaction_appeal(&hash, appealed).await
            }
            Effect::SetAppealUndetermined { hash, value } => {
                self.storage
                    .set_transaction_appeal_undetermined(&hash, value)
                    .await
            }
            Effect::SetAppealLeaderTimeout { hash, value } => {
                self.storage
                    .set_transaction_appeal_leader_timeout(&hash, value)
                    .await
            }
            Effect::SetAppealValidatorsTimeout { hash, value } => {
                self.storage
                    .set_transaction_appeal_validators_timeout(&hash, value)
                    .await
            }
            Effect::SetAppealFailed { hash, count } => {
                self.storage
                    .set_transaction_appeal_failed(&hash, count)
                    .await
            }
            Effect::SetAppealProcessingTime { hash } => {
                self.storage
                    .set_transaction_appeal_processing_time(&hash)
                    .await
            }
            Effect::ResetAppealProcessingTime { hash } => {
                self.storage
                    .reset_transaction_appeal_processing_time(&hash)
                    .await
            }
            Effect::SetTimestampAppeal { hash, value } => {
                self.storage
                    .set_transaction_timestamp_appeal(&hash, value)
                    .await
            }
            Effect::SetTimestampAwaitingFinalization { hash, value } => {
                self.storage
                    .set_transaction_timestamp_awaiting_finalization(&hash, value)
                    .await
            }
            Effect::SetTimestampLastVote { hash } => {
                self.storage.set_transaction_timestamp_last_vote(&hash).await
            }
            Effect::SetContractSnapshot { hash, snapshot } => {
                self.storage
                    .set_transaction_contract_snapshot(&hash, snapshot)
                    .await
            }
            Effect::SetLeaderTimeoutValidators { hash, validators } => {
                self.storage
                    .set_leader_timeout_validators(&hash, validators)
                    .await
            }
            Effect::ResetRotationCount { hash } => {
                self.storage.reset_transaction_rotation_count(&hash).await
            }
            Effect::IncreaseRotationCount { hash } => {
                self.storage.increase_transaction_rotation_count(&hash).await
            }
            Effect::UpdateConsensusHistory {
                hash,
                round,
                leader_receipts,
                validator_results,
                new_status,
            } => {
                self.storage
                    .update_consensus_history(
                        &hash,
                        round,
                        leader_receipts,
                        validator_results,
                        new_status,
                    )
                    .await?;
                if let Some(status) = new_status {
                    self.events.send_log(LogEvent::new(
                        "transaction_status_updated",
                        EventType::Info,
                        EventScope::Consensus,
                        format!("{} {}", status, hash),
                        json!({ "hash": hash, "new_status": status }),
                        Some(hash),
                    ));
                }
                Ok(())
            }
            Effect::InsertTriggeredTransaction { transaction } => {
                let hash = transaction.hash;
                match self.storage.insert_transaction(transaction).await {
                    Ok(_) => Ok(()),
                    // a replayed step may have inserted it already
                    Err(ConsensusError::TransactionAlreadyExists(_)) => {
                        debug!("triggered transaction {} already inserted", hash);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::{MemoryStorage, TransactionProvider};
    use chrono::Utc;
    use synod_common::{
        crypto::ADDRESS_SIZE,
        encoding::Base64Bytes,
        transaction::{TransactionData, TransactionType},
    };

    fn executor() -> (EffectExecutor<MemoryStorage>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (
            EffectExecutor::new(storage.clone(), EventBus::new()),
            storage,
        )
    }

    fn make_tx() -> Transaction {
        Transaction::new(
            Address::new([1; ADDRESS_SIZE]),
            Address::new([2; ADDRESS_SIZE]),
            TransactionData {
                calldata: Base64Bytes::new(vec![1]),
                contract_code: None,
            },
            0,
            0,
            TransactionType::RunContract,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn effects_apply_in_listed_order() {
        let (executor, storage) = executor();
        let hash = storage.insert_transaction(make_tx()).await.unwrap();

        executor
            .execute(vec![
                Effect::StatusUpdate {
                    hash,
                    new_status: TransactionStatus::Activated,
                    append_to_history: true,
                },
                Effect::StatusUpdate {
                    hash,
                    new_status: TransactionStatus::Proposing,
                    append_to_history: true,
                },
                Effect::IncreaseRotationCount { hash },
            ])
            .await
            .unwrap();

        let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Proposing);
        assert_eq!(tx.rotation_count, 1);
        assert_eq!(tx.consensus_history.state_timestamps.len(), 2);
    }

    #[tokio::test]
    async fn first_failure_aborts_the_rest() {
        let (executor, storage) = executor();
        let hash = storage.insert_transaction(make_tx()).await.unwrap();
        let missing = Hash::new([0xff; 32]);

        let result = executor
            .execute(vec![
                Effect::SetAppealFailed { hash: missing, count: 1 },
                Effect::IncreaseRotationCount { hash },
            ])
            .await;
        assert!(result.is_err());

        let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(tx.rotation_count, 0);
    }

    #[tokio::test]
    async fn idempotent_effects_converge() {
        let (executor, storage) = executor();
        let hash = storage.insert_transaction(make_tx()).await.unwrap();

        let batch = || {
            vec![
                Effect::SetAppeal { hash, appealed: true },
                Effect::SetAppealFailed { hash, count: 2 },
                Effect::SetTimestampAppeal {
                    hash,
                    value: Some(1234),
                },
            ]
        };
        executor.execute(batch()).await.unwrap();
        let once = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
        executor.execute(batch()).await.unwrap();
        let twice = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();

        assert_eq!(once.appealed, twice.appealed);
        assert_eq!(once.appeal_failed, twice.appeal_failed);
        assert_eq!(once.timestamp_appeal, twice.timestamp_appeal);
    }

    #[tokio::test]
    async fn triggered_insert_is_idempotent() {
        let (executor, storage) = executor();
        let triggered = make_tx();

        executor
            .execute(vec![Effect::InsertTriggeredTransaction {
                transaction: triggered.clone(),
            }])
            .await
            .unwrap();
        // replaying the same effect list must not fail
        executor
            .execute(vec![Effect::InsertTriggeredTransaction {
                transaction: triggered.clone(),
            }])
            .await
            .unwrap();

        assert!(storage
            .get_transaction_by_hash(&triggered.hash)
            .await
            .unwrap()
            .is_some());
    }
}
