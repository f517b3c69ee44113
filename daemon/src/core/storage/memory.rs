// In-memory reference adapter for the repository ports. The persistent SQL
// store is an out-of-process collaborator; this adapter backs the daemon in
// simulator mode and every test.

use std::collections::BTreeMap;

use async_trait::async_trait;
use indexmap::IndexMap;
use log::trace;
use tokio::sync::RwLock;

use synod_common::{
    consensus::{ConsensusData, ConsensusRound, ConsensusRoundRecord, Receipt, StateTimestamp},
    contract::{ContractAccount, ContractSnapshot, StateMap},
    crypto::{Address, Hash},
    time::{get_current_time_in_seconds, TimestampSeconds},
    transaction::{Transaction, TransactionStatus},
    validator::Validator,
};

use crate::core::{
    error::ConsensusError,
    storage::{ContractProvider, TransactionProvider, ValidatorProvider},
};

#[derive(Default)]
pub struct MemoryStorage {
    transactions: RwLock<IndexMap<Hash, Transaction>>,
    contracts: RwLock<IndexMap<Address, ContractAccount>>,
    validators: RwLock<IndexMap<Address, Validator>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    async fn with_transaction<F>(&self, hash: &Hash, mutate: F) -> Result<(), ConsensusError>
    where
        F: FnOnce(&mut Transaction),
    {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(hash)
            .ok_or(ConsensusError::TransactionNotFound(*hash))?;
        mutate(transaction);
        Ok(())
    }
}

// Per-contract ordering key: created_at with the nonce as tie-break
fn order_key(tx: &Transaction) -> (chrono::DateTime<chrono::Utc>, u64) {
    (tx.created_at, tx.nonce)
}

fn push_state_timestamp(tx: &mut Transaction, status: TransactionStatus, now: TimestampSeconds) {
    tx.consensus_history.state_timestamps.push(StateTimestamp {
        state_name: status,
        timestamp: now,
    });
}

#[async_trait]
impl TransactionProvider for MemoryStorage {
    async fn insert_transaction(&self, transaction: Transaction) -> Result<Hash, ConsensusError> {
        let mut transactions = self.transactions.write().await;
        let hash = transaction.hash;
        if transactions.contains_key(&hash) {
            return Err(ConsensusError::TransactionAlreadyExists(hash));
        }
        trace!("insert transaction {}", hash);
        transactions.insert(hash, transaction);
        Ok(hash)
    }

    async fn get_transaction_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<Transaction>, ConsensusError> {
        Ok(self.transactions.read().await.get(hash).cloned())
    }

    async fn update_transaction_status(
        &self,
        hash: &Hash,
        status: TransactionStatus,
        append_to_history: bool,
    ) -> Result<(), ConsensusError> {
        let now = get_current_time_in_seconds();
        self.with_transaction(hash, |tx| {
            trace!("transaction {} status {} -> {}", tx.hash, tx.status, status);
            tx.status = status;
            if append_to_history {
                push_state_timestamp(tx, status, now);
            }
        })
        .await
    }

    async fn update_transaction_status_conditional(
        &self,
        hash: &Hash,
        expected: TransactionStatus,
        status: TransactionStatus,
    ) -> Result<bool, ConsensusError> {
        let now = get_current_time_in_seconds();
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(hash)
            .ok_or(ConsensusError::TransactionNotFound(*hash))?;
        if transaction.status != expected {
            return Ok(false);
        }
        transaction.status = status;
        push_state_timestamp(transaction, status, now);
        Ok(true)
    }

    async fn atomic_claim(&self, hash: &Hash) -> Result<bool, ConsensusError> {
        self.update_transaction_status_conditional(
            hash,
            TransactionStatus::Pending,
            TransactionStatus::Activated,
        )
        .await
    }

    async fn get_pending_transactions_grouped(
        &self,
    ) -> Result<Vec<(Address, Vec<Transaction>)>, ConsensusError> {
        let transactions = self.transactions.read().await;
        let mut grouped: BTreeMap<Address, Vec<Transaction>> = BTreeMap::new();
        for tx in transactions.values() {
            if tx.status == TransactionStatus::Pending {
                grouped.entry(tx.to_address).or_default().push(tx.clone());
            }
        }
        let mut result = Vec::with_capacity(grouped.len());
        for (address, mut txs) in grouped {
            txs.sort_by_key(order_key);
            result.push((address, txs));
        }
        Ok(result)
    }

    async fn get_transactions_in_process_by_contract(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, ConsensusError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.to_address == *address && tx.status.is_in_process())
            .cloned()
            .collect())
    }

    async fn get_in_process_transactions(&self) -> Result<Vec<Transaction>, ConsensusError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.status.is_in_process())
            .cloned()
            .collect())
    }

    async fn get_previous_transaction(
        &self,
        hash: &Hash,
        status_filter: Option<TransactionStatus>,
    ) -> Result<Option<Transaction>, ConsensusError> {
        let transactions = self.transactions.read().await;
        let reference = transactions
            .get(hash)
            .ok_or(ConsensusError::TransactionNotFound(*hash))?;
        let mut candidates: Vec<&Transaction> = transactions
            .values()
            .filter(|tx| {
                tx.to_address == reference.to_address
                    && order_key(tx) < order_key(reference)
                    && status_filter.map_or(true, |status| tx.status == status)
            })
            .collect();
        candidates.sort_by_key(|tx| order_key(tx));
        Ok(candidates.last().map(|tx| (*tx).clone()))
    }

    async fn get_newer_transactions(
        &self,
        hash: &Hash,
    ) -> Result<Vec<Transaction>, ConsensusError> {
        let transactions = self.transactions.read().await;
        let reference = transactions
            .get(hash)
            .ok_or(ConsensusError::TransactionNotFound(*hash))?;
        let mut newer: Vec<Transaction> = transactions
            .values()
            .filter(|tx| {
                tx.to_address == reference.to_address && order_key(tx) > order_key(reference)
            })
            .cloned()
            .collect();
        newer.sort_by_key(order_key);
        Ok(newer)
    }

    async fn get_appealed_transactions(&self) -> Result<Vec<Transaction>, ConsensusError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.appealed && tx.status.is_appealable())
            .cloned()
            .collect())
    }

    async fn get_awaiting_finalization(&self) -> Result<Vec<Transaction>, ConsensusError> {
        let transactions = self.transactions.read().await;
        let mut awaiting: Vec<Transaction> = transactions
            .values()
            .filter(|tx| {
                tx.status.is_appealable() && tx.timestamp_awaiting_finalization.is_some()
            })
            .cloned()
            .collect();
        awaiting.sort_by_key(order_key);
        Ok(awaiting)
    }

    async fn get_transaction_count_for_address(
        &self,
        address: &Address,
    ) -> Result<u64, ConsensusError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.from_address == *address && tx.status != TransactionStatus::Canceled)
            .count() as u64)
    }

    async fn get_transactions_for_address(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, ConsensusError> {
        let transactions = self.transactions.read().await;
        let mut result: Vec<Transaction> = transactions
            .values()
            .filter(|tx| tx.from_address == *address || tx.to_address == *address)
            .cloned()
            .collect();
        result.sort_by_key(order_key);
        Ok(result)
    }

    async fn count_transactions(&self) -> Result<u64, ConsensusError> {
        Ok(self.transactions.read().await.len() as u64)
    }

    async fn set_transaction_result(
        &self,
        hash: &Hash,
        consensus_data: Option<ConsensusData>,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| {
            tx.consensus_data = consensus_data.map(|data| data.stripped());
        })
        .await
    }

    async fn update_consensus_history(
        &self,
        hash: &Hash,
        round: ConsensusRound,
        leader_receipts: Vec<Receipt>,
        validator_results: Vec<Receipt>,
        new_status: Option<TransactionStatus>,
    ) -> Result<(), ConsensusError> {
        let now = get_current_time_in_seconds();
        self.with_transaction(hash, |tx| {
            tx.consensus_history.rounds.push(ConsensusRoundRecord {
                round_label: round,
                leader_receipts: leader_receipts.iter().map(Receipt::stripped).collect(),
                validator_results: validator_results.iter().map(Receipt::stripped).collect(),
            });
            if let Some(status) = new_status {
                tx.status = status;
                push_state_timestamp(tx, status, now);
            }
        })
        .await
    }

    async fn add_state_timestamp(
        &self,
        hash: &Hash,
        state: TransactionStatus,
    ) -> Result<(), ConsensusError> {
        let now = get_current_time_in_seconds();
        self.with_transaction(hash, |tx| push_state_timestamp(tx, state, now))
            .await
    }

    async fn clear_consensus_history(&self, hash: &Hash) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| {
            tx.consensus_history.rounds.clear();
            tx.consensus_history.state_timestamps.clear();
        })
        .await
    }

    async fn set_transaction_appeal(
        &self,
        hash: &Hash,
        appealed: bool,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.appealed = appealed).await
    }

    async fn set_transaction_appeal_undetermined(
        &self,
        hash: &Hash,
        value: bool,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.appeal_undetermined = value)
            .await
    }

    async fn set_transaction_appeal_leader_timeout(
        &self,
        hash: &Hash,
        value: bool,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.appeal_leader_timeout = value)
            .await
    }

    async fn set_transaction_appeal_validators_timeout(
        &self,
        hash: &Hash,
        value: bool,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.appeal_validators_timeout = value)
            .await
    }

    async fn set_transaction_appeal_failed(
        &self,
        hash: &Hash,
        count: u32,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.appeal_failed = count).await
    }

    async fn set_transaction_appeal_processing_time(
        &self,
        hash: &Hash,
    ) -> Result<(), ConsensusError> {
        let now = get_current_time_in_seconds();
        self.with_transaction(hash, |tx| {
            if let Some(since) = tx.timestamp_appeal {
                tx.appeal_processing_time += now.saturating_sub(since);
            }
        })
        .await
    }

    async fn reset_transaction_appeal_processing_time(
        &self,
        hash: &Hash,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.appeal_processing_time = 0)
            .await
    }

    async fn set_transaction_timestamp_appeal(
        &self,
        hash: &Hash,
        value: Option<TimestampSeconds>,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.timestamp_appeal = value)
            .await
    }

    async fn set_transaction_timestamp_awaiting_finalization(
        &self,
        hash: &Hash,
        value: Option<TimestampSeconds>,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.timestamp_awaiting_finalization = value)
            .await
    }

    async fn set_transaction_timestamp_last_vote(
        &self,
        hash: &Hash,
    ) -> Result<(), ConsensusError> {
        let now = get_current_time_in_seconds();
        self.with_transaction(hash, |tx| tx.last_vote_timestamp = Some(now))
            .await
    }

    async fn set_transaction_contract_snapshot(
        &self,
        hash: &Hash,
        snapshot: Option<ContractSnapshot>,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.contract_snapshot = snapshot)
            .await
    }

    async fn set_leader_timeout_validators(
        &self,
        hash: &Hash,
        validators: Vec<Validator>,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.leader_timeout_validators = validators)
            .await
    }

    async fn reset_transaction_rotation_count(&self, hash: &Hash) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.rotation_count = 0).await
    }

    async fn increase_transaction_rotation_count(
        &self,
        hash: &Hash,
    ) -> Result<(), ConsensusError> {
        self.with_transaction(hash, |tx| tx.rotation_count += 1).await
    }
}

#[async_trait]
impl ContractProvider for MemoryStorage {
    async fn register_contract(&self, account: ContractAccount) -> Result<(), ConsensusError> {
        let mut contracts = self.contracts.write().await;
        trace!("register contract {}", account.address);
        contracts.insert(account.address, account);
        Ok(())
    }

    async fn get_contract_account(
        &self,
        address: &Address,
    ) -> Result<Option<ContractAccount>, ConsensusError> {
        Ok(self.contracts.read().await.get(address).cloned())
    }

    async fn contract_exists(&self, address: &Address) -> Result<bool, ConsensusError> {
        Ok(self.contracts.read().await.contains_key(address))
    }

    async fn update_contract_state(
        &self,
        address: &Address,
        accepted: Option<StateMap>,
        finalized: Option<StateMap>,
    ) -> Result<(), ConsensusError> {
        let mut contracts = self.contracts.write().await;
        let account = contracts
            .get_mut(address)
            .ok_or(ConsensusError::ContractNotFound(*address))?;
        if let Some(state) = accepted {
            account.state.accepted = state;
        }
        if let Some(state) = finalized {
            account.state.finalized = state;
        }
        Ok(())
    }

    async fn get_balance(&self, address: &Address) -> Result<u64, ConsensusError> {
        Ok(self
            .contracts
            .read()
            .await
            .get(address)
            .map(|account| account.balance)
            .unwrap_or(0))
    }

    async fn fund_account(&self, address: &Address, amount: u64) -> Result<(), ConsensusError> {
        let mut contracts = self.contracts.write().await;
        let account = contracts
            .entry(*address)
            .or_insert_with(|| ContractAccount::new(*address));
        account.balance = account.balance.saturating_add(amount);
        Ok(())
    }

    async fn transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<(), ConsensusError> {
        let mut contracts = self.contracts.write().await;
        let moved = {
            let sender = contracts
                .entry(*from)
                .or_insert_with(|| ContractAccount::new(*from));
            let moved = sender.balance.min(amount);
            sender.balance -= moved;
            moved
        };
        let receiver = contracts
            .entry(*to)
            .or_insert_with(|| ContractAccount::new(*to));
        receiver.balance = receiver.balance.saturating_add(moved);
        Ok(())
    }
}

#[async_trait]
impl ValidatorProvider for MemoryStorage {
    async fn register_validator(&self, validator: Validator) -> Result<(), ConsensusError> {
        let mut validators = self.validators.write().await;
        validators.insert(validator.address, validator);
        Ok(())
    }

    async fn get_all_validators(&self) -> Result<Vec<Validator>, ConsensusError> {
        Ok(self.validators.read().await.values().cloned().collect())
    }

    async fn count_validators(&self) -> Result<usize, ConsensusError> {
        Ok(self.validators.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use synod_common::{
        crypto::ADDRESS_SIZE,
        encoding::Base64Bytes,
        transaction::{TransactionData, TransactionType},
    };

    fn make_tx(contract: u8, nonce: u64, at_secs: i64) -> Transaction {
        let mut tx = Transaction::new(
            Address::new([1; ADDRESS_SIZE]),
            Address::new([contract; ADDRESS_SIZE]),
            TransactionData {
                calldata: Base64Bytes::new(vec![nonce as u8]),
                contract_code: None,
            },
            0,
            nonce,
            TransactionType::RunContract,
            Utc.timestamp_opt(at_secs, 0).unwrap(),
        );
        tx.num_of_initial_validators = 3;
        tx
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_idempotent() {
        let storage = MemoryStorage::new();
        let hash = storage.insert_transaction(make_tx(9, 0, 100)).await.unwrap();

        assert!(storage.atomic_claim(&hash).await.unwrap());
        // claiming an already-claimed transaction is a no-op returning false
        assert!(!storage.atomic_claim(&hash).await.unwrap());

        let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Activated);
    }

    #[tokio::test]
    async fn conditional_update_reports_miss() {
        let storage = MemoryStorage::new();
        let hash = storage.insert_transaction(make_tx(9, 0, 100)).await.unwrap();

        let hit = storage
            .update_transaction_status_conditional(
                &hash,
                TransactionStatus::Accepted,
                TransactionStatus::Finalized,
            )
            .await
            .unwrap();
        assert!(!hit);
    }

    #[tokio::test]
    async fn newer_and_previous_queries_follow_created_at() {
        let storage = MemoryStorage::new();
        let first = storage.insert_transaction(make_tx(5, 0, 100)).await.unwrap();
        let second = storage.insert_transaction(make_tx(5, 1, 200)).await.unwrap();
        let third = storage.insert_transaction(make_tx(5, 2, 300)).await.unwrap();
        // a transaction on another contract never shows up
        storage.insert_transaction(make_tx(6, 0, 150)).await.unwrap();

        let newer = storage.get_newer_transactions(&first).await.unwrap();
        assert_eq!(
            newer.iter().map(|tx| tx.hash).collect::<Vec<_>>(),
            vec![second, third]
        );

        let previous = storage.get_previous_transaction(&third, None).await.unwrap();
        assert_eq!(previous.unwrap().hash, second);
        let previous = storage
            .get_previous_transaction(&first, None)
            .await
            .unwrap();
        assert!(previous.is_none());
    }

    #[tokio::test]
    async fn history_appends_and_strips_contract_state() {
        use synod_common::consensus::{
            encode_result, ExecutionMode, ExecutionResultStatus, NodeConfig, ResultCode,
        };

        let storage = MemoryStorage::new();
        let hash = storage.insert_transaction(make_tx(9, 0, 100)).await.unwrap();

        let mut receipt = Receipt {
            result: encode_result(ResultCode::Return, b""),
            calldata: Base64Bytes::default(),
            mode: ExecutionMode::Leader,
            vote: None,
            execution_result: ExecutionResultStatus::Success,
            contract_state: StateMap::new(),
            eq_outputs: Default::default(),
            pending_transactions: Vec::new(),
            node_config: NodeConfig::default(),
            genvm_result: None,
            processing_time_ms: None,
            nondet_disagree: None,
        };
        receipt
            .contract_state
            .insert("slot".to_string(), "dmFsdWU=".to_string());

        storage
            .update_consensus_history(
                &hash,
                ConsensusRound::Proposing,
                vec![receipt.clone()],
                vec![receipt],
                None,
            )
            .await
            .unwrap();
        storage
            .update_consensus_history(&hash, ConsensusRound::LeaderRotation, vec![], vec![], None)
            .await
            .unwrap();

        let tx = storage.get_transaction_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(tx.consensus_history.rounds.len(), 2);
        for round in &tx.consensus_history.rounds {
            for receipt in round
                .leader_receipts
                .iter()
                .chain(round.validator_results.iter())
            {
                assert!(receipt.contract_state.is_empty());
            }
        }
    }
}
