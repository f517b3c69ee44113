mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;

use synod_common::{
    consensus::{ConsensusData, ConsensusRound, Receipt},
    contract::{ContractAccount, ContractSnapshot, StateMap},
    crypto::{Address, Hash},
    time::TimestampSeconds,
    transaction::{Transaction, TransactionStatus},
    validator::Validator,
};

use crate::core::error::ConsensusError;

// Durable CRUD for transactions and consensus artifacts. Conditional
// updates report a miss instead of raising; callers treat the miss as
// "someone else owns this".
#[async_trait]
pub trait TransactionProvider {
    async fn insert_transaction(&self, transaction: Transaction) -> Result<Hash, ConsensusError>;

    async fn get_transaction_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<Transaction>, ConsensusError>;

    async fn update_transaction_status(
        &self,
        hash: &Hash,
        status: TransactionStatus,
        append_to_history: bool,
    ) -> Result<(), ConsensusError>;

    // UPDATE ... WHERE status = expected; false on a miss
    async fn update_transaction_status_conditional(
        &self,
        hash: &Hash,
        expected: TransactionStatus,
        status: TransactionStatus,
    ) -> Result<bool, ConsensusError>;

    // Flip Pending -> Activated iff currently Pending. The boolean return
    // powers the worker race.
    async fn atomic_claim(&self, hash: &Hash) -> Result<bool, ConsensusError>;

    // Pending transactions grouped by target contract, each group ordered
    // by created_at ascending
    async fn get_pending_transactions_grouped(
        &self,
    ) -> Result<Vec<(Address, Vec<Transaction>)>, ConsensusError>;

    async fn get_transactions_in_process_by_contract(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, ConsensusError>;

    async fn get_in_process_transactions(&self) -> Result<Vec<Transaction>, ConsensusError>;

    // The closest older transaction on the same contract, optionally
    // restricted to one status
    async fn get_previous_transaction(
        &self,
        hash: &Hash,
        status_filter: Option<TransactionStatus>,
    ) -> Result<Option<Transaction>, ConsensusError>;

    // Strictly newer transactions on the same contract, created_at ascending
    async fn get_newer_transactions(&self, hash: &Hash)
        -> Result<Vec<Transaction>, ConsensusError>;

    async fn get_appealed_transactions(&self) -> Result<Vec<Transaction>, ConsensusError>;

    // Transactions sitting in the finality window
    async fn get_awaiting_finalization(&self) -> Result<Vec<Transaction>, ConsensusError>;

    // Pending + included transaction count for an address (nonce source)
    async fn get_transaction_count_for_address(
        &self,
        address: &Address,
    ) -> Result<u64, ConsensusError>;

    async fn get_transactions_for_address(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, ConsensusError>;

    async fn count_transactions(&self) -> Result<u64, ConsensusError>;

    // Persist the latest round. The receipts are stripped of contract_state
    // before the write.
    async fn set_transaction_result(
        &self,
        hash: &Hash,
        consensus_data: Option<ConsensusData>,
    ) -> Result<(), ConsensusError>;

    // Append-only over history; strips contract_state before the write
    async fn update_consensus_history(
        &self,
        hash: &Hash,
        round: ConsensusRound,
        leader_receipts: Vec<Receipt>,
        validator_results: Vec<Receipt>,
        new_status: Option<TransactionStatus>,
    ) -> Result<(), ConsensusError>;

    async fn add_state_timestamp(
        &self,
        hash: &Hash,
        state: TransactionStatus,
    ) -> Result<(), ConsensusError>;

    async fn clear_consensus_history(&self, hash: &Hash) -> Result<(), ConsensusError>;

    async fn set_transaction_appeal(&self, hash: &Hash, appealed: bool)
        -> Result<(), ConsensusError>;

    async fn set_transaction_appeal_undetermined(
        &self,
        hash: &Hash,
        value: bool,
    ) -> Result<(), ConsensusError>;

    async fn set_transaction_appeal_leader_timeout(
        &self,
        hash: &Hash,
        value: bool,
    ) -> Result<(), ConsensusError>;

    async fn set_transaction_appeal_validators_timeout(
        &self,
        hash: &Hash,
        value: bool,
    ) -> Result<(), ConsensusError>;

    async fn set_transaction_appeal_failed(
        &self,
        hash: &Hash,
        count: u32,
    ) -> Result<(), ConsensusError>;

    // Accumulate the time spent on the current appeal since timestamp_appeal
    async fn set_transaction_appeal_processing_time(
        &self,
        hash: &Hash,
    ) -> Result<(), ConsensusError>;

    async fn reset_transaction_appeal_processing_time(
        &self,
        hash: &Hash,
    ) -> Result<(), ConsensusError>;

    async fn set_transaction_timestamp_appeal(
        &self,
        hash: &Hash,
        value: Option<TimestampSeconds>,
    ) -> Result<(), ConsensusError>;

    async fn set_transaction_timestamp_awaiting_finalization(
        &self,
        hash: &Hash,
        value: Option<TimestampSeconds>,
    ) -> Result<(), ConsensusError>;

    async fn set_transaction_timestamp_last_vote(&self, hash: &Hash)
        -> Result<(), ConsensusError>;

    async fn set_transaction_contract_snapshot(
        &self,
        hash: &Hash,
        snapshot: Option<ContractSnapshot>,
    ) -> Result<(), ConsensusError>;

    async fn set_leader_timeout_validators(
        &self,
        hash: &Hash,
        validators: Vec<Validator>,
    ) -> Result<(), ConsensusError>;

    async fn reset_transaction_rotation_count(&self, hash: &Hash) -> Result<(), ConsensusError>;

    async fn increase_transaction_rotation_count(&self, hash: &Hash)
        -> Result<(), ConsensusError>;
}

// Contract account state with accepted and finalized sub-states
#[async_trait]
pub trait ContractProvider {
    async fn register_contract(&self, account: ContractAccount) -> Result<(), ConsensusError>;

    async fn get_contract_account(
        &self,
        address: &Address,
    ) -> Result<Option<ContractAccount>, ConsensusError>;

    async fn contract_exists(&self, address: &Address) -> Result<bool, ConsensusError>;

    async fn update_contract_state(
        &self,
        address: &Address,
        accepted: Option<StateMap>,
        finalized: Option<StateMap>,
    ) -> Result<(), ConsensusError>;

    async fn get_balance(&self, address: &Address) -> Result<u64, ConsensusError>;

    async fn fund_account(&self, address: &Address, amount: u64) -> Result<(), ConsensusError>;

    // Move value between accounts; the deducted amount is capped at the
    // sender's balance (input validation belongs to the RPC layer)
    async fn transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<(), ConsensusError>;
}

#[async_trait]
pub trait ValidatorProvider {
    async fn register_validator(&self, validator: Validator) -> Result<(), ConsensusError>;

    async fn get_all_validators(&self) -> Result<Vec<Validator>, ConsensusError>;

    async fn count_validators(&self) -> Result<usize, ConsensusError>;
}

pub trait Storage:
    TransactionProvider + ContractProvider + ValidatorProvider + Send + Sync + 'static
{
}

impl<T> Storage for T where
    T: TransactionProvider + ContractProvider + ValidatorProvider + Send + Sync + 'static
{
}
