use thiserror::Error;

use synod_common::{
    crypto::{Address, Hash},
    transaction::TransactionStatus,
};

use crate::{genvm::GenVmError, node::NodeError};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Transaction {0} not found")]
    TransactionNotFound(Hash),

    #[error("Transaction {0} already exists")]
    TransactionAlreadyExists(Hash),

    #[error("Contract {0} not found")]
    ContractNotFound(Address),

    #[error("No validators registered")]
    NoValidators,

    #[error("Not enough validators: required {required}, available {available}")]
    NotEnoughValidators { required: usize, available: usize },

    #[error("Transaction {0} could not be claimed")]
    ClaimMiss(Hash),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("Appeal window closed for transaction {0}")]
    AppealWindowClosed(Hash),

    #[error("Transaction {0} cannot be appealed in status {1}")]
    NotAppealable(Hash, TransactionStatus),

    #[error("Transaction {0} has no consensus data")]
    MissingConsensusData(Hash),

    #[error("Transaction {0} has no contract snapshot")]
    MissingContractSnapshot(Hash),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    GenVm(#[from] GenVmError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Effect failed: {0}")]
    EffectFailed(String),
}
