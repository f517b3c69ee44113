use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    consensus::{ConsensusData, ConsensusHistory},
    contract::ContractSnapshot,
    crypto::{keccak256, Address, Hash},
    encoding::Base64Bytes,
    time::TimestampSeconds,
    validator::Validator,
};

// this enum represents all types of transaction available on the simulator
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Send,
    DeployContract,
    RunContract,
}

impl TransactionType {
    pub fn as_u8(&self) -> u8 {
        match self {
            TransactionType::Send => 0,
            TransactionType::DeployContract => 1,
            TransactionType::RunContract => 2,
        }
    }
}

#[derive(
    Serialize, Deserialize, Display, EnumString, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Activated,
    Canceled,
    Proposing,
    Committing,
    Revealing,
    Accepted,
    Finalized,
    Undetermined,
    LeaderTimeout,
    ValidatorsTimeout,
}

impl TransactionStatus {
    // A worker owns a transaction by holding it in one of these states
    pub fn is_in_process(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Activated
                | TransactionStatus::Proposing
                | TransactionStatus::Committing
                | TransactionStatus::Revealing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Finalized | TransactionStatus::Canceled
        )
    }

    // States that sit in the finality window and may be re-opened
    pub fn is_appealable(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Accepted
                | TransactionStatus::Undetermined
                | TransactionStatus::LeaderTimeout
                | TransactionStatus::ValidatorsTimeout
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredOn {
    Accepted,
    Finalized,
}

// A follow-up transaction scheduled by a contract during execution. It is
// inserted as a fresh Pending transaction once the parent reaches the
// requested status.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingTransaction {
    pub address: Address,
    pub calldata: Base64Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Base64Bytes>,
    #[serde(default)]
    pub salt_nonce: u64,
    pub on: TriggeredOn,
    #[serde(default)]
    pub value: u64,
}

impl PendingTransaction {
    pub fn is_deploy(&self) -> bool {
        self.code.is_some()
    }
}

// Method + calldata payload; deploys additionally carry the code blob
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionData {
    #[serde(default)]
    pub calldata: Base64Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_code: Option<Base64Bytes>,
}

// The unit of consensus. Mutated only by the effect executor on behalf of
// the consensus state machine, never deleted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Transaction {
    pub hash: Hash,
    pub status: TransactionStatus,
    pub from_address: Address,
    pub to_address: Address,
    pub data: TransactionData,
    pub value: u64,
    pub nonce: u64,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub created_at: DateTime<Utc>,
    pub leader_only: bool,
    pub num_of_initial_validators: usize,
    pub config_rotation_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_data: Option<ConsensusData>,
    #[serde(default)]
    pub consensus_history: ConsensusHistory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_snapshot: Option<ContractSnapshot>,
    #[serde(default)]
    pub appealed: bool,
    #[serde(default)]
    pub appeal_failed: u32,
    #[serde(default)]
    pub appeal_undetermined: bool,
    #[serde(default)]
    pub appeal_leader_timeout: bool,
    #[serde(default)]
    pub appeal_validators_timeout: bool,
    #[serde(default)]
    pub appeal_processing_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_appeal: Option<TimestampSeconds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_awaiting_finalization: Option<TimestampSeconds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_vote_timestamp: Option<TimestampSeconds>,
    #[serde(default)]
    pub rotation_count: u32,
    #[serde(default)]
    pub leader_timeout_validators: Vec<Validator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by_hash: Option<Hash>,
}

impl Transaction {
    pub fn new(
        from_address: Address,
        to_address: Address,
        data: TransactionData,
        value: u64,
        nonce: u64,
        tx_type: TransactionType,
        created_at: DateTime<Utc>,
    ) -> Self {
        let hash = Transaction::compute_hash(
            &from_address,
            &to_address,
            &data,
            nonce,
            value,
            tx_type,
        );
        Transaction {
            hash,
            status: TransactionStatus::Pending,
            from_address,
            to_address,
            data,
            value,
            nonce,
            tx_type,
            created_at,
            leader_only: false,
            num_of_initial_validators: crate::config::DEFAULT_NUM_INITIAL_VALIDATORS,
            config_rotation_rounds: crate::config::DEFAULT_ROTATION_ROUNDS,
            consensus_data: None,
            consensus_history: ConsensusHistory::default(),
            contract_snapshot: None,
            appealed: false,
            appeal_failed: 0,
            appeal_undetermined: false,
            appeal_leader_timeout: false,
            appeal_validators_timeout: false,
            appeal_processing_time: 0,
            timestamp_appeal: None,
            timestamp_awaiting_finalization: None,
            last_vote_timestamp: None,
            rotation_count: 0,
            leader_timeout_validators: Vec::new(),
            triggered_by_hash: None,
        }
    }

    // Deterministic hash over (from, to, data, nonce, value, type)
    pub fn compute_hash(
        from_address: &Address,
        to_address: &Address,
        data: &TransactionData,
        nonce: u64,
        value: u64,
        tx_type: TransactionType,
    ) -> Hash {
        let mut material = Vec::new();
        material.extend_from_slice(from_address.as_bytes());
        material.extend_from_slice(to_address.as_bytes());
        material.extend_from_slice(&keccak256(&data.calldata));
        if let Some(code) = &data.contract_code {
            material.extend_from_slice(&keccak256(code));
        }
        material.extend_from_slice(&nonce.to_le_bytes());
        material.extend_from_slice(&value.to_le_bytes());
        material.push(tx_type.as_u8());
        Hash::new(keccak256(&material))
    }

    pub fn is_deploy(&self) -> bool {
        self.tx_type == TransactionType::DeployContract
    }

    // Whether the finality window has elapsed for this transaction
    pub fn finality_window_elapsed(&self, window: TimestampSeconds, now: TimestampSeconds) -> bool {
        match self.timestamp_awaiting_finalization {
            Some(since) => now.saturating_sub(since) >= window,
            None => false,
        }
    }

    // Whether an appeal is still admissible
    pub fn appeal_window_open(&self, window: TimestampSeconds, now: TimestampSeconds) -> bool {
        match self.timestamp_awaiting_finalization {
            Some(since) => now.saturating_sub(since) < window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ADDRESS_SIZE;

    fn sample_data() -> TransactionData {
        TransactionData {
            calldata: Base64Bytes::new(vec![1, 2, 3]),
            contract_code: None,
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let from = Address::new([1; ADDRESS_SIZE]);
        let to = Address::new([2; ADDRESS_SIZE]);
        let a = Transaction::compute_hash(&from, &to, &sample_data(), 0, 5, TransactionType::RunContract);
        let b = Transaction::compute_hash(&from, &to, &sample_data(), 0, 5, TransactionType::RunContract);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_depends_on_every_field() {
        let from = Address::new([1; ADDRESS_SIZE]);
        let to = Address::new([2; ADDRESS_SIZE]);
        let base = Transaction::compute_hash(&from, &to, &sample_data(), 0, 5, TransactionType::RunContract);
        assert_ne!(
            base,
            Transaction::compute_hash(&from, &to, &sample_data(), 1, 5, TransactionType::RunContract)
        );
        assert_ne!(
            base,
            Transaction::compute_hash(&from, &to, &sample_data(), 0, 6, TransactionType::RunContract)
        );
        assert_ne!(
            base,
            Transaction::compute_hash(&from, &to, &sample_data(), 0, 5, TransactionType::Send)
        );
        let mut other_data = sample_data();
        other_data.calldata = Base64Bytes::new(vec![9]);
        assert_ne!(
            base,
            Transaction::compute_hash(&from, &to, &other_data, 0, 5, TransactionType::RunContract)
        );
    }

    #[test]
    fn status_classification() {
        assert!(TransactionStatus::Proposing.is_in_process());
        assert!(!TransactionStatus::Pending.is_in_process());
        assert!(TransactionStatus::Accepted.is_appealable());
        assert!(TransactionStatus::Undetermined.is_appealable());
        assert!(!TransactionStatus::Finalized.is_appealable());
        assert!(TransactionStatus::Canceled.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        assert_eq!(TransactionStatus::LeaderTimeout.to_string(), "LEADER_TIMEOUT");
        let parsed: TransactionStatus = "VALIDATORS_TIMEOUT".parse().unwrap();
        assert_eq!(parsed, TransactionStatus::ValidatorsTimeout);
    }

    #[test]
    fn appeal_window_accounting() {
        let mut tx = Transaction::new(
            Address::new([1; ADDRESS_SIZE]),
            Address::new([2; ADDRESS_SIZE]),
            sample_data(),
            0,
            0,
            TransactionType::RunContract,
            Utc::now(),
        );
        assert!(!tx.appeal_window_open(100, 50));
        tx.timestamp_awaiting_finalization = Some(40);
        assert!(tx.appeal_window_open(100, 50));
        assert!(!tx.finality_window_elapsed(100, 50));
        assert!(tx.finality_window_elapsed(100, 140));
        assert!(!tx.appeal_window_open(100, 140));
    }
}
