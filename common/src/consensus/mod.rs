// Receipts, votes and per-round consensus artifacts.
//
// A Receipt is one validator's output for one transaction execution. The
// leader receipt of a round defines the reference values every validator is
// compared against; `contract_state` is carried in memory for that
// comparison and stripped at the persistence boundary.

use indexmap::IndexMap;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use crate::{
    contract::StateMap,
    crypto::Address,
    encoding::Base64Bytes,
    time::TimestampSeconds,
    transaction::{PendingTransaction, TransactionStatus},
};

// First byte of every execution result payload
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Return = 0,
    UserError = 1,
    VmError = 2,
    InternalError = 3,
}

impl ResultCode {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResultCode::Return),
            1 => Some(ResultCode::UserError),
            2 => Some(ResultCode::VmError),
            3 => Some(ResultCode::InternalError),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

// Build a result payload from its code prefix and data
pub fn encode_result(code: ResultCode, payload: &[u8]) -> Base64Bytes {
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(code.as_byte());
    bytes.extend_from_slice(payload);
    Base64Bytes::new(bytes)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    NotVoted,
    Agree,
    Disagree,
    Timeout,
    DeterministicViolation,
    Idle,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Leader,
    Validator,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionResultStatus {
    Success,
    Error,
}

// Raw executor output attached to a receipt for debugging and error
// classification. `error_code` is one of the GenVM error-code strings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GenVmResult {
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<serde_json::Value>,
}

// The validator identity a receipt was produced under. The private key
// never leaves the validator record; only public material is persisted.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeConfig {
    pub address: Address,
    pub stake: u64,
    pub provider: String,
    pub model: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Receipt {
    pub result: Base64Bytes,
    pub calldata: Base64Bytes,
    pub mode: ExecutionMode,
    pub vote: Option<Vote>,
    pub execution_result: ExecutionResultStatus,
    #[serde(default)]
    pub contract_state: StateMap,
    #[serde(default)]
    pub eq_outputs: IndexMap<u32, String>,
    #[serde(default)]
    pub pending_transactions: Vec<PendingTransaction>,
    pub node_config: NodeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genvm_result: Option<GenVmResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nondet_disagree: Option<u32>,
}

impl Receipt {
    pub fn result_code(&self) -> Option<ResultCode> {
        self.result.first().copied().and_then(ResultCode::from_byte)
    }

    pub fn result_payload(&self) -> &[u8] {
        if self.result.is_empty() {
            &[]
        } else {
            &self.result[1..]
        }
    }

    // A VM error whose message starts with "timeout" marks an execution
    // that exceeded its fuel/time budget inside the executor
    pub fn is_timeout(&self) -> bool {
        self.result_code() == Some(ResultCode::VmError)
            && self.result_payload().starts_with(b"timeout")
    }

    // The four reference fields of the vote table
    pub fn matches_reference(&self, leader: &Receipt) -> bool {
        self.execution_result == leader.execution_result
            && self.result == leader.result
            && self.contract_state == leader.contract_state
            && self.pending_transactions == leader.pending_transactions
    }

    // Copy with contract_state replaced by an empty map. The canonical
    // state lives in the contract account and snapshot records only.
    pub fn stripped(&self) -> Receipt {
        let mut receipt = self.clone();
        receipt.contract_state = StateMap::new();
        receipt
    }
}

// Latest round's votes and receipts. `leader_receipts` is ordered: the
// leader-phase receipt first, then the optional validator-phase receipt.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ConsensusData {
    #[serde(default)]
    pub votes: IndexMap<Address, Vote>,
    #[serde(default)]
    pub leader_receipts: Vec<Receipt>,
    #[serde(default)]
    pub validators: Vec<Receipt>,
}

impl ConsensusData {
    pub fn leader_receipt(&self) -> Option<&Receipt> {
        self.leader_receipts.first()
    }

    pub fn stripped(&self) -> ConsensusData {
        ConsensusData {
            votes: self.votes.clone(),
            leader_receipts: self.leader_receipts.iter().map(Receipt::stripped).collect(),
            validators: self.validators.iter().map(Receipt::stripped).collect(),
        }
    }
}

// Label of one recorded consensus round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsensusRound {
    Proposing,
    LeaderRotation,
    Accepted,
    Undetermined,
    LeaderTimeout,
    ValidatorsTimeout,
    AppealFailed,
    AppealSuccessful,
}

impl ConsensusRound {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusRound::Proposing => "Proposing",
            ConsensusRound::LeaderRotation => "Leader Rotation",
            ConsensusRound::Accepted => "Accepted",
            ConsensusRound::Undetermined => "Undetermined",
            ConsensusRound::LeaderTimeout => "Leader Timeout",
            ConsensusRound::ValidatorsTimeout => "Validators Timeout",
            ConsensusRound::AppealFailed => "Appeal Failed",
            ConsensusRound::AppealSuccessful => "Appeal Successful",
        }
    }
}

impl Display for ConsensusRound {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConsensusRound {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Proposing" => Ok(ConsensusRound::Proposing),
            "Leader Rotation" => Ok(ConsensusRound::LeaderRotation),
            "Accepted" => Ok(ConsensusRound::Accepted),
            "Undetermined" => Ok(ConsensusRound::Undetermined),
            "Leader Timeout" => Ok(ConsensusRound::LeaderTimeout),
            "Validators Timeout" => Ok(ConsensusRound::ValidatorsTimeout),
            "Appeal Failed" => Ok(ConsensusRound::AppealFailed),
            "Appeal Successful" => Ok(ConsensusRound::AppealSuccessful),
            _ => Err("Unknown consensus round label"),
        }
    }
}

impl Serialize for ConsensusRound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConsensusRound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(de::Error::custom)
    }
}

// One appended entry of the consensus history
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConsensusRoundRecord {
    pub round_label: ConsensusRound,
    #[serde(default)]
    pub leader_receipts: Vec<Receipt>,
    #[serde(default)]
    pub validator_results: Vec<Receipt>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateTimestamp {
    pub state_name: TransactionStatus,
    pub timestamp: TimestampSeconds,
}

// Append-only log of all rounds plus the status timeline
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ConsensusHistory {
    #[serde(default)]
    pub rounds: Vec<ConsensusRoundRecord>,
    #[serde(default)]
    pub state_timestamps: Vec<StateTimestamp>,
}

impl ConsensusHistory {
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty() && self.state_timestamps.is_empty()
    }

    // Every leader address that already led a round of this transaction
    pub fn used_leader_addresses(&self) -> Vec<Address> {
        let mut addresses = Vec::new();
        for record in &self.rounds {
            if let Some(receipt) = record.leader_receipts.first() {
                if !addresses.contains(&receipt.node_config.address) {
                    addresses.push(receipt.node_config.address);
                }
            }
        }
        addresses
    }
}
