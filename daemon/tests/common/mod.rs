// Shared fixtures for the consensus integration tests: an in-memory
// storage, a pool of synthetic validators and a scripted node factory that
// plays back per-round behaviors instead of calling the executor.

#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use synod_common::{
    consensus::{encode_result, ExecutionMode, ExecutionResultStatus, Receipt, ResultCode, Vote},
    crypto::{Address, Hash, ADDRESS_SIZE},
    encoding::{b64_encode, Base64Bytes},
    transaction::{
        PendingTransaction, Transaction, TransactionData, TransactionStatus, TransactionType,
    },
    validator::{LlmProvider, Validator},
};

use synod_daemon::{
    core::{
        consensus::ConsensusEngine,
        storage::{MemoryStorage, TransactionProvider, ValidatorProvider},
    },
    event::EventBus,
    genvm::ExecutorHealth,
    node::{assign_vote, NodeError, NodeFactory, NodeRequest, NodeRunner},
};

#[derive(Clone, Debug)]
pub enum ScriptedVote {
    Agree,
    Disagree,
    DeterministicViolation,
    Timeout,
    Hang(u64),
}

#[derive(Clone, Debug, Default)]
pub struct RoundScript {
    pub leader_timeout: bool,
    // slots the leader writes on top of the snapshot (key, b64 value)
    pub leader_writes: Vec<(String, String)>,
    pub votes: Vec<ScriptedVote>,
    pub pending: Vec<PendingTransaction>,
}

impl RoundScript {
    pub fn all_agree() -> Self {
        RoundScript::default()
    }

    pub fn with_votes(votes: Vec<ScriptedVote>) -> Self {
        RoundScript {
            votes,
            ..Default::default()
        }
    }

    pub fn writing(writes: Vec<(&str, &str)>) -> Self {
        RoundScript {
            leader_writes: writes
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn leader_timeout() -> Self {
        RoundScript {
            leader_timeout: true,
            ..Default::default()
        }
    }

    fn vote_for(&self, seq: usize) -> ScriptedVote {
        self.votes
            .get(seq)
            .cloned()
            .unwrap_or(ScriptedVote::Agree)
    }
}

#[derive(Default)]
struct FactoryState {
    round: usize,
    validator_seq: usize,
}

pub struct ScriptedFactory {
    rounds: Vec<RoundScript>,
    state: Mutex<FactoryState>,
    appeal_votes: Mutex<Vec<ScriptedVote>>,
    // leader execution order, for ordering assertions
    executed: Arc<Mutex<Vec<Hash>>>,
}

impl ScriptedFactory {
    pub fn new(rounds: Vec<RoundScript>) -> Arc<Self> {
        Arc::new(ScriptedFactory {
            rounds,
            state: Mutex::new(FactoryState::default()),
            appeal_votes: Mutex::new(Vec::new()),
            executed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn always_agree() -> Arc<Self> {
        ScriptedFactory::new(Vec::new())
    }

    pub fn queue_appeal_votes(&self, votes: Vec<ScriptedVote>) {
        let mut queued = self.appeal_votes.lock().unwrap();
        *queued = votes;
        queued.reverse();
    }

    pub fn executed_order(&self) -> Vec<Hash> {
        self.executed.lock().unwrap().clone()
    }

    fn script_at(&self, round: usize) -> RoundScript {
        self.rounds
            .get(round)
            .cloned()
            .unwrap_or_else(RoundScript::all_agree)
    }
}

impl NodeFactory for ScriptedFactory {
    fn make(&self, request: NodeRequest) -> Box<dyn NodeRunner> {
        let mut state = self.state.lock().unwrap();
        match request.mode {
            ExecutionMode::Leader => {
                let script = self.script_at(state.round);
                state.round += 1;
                state.validator_seq = 0;
                Box::new(ScriptedNode {
                    request,
                    script,
                    vote: None,
                    executed: Some(self.executed.clone()),
                })
            }
            ExecutionMode::Validator => {
                // appeal validators consume the queued votes; regular
                // rounds replay the current round's script
                let queued = self.appeal_votes.lock().unwrap().pop();
                let vote = match queued {
                    Some(vote) => vote,
                    None => {
                        let script = self.script_at(state.round.saturating_sub(1));
                        let vote = script.vote_for(state.validator_seq);
                        state.validator_seq += 1;
                        vote
                    }
                };
                let script = self.script_at(state.round.saturating_sub(1));
                Box::new(ScriptedNode {
                    request,
                    script,
                    vote: Some(vote),
                    executed: None,
                })
            }
        }
    }
}

pub struct ScriptedNode {
    request: NodeRequest,
    script: RoundScript,
    vote: Option<ScriptedVote>,
    executed: Option<Arc<Mutex<Vec<Hash>>>>,
}

#[async_trait]
impl NodeRunner for ScriptedNode {
    async fn exec_transaction(&self, transaction: &Transaction) -> Result<Receipt, NodeError> {
        match self.request.mode {
            ExecutionMode::Leader => {
                if let Some(executed) = &self.executed {
                    executed.lock().unwrap().push(transaction.hash);
                }
                Ok(self.leader_receipt(transaction))
            }
            ExecutionMode::Validator => Ok(self.validator_receipt(transaction).await),
        }
    }
}

impl ScriptedNode {
    fn base_receipt(&self, transaction: &Transaction) -> Receipt {
        Receipt {
            result: encode_result(ResultCode::Return, b"ok"),
            calldata: transaction.data.calldata.clone(),
            mode: self.request.mode,
            vote: Some(Vote::NotVoted),
            execution_result: ExecutionResultStatus::Success,
            contract_state: Default::default(),
            eq_outputs: Default::default(),
            pending_transactions: Vec::new(),
            node_config: self.request.validator.node_config(),
            genvm_result: None,
            processing_time_ms: Some(1),
            nondet_disagree: None,
        }
    }

    fn leader_receipt(&self, transaction: &Transaction) -> Receipt {
        let mut receipt = self.base_receipt(transaction);
        if self.script.leader_timeout {
            receipt.result = encode_result(ResultCode::VmError, b"timeout");
            receipt.execution_result = ExecutionResultStatus::Error;
            return receipt;
        }
        let mut state = self.request.contract_snapshot.states.accepted.clone();
        for (key, value) in &self.script.leader_writes {
            state.insert(key.clone(), value.clone());
        }
        receipt.contract_state = state;
        receipt.pending_transactions = self.script.pending.clone();
        receipt
    }

    async fn validator_receipt(&self, transaction: &Transaction) -> Receipt {
        let leader = self
            .request
            .leader_receipt
            .clone()
            .expect("validator node without leader receipt");
        let mut receipt = self.base_receipt(transaction);
        // mirror the reference fields, then diverge per script
        receipt.result = leader.result.clone();
        receipt.execution_result = leader.execution_result;
        receipt.contract_state = leader.contract_state.clone();
        receipt.pending_transactions = leader.pending_transactions.clone();

        match self.vote.clone().unwrap_or(ScriptedVote::Agree) {
            ScriptedVote::Agree => {}
            ScriptedVote::Disagree => {
                receipt.nondet_disagree = Some(1);
            }
            ScriptedVote::DeterministicViolation => {
                receipt.result = encode_result(ResultCode::Return, b"divergent");
            }
            ScriptedVote::Timeout => {
                receipt.result = encode_result(ResultCode::VmError, b"timeout");
                receipt.execution_result = ExecutionResultStatus::Error;
            }
            ScriptedVote::Hang(millis) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
        }
        receipt.vote = Some(assign_vote(&receipt, &leader));
        receipt
    }
}

pub fn validator_pool(count: u8) -> Vec<Validator> {
    (1..=count)
        .map(|id| {
            Validator::new(
                Address::new([id; ADDRESS_SIZE]),
                100,
                LlmProvider {
                    provider: "openai".to_string(),
                    model: "gpt-4o".to_string(),
                    ..Default::default()
                },
            )
        })
        .collect()
}

pub async fn setup(
    validators: u8,
    factory: Arc<ScriptedFactory>,
) -> (Arc<MemoryStorage>, Arc<ConsensusEngine<MemoryStorage>>) {
    let storage = Arc::new(MemoryStorage::new());
    for validator in validator_pool(validators) {
        storage.register_validator(validator).await.unwrap();
    }
    let mut engine = ConsensusEngine::new(
        storage.clone(),
        factory as Arc<dyn NodeFactory>,
        EventBus::new(),
        Arc::new(ExecutorHealth::new(3)),
    );
    engine.set_validator_deadline(Duration::from_secs(5));
    (storage, Arc::new(engine))
}

pub fn sender() -> Address {
    Address::new([0xaa; ADDRESS_SIZE])
}

pub fn deploy_transaction(nonce: u64, at_secs: i64, validators: usize, rotations: u32) -> Transaction {
    let from = sender();
    let to = Address::derive_contract_address(&from, nonce);
    let mut tx = Transaction::new(
        from,
        to,
        TransactionData {
            calldata: Base64Bytes::new(vec![0x01]),
            contract_code: Some(Base64Bytes::new(b"contract code".to_vec())),
        },
        0,
        nonce,
        TransactionType::DeployContract,
        Utc.timestamp_opt(at_secs, 0).unwrap(),
    );
    tx.num_of_initial_validators = validators;
    tx.config_rotation_rounds = rotations;
    tx
}

pub fn run_transaction(
    contract: Address,
    nonce: u64,
    at_secs: i64,
    validators: usize,
    rotations: u32,
) -> Transaction {
    let mut tx = Transaction::new(
        sender(),
        contract,
        TransactionData {
            calldata: Base64Bytes::new(vec![nonce as u8 + 1]),
            contract_code: None,
        },
        0,
        nonce,
        TransactionType::RunContract,
        Utc.timestamp_opt(at_secs, 0).unwrap(),
    );
    tx.num_of_initial_validators = validators;
    tx.config_rotation_rounds = rotations;
    tx
}

// Claim and process the oldest pending transaction of each contract, one
// pass; returns how many were processed
pub async fn process_pending_once(
    storage: &Arc<MemoryStorage>,
    engine: &Arc<ConsensusEngine<MemoryStorage>>,
) -> usize {
    let groups = storage.get_pending_transactions_grouped().await.unwrap();
    let mut processed = 0;
    for (_, transactions) in groups {
        let Some(oldest) = transactions.first() else {
            continue;
        };
        if storage.atomic_claim(&oldest.hash).await.unwrap() {
            engine.process_transaction(oldest.hash).await.unwrap();
            processed += 1;
        }
    }
    processed
}

// Drain the pending queue to quiescence in created_at order
pub async fn process_all_pending(
    storage: &Arc<MemoryStorage>,
    engine: &Arc<ConsensusEngine<MemoryStorage>>,
) {
    while process_pending_once(storage, engine).await > 0 {}
}

pub fn slot(value: &[u8]) -> String {
    b64_encode(value)
}

pub async fn status_of(storage: &Arc<MemoryStorage>, hash: &Hash) -> TransactionStatus {
    storage
        .get_transaction_by_hash(hash)
        .await
        .unwrap()
        .unwrap()
        .status
}
