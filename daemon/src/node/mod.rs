// One validator's execution of one transaction, wrapped into a Receipt.
//
// The runner builds the executor message, answers the host loop, decodes
// the result-code-prefixed payload and, for validators, applies the vote
// table against the leader's reference receipt. Leader-fatal
// infrastructure failures escalate instead of producing a receipt so the
// worker can release the transaction for a retry elsewhere.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use log::debug;
use serde_json::json;
use thiserror::Error;

use synod_common::{
    consensus::{
        encode_result, ExecutionMode, ExecutionResultStatus, GenVmResult, Receipt, ResultCode,
        Vote,
    },
    contract::{ContractSnapshot, StateStatus},
    crypto::Hash,
    encoding::Base64Bytes,
    event::{EventScope, EventType, LogEvent},
    transaction::Transaction,
    validator::Validator,
};

use crate::{
    config,
    core::storage::Storage,
    event::EventBus,
    genvm::{
        error_codes::{extract_error_code, parse_module_error_string, ModuleErrorInfo},
        state::{DecodedValueCache, NodeHost, StorageSnapshotFactory},
        GenVmError, GenVmManager, RunPayload,
    },
};

const STDOUT_CAPTURE_LIMIT: usize = 5000;

#[derive(Debug, Error)]
pub enum NodeError {
    // Fatal executor-infrastructure failure while leading: the worker
    // releases the transaction so another worker retries it
    #[error("Internal executor error: {message} (code {error_code:?}, fatal {is_fatal})")]
    InternalExecutor {
        message: String,
        error_code: Option<String>,
        causes: Vec<String>,
        is_fatal: bool,
    },

    #[error(transparent)]
    GenVm(#[from] GenVmError),
}

pub struct NodeRequest {
    pub validator: Validator,
    pub mode: ExecutionMode,
    pub contract_snapshot: ContractSnapshot,
    pub leader_receipt: Option<Receipt>,
}

#[async_trait]
pub trait NodeRunner: Send + Sync {
    async fn exec_transaction(&self, transaction: &Transaction) -> Result<Receipt, NodeError>;
}

// Seam between the consensus engine and the executor: tests plug scripted
// runners in here, the daemon wires the GenVM-backed factory.
pub trait NodeFactory: Send + Sync {
    fn make(&self, request: NodeRequest) -> Box<dyn NodeRunner>;
}

// The vote table. The leader receipt defines the reference values.
pub fn assign_vote(receipt: &Receipt, leader: &Receipt) -> Vote {
    if receipt.is_timeout() {
        return Vote::Timeout;
    }
    if receipt.matches_reference(leader) {
        if receipt.nondet_disagree.is_some() {
            Vote::Disagree
        } else {
            Vote::Agree
        }
    } else if receipt.result_code() == Some(ResultCode::VmError) {
        // a non-timeout crash on our side, not a reference mismatch
        Vote::Disagree
    } else {
        Vote::DeterministicViolation
    }
}

// Receipt synthesized when a validator never produced a result within the
// per-call deadline (or failed on infrastructure)
pub fn make_idle_receipt(validator: &Validator, calldata: Base64Bytes, error_code: &str) -> Receipt {
    Receipt {
        result: encode_result(ResultCode::InternalError, b"idle"),
        calldata,
        mode: ExecutionMode::Validator,
        vote: Some(Vote::Idle),
        execution_result: ExecutionResultStatus::Error,
        contract_state: Default::default(),
        eq_outputs: Default::default(),
        pending_transactions: Vec::new(),
        node_config: validator.node_config(),
        genvm_result: Some(GenVmResult {
            stdout: String::new(),
            stderr: String::new(),
            error_code: Some(error_code.to_string()),
            raw_error: None,
        }),
        processing_time_ms: None,
        nondet_disagree: None,
    }
}

pub struct GenVmNodeFactory<S: Storage> {
    manager: Arc<GenVmManager>,
    storage: Arc<S>,
    events: EventBus,
    decoded_cache: Arc<DecodedValueCache>,
}

impl<S: Storage> GenVmNodeFactory<S> {
    pub fn new(
        manager: Arc<GenVmManager>,
        storage: Arc<S>,
        events: EventBus,
        decoded_cache: Arc<DecodedValueCache>,
    ) -> Self {
        GenVmNodeFactory {
            manager,
            storage,
            events,
            decoded_cache,
        }
    }
}

impl<S: Storage> NodeFactory for GenVmNodeFactory<S> {
    fn make(&self, request: NodeRequest) -> Box<dyn NodeRunner> {
        Box::new(GenVmNode {
            manager: self.manager.clone(),
            storage: self.storage.clone(),
            events: self.events.clone(),
            decoded_cache: self.decoded_cache.clone(),
            validator: request.validator,
            mode: request.mode,
            contract_snapshot: request.contract_snapshot,
            leader_receipt: request.leader_receipt,
        })
    }
}

pub struct GenVmNode<S: Storage> {
    manager: Arc<GenVmManager>,
    storage: Arc<S>,
    events: EventBus,
    decoded_cache: Arc<DecodedValueCache>,
    validator: Validator,
    mode: ExecutionMode,
    contract_snapshot: ContractSnapshot,
    leader_receipt: Option<Receipt>,
}

impl<S: Storage> GenVmNode<S> {
    fn truncated(stdout: String) -> String {
        if stdout.len() <= STDOUT_CAPTURE_LIMIT {
            stdout
        } else {
            stdout.chars().take(STDOUT_CAPTURE_LIMIT).collect()
        }
    }

    fn notify_finished(&self, hash: &Hash, execution_failed: bool, stdout: &str, stderr: &str) {
        self.events.send_log(LogEvent::new(
            "execution_finished",
            if execution_failed {
                EventType::Error
            } else {
                EventType::Info
            },
            EventScope::GenVm,
            "execution finished",
            json!({ "stdout": stdout, "stderr": stderr }),
            Some(*hash),
        ));
    }
}

#[async_trait]
impl<S: Storage> NodeRunner for GenVmNode<S> {
    async fn exec_transaction(&self, transaction: &Transaction) -> Result<Receipt, NodeError> {
        let is_deploy = transaction.is_deploy();
        let calldata = transaction.data.calldata.clone();

        let message = json!({
            "from": transaction.from_address,
            "to": transaction.to_address,
            "value": transaction.value,
            "is_init": is_deploy,
            "chain_id": config::chain_id(),
            "datetime": transaction.created_at.to_rfc3339(),
        });

        let mut snapshot = self.contract_snapshot.clone();
        if is_deploy {
            if let Some(code) = &transaction.data.contract_code {
                snapshot.set_code(code);
            }
        }

        let host = NodeHost::new(
            snapshot,
            Arc::new(StorageSnapshotFactory::new(self.storage.clone())),
            false,
            StateStatus::Accepted,
            self.leader_receipt
                .as_ref()
                .map(|receipt| receipt.eq_outputs.clone()),
            self.decoded_cache.clone(),
        );

        let payload = RunPayload {
            message,
            is_sync: self.mode == ExecutionMode::Validator,
            capture_output: true,
            host_data: format!("node-{}", self.validator.address),
            timestamp: transaction.created_at.to_rfc3339(),
            extra_args: Vec::new(),
            storage_pages: 10_000_000,
            code: transaction
                .data
                .contract_code
                .as_ref()
                .map(|code| code.to_vec()),
            calldata: calldata.to_vec(),
            deadline: Some(config::validator_exec_timeout()),
        };

        let started = Instant::now();
        let (execution, host) = self.manager.run(payload, host).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let execution_failed = execution.result_code != ResultCode::Return;
        let execution_result = if execution_failed {
            ExecutionResultStatus::Error
        } else {
            ExecutionResultStatus::Success
        };

        let mut error_info = ModuleErrorInfo::default();
        let mut error_code = None;
        if execution_failed {
            let message = String::from_utf8_lossy(&execution.result_data).to_string();
            error_info = parse_module_error_string(&message);
            error_code = error_info.error_code.or_else(|| {
                extract_error_code(Some(&serde_json::Value::String(message)), &execution.stderr)
            });
        }

        self.notify_finished(
            &transaction.hash,
            execution_failed,
            &execution.stdout,
            &execution.stderr,
        );

        if self.mode == ExecutionMode::Leader
            && execution.result_code == ResultCode::InternalError
            && error_info.is_fatal
        {
            debug!(
                "leader execution hit fatal infrastructure failure for {}",
                transaction.hash
            );
            return Err(NodeError::InternalExecutor {
                message: String::from_utf8_lossy(&execution.result_data).to_string(),
                error_code: error_code.map(|code| code.as_str().to_string()),
                causes: error_info.causes.clone(),
                is_fatal: true,
            });
        }

        let mut receipt = Receipt {
            result: encode_result(execution.result_code, &execution.result_data),
            calldata,
            mode: self.mode,
            vote: Some(Vote::NotVoted),
            execution_result,
            contract_state: host.snapshot().states.accepted.clone(),
            eq_outputs: host.eq_outputs.clone(),
            pending_transactions: host.pending_transactions.clone(),
            node_config: self.validator.node_config(),
            genvm_result: Some(GenVmResult {
                stdout: GenVmNode::<S>::truncated(execution.stdout),
                stderr: execution.stderr,
                error_code: error_code.map(|code| code.as_str().to_string()),
                raw_error: if error_info.causes.is_empty() {
                    None
                } else {
                    Some(json!({
                        "causes": error_info.causes,
                        "fatal": error_info.is_fatal,
                    }))
                },
            }),
            processing_time_ms: Some(elapsed_ms),
            nondet_disagree: host.nondet_disagree,
        };

        if self.mode == ExecutionMode::Validator {
            if let Some(leader) = &self.leader_receipt {
                receipt.vote = Some(assign_vote(&receipt, leader));
            }
        }

        Ok(receipt)
    }
}
