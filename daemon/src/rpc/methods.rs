// The JSON-RPC surface the consensus core serves. Parameters are
// positional arrays, JSON-RPC 2.0 envelopes; validation errors never
// mutate state.

use serde::Deserialize;
use serde_json::{json, Value};

use synod_common::{
    crypto::{Address, Hash},
    encoding::Base64Bytes,
    rpc::{InternalRpcError, RPCHandler, RpcResult},
    transaction::{Transaction, TransactionData, TransactionStatus, TransactionType},
};

use crate::{
    config,
    core::{error::ConsensusError, storage::Storage},
    rpc::RpcContext,
};

fn storage_error(err: ConsensusError) -> InternalRpcError {
    InternalRpcError::Custom(-32, err.to_string())
}

fn param<T: serde::de::DeserializeOwned>(params: &Value, index: usize) -> Result<T, InternalRpcError> {
    let value = params
        .get(index)
        .cloned()
        .ok_or(InternalRpcError::ExpectedParams)?;
    serde_json::from_value(value).map_err(InternalRpcError::from)
}

#[derive(Deserialize, Debug)]
struct SendTransactionParams {
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    calldata: Option<Base64Bytes>,
    #[serde(default)]
    code: Option<Base64Bytes>,
    #[serde(default)]
    value: u64,
    #[serde(default)]
    nonce: Option<u64>,
    #[serde(default)]
    leader_only: bool,
    #[serde(default)]
    num_of_initial_validators: Option<usize>,
    #[serde(default)]
    config_rotation_rounds: Option<u32>,
}

async fn send_raw_transaction<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let request: SendTransactionParams = param(&params, 0)?;
    let storage = ctx.engine.storage();

    let nonce = match request.nonce {
        Some(nonce) => nonce,
        None => storage
            .get_transaction_count_for_address(&request.from)
            .await
            .map_err(storage_error)?,
    };

    let tx_type = if request.code.is_some() {
        TransactionType::DeployContract
    } else if request.calldata.is_some() {
        TransactionType::RunContract
    } else {
        TransactionType::Send
    };

    let to_address = match tx_type {
        TransactionType::DeployContract => Address::derive_contract_address(&request.from, nonce),
        _ => request
            .to
            .ok_or(InternalRpcError::InvalidParams("missing to address"))?,
    };

    let data = TransactionData {
        calldata: request.calldata.unwrap_or_default(),
        contract_code: request.code,
    };

    let mut transaction = Transaction::new(
        request.from,
        to_address,
        data,
        request.value,
        nonce,
        tx_type,
        chrono::Utc::now(),
    );
    transaction.leader_only = request.leader_only;
    if let Some(validators) = request.num_of_initial_validators {
        transaction.num_of_initial_validators = validators;
    }
    if let Some(rounds) = request.config_rotation_rounds {
        transaction.config_rotation_rounds = rounds;
    }

    let hash = storage
        .insert_transaction(transaction)
        .await
        .map_err(storage_error)?;
    Ok(json!(hash))
}

async fn get_transaction_by_hash<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let hash: Hash = param(&params, 0)?;
    let transaction = ctx
        .engine
        .storage()
        .get_transaction_by_hash(&hash)
        .await
        .map_err(storage_error)?;
    Ok(serde_json::to_value(transaction)?)
}

async fn get_transaction_receipt<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let hash: Hash = param(&params, 0)?;
    let Some(transaction) = ctx
        .engine
        .storage()
        .get_transaction_by_hash(&hash)
        .await
        .map_err(storage_error)?
    else {
        return Ok(Value::Null);
    };
    Ok(json!({
        "transaction_hash": transaction.hash,
        "from": transaction.from_address,
        "to": transaction.to_address,
        "status": transaction.status,
        "consensus_data": transaction.consensus_data,
        "created_at": transaction.created_at,
    }))
}

async fn get_transaction_count<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let address: Address = param(&params, 0)?;
    let count = ctx
        .engine
        .storage()
        .get_transaction_count_for_address(&address)
        .await
        .map_err(storage_error)?;
    Ok(json!(count))
}

async fn get_balance<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let address: Address = param(&params, 0)?;
    let balance = ctx
        .engine
        .storage()
        .get_balance(&address)
        .await
        .map_err(storage_error)?;
    Ok(json!(balance))
}

async fn chain_id<S: Storage>(_ctx: RpcContext<S>, _params: Value) -> RpcResult {
    Ok(json!(format!("{:#x}", config::chain_id())))
}

async fn block_number<S: Storage>(ctx: RpcContext<S>, _params: Value) -> RpcResult {
    let count = ctx
        .engine
        .storage()
        .count_transactions()
        .await
        .map_err(storage_error)?;
    Ok(json!(format!("{:#x}", count)))
}

async fn get_contract_code<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let address: Address = param(&params, 0)?;
    let account = ctx
        .engine
        .storage()
        .get_contract_account(&address)
        .await
        .map_err(storage_error)?;
    match account.and_then(|account| account.code()) {
        Some(code) => Ok(json!(synod_common::encoding::b64_encode(&code))),
        None => Ok(Value::Null),
    }
}

async fn get_transaction_status<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let hash: Hash = param(&params, 0)?;
    let transaction = ctx
        .engine
        .storage()
        .get_transaction_by_hash(&hash)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| InternalRpcError::Custom(-32, format!("unknown transaction {}", hash)))?;
    Ok(json!(transaction.status))
}

async fn fund_account<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let address: Address = param(&params, 0)?;
    let amount: u64 = param(&params, 1)?;
    ctx.engine
        .storage()
        .fund_account(&address, amount)
        .await
        .map_err(storage_error)?;
    let balance = ctx
        .engine
        .storage()
        .get_balance(&address)
        .await
        .map_err(storage_error)?;
    Ok(json!(balance))
}

async fn get_transactions_for_address<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let address: Address = param(&params, 0)?;
    let transactions = ctx
        .engine
        .storage()
        .get_transactions_for_address(&address)
        .await
        .map_err(storage_error)?;
    Ok(serde_json::to_value(transactions)?)
}

async fn set_finality_window_time<S: Storage>(_ctx: RpcContext<S>, params: Value) -> RpcResult {
    let seconds: u64 = param(&params, 0)?;
    config::set_finality_window_time(seconds);
    Ok(json!(true))
}

// Developer tool: force a status, appending to the timeline
async fn update_transaction_status<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let hash: Hash = param(&params, 0)?;
    let status: TransactionStatus = param(&params, 1)?;
    ctx.engine
        .storage()
        .update_transaction_status(&hash, status, true)
        .await
        .map_err(storage_error)?;
    Ok(json!(true))
}

async fn appeal_transaction<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let hash: Hash = param(&params, 0)?;
    ctx.engine.file_appeal(hash).await.map_err(storage_error)?;
    Ok(json!(true))
}

// Cancellation is admissible while Pending only
async fn cancel_transaction<S: Storage>(ctx: RpcContext<S>, params: Value) -> RpcResult {
    let hash: Hash = param(&params, 0)?;
    let canceled = ctx
        .engine
        .storage()
        .update_transaction_status_conditional(
            &hash,
            TransactionStatus::Pending,
            TransactionStatus::Canceled,
        )
        .await
        .map_err(storage_error)?;
    if !canceled {
        let status = ctx
            .engine
            .storage()
            .get_transaction_by_hash(&hash)
            .await
            .map_err(storage_error)?
            .map(|tx| tx.status.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return Err(InternalRpcError::Custom(
            -32,
            format!("transaction {} is not pending (status {})", hash, status),
        ));
    }
    Ok(json!(true))
}

pub fn register_methods<S: Storage>(handler: &mut RPCHandler<RpcContext<S>>) {
    handler.register_method("eth_sendRawTransaction", send_raw_transaction::<S>);
    handler.register_method("eth_getTransactionByHash", get_transaction_by_hash::<S>);
    handler.register_method("eth_getTransactionReceipt", get_transaction_receipt::<S>);
    handler.register_method("eth_getTransactionCount", get_transaction_count::<S>);
    handler.register_method("eth_getBalance", get_balance::<S>);
    handler.register_method("eth_chainId", chain_id::<S>);
    handler.register_method("eth_blockNumber", block_number::<S>);
    handler.register_method("gen_getContractCode", get_contract_code::<S>);
    handler.register_method("gen_getTransactionStatus", get_transaction_status::<S>);
    handler.register_method("sim_fundAccount", fund_account::<S>);
    handler.register_method(
        "sim_getTransactionsForAddress",
        get_transactions_for_address::<S>,
    );
    handler.register_method("sim_setFinalityWindowTime", set_finality_window_time::<S>);
    handler.register_method("sim_updateTransactionStatus", update_transaction_status::<S>);
    handler.register_method("sim_appealTransaction", appeal_transaction::<S>);
    handler.register_method("sim_cancelTransaction", cancel_transaction::<S>);
}
