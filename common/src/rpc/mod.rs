// JSON-RPC 2.0 plumbing: request/response envelope, error codes and the
// method registry the daemon registers its handlers into.

#[cfg(feature = "rpc-server")]
pub mod server;

use std::{collections::HashMap, future::Future, pin::Pin};

use anyhow::Error as AnyError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Error as SerdeError, Value};
use thiserror::Error;

pub const JSON_RPC_VERSION: &str = "2.0";

// Maximum number of requests accepted in one batch call
pub const BATCH_LIMIT: usize = 20;

pub type Id = Value;

#[derive(Error, Debug)]
pub enum InternalRpcError {
    #[error("Internal error: {}", _0)]
    InternalError(&'static str),
    #[error("Invalid body in request")]
    ParseBodyError,
    #[error("Invalid JSON request")]
    InvalidJSONRequest,
    #[error("Invalid request: {}", _0)]
    InvalidRequestStr(&'static str),
    #[error("Invalid params: {}", _0)]
    InvalidJSONParams(#[from] SerdeError),
    #[error("Invalid params: {}", _0)]
    InvalidParams(&'static str),
    #[error("Invalid params: {:#}", _0)]
    InvalidParamsAny(AnyError),
    #[error("Expected parameters for this method but was not present")]
    ExpectedParams,
    #[error("Expected json_rpc set to '2.0'")]
    InvalidVersion,
    #[error("Method '{}' in request was not found", _0)]
    MethodNotFound(String),
    #[error(transparent)]
    AnyError(#[from] AnyError),
    #[error("batch limit exceeded")]
    BatchLimitExceeded,
    // caller-supplied codes; JSON-RPC reserves everything outside -3..-31999
    #[error("{}", _1)]
    Custom(i16, String),
    #[error("{}", _1)]
    CustomStr(i16, &'static str),
}

impl InternalRpcError {
    pub fn get_code(&self) -> i16 {
        match self {
            // codes reserved by the JSON-RPC 2.0 spec
            Self::ParseBodyError => -32700,
            Self::InvalidJSONRequest
            | Self::InvalidRequestStr(_)
            | Self::InvalidVersion
            | Self::BatchLimitExceeded => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidJSONParams(_)
            | Self::InvalidParams(_)
            | Self::InvalidParamsAny(_)
            | Self::ExpectedParams => -32602,
            // server-side failures
            Self::InternalError(_) => -32603,
            Self::AnyError(_) => -32004,
            // whatever the caller registered
            Self::Custom(code, _) | Self::CustomStr(code, _) => *code,
        }
    }
}

#[derive(Debug)]
pub struct RpcResponseError {
    id: Option<Id>,
    error: InternalRpcError,
}

impl RpcResponseError {
    pub fn new(id: Option<Id>, error: InternalRpcError) -> Self {
        RpcResponseError { id, error }
    }

    pub fn get_id(&self) -> Id {
        self.id.clone().unwrap_or(Value::Null)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "jsonrpc": JSON_RPC_VERSION,
            "id": self.get_id(),
            "error": {
                "code": self.error.get_code(),
                "message": self.error.to_string(),
            }
        })
    }
}

impl std::fmt::Display for RpcResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RpcError[id: {}, error: {}]", self.get_id(), self.error)
    }
}

#[derive(Deserialize, Debug)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Serialize, Debug)]
pub struct RpcResponse<'a> {
    pub jsonrpc: &'a str,
    pub id: Id,
    pub result: Value,
}

impl<'a> RpcResponse<'a> {
    pub fn new(id: Id, result: Value) -> Self {
        RpcResponse {
            jsonrpc: JSON_RPC_VERSION,
            id,
            result,
        }
    }
}

pub type RpcResult = Result<Value, InternalRpcError>;

type RpcMethodFn<T> =
    Box<dyn Fn(T, Value) -> Pin<Box<dyn Future<Output = RpcResult> + Send>> + Send + Sync>;

// Registry of async JSON-RPC methods over a shared, cloneable context
pub struct RPCHandler<T>
where
    T: Clone + Send + Sync + 'static,
{
    data: T,
    methods: HashMap<String, RpcMethodFn<T>>,
}

impl<T> RPCHandler<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(data: T) -> Self {
        RPCHandler {
            data,
            methods: HashMap::new(),
        }
    }

    pub fn get_data(&self) -> &T {
        &self.data
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn count_methods(&self) -> usize {
        self.methods.len()
    }

    pub fn register_method<F, Fut>(&mut self, name: &str, method: F)
    where
        F: Fn(T, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult> + Send + 'static,
    {
        let previous = self.methods.insert(
            name.to_string(),
            Box::new(move |data, params| Box::pin(method(data, params))),
        );
        debug_assert!(previous.is_none(), "duplicate RPC method registration");
    }

    pub async fn execute_method(&self, name: &str, params: Value) -> RpcResult {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| InternalRpcError::MethodNotFound(name.to_string()))?;
        method(self.data.clone(), params).await
    }

    // Handle a raw request body: single request or batch
    pub async fn handle_request(&self, body: &[u8]) -> Result<Value, RpcResponseError> {
        let parsed: Value = serde_json::from_slice(body)
            .map_err(|_| RpcResponseError::new(None, InternalRpcError::ParseBodyError))?;

        match parsed {
            Value::Array(requests) => {
                if requests.len() > BATCH_LIMIT {
                    return Err(RpcResponseError::new(
                        None,
                        InternalRpcError::BatchLimitExceeded,
                    ));
                }
                let mut responses = Vec::with_capacity(requests.len());
                for request in requests {
                    match self.handle_single(request).await {
                        Ok(response) => responses.push(response),
                        Err(error) => responses.push(error.to_json()),
                    }
                }
                Ok(Value::Array(responses))
            }
            request => self.handle_single(request).await,
        }
    }

    async fn handle_single(&self, request: Value) -> Result<Value, RpcResponseError> {
        let request: RpcRequest = serde_json::from_value(request)
            .map_err(|_| RpcResponseError::new(None, InternalRpcError::InvalidJSONRequest))?;

        if request.jsonrpc != JSON_RPC_VERSION {
            return Err(RpcResponseError::new(
                request.id,
                InternalRpcError::InvalidVersion,
            ));
        }

        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);
        let result = self
            .execute_method(&request.method, params)
            .await
            .map_err(|error| RpcResponseError::new(id.clone(), error))?;

        Ok(serde_json::to_value(RpcResponse::new(
            id.unwrap_or(Value::Null),
            result,
        ))
        .map_err(|_| {
            RpcResponseError::new(None, InternalRpcError::InternalError("serialize response"))
        })?)
    }
}
