// Outbound event vocabulary: structured log events for the websocket
// fan-out and mirror events for the rollup bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{Address, Hash};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Info,
    Success,
    Error,
    Debug,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Consensus,
    GenVm,
    Rpc,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LogEvent {
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub scope: EventScope,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<Hash>,
}

impl LogEvent {
    pub fn new(
        name: impl Into<String>,
        event_type: EventType,
        scope: EventScope,
        message: impl Into<String>,
        data: Value,
        transaction_hash: Option<Hash>,
    ) -> Self {
        LogEvent {
            name: name.into(),
            event_type,
            scope,
            message: message.into(),
            data,
            transaction_hash,
        }
    }
}

// Mirror event emitted towards the on-chain rollup bridge
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RollupEvent {
    pub name: String,
    pub account: Address,
    pub transaction_hash: Hash,
    #[serde(default)]
    pub extra: Vec<Value>,
}
