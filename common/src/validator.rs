use serde::{Deserialize, Serialize};

use crate::{consensus::NodeConfig, crypto::Address};

// LLM backend configuration of a validator node
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LlmProvider {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub plugin_config: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
}

// A configured node identity that can execute a transaction and cast a
// vote. Stake is a weight hint; selection is uniform by default.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Validator {
    pub address: Address,
    pub stake: u64,
    pub provider: LlmProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl Validator {
    pub fn new(address: Address, stake: u64, provider: LlmProvider) -> Self {
        Validator {
            address,
            stake,
            provider,
            private_key: None,
        }
    }

    // Public material carried on receipts produced by this validator
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            address: self.address,
            stake: self.stake,
            provider: self.provider.provider.clone(),
            model: self.provider.model.clone(),
        }
    }
}
