// Contract accounts, their dual state maps and rollback snapshots.
//
// A contract carries two storage views: `accepted` (visible to pending
// reads) and `finalized` (visible to finalized reads). Each map goes from a
// base64-encoded 32-byte slot id to a base64 blob. Blobs are padded byte
// strings; reads are zero-extended and writes grow the blob as needed, so
// encode/decode round-trips are exact.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::Address,
    encoding::{b64_decode, b64_encode},
};

pub const SLOT_ID_SIZE: usize = 32;

// The well-known storage slot holding the deployed code blob
pub const CODE_SLOT: [u8; SLOT_ID_SIZE] = [0u8; SLOT_ID_SIZE];

pub type StateMap = IndexMap<String, String>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateStatus {
    Accepted,
    Finalized,
}

pub fn slot_key(slot: &[u8; SLOT_ID_SIZE]) -> String {
    b64_encode(slot)
}

pub fn code_slot_key() -> String {
    slot_key(&CODE_SLOT)
}

// Zero-extended read of `len` bytes at `index` within a slot blob
pub fn read_slot(state: &StateMap, key: &str, index: usize, len: usize) -> Vec<u8> {
    let mut data = state
        .get(key)
        .map(|blob| b64_decode(blob).unwrap_or_default())
        .unwrap_or_default();
    if data.len() < index + len {
        data.resize(index + len, 0);
    }
    data[index..index + len].to_vec()
}

// Write `bytes` at `index` within a slot blob, growing it with zeros
pub fn write_slot(state: &mut StateMap, key: &str, index: usize, bytes: &[u8]) {
    let mut data = state
        .get(key)
        .map(|blob| b64_decode(blob).unwrap_or_default())
        .unwrap_or_default();
    if data.len() < index + bytes.len() {
        data.resize(index + bytes.len(), 0);
    }
    data[index..index + bytes.len()].copy_from_slice(bytes);
    state.insert(key.to_string(), b64_encode(&data));
}

// Code blob layout: 4-byte little-endian length prefix, then the code bytes
pub fn encode_code_blob(code: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(4 + code.len());
    blob.extend_from_slice(&(code.len() as u32).to_le_bytes());
    blob.extend_from_slice(code);
    blob
}

pub fn decode_code_blob(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if raw.len() < 4 + len {
        return None;
    }
    Some(raw[4..4 + len].to_vec())
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ContractState {
    #[serde(default)]
    pub accepted: StateMap,
    #[serde(default)]
    pub finalized: StateMap,
}

impl ContractState {
    pub fn map(&self, status: StateStatus) -> &StateMap {
        match status {
            StateStatus::Accepted => &self.accepted,
            StateStatus::Finalized => &self.finalized,
        }
    }

    pub fn map_mut(&mut self, status: StateStatus) -> &mut StateMap {
        match status {
            StateStatus::Accepted => &mut self.accepted,
            StateStatus::Finalized => &mut self.finalized,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContractAccount {
    pub address: Address,
    pub balance: u64,
    #[serde(default)]
    pub state: ContractState,
}

impl ContractAccount {
    pub fn new(address: Address) -> Self {
        ContractAccount {
            address,
            balance: 0,
            state: ContractState::default(),
        }
    }

    pub fn code(&self) -> Option<Vec<u8>> {
        let blob = self.state.accepted.get(&code_slot_key())?;
        decode_code_blob(&b64_decode(blob).ok()?)
    }
}

// Immutable copy of a contract's accepted state plus code, captured when a
// transaction enters the proposing phase and used to roll it back when a
// later appeal succeeds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContractSnapshot {
    pub contract_address: Address,
    pub balance: u64,
    #[serde(default)]
    pub states: ContractState,
}

impl ContractSnapshot {
    pub fn from_account(account: &ContractAccount) -> Self {
        ContractSnapshot {
            contract_address: account.address,
            balance: account.balance,
            states: account.state.clone(),
        }
    }

    // Empty snapshot for a contract that does not exist yet (deploys)
    pub fn empty(address: Address, balance: u64) -> Self {
        ContractSnapshot {
            contract_address: address,
            balance,
            states: ContractState::default(),
        }
    }

    pub fn contract_code(&self) -> Option<Vec<u8>> {
        let blob = self.states.accepted.get(&code_slot_key())?;
        decode_code_blob(&b64_decode(blob).ok()?)
    }

    pub fn read_slot(&self, status: StateStatus, key: &str, index: usize, len: usize) -> Vec<u8> {
        read_slot(self.states.map(status), key, index, len)
    }

    pub fn write_slot(&mut self, status: StateStatus, key: &str, index: usize, bytes: &[u8]) {
        write_slot(self.states.map_mut(status), key, index, bytes)
    }

    pub fn set_code(&mut self, code: &[u8]) {
        let blob = encode_code_blob(code);
        self.states
            .accepted
            .insert(code_slot_key(), b64_encode(&blob));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ADDRESS_SIZE;

    #[test]
    fn reads_are_zero_extended() {
        let state = StateMap::new();
        let key = slot_key(&[1u8; SLOT_ID_SIZE]);
        let data = read_slot(&state, &key, 3, 5);
        assert_eq!(data, vec![0u8; 5]);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut state = StateMap::new();
        let key = slot_key(&[2u8; SLOT_ID_SIZE]);
        write_slot(&mut state, &key, 4, &[0xaa, 0xbb]);
        assert_eq!(read_slot(&state, &key, 0, 6), vec![0, 0, 0, 0, 0xaa, 0xbb]);
        // padding must not be stripped by the round-trip
        let blob = state.get(&key).unwrap();
        assert_eq!(b64_decode(blob).unwrap().len(), 6);
    }

    #[test]
    fn code_blob_roundtrip() {
        let code = b"contract bytes".to_vec();
        let blob = encode_code_blob(&code);
        assert_eq!(decode_code_blob(&blob), Some(code.clone()));

        let mut snapshot = ContractSnapshot::empty(Address::new([3; ADDRESS_SIZE]), 0);
        snapshot.set_code(&code);
        assert_eq!(snapshot.contract_code(), Some(code));
    }

    #[test]
    fn snapshot_captures_accepted_and_finalized() {
        let mut account = ContractAccount::new(Address::new([4; ADDRESS_SIZE]));
        account
            .state
            .accepted
            .insert("slot".to_string(), b64_encode(&[1, 0, 0]));
        account
            .state
            .finalized
            .insert("slot".to_string(), b64_encode(&[9]));
        let snapshot = ContractSnapshot::from_account(&account);
        assert_eq!(snapshot.states, account.state);

        // the snapshot is an independent copy
        account.state.accepted.clear();
        assert!(!snapshot.states.accepted.is_empty());
    }
}
