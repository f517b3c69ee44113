// State proxy handed to the executor: scoped access to the transaction's
// contract snapshot with read-through to other contracts, plus the
// collection points for eq outputs, scheduled messages and disagreement
// notices.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use log::trace;

use synod_common::{
    contract::{write_slot, ContractSnapshot, StateStatus, SLOT_ID_SIZE},
    crypto::Address,
    encoding::{b64_decode, b64_encode, Base64Bytes},
    transaction::{PendingTransaction, TriggeredOn},
};

use crate::{
    core::{error::ConsensusError, storage::Storage},
    genvm::host::{HostCallbackError, HostHandler, MessageData, StorageType},
};

// Executor fuel budget granted per run
const INITIAL_FUEL: u64 = (1u64 << 53) - 1;

// Process-wide read-mostly cache of decoded slot blobs, shared across the
// validator tasks of one transaction to amortize base64 decoding. Entries
// are immutable once inserted.
#[derive(Default)]
pub struct DecodedValueCache {
    entries: DashMap<String, Arc<Vec<u8>>>,
}

impl DecodedValueCache {
    pub fn new() -> Self {
        DecodedValueCache::default()
    }

    pub fn decode(&self, blob: &str) -> Arc<Vec<u8>> {
        if let Some(entry) = self.entries.get(blob) {
            return entry.clone();
        }
        let decoded = Arc::new(b64_decode(blob).unwrap_or_default());
        self.entries
            .insert(blob.to_string(), decoded.clone());
        decoded
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Read-through source for foreign contract snapshots and balances
#[async_trait]
pub trait SnapshotFactory: Send + Sync {
    async fn snapshot_for(&self, address: &Address) -> Result<ContractSnapshot, ConsensusError>;

    async fn balance_of(&self, address: &Address) -> Result<u64, ConsensusError>;
}

pub struct StorageSnapshotFactory<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> StorageSnapshotFactory<S> {
    pub fn new(storage: Arc<S>) -> Self {
        StorageSnapshotFactory { storage }
    }
}

#[async_trait]
impl<S: Storage> SnapshotFactory for StorageSnapshotFactory<S> {
    async fn snapshot_for(&self, address: &Address) -> Result<ContractSnapshot, ConsensusError> {
        let account = self
            .storage
            .get_contract_account(address)
            .await?
            .ok_or(ConsensusError::ContractNotFound(*address))?;
        Ok(ContractSnapshot::from_account(&account))
    }

    async fn balance_of(&self, address: &Address) -> Result<u64, ConsensusError> {
        self.storage.get_balance(address).await
    }
}

pub struct NodeHost {
    snapshot: ContractSnapshot,
    factory: Arc<dyn SnapshotFactory>,
    foreign: HashMap<Address, ContractSnapshot>,
    readonly: bool,
    state_status: StateStatus,
    leader_eq_outputs: Option<IndexMap<u32, String>>,
    decoded_cache: Arc<DecodedValueCache>,
    fuel_remaining: u64,
    pub eq_outputs: IndexMap<u32, String>,
    pub pending_transactions: Vec<PendingTransaction>,
    pub eth_sends: Vec<(Address, Vec<u8>)>,
    pub nondet_disagree: Option<u32>,
}

impl NodeHost {
    pub fn new(
        snapshot: ContractSnapshot,
        factory: Arc<dyn SnapshotFactory>,
        readonly: bool,
        state_status: StateStatus,
        leader_eq_outputs: Option<IndexMap<u32, String>>,
        decoded_cache: Arc<DecodedValueCache>,
    ) -> Self {
        NodeHost {
            snapshot,
            factory,
            foreign: HashMap::new(),
            readonly,
            state_status,
            leader_eq_outputs,
            decoded_cache,
            fuel_remaining: INITIAL_FUEL,
            eq_outputs: IndexMap::new(),
            pending_transactions: Vec::new(),
            eth_sends: Vec::new(),
            nondet_disagree: None,
        }
    }

    pub fn snapshot(&self) -> &ContractSnapshot {
        &self.snapshot
    }

    fn view_for(&self, mode: StorageType) -> StateStatus {
        match mode {
            StorageType::Default => self.state_status,
            StorageType::LatestNonFinal => StateStatus::Accepted,
            StorageType::LatestFinal => StateStatus::Finalized,
        }
    }

    fn read_from_snapshot(
        &self,
        snapshot: &ContractSnapshot,
        status: StateStatus,
        key: &str,
        index: usize,
        len: usize,
    ) -> Vec<u8> {
        let mut data: Vec<u8> = match snapshot.states.map(status).get(key) {
            Some(blob) => self.decoded_cache.decode(blob).as_ref().clone(),
            None => Vec::new(),
        };
        if data.len() < index + len {
            data.resize(index + len, 0);
        }
        data[index..index + len].to_vec()
    }

    async fn foreign_snapshot(
        &mut self,
        address: Address,
    ) -> Result<&ContractSnapshot, HostCallbackError> {
        if !self.foreign.contains_key(&address) {
            let snapshot = self
                .factory
                .snapshot_for(&address)
                .await
                .map_err(|_| HostCallbackError::absent())?;
            self.foreign.insert(address, snapshot);
        }
        match self.foreign.get(&address) {
            Some(snapshot) => Ok(snapshot),
            None => Err(HostCallbackError::absent()),
        }
    }

    fn parse_on(raw: Option<&str>) -> TriggeredOn {
        match raw {
            Some("accepted") => TriggeredOn::Accepted,
            _ => TriggeredOn::Finalized,
        }
    }
}

#[async_trait]
impl HostHandler for NodeHost {
    async fn storage_read(
        &mut self,
        mode: StorageType,
        account: Address,
        slot: [u8; SLOT_ID_SIZE],
        index: u32,
        len: u32,
    ) -> Result<Vec<u8>, HostCallbackError> {
        let status = self.view_for(mode);
        let key = b64_encode(&slot);
        trace!("storage read {} slot {}", account, key);
        if account == self.snapshot.contract_address {
            return Ok(self.read_from_snapshot(
                &self.snapshot,
                status,
                &key,
                index as usize,
                len as usize,
            ));
        }
        let snapshot = self.foreign_snapshot(account).await?.clone();
        Ok(self.read_from_snapshot(&snapshot, status, &key, index as usize, len as usize))
    }

    async fn storage_write(
        &mut self,
        slot: [u8; SLOT_ID_SIZE],
        index: u32,
        data: Vec<u8>,
    ) -> Result<(), HostCallbackError> {
        if self.readonly {
            return Err(HostCallbackError::forbidden());
        }
        let key = b64_encode(&slot);
        let status = self.state_status;
        write_slot(
            self.snapshot.states.map_mut(status),
            &key,
            index as usize,
            &data,
        );
        Ok(())
    }

    async fn get_leader_nondet_result(
        &mut self,
        call_no: u32,
    ) -> Result<Vec<u8>, HostCallbackError> {
        let outputs = self
            .leader_eq_outputs
            .as_ref()
            .ok_or_else(HostCallbackError::absent)?;
        let blob = outputs.get(&call_no).ok_or_else(HostCallbackError::absent)?;
        b64_decode(blob).map_err(|_| HostCallbackError::absent())
    }

    async fn post_nondet_result(
        &mut self,
        call_no: u32,
        data: Vec<u8>,
    ) -> Result<(), HostCallbackError> {
        self.eq_outputs.insert(call_no, b64_encode(&data));
        Ok(())
    }

    async fn post_message(
        &mut self,
        account: Address,
        calldata: Vec<u8>,
        data: MessageData,
    ) -> Result<(), HostCallbackError> {
        if self.readonly {
            return Err(HostCallbackError::forbidden());
        }
        self.pending_transactions.push(PendingTransaction {
            address: account,
            calldata: Base64Bytes::new(calldata),
            code: None,
            salt_nonce: 0,
            on: NodeHost::parse_on(data.on.as_deref()),
            value: data.parsed_value(),
        });
        Ok(())
    }

    async fn consume_fuel(&mut self, fuel: u64) {
        self.fuel_remaining = self.fuel_remaining.saturating_sub(fuel);
    }

    async fn deploy_contract(
        &mut self,
        calldata: Vec<u8>,
        code: Vec<u8>,
        data: MessageData,
    ) -> Result<(), HostCallbackError> {
        if self.readonly {
            return Err(HostCallbackError::forbidden());
        }
        self.pending_transactions.push(PendingTransaction {
            address: Address::zero(),
            calldata: Base64Bytes::new(calldata),
            code: Some(Base64Bytes::new(code)),
            salt_nonce: data.parsed_salt_nonce(),
            on: NodeHost::parse_on(data.on.as_deref()),
            value: data.parsed_value(),
        });
        Ok(())
    }

    async fn eth_send(
        &mut self,
        account: Address,
        calldata: Vec<u8>,
        _data: MessageData,
    ) -> Result<(), HostCallbackError> {
        // outbound rollup bridge port; recorded for the mirror emitter
        self.eth_sends.push((account, calldata));
        Ok(())
    }

    async fn eth_call(
        &mut self,
        _account: Address,
        _calldata: Vec<u8>,
    ) -> Result<Vec<u8>, HostCallbackError> {
        // the rollup chain is a collaborator; reads resolve to empty here
        Ok(Vec::new())
    }

    async fn get_balance(&mut self, account: Address) -> Result<u64, HostCallbackError> {
        if account == self.snapshot.contract_address {
            return Ok(self.snapshot.balance);
        }
        self.factory
            .balance_of(&account)
            .await
            .map_err(|_| HostCallbackError::absent())
    }

    async fn remaining_fuel_as_gen(&mut self) -> Result<u64, HostCallbackError> {
        Ok(self.fuel_remaining)
    }

    async fn notify_nondet_disagreement(&mut self, call_no: u32) {
        self.nondet_disagree = Some(call_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFactory;

    #[async_trait]
    impl SnapshotFactory for NoFactory {
        async fn snapshot_for(
            &self,
            address: &Address,
        ) -> Result<ContractSnapshot, ConsensusError> {
            Err(ConsensusError::ContractNotFound(*address))
        }

        async fn balance_of(&self, _address: &Address) -> Result<u64, ConsensusError> {
            Ok(0)
        }
    }

    fn host(readonly: bool) -> NodeHost {
        let snapshot = ContractSnapshot::empty(Address::new([1; 20]), 77);
        NodeHost::new(
            snapshot,
            Arc::new(NoFactory),
            readonly,
            StateStatus::Accepted,
            None,
            Arc::new(DecodedValueCache::new()),
        )
    }

    #[tokio::test]
    async fn write_then_read_roundtrip_with_zero_extension() {
        let mut host = host(false);
        let slot = [5u8; SLOT_ID_SIZE];
        host.storage_write(slot, 2, vec![0xaa, 0xbb]).await.unwrap();

        let own = host.snapshot().contract_address;
        let data = host
            .storage_read(StorageType::Default, own, slot, 0, 6)
            .await
            .unwrap();
        assert_eq!(data, vec![0, 0, 0xaa, 0xbb, 0, 0]);
    }

    #[tokio::test]
    async fn readonly_host_rejects_writes_and_messages() {
        let mut host = host(true);
        let err = host
            .storage_write([0u8; SLOT_ID_SIZE], 0, vec![1])
            .await
            .unwrap_err();
        assert_eq!(err.0, crate::genvm::host::HostStatus::Forbidden);

        let err = host
            .post_message(Address::zero(), vec![], MessageData::default())
            .await
            .unwrap_err();
        assert_eq!(err.0, crate::genvm::host::HostStatus::Forbidden);
    }

    #[tokio::test]
    async fn leader_eq_outputs_are_served_to_validators() {
        let mut leader_outputs = IndexMap::new();
        leader_outputs.insert(3u32, b64_encode(b"llm says yes"));
        let mut host = NodeHost::new(
            ContractSnapshot::empty(Address::new([1; 20]), 0),
            Arc::new(NoFactory),
            false,
            StateStatus::Accepted,
            Some(leader_outputs),
            Arc::new(DecodedValueCache::new()),
        );

        let data = host.get_leader_nondet_result(3).await.unwrap();
        assert_eq!(data, b"llm says yes");
        assert!(host.get_leader_nondet_result(4).await.is_err());

        host.post_nondet_result(0, b"own output".to_vec()).await.unwrap();
        assert_eq!(host.eq_outputs.get(&0).unwrap(), &b64_encode(b"own output"));
    }

    #[tokio::test]
    async fn scheduled_messages_become_pending_transactions() {
        let mut host = host(false);
        host.post_message(
            Address::new([9; 20]),
            vec![1, 2],
            MessageData {
                value: Some("15".to_string()),
                on: Some("accepted".to_string()),
                salt_nonce: None,
            },
        )
        .await
        .unwrap();
        host.deploy_contract(vec![3], vec![4, 5], MessageData::default())
            .await
            .unwrap();

        assert_eq!(host.pending_transactions.len(), 2);
        let message = &host.pending_transactions[0];
        assert_eq!(message.value, 15);
        assert_eq!(message.on, TriggeredOn::Accepted);
        assert!(!message.is_deploy());
        let deploy = &host.pending_transactions[1];
        assert!(deploy.is_deploy());
        assert_eq!(deploy.on, TriggeredOn::Finalized);
    }

    #[tokio::test]
    async fn decoded_value_cache_reuses_entries() {
        let cache = DecodedValueCache::new();
        let blob = b64_encode(&[1, 2, 3, 0, 0]);
        let a = cache.decode(&blob);
        let b = cache.decode(&blob);
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        assert_eq!(*a, vec![1, 2, 3, 0, 0]);
    }
}
