// The host side of the executor socket protocol.
//
// After POST /genvm/run the sidecar connects back and drives this loop:
// every request starts with a 1-byte method tag, lengths are 4-byte
// little-endian prefixes, addresses are 20 bytes, slot ids 32 bytes.
// Replies lead with a single status byte. The loop ends when the executor
// delivers CONSUME_RESULT: a 1-byte result code plus the payload.

use async_trait::async_trait;
use log::trace;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use synod_common::{
    consensus::ResultCode,
    contract::SLOT_ID_SIZE,
    crypto::{Address, ADDRESS_SIZE},
};

use crate::genvm::GenVmError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HostMethod {
    StorageRead = 0,
    StorageWrite = 1,
    ConsumeResult = 2,
    GetLeaderNondetResult = 3,
    PostNondetResult = 4,
    PostMessage = 5,
    ConsumeFuel = 6,
    DeployContract = 7,
    EthSend = 8,
    EthCall = 9,
    GetBalance = 10,
    RemainingFuelAsGen = 11,
    NotifyNondetDisagreement = 12,
}

impl HostMethod {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(HostMethod::StorageRead),
            1 => Some(HostMethod::StorageWrite),
            2 => Some(HostMethod::ConsumeResult),
            3 => Some(HostMethod::GetLeaderNondetResult),
            4 => Some(HostMethod::PostNondetResult),
            5 => Some(HostMethod::PostMessage),
            6 => Some(HostMethod::ConsumeFuel),
            7 => Some(HostMethod::DeployContract),
            8 => Some(HostMethod::EthSend),
            9 => Some(HostMethod::EthCall),
            10 => Some(HostMethod::GetBalance),
            11 => Some(HostMethod::RemainingFuelAsGen),
            12 => Some(HostMethod::NotifyNondetDisagreement),
            _ => None,
        }
    }
}

// Which state view a storage read goes against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageType {
    Default = 0,
    LatestNonFinal = 1,
    LatestFinal = 2,
}

impl StorageType {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(StorageType::Default),
            1 => Some(StorageType::LatestNonFinal),
            2 => Some(StorageType::LatestFinal),
            _ => None,
        }
    }
}

// Single-byte reply status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HostStatus {
    Ok = 0,
    Forbidden = 1,
    Absent = 2,
    Internal = 3,
}

#[derive(Debug, thiserror::Error)]
#[error("host callback failed: {0:?}")]
pub struct HostCallbackError(pub HostStatus);

impl HostCallbackError {
    pub fn forbidden() -> Self {
        HostCallbackError(HostStatus::Forbidden)
    }

    pub fn absent() -> Self {
        HostCallbackError(HostStatus::Absent)
    }
}

// Message metadata attached to POST_MESSAGE / DEPLOY_CONTRACT / ETH_SEND,
// carried as a JSON blob with stringified numbers
#[derive(Deserialize, Debug, Default)]
pub struct MessageData {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub on: Option<String>,
    #[serde(default)]
    pub salt_nonce: Option<String>,
}

impl MessageData {
    pub fn parsed_value(&self) -> u64 {
        self.value.as_deref().map(parse_number).unwrap_or(0)
    }

    pub fn parsed_salt_nonce(&self) -> u64 {
        self.salt_nonce.as_deref().map(parse_number).unwrap_or(0)
    }
}

fn parse_number(raw: &str) -> u64 {
    if let Some(hexpart) = raw.strip_prefix("0x") {
        u64::from_str_radix(hexpart, 16).unwrap_or(0)
    } else {
        raw.parse().unwrap_or(0)
    }
}

type HostResult<T> = Result<T, HostCallbackError>;

// Callbacks the executor is allowed to make while running one transaction
#[async_trait]
pub trait HostHandler: Send {
    async fn storage_read(
        &mut self,
        mode: StorageType,
        account: Address,
        slot: [u8; SLOT_ID_SIZE],
        index: u32,
        len: u32,
    ) -> HostResult<Vec<u8>>;

    async fn storage_write(
        &mut self,
        slot: [u8; SLOT_ID_SIZE],
        index: u32,
        data: Vec<u8>,
    ) -> HostResult<()>;

    async fn get_leader_nondet_result(&mut self, call_no: u32) -> HostResult<Vec<u8>>;

    async fn post_nondet_result(&mut self, call_no: u32, data: Vec<u8>) -> HostResult<()>;

    async fn post_message(
        &mut self,
        account: Address,
        calldata: Vec<u8>,
        data: MessageData,
    ) -> HostResult<()>;

    async fn consume_fuel(&mut self, fuel: u64);

    async fn deploy_contract(
        &mut self,
        calldata: Vec<u8>,
        code: Vec<u8>,
        data: MessageData,
    ) -> HostResult<()>;

    async fn eth_send(
        &mut self,
        account: Address,
        calldata: Vec<u8>,
        data: MessageData,
    ) -> HostResult<()>;

    async fn eth_call(&mut self, account: Address, calldata: Vec<u8>) -> HostResult<Vec<u8>>;

    async fn get_balance(&mut self, account: Address) -> HostResult<u64>;

    async fn remaining_fuel_as_gen(&mut self) -> HostResult<u64>;

    async fn notify_nondet_disagreement(&mut self, call_no: u32);
}

async fn read_exact_vec<S>(stream: &mut S, len: usize) -> Result<Vec<u8>, GenVmError>
where
    S: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn recv_u32<S>(stream: &mut S) -> Result<u32, GenVmError>
where
    S: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

async fn recv_u64<S>(stream: &mut S) -> Result<u64, GenVmError>
where
    S: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

async fn read_slice<S>(stream: &mut S) -> Result<Vec<u8>, GenVmError>
where
    S: AsyncRead + Unpin + Send,
{
    let len = recv_u32(stream).await? as usize;
    read_exact_vec(stream, len).await
}

async fn read_address<S>(stream: &mut S) -> Result<Address, GenVmError>
where
    S: AsyncRead + Unpin + Send,
{
    let raw = read_exact_vec(stream, ADDRESS_SIZE).await?;
    let mut bytes = [0u8; ADDRESS_SIZE];
    bytes.copy_from_slice(&raw);
    Ok(Address::new(bytes))
}

async fn send_status<S>(stream: &mut S, status: HostStatus) -> Result<(), GenVmError>
where
    S: AsyncWrite + Unpin + Send,
{
    stream.write_all(&[status as u8]).await?;
    Ok(())
}

async fn send_u32<S>(stream: &mut S, value: u32) -> Result<(), GenVmError>
where
    S: AsyncWrite + Unpin + Send,
{
    stream.write_all(&value.to_le_bytes()).await?;
    Ok(())
}

// Answer executor callbacks until CONSUME_RESULT arrives; returns the
// result code and its payload
pub async fn host_loop<S, H>(stream: &mut S, handler: &mut H) -> Result<(ResultCode, Vec<u8>), GenVmError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: HostHandler,
{
    loop {
        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag).await?;
        let method = HostMethod::from_byte(tag[0])
            .ok_or_else(|| GenVmError::Protocol(format!("unknown host method {}", tag[0])))?;
        trace!("host method {:?}", method);

        match method {
            HostMethod::StorageRead => {
                let mode_raw = read_exact_vec(stream, 1).await?;
                let mode = StorageType::from_byte(mode_raw[0]).ok_or_else(|| {
                    GenVmError::Protocol(format!("unknown storage type {}", mode_raw[0]))
                })?;
                let account = read_address(stream).await?;
                let slot_raw = read_exact_vec(stream, SLOT_ID_SIZE).await?;
                let mut slot = [0u8; SLOT_ID_SIZE];
                slot.copy_from_slice(&slot_raw);
                let index = recv_u32(stream).await?;
                let len = recv_u32(stream).await?;
                match handler.storage_read(mode, account, slot, index, len).await {
                    Ok(data) => {
                        debug_assert_eq!(data.len(), len as usize);
                        send_status(stream, HostStatus::Ok).await?;
                        stream.write_all(&data).await?;
                    }
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::StorageWrite => {
                let slot_raw = read_exact_vec(stream, SLOT_ID_SIZE).await?;
                let mut slot = [0u8; SLOT_ID_SIZE];
                slot.copy_from_slice(&slot_raw);
                let index = recv_u32(stream).await?;
                let data = read_slice(stream).await?;
                match handler.storage_write(slot, index, data).await {
                    Ok(()) => send_status(stream, HostStatus::Ok).await?,
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::ConsumeResult => {
                let payload = read_slice(stream).await?;
                stream.write_all(&[0u8]).await?;
                if payload.is_empty() {
                    return Err(GenVmError::Protocol("empty consume result".to_string()));
                }
                let code = ResultCode::from_byte(payload[0]).ok_or_else(|| {
                    GenVmError::Protocol(format!("unknown result code {}", payload[0]))
                })?;
                return Ok((code, payload[1..].to_vec()));
            }
            HostMethod::GetLeaderNondetResult => {
                let call_no = recv_u32(stream).await?;
                match handler.get_leader_nondet_result(call_no).await {
                    Ok(data) => {
                        send_status(stream, HostStatus::Ok).await?;
                        send_u32(stream, data.len() as u32).await?;
                        stream.write_all(&data).await?;
                    }
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::PostNondetResult => {
                let call_no = recv_u32(stream).await?;
                let data = read_slice(stream).await?;
                match handler.post_nondet_result(call_no, data).await {
                    Ok(()) => send_status(stream, HostStatus::Ok).await?,
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::PostMessage => {
                let account = read_address(stream).await?;
                let calldata = read_slice(stream).await?;
                let message_raw = read_slice(stream).await?;
                let data: MessageData = serde_json::from_slice(&message_raw)?;
                match handler.post_message(account, calldata, data).await {
                    Ok(()) => send_status(stream, HostStatus::Ok).await?,
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::ConsumeFuel => {
                let fuel = recv_u64(stream).await?;
                handler.consume_fuel(fuel).await;
            }
            HostMethod::DeployContract => {
                let calldata = read_slice(stream).await?;
                let code = read_slice(stream).await?;
                let message_raw = read_slice(stream).await?;
                let data: MessageData = serde_json::from_slice(&message_raw)?;
                match handler.deploy_contract(calldata, code, data).await {
                    Ok(()) => send_status(stream, HostStatus::Ok).await?,
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::EthSend => {
                let account = read_address(stream).await?;
                let calldata = read_slice(stream).await?;
                let message_raw = read_slice(stream).await?;
                let data: MessageData = serde_json::from_slice(&message_raw)?;
                match handler.eth_send(account, calldata, data).await {
                    Ok(()) => send_status(stream, HostStatus::Ok).await?,
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::EthCall => {
                let account = read_address(stream).await?;
                let calldata = read_slice(stream).await?;
                match handler.eth_call(account, calldata).await {
                    Ok(data) => {
                        send_status(stream, HostStatus::Ok).await?;
                        send_u32(stream, data.len() as u32).await?;
                        stream.write_all(&data).await?;
                    }
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::GetBalance => {
                let account = read_address(stream).await?;
                match handler.get_balance(account).await {
                    Ok(balance) => {
                        send_status(stream, HostStatus::Ok).await?;
                        // 32-byte little-endian balance
                        let mut bytes = [0u8; 32];
                        bytes[..8].copy_from_slice(&balance.to_le_bytes());
                        stream.write_all(&bytes).await?;
                    }
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::RemainingFuelAsGen => {
                match handler.remaining_fuel_as_gen().await {
                    Ok(fuel) => {
                        send_status(stream, HostStatus::Ok).await?;
                        // clamp to what fits a double mantissa
                        let clamped = fuel.min((1u64 << 53) - 1);
                        stream.write_all(&clamped.to_le_bytes()).await?;
                    }
                    Err(err) => send_status(stream, err.0).await?,
                }
            }
            HostMethod::NotifyNondetDisagreement => {
                let call_no = recv_u32(stream).await?;
                // no response expected
                handler.notify_nondet_disagreement(call_no).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use synod_common::contract::{ContractSnapshot, StateStatus};

    use crate::genvm::state::{DecodedValueCache, NodeHost, SnapshotFactory};
    use crate::core::error::ConsensusError;

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
            Ok(5)
        }
    }

    fn frame_u32(value: u32) -> [u8; 4] {
        value.to_le_bytes()
    }

    // Drive the loop over an in-memory duplex: write a slot, read it back
    // zero-extended, then deliver the result
    #[tokio::test]
    async fn host_loop_speaks_the_frame_protocol() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let contract = Address::new([1; ADDRESS_SIZE]);
        let mut handler = NodeHost::new(
            ContractSnapshot::empty(contract, 0),
            Arc::new(NoFactory),
            false,
            StateStatus::Accepted,
            None,
            Arc::new(DecodedValueCache::new()),
        );

        let server_task = tokio::spawn(async move {
            let result = host_loop(&mut server, &mut handler).await;
            (result, handler)
        });

        let slot = [9u8; SLOT_ID_SIZE];

        // STORAGE_WRITE slot[2..4] = aa bb
        client.write_all(&[HostMethod::StorageWrite as u8]).await.unwrap();
        client.write_all(&slot).await.unwrap();
        client.write_all(&frame_u32(2)).await.unwrap();
        client.write_all(&frame_u32(2)).await.unwrap();
        client.write_all(&[0xaa, 0xbb]).await.unwrap();
        let mut status = [0u8; 1];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], HostStatus::Ok as u8);

        // STORAGE_READ 6 bytes from index 0, zero-extended around the write
        client.write_all(&[HostMethod::StorageRead as u8]).await.unwrap();
        client.write_all(&[StorageType::Default as u8]).await.unwrap();
        client.write_all(contract.as_bytes()).await.unwrap();
        client.write_all(&slot).await.unwrap();
        client.write_all(&frame_u32(0)).await.unwrap();
        client.write_all(&frame_u32(6)).await.unwrap();
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], HostStatus::Ok as u8);
        let mut data = [0u8; 6];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, [0, 0, 0xaa, 0xbb, 0, 0]);

        // GET_BALANCE answers 32 little-endian bytes
        client.write_all(&[HostMethod::GetBalance as u8]).await.unwrap();
        client.write_all(&[7u8; ADDRESS_SIZE]).await.unwrap();
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], HostStatus::Ok as u8);
        let mut balance = [0u8; 32];
        client.read_exact(&mut balance).await.unwrap();
        assert_eq!(balance[0], 5);

        // CONSUME_RESULT ends the loop with the code-prefixed payload
        let payload = [&[ResultCode::Return.as_byte()][..], b"done"].concat();
        client.write_all(&[HostMethod::ConsumeResult as u8]).await.unwrap();
        client.write_all(&frame_u32(payload.len() as u32)).await.unwrap();
        client.write_all(&payload).await.unwrap();
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status[0], 0);

        let (result, handler) = server_task.await.unwrap();
        let (code, data) = result.unwrap();
        assert_eq!(code, ResultCode::Return);
        assert_eq!(data, b"done");
        // the write landed in the accepted view of the snapshot
        let stored = handler.snapshot().read_slot(
            StateStatus::Accepted,
            &synod_common::encoding::b64_encode(&slot),
            0,
            4,
        );
        assert_eq!(stored, vec![0, 0, 0xaa, 0xbb]);
    }

    #[tokio::test]
    async fn unknown_method_tag_is_a_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut handler = NodeHost::new(
            ContractSnapshot::empty(Address::new([1; ADDRESS_SIZE]), 0),
            Arc::new(NoFactory),
            false,
            StateStatus::Accepted,
            None,
            Arc::new(DecodedValueCache::new()),
        );

        client.write_all(&[0xff]).await.unwrap();
        let err = host_loop(&mut server, &mut handler).await.unwrap_err();
        assert!(matches!(err, GenVmError::Protocol(_)));
    }
}

