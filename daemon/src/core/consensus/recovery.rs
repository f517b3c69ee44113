// Startup recovery for transactions a dead worker left mid-flight.
//
// Ownership is implicit in the status, so anything found in an in-process
// state at boot belongs to nobody. Such transactions, and everything newer
// on the same contract, restart from Pending with a clean slate;
// re-execution is at-least-once.

use log::{info, warn};

use synod_common::transaction::{Transaction, TransactionStatus, TransactionType};

use crate::core::{
    consensus::ConsensusEngine,
    effects::{Effect, StoreWrite},
    error::ConsensusError,
    storage::Storage,
};

impl<S: Storage> ConsensusEngine<S> {
    pub async fn recover_stuck_transactions(&self) -> Result<usize, ConsensusError> {
        let mut stuck = self.storage().get_in_process_transactions().await?;
        stuck.sort_by_key(|tx| (tx.created_at, tx.nonce));
        if stuck.is_empty() {
            return Ok(0);
        }
        info!("recovering {} stuck transaction(s)", stuck.len());

        let mut recovered = 0;
        for transaction in stuck {
            // the sweep for an earlier sibling may have reset this one
            let Some(current) = self
                .storage()
                .get_transaction_by_hash(&transaction.hash)
                .await?
            else {
                continue;
            };
            if !current.status.is_in_process() {
                continue;
            }

            self.restore_contract_state_from_receipts(&current).await?;

            // a call against a contract that never came to exist cannot
            // make progress; deploys re-run and create it
            if current.tx_type == TransactionType::RunContract
                && !self.storage().contract_exists(&current.to_address).await?
            {
                warn!(
                    "canceling stuck transaction {}: contract {} never existed",
                    current.hash, current.to_address
                );
                self.effect_executor()
                    .execute(vec![Effect::StatusUpdate {
                        hash: current.hash,
                        new_status: TransactionStatus::Canceled,
                        append_to_history: true,
                    }])
                    .await?;
                continue;
            }

            let mut batch = vec![current.clone()];
            batch.extend(self.storage().get_newer_transactions(&current.hash).await?);
            let mut effects = Vec::new();
            for tx in &batch {
                if tx.status.is_terminal() {
                    continue;
                }
                effects.extend(restart_effects(tx));
            }
            self.effect_executor().execute(effects).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    // If a prior concluded transaction on the same contract still carries
    // leader contract state (legacy rows; receipts are stripped on write
    // today), restore the account from it.
    async fn restore_contract_state_from_receipts(
        &self,
        transaction: &Transaction,
    ) -> Result<(), ConsensusError> {
        for status in [TransactionStatus::Accepted, TransactionStatus::Finalized] {
            let Some(previous) = self
                .storage()
                .get_previous_transaction(&transaction.hash, Some(status))
                .await?
            else {
                continue;
            };
            let Some(state) = previous
                .consensus_data
                .as_ref()
                .and_then(|data| data.leader_receipt())
                .map(|receipt| receipt.contract_state.clone())
            else {
                continue;
            };
            if state.is_empty() {
                continue;
            }
            info!(
                "restoring contract {} state from transaction {}",
                transaction.to_address, previous.hash
            );
            let (accepted, finalized) = match status {
                TransactionStatus::Finalized => (Some(state.clone()), Some(state)),
                _ => (Some(state), None),
            };
            self.effect_executor()
                .execute(vec![Effect::UpdateContractState {
                    address: transaction.to_address,
                    accepted,
                    finalized,
                }])
                .await?;
            return Ok(());
        }
        Ok(())
    }
}

// Startup restart is harsher than appeal rollback: consensus history and
// appeal bookkeeping are wiped as well
fn restart_effects(transaction: &Transaction) -> Vec<Effect> {
    let hash = transaction.hash;
    vec![
        Effect::StatusUpdate {
            hash,
            new_status: TransactionStatus::Pending,
            append_to_history: false,
        },
        Effect::DBWrite {
            hash,
            write: StoreWrite::ClearConsensusData,
        },
        Effect::DBWrite {
            hash,
            write: StoreWrite::ClearContractSnapshot,
        },
        Effect::DBWrite {
            hash,
            write: StoreWrite::ClearConsensusHistory,
        },
        Effect::SetAppeal {
            hash,
            appealed: false,
        },
        Effect::SetAppealFailed { hash, count: 0 },
        Effect::SetAppealUndetermined { hash, value: false },
        Effect::SetAppealLeaderTimeout { hash, value: false },
        Effect::SetAppealValidatorsTimeout { hash, value: false },
        Effect::ResetRotationCount { hash },
        Effect::ResetAppealProcessingTime { hash },
        Effect::SetTimestampAppeal { hash, value: None },
        Effect::SetTimestampAwaitingFinalization { hash, value: None },
    ]
}
