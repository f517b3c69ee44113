// Promotion of concluded transactions once their appeal window closes.

use log::{debug, info};

use synod_common::{
    time::get_current_time_in_seconds,
    transaction::{Transaction, TransactionStatus},
};

use crate::{
    config,
    core::{consensus::ConsensusEngine, effects::Effect, error::ConsensusError, storage::Storage},
};

impl<S: Storage> ConsensusEngine<S> {
    // One finalization sweep; returns how many transactions finalized
    pub async fn finalize_due_transactions(&self) -> Result<usize, ConsensusError> {
        let window = config::finality_window_time();
        let now = get_current_time_in_seconds();
        let candidates = self.storage().get_awaiting_finalization().await?;

        let mut finalized = 0;
        for transaction in candidates {
            if transaction.appealed {
                continue;
            }
            if !transaction.finality_window_elapsed(window, now) {
                continue;
            }
            // a triggered transaction waits for its parent
            if let Some(parent_hash) = transaction.triggered_by_hash {
                match self.storage().get_transaction_by_hash(&parent_hash).await? {
                    Some(parent) if parent.status != TransactionStatus::Finalized => {
                        debug!(
                            "transaction {} waits for parent {} to finalize",
                            transaction.hash, parent_hash
                        );
                        continue;
                    }
                    _ => {}
                }
            }
            self.finalize_one(&transaction).await?;
            finalized += 1;
        }
        Ok(finalized)
    }

    async fn finalize_one(&self, transaction: &Transaction) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let mut effects = vec![Effect::StatusUpdate {
            hash,
            new_status: TransactionStatus::Finalized,
            append_to_history: true,
        }];

        // accepted executions promote their state into the finalized view
        if transaction.status == TransactionStatus::Accepted {
            if let Some(account) = self
                .storage()
                .get_contract_account(&transaction.to_address)
                .await?
            {
                effects.push(Effect::UpdateContractState {
                    address: transaction.to_address,
                    accepted: None,
                    finalized: Some(account.state.accepted.clone()),
                });
            }
        }

        // the rollback snapshot is retained until finalization
        effects.push(Effect::SetContractSnapshot {
            hash,
            snapshot: None,
        });
        effects.push(Effect::EmitRollupEvent {
            name: "transaction_finalized".to_string(),
            account: transaction.to_address,
            hash,
            extra: Vec::new(),
        });
        effects.extend(self.insert_finalization_triggers(transaction).await?);

        self.effect_executor().execute(effects).await?;
        info!("transaction {} finalized", hash);
        Ok(())
    }
}
