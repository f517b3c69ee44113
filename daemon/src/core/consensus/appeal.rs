// Window-gated re-opening of concluded transactions.
//
// A failed appeal augments the validator set, restores the previous status
// and extends the finality window. A successful appeal rolls the contract
// back to the snapshot captured at proposing time and re-enqueues the
// transaction together with every later transaction on the same contract,
// history preserved, in created_at order.

use indexmap::IndexMap;
use log::{debug, info};

use synod_common::{
    consensus::{ConsensusData, ConsensusRound, Vote},
    crypto::Hash,
    time::get_current_time_in_seconds,
    transaction::{Transaction, TransactionStatus, TriggeredOn},
};

use crate::{
    config,
    core::{
        consensus::{appeal_confirms, collect_votes, ConsensusEngine},
        effects::{Effect, StoreWrite},
        error::ConsensusError,
        storage::Storage,
    },
    vrf,
};

impl<S: Storage> ConsensusEngine<S> {
    // Worker entry point for a transaction flagged `appealed`
    pub async fn process_appeal(&self, hash: Hash) -> Result<(), ConsensusError> {
        let transaction = self
            .storage()
            .get_transaction_by_hash(&hash)
            .await?
            .ok_or(ConsensusError::TransactionNotFound(hash))?;
        if !transaction.appealed {
            debug!("transaction {} no longer flagged for appeal", hash);
            return Ok(());
        }

        let now = get_current_time_in_seconds();
        let window = config::finality_window_time();
        if !transaction.appeal_window_open(window, now) {
            debug!("appeal window closed for {}, clearing flag", hash);
            return self
                .effect_executor()
                .execute(vec![Effect::SetAppeal {
                    hash,
                    appealed: false,
                }])
                .await;
        }

        match transaction.status {
            TransactionStatus::Accepted => self.appeal_round(transaction, false).await,
            TransactionStatus::Undetermined => self.appeal_round(transaction, true).await,
            // timeouts never mutated state; the remedy is a clean rerun
            TransactionStatus::LeaderTimeout | TransactionStatus::ValidatorsTimeout => {
                self.reopen_after_timeout(transaction).await
            }
            status => Err(ConsensusError::NotAppealable(hash, status)),
        }
    }

    // The persisted leader receipt is stripped; its reference state is
    // rebuilt from canonical sources only. The snapshot of the next newer
    // transaction on the contract is exactly this transaction's post
    // state; with no newer transaction the contract's accepted map is.
    async fn reference_state_for_appeal(
        &self,
        transaction: &Transaction,
    ) -> Result<synod_common::contract::StateMap, ConsensusError> {
        let newer = self.storage().get_newer_transactions(&transaction.hash).await?;
        for sibling in newer {
            if let Some(snapshot) = sibling.contract_snapshot {
                return Ok(snapshot.states.accepted);
            }
        }
        Ok(self
            .storage()
            .get_contract_account(&transaction.to_address)
            .await?
            .map(|account| account.state.accepted)
            .unwrap_or_default())
    }

    // Re-run Committing/Revealing against the recorded leader receipt with
    // an augmented validator set
    async fn appeal_round(
        &self,
        transaction: Transaction,
        was_undetermined: bool,
    ) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let consensus_data = transaction
            .consensus_data
            .clone()
            .ok_or(ConsensusError::MissingConsensusData(hash))?;
        let mut leader_receipt = consensus_data
            .leader_receipt()
            .cloned()
            .ok_or(ConsensusError::MissingConsensusData(hash))?;
        let snapshot = transaction
            .contract_snapshot
            .clone()
            .ok_or(ConsensusError::MissingContractSnapshot(hash))?;

        if !was_undetermined {
            leader_receipt.contract_state = self.reference_state_for_appeal(&transaction).await?;
        }

        let all_validators = self.storage().get_all_validators().await?;
        let appeal_set = vrf::get_extra_validators(
            &all_validators,
            &transaction.consensus_history,
            &consensus_data,
            transaction.appeal_failed,
            &hash,
        )?;

        let now = get_current_time_in_seconds();
        self.effect_executor()
            .execute(vec![
                Effect::SetTimestampAppeal {
                    hash,
                    value: Some(now),
                },
                Effect::StatusUpdate {
                    hash,
                    new_status: TransactionStatus::Committing,
                    append_to_history: true,
                },
            ])
            .await?;

        let receipts = self
            .run_validators(&transaction, &appeal_set.extra, &leader_receipt, &snapshot)
            .await;

        self.effect_executor()
            .execute(vec![
                Effect::StatusUpdate {
                    hash,
                    new_status: TransactionStatus::Revealing,
                    append_to_history: true,
                },
                Effect::SetTimestampLastVote { hash },
            ])
            .await?;

        let confirmed = appeal_confirms(&receipts);

        if was_undetermined {
            // an undetermined transaction resolves when the appeal set
            // reaches agreement with the recorded leader; it re-enters the
            // pipeline for a clean accepting round (the recorded receipt
            // carries no canonical post-state to apply)
            if confirmed {
                info!(
                    "appeal resolved undetermined transaction {}, re-running",
                    hash
                );
                let mut effects = vec![
                    Effect::UpdateConsensusHistory {
                        hash,
                        round: ConsensusRound::AppealSuccessful,
                        leader_receipts: Vec::new(),
                        validator_results: receipts,
                        new_status: None,
                    },
                    Effect::SetAppealUndetermined { hash, value: true },
                    Effect::SetAppealProcessingTime { hash },
                ];
                effects.extend(reopen_effects(hash));
                return self.effect_executor().execute(effects).await;
            }
            return self.appeal_failed_effects(&transaction, receipts, consensus_data).await;
        }

        if confirmed {
            // majority still agrees with the original leader
            return self.appeal_failed_effects(&transaction, receipts, consensus_data).await;
        }

        // the appeal succeeded: roll back and replay
        info!("appeal succeeded for {}, rolling back descendants", hash);
        let mut effects = vec![
            Effect::UpdateConsensusHistory {
                hash,
                round: ConsensusRound::AppealSuccessful,
                leader_receipts: Vec::new(),
                validator_results: receipts,
                new_status: None,
            },
            Effect::SetAppealProcessingTime { hash },
            // overwrite the contract's accepted state from the snapshot
            Effect::UpdateContractState {
                address: transaction.to_address,
                accepted: Some(snapshot.states.accepted.clone()),
                finalized: None,
            },
        ];

        let mut to_reopen = vec![transaction.clone()];
        to_reopen.extend(self.storage().get_newer_transactions(&hash).await?);
        for tx in &to_reopen {
            if tx.status.is_terminal() {
                continue;
            }
            effects.extend(reopen_effects(tx.hash));
        }

        self.effect_executor().execute(effects).await
    }

    async fn appeal_failed_effects(
        &self,
        transaction: &Transaction,
        receipts: Vec<synod_common::consensus::Receipt>,
        consensus_data: ConsensusData,
    ) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let now = get_current_time_in_seconds();
        let restored_status = transaction.status;

        // the appeal validators join the recorded set; the failed counter
        // drives the next augmentation step
        let mut merged = consensus_data;
        let appeal_votes: IndexMap<_, Vote> = collect_votes(&receipts);
        merged.votes.extend(appeal_votes);
        merged.validators.extend(receipts.clone());

        self.effect_executor()
            .execute(vec![
                Effect::UpdateConsensusHistory {
                    hash,
                    round: ConsensusRound::AppealFailed,
                    leader_receipts: Vec::new(),
                    validator_results: receipts,
                    new_status: Some(restored_status),
                },
                Effect::SetTransactionResult {
                    hash,
                    consensus_data: Some(merged),
                },
                Effect::SetAppealFailed {
                    hash,
                    count: transaction.appeal_failed + 1,
                },
                Effect::SetAppeal {
                    hash,
                    appealed: false,
                },
                Effect::SetAppealProcessingTime { hash },
                // a failed appeal extends the finality window
                Effect::SetTimestampAwaitingFinalization {
                    hash,
                    value: Some(now),
                },
            ])
            .await?;
        info!(
            "appeal failed for {}, window extended (appeal_failed now {})",
            hash,
            transaction.appeal_failed + 1
        );
        Ok(())
    }

    // Timeout statuses re-enter the pipeline from scratch
    async fn reopen_after_timeout(&self, transaction: Transaction) -> Result<(), ConsensusError> {
        let hash = transaction.hash;
        let flag_effect = if transaction.status == TransactionStatus::LeaderTimeout {
            Effect::SetAppealLeaderTimeout { hash, value: true }
        } else {
            Effect::SetAppealValidatorsTimeout { hash, value: true }
        };
        let mut effects = vec![flag_effect];
        effects.extend(reopen_effects(hash));
        self.effect_executor().execute(effects).await
    }

    // File an appeal: flag the transaction and zero the appeal timestamp.
    // The appeal scanner picks it up from there.
    pub async fn file_appeal(&self, hash: Hash) -> Result<(), ConsensusError> {
        let transaction = self
            .storage()
            .get_transaction_by_hash(&hash)
            .await?
            .ok_or(ConsensusError::TransactionNotFound(hash))?;
        if !transaction.status.is_appealable() {
            return Err(ConsensusError::NotAppealable(hash, transaction.status));
        }
        let now = get_current_time_in_seconds();
        let window = config::finality_window_time();
        if !transaction.appeal_window_open(window, now) {
            return Err(ConsensusError::AppealWindowClosed(hash));
        }
        self.effect_executor()
            .execute(vec![
                Effect::SetAppeal {
                    hash,
                    appealed: true,
                },
                Effect::SetTimestampAppeal { hash, value: None },
            ])
            .await
    }

    // Insert follow-up transactions scheduled `on = finalized`
    pub(crate) async fn insert_finalization_triggers(
        &self,
        transaction: &Transaction,
    ) -> Result<Vec<Effect>, ConsensusError> {
        let Some(consensus_data) = &transaction.consensus_data else {
            return Ok(Vec::new());
        };
        let Some(leader_receipt) = consensus_data.leader_receipt() else {
            return Ok(Vec::new());
        };
        self.triggered_transaction_effects(
            transaction,
            &leader_receipt.pending_transactions,
            TriggeredOn::Finalized,
        )
        .await
    }
}

// Reset one transaction to Pending for re-execution. History is
// preserved; consensus data and the snapshot are cleared so it runs clean.
fn reopen_effects(hash: Hash) -> Vec<Effect> {
    vec![
        Effect::StatusUpdate {
            hash,
            new_status: TransactionStatus::Pending,
            append_to_history: true,
        },
        Effect::DBWrite {
            hash,
            write: StoreWrite::ClearConsensusData,
        },
        Effect::DBWrite {
            hash,
            write: StoreWrite::ClearContractSnapshot,
        },
        Effect::SetAppeal {
            hash,
            appealed: false,
        },
        Effect::SetAppealFailed { hash, count: 0 },
        Effect::ResetRotationCount { hash },
        Effect::SetTimestampAwaitingFinalization { hash, value: None },
        Effect::SetTimestampAppeal { hash, value: None },
        Effect::ResetAppealProcessingTime { hash },
    ]
}
