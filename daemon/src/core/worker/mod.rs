// Background loops: the pending scanner, the appeal scanner and the
// finalization scanner, each its own task.
//
// A worker owns a transaction by winning the atomic Pending -> Activated
// claim; ownership is implicit in the status from then on. Per-contract
// ordering holds because only the oldest pending transaction of a contract
// is ever claimed, and only while nothing on that contract is in process.

use std::{sync::Arc, time::Duration};

use dashmap::DashSet;
use log::{debug, error, info};
use tokio::{sync::watch, task::JoinHandle, time::interval};

use synod_common::{crypto::Hash, time::get_current_time_in_seconds};

use crate::{
    config,
    core::{consensus::ConsensusEngine, storage::Storage},
};

pub struct WorkerPool<S: Storage> {
    engine: Arc<ConsensusEngine<S>>,
    pending_scan_interval: Duration,
    finalization_scan_interval: Duration,
    appeals_in_flight: Arc<DashSet<Hash>>,
    shutdown: watch::Receiver<bool>,
}

impl<S: Storage> WorkerPool<S> {
    pub fn new(
        engine: Arc<ConsensusEngine<S>>,
        pending_scan_interval_ms: u64,
        finalization_scan_interval_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        WorkerPool {
            engine,
            pending_scan_interval: Duration::from_millis(pending_scan_interval_ms.max(10)),
            finalization_scan_interval: Duration::from_millis(
                finalization_scan_interval_ms.max(10),
            ),
            appeals_in_flight: Arc::new(DashSet::new()),
            shutdown,
        }
    }

    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_pending_scanner(),
            self.spawn_appeal_scanner(),
            self.spawn_finalization_scanner(),
        ]
    }

    fn spawn_pending_scanner(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let mut shutdown = self.shutdown.clone();
        let period = self.pending_scan_interval;
        tokio::spawn(async move {
            info!("pending scanner started ({:?} period)", period);
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scan_pending(&engine).await {
                            error!("pending scan failed: {}", err);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("pending scanner stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_appeal_scanner(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let in_flight = self.appeals_in_flight.clone();
        let mut shutdown = self.shutdown.clone();
        let period = self.pending_scan_interval;
        tokio::spawn(async move {
            info!("appeal scanner started ({:?} period)", period);
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scan_appeals(&engine, &in_flight).await {
                            error!("appeal scan failed: {}", err);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("appeal scanner stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_finalization_scanner(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let mut shutdown = self.shutdown.clone();
        let period = self.finalization_scan_interval;
        tokio::spawn(async move {
            info!("finalization scanner started ({:?} period)", period);
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.finalize_due_transactions().await {
                            Ok(0) => {}
                            Ok(count) => debug!("finalized {} transaction(s)", count),
                            Err(err) => error!("finalization scan failed: {}", err),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("finalization scanner stopping");
                        return;
                    }
                }
            }
        })
    }
}

// One pending sweep: per contract, try to claim the oldest pending
// transaction as long as nothing on that contract is currently in process
async fn scan_pending<S: Storage>(
    engine: &Arc<ConsensusEngine<S>>,
) -> Result<(), crate::core::error::ConsensusError> {
    let groups = engine.storage().get_pending_transactions_grouped().await?;
    for (address, transactions) in groups {
        let in_process = engine
            .storage()
            .get_transactions_in_process_by_contract(&address)
            .await?;
        if !in_process.is_empty() {
            continue;
        }
        let Some(oldest) = transactions.first() else {
            continue;
        };

        // the claim is the race: losing it just means another worker won
        if !engine.storage().atomic_claim(&oldest.hash).await? {
            debug!("claim miss on {}", oldest.hash);
            continue;
        }

        let engine = engine.clone();
        let hash = oldest.hash;
        tokio::spawn(async move {
            if let Err(err) = engine.process_transaction(hash).await {
                error!("processing {} failed: {}", hash, err);
            }
        });
    }
    Ok(())
}

async fn scan_appeals<S: Storage>(
    engine: &Arc<ConsensusEngine<S>>,
    in_flight: &Arc<DashSet<Hash>>,
) -> Result<(), crate::core::error::ConsensusError> {
    let window = config::finality_window_time();
    let now = get_current_time_in_seconds();
    let appealed = engine.storage().get_appealed_transactions().await?;
    for transaction in appealed {
        if !transaction.appeal_window_open(window, now) {
            continue;
        }
        if !in_flight.insert(transaction.hash) {
            continue;
        }
        let engine = engine.clone();
        let in_flight = in_flight.clone();
        let hash = transaction.hash;
        tokio::spawn(async move {
            if let Err(err) = engine.process_appeal(hash).await {
                error!("appeal processing for {} failed: {}", hash, err);
            }
            in_flight.remove(&hash);
        });
    }
    Ok(())
}
