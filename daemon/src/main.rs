use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use rand::RngCore;
use tokio::sync::watch;

use synod_common::{
    crypto::{Address, ADDRESS_SIZE},
    validator::{LlmProvider, Validator},
};

use synod_daemon::{
    config::{self, DaemonConfig},
    core::{
        consensus::ConsensusEngine,
        storage::{MemoryStorage, ValidatorProvider},
        worker::WorkerPool,
    },
    event::EventBus,
    genvm::{state::DecodedValueCache, ExecutorHealth, GenVmManager},
    node::GenVmNodeFactory,
    rpc::start_rpc_server,
};

const SEED_MODELS: [&str; 3] = ["gpt-4o", "gpt-4o-mini", "claude-3-5-sonnet"];

// A fresh registry gets a synthetic validator set so the simulator is
// usable out of the box
async fn seed_validators(storage: &MemoryStorage, count: usize) -> anyhow::Result<()> {
    if storage.count_validators().await? >= count {
        return Ok(());
    }
    let mut rng = rand::thread_rng();
    for index in 0..count {
        let mut address = [0u8; ADDRESS_SIZE];
        rng.fill_bytes(&mut address);
        let mut private_key = [0u8; 32];
        rng.fill_bytes(&mut private_key);

        let mut validator = Validator::new(
            Address::new(address),
            100,
            LlmProvider {
                provider: "openai".to_string(),
                model: SEED_MODELS[index % SEED_MODELS.len()].to_string(),
                ..Default::default()
            },
        );
        validator.private_key = Some(hex::encode(private_key));
        storage.register_validator(validator).await?;
    }
    info!("seeded {} validators", count);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let daemon_config = DaemonConfig::parse();

    let storage = Arc::new(MemoryStorage::new());
    seed_validators(&storage, daemon_config.seed_validators).await?;

    let events = EventBus::new();
    let health = Arc::new(ExecutorHealth::new(config::genvm_unhealthy_threshold()));
    let manager = Arc::new(GenVmManager::new(
        daemon_config.genvm_manager_uri.clone(),
        health.clone(),
    ));
    let decoded_cache = Arc::new(DecodedValueCache::new());
    let node_factory = Arc::new(GenVmNodeFactory::new(
        manager,
        storage.clone(),
        events.clone(),
        decoded_cache,
    ));

    let engine = Arc::new(ConsensusEngine::new(
        storage,
        node_factory,
        events,
        health,
    ));

    let recovered = engine.recover_stuck_transactions().await?;
    if recovered > 0 {
        info!("recovered {} stuck transaction(s) at startup", recovered);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::new(
        engine.clone(),
        daemon_config.pending_scan_interval_ms,
        daemon_config.finalization_scan_interval_ms,
        shutdown_rx,
    );
    let workers = pool.spawn();

    let rpc_handle = start_rpc_server(&daemon_config.rpc_bind_address, engine)
        .context("failed to start RPC server")?;

    info!("daemon running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    rpc_handle.stop(true).await;
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
