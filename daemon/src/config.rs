use std::{
    env,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use clap::Parser;
use lazy_static::lazy_static;

use synod_common::config::{
    DEFAULT_CHAIN_ID, DEFAULT_FINALITY_WINDOW_TIME, DEFAULT_FINALIZATION_SCAN_INTERVAL_MS,
    DEFAULT_GENVM_FAILURE_UNHEALTHY_THRESHOLD, DEFAULT_GENVM_RUN_HTTP_TIMEOUT_SECONDS,
    DEFAULT_GENVM_RUN_RETRIES, DEFAULT_GENVM_RUN_RETRY_DELAY_SECONDS,
    DEFAULT_NUM_INITIAL_VALIDATORS, DEFAULT_PENDING_SCAN_INTERVAL_MS,
    DEFAULT_VALIDATOR_EXEC_TIMEOUT_SECONDS, MAX_VALIDATOR_EXEC_TIMEOUT_SECONDS,
};

// RPC endpoints include administrative functions (sim_updateTransactionStatus,
// snapshot management) and should not be exposed to the network by default.
pub const DEFAULT_RPC_BIND_ADDRESS: &str = "127.0.0.1:8545";

pub const DEFAULT_GENVM_MANAGER_URI: &str = "http://127.0.0.1:3999";

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

lazy_static! {
    // Runtime-adjustable: sim_setFinalityWindowTime writes through this
    static ref FINALITY_WINDOW: AtomicU64 = AtomicU64::new(env_u64(
        "FINALITY_WINDOW_TIME",
        DEFAULT_FINALITY_WINDOW_TIME
    ));
    static ref VALIDATOR_EXEC_TIMEOUT_SECONDS: u64 = env_u64(
        "VALIDATOR_EXEC_TIMEOUT_SECONDS",
        DEFAULT_VALIDATOR_EXEC_TIMEOUT_SECONDS
    )
    .min(MAX_VALIDATOR_EXEC_TIMEOUT_SECONDS);
    static ref GENVM_RUN_RETRIES: u64 = env_u64(
        "GENVM_MANAGER_RUN_RETRIES",
        DEFAULT_GENVM_RUN_RETRIES as u64
    );
    static ref GENVM_RUN_HTTP_TIMEOUT_SECONDS: u64 = env_u64(
        "GENVM_MANAGER_RUN_HTTP_TIMEOUT_SECONDS",
        DEFAULT_GENVM_RUN_HTTP_TIMEOUT_SECONDS
    );
    static ref GENVM_RUN_RETRY_DELAY_SECONDS: u64 = env_u64(
        "GENVM_MANAGER_RUN_RETRY_DELAY_SECONDS",
        DEFAULT_GENVM_RUN_RETRY_DELAY_SECONDS
    );
    static ref GENVM_FAILURE_UNHEALTHY_THRESHOLD: u64 = env_u64(
        "GENVM_FAILURE_UNHEALTHY_THRESHOLD",
        DEFAULT_GENVM_FAILURE_UNHEALTHY_THRESHOLD as u64
    );
    static ref CHAIN_ID: u64 = env_u64("HARDHAT_CHAIN_ID", DEFAULT_CHAIN_ID);
}

// Seconds a transaction waits Accepted before finalization; also the
// appeal window.
pub fn finality_window_time() -> u64 {
    FINALITY_WINDOW.load(Ordering::Relaxed)
}

pub fn set_finality_window_time(seconds: u64) {
    FINALITY_WINDOW.store(seconds, Ordering::Relaxed);
}

// Soft per-validator execution deadline
pub fn validator_exec_timeout() -> Duration {
    Duration::from_secs(*VALIDATOR_EXEC_TIMEOUT_SECONDS)
}

// Hard deadline applied while collecting validator receipts: 1.5x the
// soft cap. The pipeline must never block on a hung executor.
pub fn validator_hard_deadline() -> Duration {
    Duration::from_secs(*VALIDATOR_EXEC_TIMEOUT_SECONDS * 3 / 2)
}

pub fn genvm_run_retries() -> u32 {
    *GENVM_RUN_RETRIES as u32
}

pub fn genvm_run_http_timeout() -> Duration {
    Duration::from_secs(*GENVM_RUN_HTTP_TIMEOUT_SECONDS)
}

pub fn genvm_run_retry_delay() -> Duration {
    Duration::from_secs(*GENVM_RUN_RETRY_DELAY_SECONDS)
}

pub fn genvm_unhealthy_threshold() -> u32 {
    *GENVM_FAILURE_UNHEALTHY_THRESHOLD as u32
}

pub fn chain_id() -> u64 {
    *CHAIN_ID
}

#[derive(Parser, Clone, Debug)]
#[command(name = "synod_daemon", about = "Synod simulator consensus daemon")]
pub struct DaemonConfig {
    /// JSON-RPC bind address
    #[arg(long, default_value = DEFAULT_RPC_BIND_ADDRESS)]
    pub rpc_bind_address: String,

    /// GenVM manager base URI
    #[arg(long, default_value = DEFAULT_GENVM_MANAGER_URI)]
    pub genvm_manager_uri: String,

    /// Validators seeded into an empty registry at startup
    #[arg(long, default_value_t = DEFAULT_NUM_INITIAL_VALIDATORS)]
    pub seed_validators: usize,

    /// Pending/appeal scanner interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_PENDING_SCAN_INTERVAL_MS)]
    pub pending_scan_interval_ms: u64,

    /// Finalization scanner interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_FINALIZATION_SCAN_INTERVAL_MS)]
    pub finalization_scan_interval_ms: u64,
}
