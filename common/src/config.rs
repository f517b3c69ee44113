// Network-wide constants shared by the daemon and any client tooling.

use crate::time::TimestampSeconds;

// Chain id exposed to the executor and returned by eth_chainId.
// Can be overridden at runtime through the HARDHAT_CHAIN_ID variable.
pub const DEFAULT_CHAIN_ID: u64 = 61999;

// Seconds a transaction waits in Accepted before it can be finalized.
// This window is also the period during which appeals are admissible.
pub const DEFAULT_FINALITY_WINDOW_TIME: TimestampSeconds = 1800;

// Soft per-validator execution deadline in seconds. The hard deadline
// applied by the consensus engine is 1.5x this value.
pub const DEFAULT_VALIDATOR_EXEC_TIMEOUT_SECONDS: u64 = 600;

// Upper bound for the configurable soft deadline.
pub const MAX_VALIDATOR_EXEC_TIMEOUT_SECONDS: u64 = 600;

// Sidecar HTTP behaviour: attempts, per-attempt timeout and backoff base.
// The backoff doubles on every retry.
pub const DEFAULT_GENVM_RUN_RETRIES: u32 = 3;
pub const DEFAULT_GENVM_RUN_HTTP_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_GENVM_RUN_RETRY_DELAY_SECONDS: u64 = 1;

// Consecutive executor failures before the worker reports unhealthy.
pub const DEFAULT_GENVM_FAILURE_UNHEALTHY_THRESHOLD: u32 = 3;

// Default validator committee parameters for newly submitted transactions.
pub const DEFAULT_NUM_INITIAL_VALIDATORS: usize = 5;
pub const DEFAULT_ROTATION_ROUNDS: u32 = 3;

// Scanner cadence for the worker loops, in milliseconds.
pub const DEFAULT_PENDING_SCAN_INTERVAL_MS: u64 = 500;
pub const DEFAULT_FINALIZATION_SCAN_INTERVAL_MS: u64 = 2000;
