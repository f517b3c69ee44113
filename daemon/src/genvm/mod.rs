pub mod error_codes;
pub mod host;
pub mod manager;
pub mod state;

pub use manager::{GenVmExecution, GenVmManager, GenVmStatus, RunPayload};

use std::sync::atomic::{AtomicU32, Ordering};

use log::warn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenVmError {
    #[error("Executor manager unreachable after {attempts} attempts: {last_error}")]
    ManagerUnreachable { attempts: u32, last_error: String },

    #[error("Executor manager returned status {status}: {body}")]
    ManagerStatus { status: u16, body: String },

    #[error("Host protocol violation: {0}")]
    Protocol(String),

    #[error("Execution produced no result")]
    NoResult,

    #[error("Host loop stalled past its deadline")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

// Consecutive executor failure streak. A sustained streak marks the worker
// unhealthy so the health endpoint reports not-ready and the operator may
// restart. Any successful execution resets the streak.
pub struct ExecutorHealth {
    failures: AtomicU32,
    threshold: u32,
}

impl ExecutorHealth {
    pub fn new(threshold: u32) -> Self {
        ExecutorHealth {
            failures: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            warn!(
                "executor failure streak at {} (threshold {})",
                failures, self.threshold
            );
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.failure_count() < self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_streak_resets_on_success() {
        let health = ExecutorHealth::new(3);
        assert!(health.is_healthy());
        health.record_failure();
        health.record_failure();
        assert!(health.is_healthy());
        health.record_failure();
        assert!(!health.is_healthy());
        health.record_success();
        assert!(health.is_healthy());
        assert_eq!(health.failure_count(), 0);
    }
}
