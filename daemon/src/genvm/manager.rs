// HTTP client for the executor sidecar plus the orchestration of one run:
// POST the job, accept the callback socket, answer the host loop, enforce
// the deadline, and fetch stdout/stderr at the end.

use std::{sync::Arc, time::Duration};

use log::{debug, error, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, time::timeout};

use synod_common::{consensus::ResultCode, encoding::b64_encode};

use crate::{
    config,
    genvm::{
        host::{host_loop, HostHandler},
        ExecutorHealth, GenVmError,
    },
};

// How long the executor gets to answer CONSUME_RESULT after we signalled
// the deadline through DELETE
const TIMEOUT_GRACE: Duration = Duration::from_secs(10);

// How long the sidecar gets to connect back after the run was accepted
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RunPayload {
    pub message: Value,
    pub is_sync: bool,
    pub capture_output: bool,
    pub host_data: String,
    pub timestamp: String,
    pub extra_args: Vec<String>,
    pub storage_pages: u64,
    pub code: Option<Vec<u8>>,
    pub calldata: Vec<u8>,
    // soft execution limit, used to derive max_execution_minutes
    pub deadline: Option<Duration>,
}

impl RunPayload {
    fn max_execution_minutes(&self) -> u64 {
        let baseline = 20u64;
        match self.deadline {
            // this parameter is needed to prevent zombie executors
            Some(deadline) => baseline.max((deadline.as_secs() * 3 / 2 + 59) / 60),
            None => baseline,
        }
    }

    fn to_body(&self, host: &str) -> Value {
        json!({
            "major": 0,
            "message": self.message,
            "is_sync": self.is_sync,
            "capture_output": self.capture_output,
            "host_data": self.host_data,
            "max_execution_minutes": self.max_execution_minutes(),
            "timestamp": self.timestamp,
            "host": host,
            "extra_args": self.extra_args,
            "storage_pages": self.storage_pages,
            "code": self.code.as_deref().map(b64_encode),
            "calldata": b64_encode(&self.calldata),
        })
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct GenVmStatus {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub genvm_log: Vec<Value>,
}

#[derive(Deserialize, Debug)]
struct StatusEnvelope {
    status: Option<GenVmStatus>,
}

#[derive(Deserialize, Debug)]
struct RunAccepted {
    id: String,
}

#[derive(Clone, Debug)]
pub struct GenVmExecution {
    pub result_code: ResultCode,
    pub result_data: Vec<u8>,
    pub stdout: String,
    pub stderr: String,
    pub genvm_log: Vec<Value>,
}

pub struct GenVmManager {
    base_uri: String,
    client: reqwest::Client,
    health: Arc<ExecutorHealth>,
}

impl GenVmManager {
    pub fn new(base_uri: impl Into<String>, health: Arc<ExecutorHealth>) -> Self {
        GenVmManager {
            base_uri: base_uri.into(),
            client: reqwest::Client::new(),
            health,
        }
    }

    pub fn health(&self) -> &Arc<ExecutorHealth> {
        &self.health
    }

    // POST /genvm/run with retries and exponential backoff. Exhaustion
    // counts against the executor health streak.
    async fn post_run(&self, body: &Value) -> Result<String, GenVmError> {
        let attempts = config::genvm_run_retries().max(1);
        let http_timeout = config::genvm_run_http_timeout();
        let mut delay = config::genvm_run_retry_delay();
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let request = self
                .client
                .post(format!("{}/genvm/run", self.base_uri))
                .timeout(http_timeout)
                .json(body)
                .send()
                .await;

            match request {
                Ok(response) if response.status().is_success() => {
                    let accepted: RunAccepted = response.json().await?;
                    debug!(
                        "executor run accepted, id {} (attempt {})",
                        accepted.id,
                        attempt + 1
                    );
                    self.health.record_success();
                    return Ok(accepted.id);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    error!("executor /genvm/run failed: {} {}", status, text);
                    self.health.record_failure();
                    return Err(GenVmError::ManagerStatus { status, body: text });
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt + 1 < attempts {
                        warn!(
                            "executor request failed, retrying in {:?}: {}",
                            delay, last_error
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        self.health.record_failure();
        Err(GenVmError::ManagerUnreachable {
            attempts,
            last_error,
        })
    }

    async fn poll_status(&self, genvm_id: &str) -> Result<GenVmStatus, GenVmError> {
        let response = self
            .client
            .get(format!("{}/genvm/{}", self.base_uri, genvm_id))
            .timeout(config::genvm_run_http_timeout())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GenVmError::ManagerStatus { status, body });
        }
        let envelope: StatusEnvelope = response.json().await?;
        Ok(envelope.status.unwrap_or_default())
    }

    // DELETE /genvm/{id}?wait_timeout_ms= signals the deadline; failures
    // here are logged only, the host loop still decides the outcome
    async fn send_timeout(&self, genvm_id: &str) {
        let result = self
            .client
            .delete(format!(
                "{}/genvm/{}?wait_timeout_ms=20",
                self.base_uri, genvm_id
            ))
            .timeout(Duration::from_secs(3))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    "executor timeout signal for {} answered {}",
                    genvm_id,
                    response.status()
                );
            }
            Ok(_) => debug!("executor timeout signalled for {}", genvm_id),
            Err(err) => warn!("executor timeout signal for {} failed: {}", genvm_id, err),
        }
    }

    // Run one executor job to completion. The handler collects storage
    // writes, eq outputs and scheduled messages as the host loop runs.
    pub async fn run<H>(
        &self,
        payload: RunPayload,
        handler: H,
    ) -> Result<(GenVmExecution, H), GenVmError>
    where
        H: HostHandler + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let host_addr = listener.local_addr()?.to_string();
        let body = payload.to_body(&host_addr);
        let deadline = payload.deadline;

        let genvm_id = self.post_run(&body).await?;

        let accepted = timeout(ACCEPT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| GenVmError::Protocol("sidecar never connected back".to_string()))?;
        let (mut stream, peer) = accepted?;
        debug!("executor {} connected from {}", genvm_id, peer);

        // Own the socket and handler in a task so a deadline on our side
        // does not tear the frame protocol mid-message.
        let mut join = tokio::spawn(async move {
            let mut handler = handler;
            let result = host_loop(&mut stream, &mut handler).await;
            (result, handler)
        });

        let joined = match deadline {
            None => (&mut join).await,
            Some(limit) => match timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    // the executor answers the signal with a VmError
                    // timeout result through the regular channel
                    self.send_timeout(&genvm_id).await;
                    match timeout(TIMEOUT_GRACE, &mut join).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            join.abort();
                            self.health.record_failure();
                            return Err(GenVmError::Timeout);
                        }
                    }
                }
            },
        };

        let (host_result, handler) = joined
            .map_err(|err| GenVmError::Protocol(format!("host loop task failed: {err}")))?;
        let (result_code, result_data) = host_result?;

        // release the executor slot and collect output
        self.send_timeout(&genvm_id).await;
        let status = match self.poll_status(&genvm_id).await {
            Ok(status) => status,
            Err(err) => {
                warn!("status poll for {} failed: {}", genvm_id, err);
                GenVmStatus::default()
            }
        };

        Ok((
            GenVmExecution {
                result_code,
                result_data,
                stdout: status.stdout,
                stderr: status.stderr,
                genvm_log: status.genvm_log,
            },
            handler,
        ))
    }
}
