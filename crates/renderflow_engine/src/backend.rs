//! Rendering-backend clients.
//!
//! The backend is a submit-then-poll black box: `submit` returns a
//! correlation id, `wait_for_outputs` polls until the workflow reaches a
//! final status or the deadline passes. Backend selection is a tagged
//! variant keyed on the job's backend selector.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use renderflow_protocol::error::{EngineError, EngineResult};
use renderflow_protocol::{BackendKind, Settings};

/// Final status reported by the backend for one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendJobStatus {
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl BackendJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendJobStatus::Completed => "completed",
            BackendJobStatus::Failed => "failed",
            BackendJobStatus::Cancelled => "cancelled",
            BackendJobStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BackendJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendJobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "completed" | "success" => BackendJobStatus::Completed,
            "failed" | "error" => BackendJobStatus::Failed,
            "cancelled" | "canceled" => BackendJobStatus::Cancelled,
            _ => BackendJobStatus::Unknown,
        })
    }
}

/// Result of waiting on a submitted workflow.
#[derive(Debug, Clone)]
pub struct WorkflowStatus {
    pub status: BackendJobStatus,
    pub history_url: Option<String>,
    /// Opaque output descriptor; `collect_output_paths` knows its layout.
    pub outputs: Value,
    pub messages: Vec<String>,
    pub raw_history: Option<Value>,
}

/// Backend client, one concrete implementation per backend selector.
pub enum BackendClient {
    Http(HttpBackendClient),
    Mock(MockBackendClient),
}

impl BackendClient {
    /// Factory keyed on the job's backend selector.
    pub fn for_backend(kind: BackendKind, settings: &Settings) -> Self {
        match kind {
            BackendKind::Primary => BackendClient::Http(HttpBackendClient::new(
                &settings.backend_url,
                &settings.output_dir,
                Duration::from_secs(settings.backend_timeout_secs),
                Duration::from_secs_f64(settings.backend_poll_interval_secs),
            )),
            BackendKind::Mock => {
                BackendClient::Mock(MockBackendClient::new(&settings.mock_output_dir))
            }
        }
    }

    /// Submit a workflow; returns the backend correlation id.
    pub async fn submit(&self, workflow: &Value, client_id: &str) -> EngineResult<String> {
        match self {
            BackendClient::Http(client) => client.submit(workflow, client_id).await,
            BackendClient::Mock(client) => client.submit(workflow, client_id),
        }
    }

    /// Poll until the workflow reaches a final status or `max_wait` passes.
    pub async fn wait_for_outputs(
        &self,
        correlation_id: &str,
        max_wait: Duration,
    ) -> EngineResult<WorkflowStatus> {
        match self {
            BackendClient::Http(client) => client.wait_for_outputs(correlation_id, max_wait).await,
            BackendClient::Mock(client) => client.wait_for_outputs(correlation_id),
        }
    }

    /// Resolve the output descriptor into absolute file paths.
    pub fn collect_output_paths(&self, outputs: &Value) -> Vec<String> {
        match self {
            BackendClient::Http(client) => client.collect_output_paths(outputs),
            BackendClient::Mock(client) => client.collect_output_paths(outputs),
        }
    }
}

// ============================================================================
// HTTP client (primary backend)
// ============================================================================

pub struct HttpBackendClient {
    http: reqwest::Client,
    base_url: String,
    output_dir: PathBuf,
    poll_interval: Duration,
}

impl HttpBackendClient {
    pub fn new(
        base_url: &str,
        output_dir: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            output_dir: PathBuf::from(output_dir),
            poll_interval,
        }
    }

    async fn submit(&self, workflow: &Value, client_id: &str) -> EngineResult<String> {
        let url = format!("{}/prompt", self.base_url);
        let body = json!({ "prompt": workflow, "client_id": client_id });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::BackendConnection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::BackendWorkflow(format!(
                "submit rejected with HTTP {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::BackendConnection(e.to_string()))?;
        let correlation_id = payload
            .get("prompt_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::BackendWorkflow("submit response missing prompt_id".to_string())
            })?;

        info!("Submitted workflow to {} (prompt_id={})", url, correlation_id);
        Ok(correlation_id.to_string())
    }

    async fn wait_for_outputs(
        &self,
        correlation_id: &str,
        max_wait: Duration,
    ) -> EngineResult<WorkflowStatus> {
        let history_url = format!("{}/history/{}", self.base_url, correlation_id);
        let deadline = Instant::now() + max_wait;

        loop {
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(max_wait.as_secs()));
            }

            let response = self
                .http
                .get(&history_url)
                .send()
                .await
                .map_err(|e| EngineError::BackendConnection(e.to_string()))?;
            let payload: Value = response
                .json()
                .await
                .map_err(|e| EngineError::BackendConnection(e.to_string()))?;

            // History is keyed by prompt id; absent until the workflow ends.
            if let Some(entry) = payload.get(correlation_id) {
                let status = entry
                    .pointer("/status/status_str")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .parse()
                    .unwrap_or(BackendJobStatus::Unknown);
                let messages = entry
                    .pointer("/status/messages")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|m| m.to_string())
                            .collect::<Vec<String>>()
                    })
                    .unwrap_or_default();
                let completed = entry
                    .pointer("/status/completed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let status = if completed {
                    BackendJobStatus::Completed
                } else {
                    status
                };
                return Ok(WorkflowStatus {
                    status,
                    history_url: Some(history_url.clone()),
                    outputs: entry.get("outputs").cloned().unwrap_or(Value::Null),
                    messages,
                    raw_history: Some(entry.clone()),
                });
            }

            debug!("Workflow {} still pending, polling again", correlation_id);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn collect_output_paths(&self, outputs: &Value) -> Vec<String> {
        let mut paths = Vec::new();
        let Some(nodes) = outputs.as_object() else {
            return paths;
        };
        for node_output in nodes.values() {
            let Some(images) = node_output.get("images").and_then(Value::as_array) else {
                continue;
            };
            for image in images {
                let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                let subfolder = image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let mut path = self.output_dir.clone();
                if !subfolder.is_empty() {
                    path.push(subfolder);
                }
                path.push(filename);
                paths.push(path.to_string_lossy().into_owned());
            }
        }
        paths
    }
}

// ============================================================================
// Mock client (tests, local development)
// ============================================================================

/// Scripted outcome for the mock backend.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Workflow completes with these output paths.
    Complete { paths: Vec<String> },
    /// Workflow ends with the given final status and messages.
    Finish {
        status: BackendJobStatus,
        messages: Vec<String>,
    },
    /// Submission fails at the network layer.
    ConnectionError,
}

pub struct MockBackendClient {
    output_dir: PathBuf,
    outcomes: Mutex<VecDeque<MockOutcome>>,
}

impl MockBackendClient {
    pub fn new(output_dir: &str) -> Self {
        Self {
            output_dir: PathBuf::from(output_dir),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue scripted outcomes, consumed one per submitted workflow.
    pub fn script(&self, outcome: MockOutcome) {
        self.outcomes
            .lock()
            .expect("mock backend poisoned")
            .push_back(outcome);
    }

    pub fn with_outcomes(output_dir: &str, outcomes: Vec<MockOutcome>) -> Self {
        let client = Self::new(output_dir);
        for outcome in outcomes {
            client.script(outcome);
        }
        client
    }

    fn next_outcome(&self) -> Option<MockOutcome> {
        self.outcomes
            .lock()
            .expect("mock backend poisoned")
            .pop_front()
    }

    fn submit(&self, _workflow: &Value, client_id: &str) -> EngineResult<String> {
        // A scripted connection error surfaces at submit time.
        {
            let mut outcomes = self.outcomes.lock().expect("mock backend poisoned");
            if matches!(outcomes.front(), Some(MockOutcome::ConnectionError)) {
                outcomes.pop_front();
                return Err(EngineError::BackendConnection(
                    "mock backend connection refused".to_string(),
                ));
            }
        }
        Ok(format!("mock-{client_id}"))
    }

    fn wait_for_outputs(&self, correlation_id: &str) -> EngineResult<WorkflowStatus> {
        let outcome = self.next_outcome().unwrap_or(MockOutcome::Complete {
            paths: vec![self
                .output_dir
                .join(format!("{correlation_id}_0001.png"))
                .to_string_lossy()
                .into_owned()],
        });

        match outcome {
            MockOutcome::Complete { paths } => Ok(WorkflowStatus {
                status: BackendJobStatus::Completed,
                history_url: None,
                outputs: json!({ "paths": paths }),
                messages: Vec::new(),
                raw_history: None,
            }),
            MockOutcome::Finish { status, messages } => Ok(WorkflowStatus {
                status,
                history_url: None,
                outputs: Value::Null,
                messages,
                raw_history: None,
            }),
            MockOutcome::ConnectionError => Err(EngineError::BackendConnection(
                "mock backend connection refused".to_string(),
            )),
        }
    }

    fn collect_output_paths(&self, outputs: &Value) -> Vec<String> {
        outputs
            .get("paths")
            .and_then(Value::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
