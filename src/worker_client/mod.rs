//! Worker Client (§4.3): a per-node persistent handle for job submission,
//! completion polling, artifact retrieval, and the reconnecting event
//! stream. One instance is held per node in the Worker Client Pool.
mod events;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub use events::WorkerEvent;

use crate::{observability::Telemetry, template::JobGraph, util::error::OrchestratorError, util::retry::RetryConfig};

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
    #[allow(dead_code)]
    queue_number: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HistoryResponse {
    Running {
        #[serde(default)]
        #[allow(dead_code)]
        progress: Option<ProgressInfo>,
    },
    Complete {
        outputs: Vec<OutputDescriptor>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Deserialize)]
struct ProgressInfo {
    #[allow(dead_code)]
    current: u32,
    #[allow(dead_code)]
    max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Model,
    Adapter,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub outputs: Vec<OutputDescriptor>,
}

#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
    node_id: String,
    submit_timeout: Duration,
    history_timeout: Duration,
    artifact_timeout: Duration,
    poll_interval: Duration,
}

impl WorkerClient {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        base_url: impl Into<String>,
        submit_timeout: Duration,
        history_timeout: Duration,
        artifact_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            node_id: node_id.into(),
            submit_timeout,
            history_timeout,
            artifact_timeout,
            poll_interval,
        }
    }

    pub async fn submit(&self, graph: &JobGraph) -> Result<String, OrchestratorError> {
        let url = format!("{}/prompt", self.base_url);
        let response = tokio::time::timeout(
            self.submit_timeout,
            self.http.post(&url).json(&graph.to_submission_payload()).send(),
        )
        .await
        .map_err(|_| OrchestratorError::Timeout)?
        .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::RejectedByWorker(body));
        }
        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        Ok(parsed.job_id)
    }

    /// Polls the history endpoint at `poll_interval` until the worker reports
    /// completion or `deadline` elapses from the start of this call.
    pub async fn poll_until_complete(
        &self,
        worker_job_id: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, OrchestratorError> {
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() >= deadline {
                return Err(OrchestratorError::Timeout);
            }
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            let url = format!("{}/history/{worker_job_id}", self.base_url);
            let attempt = tokio::time::timeout(self.history_timeout, self.http.get(&url).send()).await;
            if let Ok(Ok(response)) = attempt {
                if response.status().is_success() {
                    if let Ok(parsed) = response.json::<HistoryResponse>().await {
                        match parsed {
                            HistoryResponse::Complete { outputs } => {
                                return Ok(JobOutcome { outputs });
                            }
                            HistoryResponse::Failed { error } => {
                                return Err(OrchestratorError::RejectedByWorker(error));
                            }
                            HistoryResponse::Running { .. } => {}
                        }
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {}
                () = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            }
        }
    }

    pub async fn fetch_artifact(&self, reference: &str) -> Result<Vec<u8>, OrchestratorError> {
        let url = format!("{}/view/{reference}", self.base_url);
        let response = tokio::time::timeout(self.artifact_timeout, self.http.get(&url).send())
            .await
            .map_err(|_| OrchestratorError::Timeout)?
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(OrchestratorError::NotFound(reference.to_string()));
        }
        if !response.status().is_success() {
            return Err(OrchestratorError::TransportError(format!(
                "status {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))
    }

    pub async fn list_assets(&self, kind: AssetKind) -> Result<Vec<AssetDescriptor>, OrchestratorError> {
        let segment = match kind {
            AssetKind::Model => "models",
            AssetKind::Adapter => "adapters",
        };
        let url = format!("{}/assets/{segment}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| OrchestratorError::TransportError(e.to_string()))
    }

    /// Spawns the single long-lived, auto-reconnecting event-stream
    /// subscription for this node. Reconnection uses exponential backoff
    /// starting at `backoff_base_ms`, capped at `backoff_cap_ms`, reset on
    /// successful open; a keepalive ping is sent every `keepalive`.
    #[must_use]
    pub fn subscribe_events(
        &self,
        backoff_base_ms: u64,
        backoff_cap_ms: u64,
        keepalive: Duration,
        cancel: CancellationToken,
        telemetry: Option<Telemetry>,
    ) -> mpsc::Receiver<WorkerEvent> {
        let (tx, rx) = mpsc::channel(256);
        let ws_url = self.ws_url();
        let node_id = self.node_id.clone();

        tokio::spawn(async move {
            let backoff = RetryConfig::new(usize::MAX, backoff_base_ms, backoff_cap_ms);
            let mut attempt = 0usize;

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if attempt > 0 {
                    let delay = backoff.delay_for_attempt(attempt.min(62));
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return,
                    }
                }

                match tokio_tungstenite::connect_async(&ws_url).await {
                    Ok((stream, _)) => {
                        tracing::info!(node_id = %node_id, "worker event stream connected");
                        if attempt > 0 {
                            if let Some(telemetry) = &telemetry {
                                telemetry.record_worker_reconnect(&node_id);
                            }
                        }
                        attempt = 0;
                        let reconnect = run_connection(stream, &tx, keepalive, &cancel).await;
                        if cancel.is_cancelled() {
                            return;
                        }
                        if !reconnect {
                            attempt = 1;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(node_id = %node_id, %error, "worker event stream connect failed");
                        attempt += 1;
                    }
                }
            }
        });

        rx
    }

    fn ws_url(&self) -> String {
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{ws_base}/ws")
    }
}

/// Drives one open connection until it errors, closes, or is cancelled.
/// Returns `true` if the caller should attempt to reconnect.
async fn run_connection(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tx: &mpsc::Sender<WorkerEvent>,
    keepalive: Duration,
    cancel: &CancellationToken,
) -> bool {
    use futures_util::{SinkExt, StreamExt};

    let (mut write, mut read) = stream.split();
    let mut ping_ticker = tokio::time::interval(keepalive);
    ping_ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            () = cancel.cancelled() => return false,
            _ = ping_ticker.tick() => {
                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return true;
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = WorkerEvent::parse(&text) {
                            if tx.send(event).await.is_err() {
                                return false; // no one is listening anymore
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(%error, "worker event stream read error");
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> WorkerClient {
        WorkerClient::new(
            "n1",
            base_url,
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn submit_returns_worker_job_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "job_id": "w-123",
                    "queue_number": 2
                })),
            )
            .mount(&server)
            .await;

        let c = client(server.uri());
        let graph = JobGraph::empty();
        let job_id = c.submit(&graph).await.expect("submit should succeed");
        assert_eq!(job_id, "w-123");
    }

    #[tokio::test]
    async fn submit_rejected_returns_rejected_by_worker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad graph"))
            .mount(&server)
            .await;

        let c = client(server.uri());
        let graph = JobGraph::empty();
        let error = c.submit(&graph).await.unwrap_err();
        assert!(matches!(error, OrchestratorError::RejectedByWorker(_)));
    }

    #[tokio::test]
    async fn poll_until_complete_returns_outputs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/w-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "complete",
                "outputs": [{"filename": "out.png"}]
            })))
            .mount(&server)
            .await;

        let c = client(server.uri());
        let cancel = CancellationToken::new();
        let outcome = c
            .poll_until_complete("w-1", Duration::from_secs(2), &cancel)
            .await
            .expect("should complete");
        assert_eq!(outcome.outputs[0].filename, "out.png");
    }

    #[tokio::test]
    async fn poll_until_complete_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/w-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "running",
                "progress": {"current": 1, "max": 10}
            })))
            .mount(&server)
            .await;

        let c = client(server.uri());
        let cancel = CancellationToken::new();
        let error = c
            .poll_until_complete("w-1", Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::Timeout));
    }

    #[tokio::test]
    async fn poll_until_complete_observes_cancellation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history/w-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "running",
                "progress": {"current": 1, "max": 10}
            })))
            .mount(&server)
            .await;

        let c = client(server.uri());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = c
            .poll_until_complete("w-1", Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::Cancelled));
    }

    #[tokio::test]
    async fn fetch_artifact_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let c = client(server.uri());
        let error = c.fetch_artifact("missing.png").await.unwrap_err();
        assert!(matches!(error, OrchestratorError::NotFound(_)));
    }
}
