//! HTTP client for loopd's daemon control plane (Section 4.1/4.4).

use loop_core::types::{Run, Unit};
use loop_core::{Config, Event};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start it with: loopd\n  → or set LOOPD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure loopd is running and listening on that address"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(std::string::ToString::to_string).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

/// Request body for `POST /jobs`.
#[derive(Debug, Serialize)]
pub struct StartJobRequest {
    pub workspace_root: String,
    pub specs_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Config>,
}

#[derive(Debug, Deserialize)]
struct StartJobResponse {
    run: Run,
}

#[derive(Debug, Deserialize)]
struct ListJobsResponse {
    runs: Vec<Run>,
}

#[derive(Debug, Deserialize)]
pub struct JobStatus {
    pub run: Run,
    pub units: Vec<Unit>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total window for the readiness probe (Section 4.1).
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for `loopd`'s local control-plane API.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 404 {
            return ClientError::RunNotFound("resource not found".to_string());
        }
        let message = response.json::<ErrorResponse>().await.map(|e| e.error).unwrap_or_else(|_| "unknown error".to_string());
        ClientError::HttpError { status, message }
    }

    /// `GET /health` - true on a successful response.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Poll `/health` with exponential backoff until the daemon answers or
    /// the window runs out.
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady { addr: self.base_url.clone(), timeout_ms });
                    }
                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    /// `POST /jobs`.
    pub async fn start_job(&self, req: StartJobRequest) -> Result<Run, ClientError> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).json(&req).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: StartJobResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.run)
    }

    /// `GET /jobs`.
    pub async fn list_jobs(&self) -> Result<Vec<Run>, ClientError> {
        let url = format!("{}/jobs", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: ListJobsResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.runs)
    }

    /// `GET /jobs/{id}`.
    pub async fn get_job_status(&self, run_id: &str) -> Result<JobStatus, ClientError> {
        let url = format!("{}/jobs/{}", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// `POST /jobs/{id}/stop`.
    pub async fn stop_job(&self, run_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/jobs/{}/stop", self.base_url, run_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// `POST /shutdown`.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let url = format!("{}/shutdown", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// `GET /jobs/{id}/watch` - SSE event stream, printed one line per event
    /// as it arrives. Runs until the server closes the stream (the run
    /// reached a terminal status).
    pub async fn watch_job(&self, run_id: &str) -> Result<(), ClientError> {
        use futures::StreamExt;

        let url = format!("{}/jobs/{}/watch", self.base_url, run_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();
                if let Some((event_type, payload)) = parse_sse_event(&event_str) {
                    println!("{event_type}\t{payload}");
                }
            }
        }

        Ok(())
    }
}

fn parse_sse_event(event_str: &str) -> Option<(String, String)> {
    let mut event_type = None;
    let mut data = None;
    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim().to_string());
        }
    }
    Some((event_type?, data?))
}

/// Parse a JSON event payload line already split out of an SSE frame.
pub fn parse_event_payload(json: &str) -> Option<Event> {
    serde_json::from_str(json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:7700/");
        assert_eq!(client.base_url, "http://localhost:7700");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:7700");
        assert_eq!(client.base_url, "http://localhost:7700");
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://localhost:7700");
        let headers = client.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_addr_returns_base_url() {
        let client = Client::new("http://localhost:7700");
        assert_eq!(client.addr(), "http://localhost:7700");
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999");
        let result = client.check_health().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999");
        let result = client.wait_for_ready_with_timeout(100).await;
        match result {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19999");
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("expected DaemonNotReady error"),
        }
    }

    #[test]
    fn daemon_not_ready_error_message_includes_addr() {
        let err = ClientError::DaemonNotReady { addr: "http://127.0.0.1:7700".to_string(), timeout_ms: 5000 };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:7700"));
        assert!(msg.contains("5000ms"));
    }

    #[test]
    fn parse_sse_event_extracts_type_and_data() {
        let event_str = "event: unit.status_changed\ndata: {\"unit_id\":\"u1\"}";
        let (event_type, data) = parse_sse_event(event_str).unwrap();
        assert_eq!(event_type, "unit.status_changed");
        assert!(data.contains("u1"));
    }

    #[test]
    fn parse_sse_event_returns_none_without_data() {
        assert!(parse_sse_event("event: unit.status_changed").is_none());
    }
}
