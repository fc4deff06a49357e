//! Escalation fan-out (spec Section 4.6).
//!
//! A single [`escalate`] call notifies every registered [`Sink`] concurrently.
//! Every sink is attempted regardless of earlier failures; the first error
//! encountered is returned to the caller for logging, but successes are not
//! otherwise coalesced or retried here — escalation is a best-effort side
//! channel, not part of the run's correctness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use loop_core::Id;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

/// Severity of an escalation. `Blocking` means the run cannot make further
/// progress without operator intervention (e.g. exhausted conflict retries);
/// `Warning` is informational (e.g. a review timeout that has not yet failed
/// the unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Blocking,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Blocking => "blocking",
        }
    }
}

/// One escalation raised against a unit (or the run as a whole).
#[derive(Debug, Clone)]
pub struct Escalation {
    pub run_id: Id,
    pub unit_id: Option<Id>,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub context: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("http error: {0}")]
    Http(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(String),
}

/// A destination that can receive escalations. Sinks must respect the
/// cancellation deadline passed to [`escalate`] for any network call.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn notify(&self, escalation: &Escalation) -> Result<(), SinkError>;

    /// Human-readable name used in logs.
    fn name(&self) -> &str;
}

/// Notify every sink concurrently. Returns the first error encountered, if
/// any; all sinks are attempted even after an earlier one fails.
pub async fn escalate(sinks: &[Arc<dyn Sink>], escalation: &Escalation) -> Result<(), SinkError> {
    info!(
        run_id = %escalation.run_id,
        severity = escalation.severity.as_str(),
        title = %escalation.title,
        sinks = sinks.len(),
        "raising escalation"
    );

    let results = join_all(sinks.iter().map(|sink| async move {
        let result = sink.notify(escalation).await;
        if let Err(ref err) = result {
            warn!(sink = sink.name(), error = %err, "escalation sink failed");
        }
        result
    }))
    .await;

    results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

/// Logs escalations at `error`/`warn` level. Always present; used when no
/// external sinks are configured, and alongside any that are.
#[derive(Debug, Default)]
pub struct TerminalSink;

#[async_trait]
impl Sink for TerminalSink {
    async fn notify(&self, escalation: &Escalation) -> Result<(), SinkError> {
        match escalation.severity {
            Severity::Blocking => {
                error!(
                    run_id = %escalation.run_id,
                    unit_id = ?escalation.unit_id,
                    title = %escalation.title,
                    message = %escalation.message,
                    "ESCALATION (blocking)"
                );
            }
            Severity::Warning => {
                warn!(
                    run_id = %escalation.run_id,
                    unit_id = ?escalation.unit_id,
                    title = %escalation.title,
                    message = %escalation.message,
                    "ESCALATION (warning)"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "terminal"
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    run_id: &'a str,
    unit_id: Option<&'a str>,
    severity: &'a str,
    title: &'a str,
    message: &'a str,
    context: &'a HashMap<String, String>,
}

/// Posts a generic JSON webhook. Used for the plain `escalation_webhook_url`
/// config option.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    async fn notify(&self, escalation: &Escalation) -> Result<(), SinkError> {
        let body = WebhookBody {
            run_id: escalation.run_id.as_ref(),
            unit_id: escalation.unit_id.as_ref().map(|id| id.as_ref()),
            severity: escalation.severity.as_str(),
            title: &escalation.title,
            message: &escalation.message,
            context: &escalation.context,
        };

        let send = self.client.post(&self.url).json(&body).send();
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(response)) => {
                if let Err(err) = response.error_for_status() {
                    return Err(SinkError::Http(err.to_string()));
                }
                Ok(())
            }
            Ok(Err(err)) => Err(SinkError::Http(err.to_string())),
            Err(_) => Err(SinkError::Timeout(self.timeout)),
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Posts a plain-text `{"text": "..."}` payload, compatible with Slack- and
/// Teams-style incoming webhooks. Used for `escalation_chat_webhook_url`.
pub struct ChatWebhookSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ChatWebhookSink {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }

    fn format_text(escalation: &Escalation) -> String {
        let unit = escalation
            .unit_id
            .as_ref()
            .map(|id| format!(" [{id}]"))
            .unwrap_or_default();
        format!(
            "[{}] {}{}: {}",
            escalation.severity.as_str(),
            escalation.title,
            unit,
            escalation.message
        )
    }
}

#[async_trait]
impl Sink for ChatWebhookSink {
    async fn notify(&self, escalation: &Escalation) -> Result<(), SinkError> {
        let text = Self::format_text(escalation);
        let send = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send();
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(response)) => {
                if let Err(err) = response.error_for_status() {
                    return Err(SinkError::Http(err.to_string()));
                }
                Ok(())
            }
            Ok(Err(err)) => Err(SinkError::Http(err.to_string())),
            Err(_) => Err(SinkError::Timeout(self.timeout)),
        }
    }

    fn name(&self) -> &str {
        "chat_webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_escalation() -> Escalation {
        Escalation {
            run_id: Id::new(),
            unit_id: None,
            severity: Severity::Blocking,
            title: "merge conflict unresolved".to_string(),
            message: "exhausted retries".to_string(),
            context: HashMap::new(),
        }
    }

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl Sink for CountingSink {
        async fn notify(&self, _escalation: &Escalation) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        async fn notify(&self, _escalation: &Escalation) -> Result<(), SinkError> {
            Err(SinkError::Http("boom".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn notifies_every_sink() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(CountingSink(Arc::clone(&counter))),
            Arc::new(CountingSink(Arc::clone(&counter))),
        ];
        escalate(&sinks, &test_escalation()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(FailingSink),
            Arc::new(CountingSink(Arc::clone(&counter))),
        ];
        let result = escalate(&sinks, &test_escalation()).await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_sink_always_succeeds() {
        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(TerminalSink)];
        escalate(&sinks, &test_escalation()).await.unwrap();
    }
}
