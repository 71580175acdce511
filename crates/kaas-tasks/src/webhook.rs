//! Externally triggered events
//!
//! An `external-webhook-apply` task is applied at most once per
//! `(source, event_id)`. The handler claims the event in the store before
//! calling the applier; a second task for the same event defers until the
//! claim is settled, and redeliveries after a successful apply complete
//! without calling the applier again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use kaas_common::model::{Task, TaskPayload};
use kaas_common::{Error, Result};
use kaas_store::{EventClaim, Store};

use crate::handler::{Outcome, TaskHandler};

/// Applies the body of an external event
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookApplier: Send + Sync {
    /// Apply one event; the returned value becomes the task result.
    async fn apply(&self, source: &str, event_id: &str, body: &Value) -> Result<Option<Value>>;
}

/// Forwards events to an HTTP endpoint as JSON
pub struct HttpForwardApplier {
    client: reqwest::Client,
    url: String,
}

impl HttpForwardApplier {
    /// Forward to `url` with a bounded request time
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("webhook", e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl WebhookApplier for HttpForwardApplier {
    async fn apply(&self, source: &str, event_id: &str, body: &Value) -> Result<Option<Value>> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "source": source, "eventId": event_id, "body": body }))
            .send()
            .await
            .map_err(|e| Error::internal_with_context("webhook", e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| Error::internal_with_context("webhook", e.to_string()))?;
            if text.trim().is_empty() {
                return Ok(None);
            }
            return Ok(Some(
                serde_json::from_str(&text).unwrap_or(Value::String(text)),
            ));
        }

        let message = format!("{} rejected event {event_id} with {status}", self.url);
        let retryable = status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
        if retryable {
            Err(Error::internal_with_context("webhook", message))
        } else {
            Err(Error::validation_for(format!("{source}/{event_id}"), message))
        }
    }
}

/// How long a task waits when another task holds the event
const EVENT_BUSY_DELAY: Duration = Duration::from_secs(5);

/// Handler for `external-webhook-apply`
pub struct WebhookHandler {
    store: Store,
    applier: Arc<dyn WebhookApplier>,
}

impl WebhookHandler {
    /// Handler deduplicating through `store`
    pub fn new(store: Store, applier: Arc<dyn WebhookApplier>) -> Self {
        Self { store, applier }
    }
}

#[async_trait]
impl TaskHandler for WebhookHandler {
    async fn handle(&self, task: &Task) -> Result<Outcome> {
        let TaskPayload::ExternalWebhookApply {
            source,
            event_id,
            body,
        } = &task.payload
        else {
            return Err(Error::validation_for(
                task.id.clone(),
                format!("{} payload routed to the webhook handler", task.kind),
            ));
        };

        match self.store.claim_event(source, event_id, &task.id, Utc::now())? {
            EventClaim::Claimed => {}
            EventClaim::AlreadyApplied => {
                debug!(source = %source, event_id = %event_id, "event already applied");
                return Ok(Outcome::with_result(json!({ "duplicate": true })));
            }
            EventClaim::InFlight { holder } => {
                debug!(source = %source, event_id = %event_id, holder = %holder, "event in flight");
                return Ok(Outcome::defer(
                    EVENT_BUSY_DELAY,
                    format!("event {source}/{event_id} is being applied by task {holder}"),
                ));
            }
        }

        let result = match self.applier.apply(source, event_id, body).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(release) = self.store.release_event(source, event_id, &task.id) {
                    warn!(error = %release, event_id = %event_id, "failed to release event claim");
                }
                return Err(e);
            }
        };
        self.store
            .finish_event(source, event_id, &task.id, Utc::now())?;
        info!(source = %source, event_id = %event_id, "external event applied");
        Ok(Outcome::Completed(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_task(event_id: &str) -> Task {
        Task::new(TaskPayload::ExternalWebhookApply {
            source: "billing".to_string(),
            event_id: event_id.to_string(),
            body: json!({"invoice": "inv-1", "state": "paid"}),
        })
    }

    #[tokio::test]
    async fn test_event_is_applied_once() {
        let store = Store::in_memory().expect("store");
        let mut applier = MockWebhookApplier::new();
        applier
            .expect_apply()
            .withf(|source, event_id, body| {
                source == "billing" && event_id == "evt-1" && body["state"] == "paid"
            })
            .times(1)
            .returning(|_, _, _| Ok(Some(json!({"applied": true}))));
        let handler = WebhookHandler::new(store.clone(), Arc::new(applier));

        let first = handler.handle(&event_task("evt-1")).await.expect("apply");
        assert_eq!(first, Outcome::with_result(json!({"applied": true})));
        let again = handler.handle(&event_task("evt-1")).await.expect("dedup");
        assert_eq!(again, Outcome::with_result(json!({"duplicate": true})));
    }

    #[tokio::test]
    async fn test_failed_apply_is_not_marked_processed() {
        let store = Store::in_memory().expect("store");
        let mut applier = MockWebhookApplier::new();
        applier
            .expect_apply()
            .times(1)
            .returning(|_, _, _| Err(Error::internal_with_context("webhook", "503")));
        let handler = WebhookHandler::new(store.clone(), Arc::new(applier));

        let err = handler
            .handle(&event_task("evt-2"))
            .await
            .expect_err("applier failed");
        assert!(err.is_retryable());
        assert!(!store.is_event_processed("billing", "evt-2").expect("check"));
    }

    /// Counts calls and holds each apply open for a while
    #[derive(Default)]
    struct SlowApplier {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl WebhookApplier for SlowApplier {
        async fn apply(&self, _: &str, _: &str, _: &Value) -> Result<Option<Value>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_apply_the_event_once() {
        let store = Store::in_memory().expect("store");
        let applier = Arc::new(SlowApplier::default());
        let handler = WebhookHandler::new(store.clone(), applier.clone());
        let first = event_task("evt-1");
        let second = event_task("evt-1");

        let (a, b) = tokio::join!(handler.handle(&first), handler.handle(&second));
        let outcomes = [a.expect("first"), b.expect("second")];

        assert_eq!(applier.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(outcomes.contains(&Outcome::done()));
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Outcome::Deferred { .. })));

        // the deferred task comes back after the apply settled
        let retried = handler.handle(&second).await.expect("redelivery");
        assert_eq!(retried, Outcome::with_result(json!({"duplicate": true})));
        assert_eq!(applier.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wrong_payload_is_permanent() {
        let handler = WebhookHandler::new(
            Store::in_memory().expect("store"),
            Arc::new(MockWebhookApplier::new()),
        );
        let task = Task::new(TaskPayload::DeleteWorkspace {
            workspace_id: "ws-1".to_string(),
        });
        let err = handler.handle(&task).await.expect_err("wrong payload");
        assert!(!err.is_retryable());
    }
}
