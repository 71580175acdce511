//! Task handler trait and the handler table

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use kaas_common::model::{Task, TaskKind};
use kaas_common::{Error, Result};

/// What a handler made of one attempt
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Done; the value is stored as the task result
    Completed(Option<serde_json::Value>),
    /// Not runnable yet; re-queue after `delay` without consuming an attempt
    Deferred {
        /// How long to wait before the next attempt
        delay: Duration,
        /// Why, recorded in the attempt log
        reason: String,
    },
}

impl Outcome {
    /// Completed without a result value
    pub fn done() -> Self {
        Self::Completed(None)
    }

    /// Completed with a result value
    pub fn with_result(value: serde_json::Value) -> Self {
        Self::Completed(Some(value))
    }

    /// Deferred for `delay`
    pub fn defer(delay: Duration, reason: impl Into<String>) -> Self {
        Self::Deferred {
            delay,
            reason: reason.into(),
        }
    }
}

/// Executes one kind of task
///
/// Tasks are delivered at least once, so `handle` must check remote state
/// before mutating it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one attempt.
    async fn handle(&self, task: &Task) -> Result<Outcome>;

    /// Called once after the final attempt failed, before the owner is moved
    /// to ERROR.
    async fn on_exhausted(&self, task: &Task, error: &Error) -> Result<()> {
        let _ = (task, error);
        Ok(())
    }
}

/// Handler table keyed by task kind
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Handler for `kind`
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Kinds with no registered handler
    pub fn missing(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|k| !self.handlers.contains_key(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_reports_missing_kinds() {
        let registry = HandlerRegistry::new().with(
            TaskKind::DeleteWorkspace,
            Arc::new(MockTaskHandler::new()) as Arc<dyn TaskHandler>,
        );
        assert!(registry.get(TaskKind::DeleteWorkspace).is_some());
        assert!(registry.get(TaskKind::CreateWorkspace).is_none());
        let missing = registry.missing();
        assert_eq!(missing.len(), TaskKind::ALL.len() - 1);
        assert!(!missing.contains(&TaskKind::DeleteWorkspace));
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(Outcome::done(), Outcome::Completed(None));
        match Outcome::defer(Duration::from_secs(5), "lock held") {
            Outcome::Deferred { delay, reason } => {
                assert_eq!(delay, Duration::from_secs(5));
                assert_eq!(reason, "lock held");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
