//! Worker pool that drives tasks from the store to completion
//!
//! Each worker loops: claim the oldest runnable task, take its advisory lock,
//! run the handler under the kind's timeout, then record the outcome. Failed
//! attempts are rescheduled with jittered exponential backoff until the
//! task's attempt budget is spent; the final failure marks the owning entity
//! ERROR and raises an alert. A reaper hands back tasks whose lease expired.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use kaas_common::model::{
    ProjectStatus, Task, TaskKind, TaskOwner, TaskStatus, WorkspaceStatus,
};
use kaas_common::retry::RetryConfig;
use kaas_common::{Error, Result};
use kaas_store::{FailureRecord, Store, StoreError, WorkspaceUpdate};

use crate::handler::{HandlerRegistry, Outcome, TaskHandler};
use crate::queue::TaskQueue;

/// Worker pool settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Idle poll interval when no wakeup arrives
    pub poll_interval: Duration,
    /// Lease granted on claim; must exceed the longest task timeout
    pub lease: Duration,
    /// Extra advisory-lock lifetime on top of the task timeout
    pub lock_margin: Duration,
    /// Delay before retrying a task whose lock was busy
    pub lock_retry_delay: Duration,
    /// How often expired leases are swept
    pub reaper_interval: Duration,
    /// Prefix for worker identities in logs
    pub worker_id: String,
    /// Per-kind backoff curves replacing [`TaskKind::retry_config`]
    pub retry_overrides: HashMap<TaskKind, RetryConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(2),
            lease: Duration::from_secs(20 * 60),
            lock_margin: Duration::from_secs(60),
            lock_retry_delay: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(30),
            worker_id: "worker".to_string(),
            retry_overrides: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Backoff curve used for `kind`
    pub fn retry_config(&self, kind: TaskKind) -> RetryConfig {
        self.retry_overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.retry_config())
    }
}

/// How a claimed task left the worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Finished successfully
    Completed,
    /// Put back without consuming an attempt
    Deferred,
    /// Failed; another attempt is scheduled
    Retrying,
    /// Failed for good; owner marked ERROR
    Failed,
}

/// Summary of one processed task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    /// Task id
    pub task_id: String,
    /// Task kind
    pub kind: TaskKind,
    /// What happened
    pub disposition: Disposition,
}

/// The async task engine
pub struct TaskEngine {
    queue: TaskQueue,
    registry: HandlerRegistry,
    config: EngineConfig,
}

impl TaskEngine {
    /// Engine over `queue` dispatching through `registry`
    pub fn new(queue: TaskQueue, registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self {
            queue,
            registry,
            config,
        }
    }

    fn store(&self) -> &Store {
        self.queue.store()
    }

    /// Run the worker pool and the lease reaper until `cancel` fires.
    ///
    /// In-flight tasks are allowed to finish. Returns an error only if the
    /// store became unusable, after cancelling the remaining workers.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let missing = self.registry.missing();
        if !missing.is_empty() {
            warn!(?missing, "no handler registered for some task kinds");
        }
        info!(workers = self.config.workers, "starting task engine");

        let mut workers = JoinSet::new();
        for n in 0..self.config.workers.max(1) {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            let name = format!("{}-{n}", self.config.worker_id);
            workers.spawn(async move { engine.worker_loop(name, cancel).await });
        }
        let engine = Arc::clone(&self);
        let reaper_cancel = cancel.clone();
        workers.spawn(async move { engine.reaper_loop(reaper_cancel).await });

        let mut outcome = Ok(());
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(Error::internal_with_context("engine", format!("worker panicked: {e}")))
            });
            if let Err(e) = result {
                cancel.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        info!("task engine stopped");
        outcome
    }

    async fn worker_loop(&self, name: String, cancel: CancellationToken) -> Result<()> {
        debug!(worker = %name, "worker started");
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!(worker = %name, error = %e, "task store unusable, stopping engine");
                    return Err(e);
                }
                Err(e) => warn!(worker = %name, error = %e, "worker iteration failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn reaper_loop(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reaper_interval) => {}
            }
            match self.store().requeue_expired(Utc::now()) {
                Ok(0) => {}
                Ok(_) => self.queue.wake(),
                Err(e) => {
                    let e = Error::from(e);
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(error = %e, "lease sweep failed");
                }
            }
        }
    }

    /// Claim and process at most one task.
    pub async fn run_once(&self) -> Result<Option<TaskReport>> {
        let Some(task) = self.store().claim_next(Utc::now(), self.config.lease)? else {
            return Ok(None);
        };
        let span = info_span!(
            "task",
            task_id = %task.id,
            kind = %task.kind,
            attempt = task.retry_count + 1,
            workspace = task.payload.workspace_id().unwrap_or("-"),
        );
        let disposition = self.process(&task).instrument(span).await?;
        Ok(Some(TaskReport {
            task_id: task.id,
            kind: task.kind,
            disposition,
        }))
    }

    async fn process(&self, task: &Task) -> Result<Disposition> {
        let Some(handler) = self.registry.get(task.kind) else {
            let err = Error::validation_for(
                task.id.clone(),
                format!("no handler registered for {}", task.kind),
            );
            return self.record_failure(task, None, err).await;
        };

        let lock_key = task.payload.lock_key();
        if let Some(key) = &lock_key {
            let now = Utc::now();
            let ttl = task.kind.timeout() + self.config.lock_margin;
            if !self.store().try_acquire_lock(key, &task.id, ttl, now)? {
                debug!(lock = %key, "lock busy, deferring");
                self.store().release_task(
                    &task.id,
                    after(now, self.config.lock_retry_delay),
                    &format!("lock {key} held by another task"),
                    now,
                )?;
                return Ok(Disposition::Deferred);
            }
        }

        let timeout = task.kind.timeout();
        let result = match tokio::time::timeout(timeout, handler.handle(task)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(task.kind.as_str(), timeout)),
        };

        if let Some(key) = &lock_key {
            if let Err(e) = self.store().release_lock(key, &task.id) {
                let e = Error::from(e);
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(lock = %key, error = %e, "failed to release lock; it will expire");
            }
        }

        let now = Utc::now();
        match result {
            Ok(Outcome::Completed(value)) => {
                self.store().complete_task(&task.id, value.as_ref(), now)?;
                info!("task completed");
                Ok(Disposition::Completed)
            }
            Ok(Outcome::Deferred { delay, reason }) => {
                self.store()
                    .release_task(&task.id, after(now, delay), &reason, now)?;
                info!(reason = %reason, delay_ms = delay.as_millis() as u64, "task deferred");
                Ok(Disposition::Deferred)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => self.record_failure(task, Some(handler.as_ref()), e).await,
        }
    }

    async fn record_failure(
        &self,
        task: &Task,
        handler: Option<&dyn TaskHandler>,
        err: Error,
    ) -> Result<Disposition> {
        let now = Utc::now();
        let failed = task.retry_count + 1;
        if err.is_retryable() && failed < task.max_retries {
            let delay = self.config.retry_config(task.kind).delay_for(failed);
            self.store().fail_task(
                &task.id,
                &FailureRecord::retry_at(err.to_string(), after(now, delay)),
                now,
            )?;
            warn!(
                error = %err,
                category = ?err.category(),
                failed_attempts = failed,
                max_attempts = task.max_retries,
                delay_ms = delay.as_millis() as u64,
                "task attempt failed, retrying"
            );
            return Ok(Disposition::Retrying);
        }

        self.store()
            .fail_task(&task.id, &FailureRecord::terminal(err.to_string()), now)?;
        self.exhaust(task, handler, &err, failed).await?;
        Ok(Disposition::Failed)
    }

    /// Terminal failure: handler hook, owner to ERROR, alert.
    async fn exhaust(
        &self,
        task: &Task,
        handler: Option<&dyn TaskHandler>,
        err: &Error,
        attempts: u32,
    ) -> Result<()> {
        if let Some(handler) = handler {
            if let Err(hook_err) = handler.on_exhausted(task, err).await {
                if hook_err.is_fatal() {
                    return Err(hook_err);
                }
                warn!(error = %hook_err, "exhaustion hook failed");
            }
        }

        let owner = task.owner();
        let detail = err.to_string();
        match &owner {
            TaskOwner::Workspace { id } => {
                match self.store().transition_workspace(
                    id,
                    WorkspaceStatus::Error,
                    WorkspaceUpdate::error(detail.clone()),
                ) {
                    Ok(_) => {}
                    Err(StoreError::NotFound { .. }) => {
                        debug!(workspace = %id, "workspace already removed")
                    }
                    Err(e) => {
                        let e = Error::from(e);
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(workspace = %id, error = %e, "failed to mark workspace ERROR");
                    }
                }
            }
            TaskOwner::Project { id, .. } => {
                if !self
                    .store()
                    .set_project_status(id, ProjectStatus::Error, Some(&detail))?
                {
                    debug!(project = %id, "project row absent, nothing to mark");
                }
            }
            TaskOwner::External { .. } => {}
        }

        let message = format!(
            "{} task {} failed after {} attempt(s): {}",
            task.kind, task.id, attempts, detail
        );
        self.store()
            .record_alert(&owner, Some(&task.id), &message)?;
        error!(
            owner_kind = owner.kind(),
            owner_id = owner.id(),
            alert = true,
            "{message}"
        );
        Ok(())
    }

    /// Status of a task, for callers polling for completion
    pub fn status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        Ok(self.queue.get(task_id)?.map(|t| t.status))
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
