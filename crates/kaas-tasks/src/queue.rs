//! Enqueue side of the task pipeline
//!
//! The queue is the store's task table plus an in-process wakeup so idle
//! workers pick up fresh work without waiting for the next poll tick.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

use kaas_common::model::{Task, TaskPayload, Workspace};
use kaas_common::Result;
use kaas_store::Store;

/// Handle used to submit tasks and to wait for new ones
#[derive(Clone)]
pub struct TaskQueue {
    store: Store,
    notify: Arc<Notify>,
}

impl TaskQueue {
    /// Queue backed by `store`
    pub fn new(store: Store) -> Self {
        Self {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Persist a new task for `payload` and wake a worker.
    pub fn enqueue(&self, payload: TaskPayload) -> Result<Task> {
        let task = Task::new(payload);
        self.enqueue_task(&task)?;
        Ok(task)
    }

    /// Persist a prepared task and wake a worker.
    pub fn enqueue_task(&self, task: &Task) -> Result<()> {
        self.store.insert_task(task)?;
        info!(task_id = %task.id, kind = %task.kind, owner = %task.owner().id(), "task submitted");
        self.notify.notify_one();
        Ok(())
    }

    /// Persist a new workspace row and its create task in one transaction,
    /// then wake a worker. Returns false, writing nothing, if the workspace
    /// id is taken.
    pub fn enqueue_with_workspace(&self, ws: &Workspace, task: &Task) -> Result<bool> {
        if !self.store.insert_workspace_with_task(ws, task)? {
            return Ok(false);
        }
        info!(task_id = %task.id, kind = %task.kind, owner = %ws.id, "task submitted");
        self.notify.notify_one();
        Ok(true)
    }

    /// Fetch a task by id.
    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.store.get_task(id)?)
    }

    /// Wake one idle worker.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves when a task was submitted.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
