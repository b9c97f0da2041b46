//! The typed control surface an HTTP/CLI layer sits on top of.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{ExecutionReport, RunOptions, TaskCoordinator};
use crate::error::EngineError;
use tapeback_lib::{BackupSet, BackupTask, SetId, TaskId};
use tapeback_meta::{ErrorClass, MetaError, MetaStore, SetFilter, TaskFilter, TaskOverrides};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<MetaError> for ServiceError {
    fn from(e: MetaError) -> Self {
        match e.class() {
            ErrorClass::NotFound => ServiceError::NotFound(e.to_string()),
            ErrorClass::Permanent => ServiceError::Invalid(e.to_string()),
            ErrorClass::Transient => ServiceError::Internal(e.to_string()),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Meta(meta) => meta.into(),
            EngineError::OperatorRequired(msg) => ServiceError::PreconditionFailed(msg),
            EngineError::Cancelled => ServiceError::Conflict("task was cancelled".into()),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

struct Execution {
    cancel: CancellationToken,
    handle: JoinHandle<Result<ExecutionReport, EngineError>>,
}

/// The engine's control service: create/run/cancel/inspect/delete.
///
/// One instance owns the running-executions table; callers get typed errors
/// (`NotFound`, `Conflict`, `PreconditionFailed`) rather than pipeline
/// internals.
pub struct BackupService {
    meta: Arc<dyn MetaStore>,
    coordinator: Arc<TaskCoordinator>,
    running: Mutex<HashMap<i64, Execution>>,
}

impl BackupService {
    pub fn new(meta: Arc<dyn MetaStore>, coordinator: Arc<TaskCoordinator>) -> Self {
        BackupService {
            meta,
            coordinator,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Clone a template into a pending execution, applying overrides.
    pub fn create_task(
        &self,
        template_id: TaskId,
        overrides: TaskOverrides,
    ) -> Result<TaskId, ServiceError> {
        let task_id = self.meta.create_task_from_template(template_id)?;
        if !overrides.is_empty() {
            self.meta.update_task_definition(task_id, &overrides)?;
        }
        info!("created task {task_id} from template {template_id}");
        Ok(task_id)
    }

    /// Start an execution in the background. Fails fast with `Conflict`
    /// when the task is already running and `PreconditionFailed` when the
    /// loaded tape does not match.
    pub fn run_task(&self, task_id: TaskId, opts: RunOptions) -> Result<(), ServiceError> {
        let task = self.meta.get_task(task_id)?;
        self.coordinator.precheck_tape(&task)?;

        let mut running = self.running.lock();
        if let Some(execution) = running.get(&task_id.0) {
            if !execution.handle.is_finished() {
                return Err(ServiceError::Conflict(format!(
                    "task {task_id} is already running"
                )));
            }
        }
        let cancel = CancellationToken::new();
        let coordinator = self.coordinator.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { coordinator.execute(task_id, opts, token).await });
        running.insert(task_id.0, Execution { cancel, handle });
        Ok(())
    }

    /// Await the outcome of a previously started execution.
    pub async fn join_execution(&self, task_id: TaskId) -> Result<ExecutionReport, ServiceError> {
        let execution = self
            .running
            .lock()
            .remove(&task_id.0)
            .ok_or_else(|| ServiceError::NotFound(format!("no execution for task {task_id}")))?;
        match execution.handle.await {
            Ok(result) => result.map_err(ServiceError::from),
            Err(join) => Err(ServiceError::Internal(format!(
                "execution task panicked: {join}"
            ))),
        }
    }

    /// Request cooperative cancellation. Ack is immediate; workers wind
    /// down within the bound of the in-flight compression + tape write.
    pub fn cancel_task(&self, task_id: TaskId) -> Result<(), ServiceError> {
        self.meta.get_task(task_id)?;
        if let Some(execution) = self.running.lock().get(&task_id.0) {
            execution.cancel.cancel();
            info!("cancellation requested for task {task_id}");
        }
        Ok(())
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.running
            .lock()
            .get(&task_id.0)
            .is_some_and(|execution| !execution.handle.is_finished())
    }

    pub fn get_task_status(&self, task_id: TaskId) -> Result<BackupTask, ServiceError> {
        Ok(self.meta.get_task(task_id)?)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<BackupTask>, ServiceError> {
        Ok(self.meta.list_tasks(filter)?)
    }

    /// Delete a task, cascading to its sets and files. Running tasks are
    /// refused.
    pub fn delete_task(&self, task_id: TaskId) -> Result<(), ServiceError> {
        if self.is_running(task_id) {
            return Err(ServiceError::Conflict(format!(
                "task {task_id} is running; cancel it first"
            )));
        }
        self.meta.delete_task(task_id)?;
        Ok(())
    }

    pub fn list_backup_sets(&self, filter: &SetFilter) -> Result<Vec<BackupSet>, ServiceError> {
        Ok(self.meta.list_backup_sets(filter)?)
    }

    pub fn delete_backup_set(&self, set_pk: SetId) -> Result<(), ServiceError> {
        Ok(self.meta.delete_backup_set(set_pk)?)
    }
}
