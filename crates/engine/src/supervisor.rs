//! Transfer supervisor: owns scheduling, control routing and recovery.
//!
//! At most `max_concurrent_transfers` executions move bytes at once. A task
//! waiting for a slot stays Pending. Pause, resume and cancel reach a live
//! execution through the [`ExecutionRegistry`]; tasks without one are
//! changed directly in the task store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use skyvault_protocol::{ControlAction, StateStatistics, TaskSnapshot, TaskState};
use skyvault_transfer::{
    ChunkLedger, ContentIndex, ObjectStore, TransferError, normalize_digest, owned_session_id,
    validate_file_name, validate_location,
};
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::TransferEvent;
use crate::executor::{self, blocking};
use crate::quota::Quota;
use crate::registry::{ExecutionHandle, ExecutionRegistry};
use crate::retry::RetryPolicy;
use crate::task::{TransferTarget, TransferTask};
use crate::task_store::TaskStore;

/// Collaborators the supervisor works with.
pub struct SupervisorParts {
    pub store: Arc<dyn ObjectStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub index: Arc<ContentIndex>,
    pub ledger: Arc<ChunkLedger>,
    pub quota: Arc<dyn Quota>,
}

/// State shared between the supervisor and its executions.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) tasks: Arc<dyn TaskStore>,
    pub(crate) index: Arc<ContentIndex>,
    pub(crate) ledger: Arc<ChunkLedger>,
    pub(crate) quota: Arc<dyn Quota>,
    pub(crate) retry: RetryPolicy,
    pub(crate) transfer_chunk_size: usize,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) registry: ExecutionRegistry,
    events: broadcast::Sender<TransferEvent>,
    /// Serializes load-modify-save of task records.
    record_lock: Mutex<()>,
}

impl Shared {
    pub(crate) fn load(&self, task_id: &str) -> Result<TransferTask, TransferError> {
        self.tasks
            .load(task_id)?
            .ok_or_else(|| TransferError::NotFound(format!("task {task_id}")))
    }

    /// Applies `f` to the stored task and persists the result. Nothing is
    /// written if `f` fails.
    pub(crate) fn update<F>(&self, task_id: &str, f: F) -> Result<TransferTask, TransferError>
    where
        F: FnOnce(&mut TransferTask) -> Result<(), TransferError>,
    {
        let _guard = self.record_lock.lock().unwrap();
        let mut task = self.load(task_id)?;
        let before = task.state;
        f(&mut task)?;
        self.tasks.save(&task)?;
        if task.state != before {
            debug!(task = %task_id, from = %before, to = %task.state, "task state changed");
            self.emit(TransferEvent::StateChanged {
                task_id: task_id.to_string(),
                state: task.state,
            });
        }
        Ok(task)
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Removes bytes a task wrote but never finished.
    pub(crate) async fn discard_partial(&self, task: &TransferTask) -> Result<(), TransferError> {
        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        let task = task.clone();
        blocking(move || discard(store.as_ref(), &ledger, &task)).await
    }

    /// [`discard_partial`](Self::discard_partial), retrying transient store
    /// failures on the chunk retry schedule.
    pub(crate) async fn discard_partial_with_retry(
        &self,
        task: &TransferTask,
    ) -> Result<(), TransferError> {
        let mut attempt = 0;
        loop {
            let err = match self.discard_partial(task).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            attempt += 1;
            if !self.retry.should_retry(&err, attempt) {
                return Err(err);
            }
            let delay = self.retry.delay_for_attempt(attempt);
            warn!(task = %task.id, attempt, error = %err, delay_ms = delay.as_millis() as u64, "partial output removal failed; retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

fn discard(
    store: &dyn ObjectStore,
    ledger: &ChunkLedger,
    task: &TransferTask,
) -> Result<(), TransferError> {
    if task.started_at.is_none() {
        // Never ran, so nothing at the target belongs to it.
        return Ok(());
    }
    match &task.target {
        TransferTarget::Download { destination, .. } => store.delete(destination),
        TransferTarget::Upload {
            name, size, digest, ..
        } => {
            let session = owned_session_id(&task.id, name, *size, digest);
            match ledger.abort_upload(&session) {
                Err(TransferError::NotFound(_)) => Ok(()),
                other => other,
            }
        }
    }
}

/// Schedules and controls transfer tasks.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(parts: SupervisorParts, config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let workers = config.max_concurrent_transfers.max(1);
        info!(workers, "transfer supervisor ready");
        Self {
            shared: Arc::new(Shared {
                store: parts.store,
                tasks: parts.tasks,
                index: parts.index,
                ledger: parts.ledger,
                quota: parts.quota,
                retry: config.retry.policy(),
                transfer_chunk_size: config.transfer_chunk_size,
                permits: Arc::new(Semaphore::new(workers)),
                registry: ExecutionRegistry::new(),
                events,
                record_lock: Mutex::new(()),
            }),
        }
    }

    /// Subscribes to task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.shared.registry
    }

    // -----------------------------------------------------------------------
    // Creation and queries
    // -----------------------------------------------------------------------

    /// Creates a pending download of stored content.
    ///
    /// Without a destination the bytes go to `downloads/<task>/<digest>`.
    pub fn create_download(
        &self,
        principal: &str,
        digest: &str,
        size: u64,
        destination: Option<&str>,
    ) -> Result<TaskSnapshot, TransferError> {
        let digest = normalize_digest(digest)?;
        let content = self
            .shared
            .index
            .lookup(&digest, size)
            .ok_or_else(|| TransferError::NotFound(format!("content {digest} ({size} bytes)")))?;

        let mut task = TransferTask::new_download(principal, content.to_ref(), "");
        let destination = match destination {
            Some(d) => d.to_string(),
            None => format!("downloads/{}/{}", task.id, digest),
        };
        validate_location(&destination)?;
        if let TransferTarget::Download { destination: d, .. } = &mut task.target {
            *d = destination;
        }
        self.insert_new(task)
    }

    /// Creates a pending upload of bytes spooled at `source`.
    pub fn create_upload(
        &self,
        principal: &str,
        name: &str,
        size: u64,
        digest: &str,
        source: &str,
    ) -> Result<TaskSnapshot, TransferError> {
        validate_file_name(name)?;
        let digest = normalize_digest(digest)?;
        validate_location(source)?;
        match self.shared.store.size(source)? {
            Some(actual) if actual == size => {}
            Some(actual) => {
                return Err(TransferError::InvalidRequest(format!(
                    "source {source} holds {actual} bytes, declared {size}"
                )));
            }
            None => return Err(TransferError::NotFound(format!("source {source}"))),
        }

        let task = TransferTask::new_upload(principal, name, size, &digest, source);
        self.insert_new(task)
    }

    fn insert_new(&self, task: TransferTask) -> Result<TaskSnapshot, TransferError> {
        self.shared.tasks.save(&task)?;
        info!(task = %task.id, direction = %task.direction, principal = %task.principal, bytes = task.total_bytes, "task created");
        self.shared.emit(TransferEvent::StateChanged {
            task_id: task.id.clone(),
            state: task.state,
        });
        Ok(task.snapshot())
    }

    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        Ok(self.shared.load(task_id)?.snapshot())
    }

    /// Lists tasks, newest first, optionally narrowed to one principal or state.
    pub fn list(
        &self,
        principal: Option<&str>,
        state: Option<TaskState>,
    ) -> Result<Vec<TaskSnapshot>, TransferError> {
        let mut tasks: Vec<TransferTask> = self
            .shared
            .tasks
            .list()?
            .into_iter()
            .filter(|t| principal.is_none_or(|p| t.principal == p))
            .filter(|t| state.is_none_or(|s| t.state == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks.iter().map(TransferTask::snapshot).collect())
    }

    /// Task count and mean progress per state.
    pub fn statistics(&self, principal: Option<&str>) -> Result<Vec<StateStatistics>, TransferError> {
        let mut groups: HashMap<TaskState, (u64, u64)> = HashMap::new();
        for task in self.shared.tasks.list()? {
            if principal.is_some_and(|p| task.principal != p) {
                continue;
            }
            let entry = groups.entry(task.state).or_default();
            entry.0 += 1;
            entry.1 += task.percent() as u64;
        }

        Ok(TaskState::ALL
            .into_iter()
            .filter_map(|state| {
                groups.get(&state).map(|&(count, percent_sum)| StateStatistics {
                    state,
                    count,
                    average_percent: percent_sum as f64 / count as f64,
                })
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Routes a control action to the task.
    pub async fn signal(
        &self,
        task_id: &str,
        action: ControlAction,
    ) -> Result<TaskSnapshot, TransferError> {
        match action {
            ControlAction::Start => self.start(task_id).await,
            ControlAction::Pause => self.pause(task_id).await,
            ControlAction::Resume => self.resume(task_id).await,
            ControlAction::Cancel => self.cancel(task_id).await,
            ControlAction::Delete => self.delete(task_id).await,
        }
    }

    /// Queues a pending task for execution.
    pub async fn start(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        let task = self.shared.update(task_id, |t| {
            if t.state != TaskState::Pending {
                return Err(TransferError::InvalidState(format!(
                    "cannot start task {} while {}",
                    t.id, t.state
                )));
            }
            t.message = "waiting for a transfer slot".into();
            Ok(())
        })?;
        self.submit(&task, false)?;
        info!(task = %task_id, "task queued");
        Ok(task.snapshot())
    }

    fn submit(&self, task: &TransferTask, paused: bool) -> Result<(), TransferError> {
        let (handle, control) = ExecutionHandle::pair(paused);
        self.shared.registry.insert(&task.id, handle)?;
        tokio::spawn(executor::run(
            Arc::clone(&self.shared),
            task.id.clone(),
            control,
        ));
        Ok(())
    }

    pub async fn pause(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        let registry = &self.shared.registry;
        let task = self.shared.update(task_id, |t| {
            t.pause()?;
            if let Some(handle) = registry.get(task_id) {
                handle.pause();
            }
            Ok(())
        })?;
        info!(task = %task_id, bytes = task.bytes_transferred, "task paused");
        Ok(task.snapshot())
    }

    pub async fn resume(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        let registry = &self.shared.registry;
        let mut live = false;
        let task = self.shared.update(task_id, |t| {
            t.resume()?;
            if let Some(handle) = registry.get(task_id) {
                handle.resume();
                live = true;
            }
            Ok(())
        })?;
        if !live {
            // Paused before it ever ran, or its execution did not survive a restart.
            self.submit(&task, false)?;
        }
        info!(task = %task_id, bytes = task.bytes_transferred, "task resumed");
        Ok(task.snapshot())
    }

    /// Cancels a task and returns once its partial output is gone.
    pub async fn cancel(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        let shared = &self.shared;
        let mut live = None;
        // The state check, the cleanup and the Cancelled write share the
        // record lock, so an execution cannot complete in between.
        let task = shared.update(task_id, |t| {
            if t.is_terminal() {
                return Err(TransferError::InvalidState(format!(
                    "cannot cancel task {task_id} while {}",
                    t.state
                )));
            }
            if let Some(handle) = shared.registry.get(task_id) {
                live = Some(handle);
                return Ok(());
            }
            discard(shared.store.as_ref(), &shared.ledger, t)?;
            t.cancel()
        })?;

        let Some(handle) = live else {
            info!(task = %task_id, "task cancelled");
            return Ok(task.snapshot());
        };

        handle.cancel();
        handle.finished().await;
        let task = shared.load(task_id)?;
        if task.state != TaskState::Cancelled {
            return Err(TransferError::InvalidState(format!(
                "task {task_id} ended as {} instead of cancelled",
                task.state
            )));
        }
        Ok(task.snapshot())
    }

    /// Removes a task record, cancelling it first if it is still live.
    /// Returns the last snapshot before removal.
    pub async fn delete(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        let task = self.shared.load(task_id)?;
        if !task.is_terminal() {
            match self.cancel(task_id).await {
                Ok(_) | Err(TransferError::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let task = self.shared.load(task_id)?;
        if task.state != TaskState::Completed {
            self.shared.discard_partial(&task).await?;
        }
        self.shared.tasks.delete(task_id)?;
        self.shared.emit(TransferEvent::Deleted {
            task_id: task_id.to_string(),
        });
        info!(task = %task_id, "task deleted");
        Ok(task.snapshot())
    }

    /// Waits until the task has no live execution and returns its state.
    pub async fn wait(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        if let Some(handle) = self.shared.registry.get(task_id) {
            handle.finished().await;
        }
        self.status(task_id)
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Fails every task recorded as Running that has no live execution.
    ///
    /// Call once at startup: those tasks were cut off by a restart and are
    /// not resumed automatically. Returns the IDs that were failed.
    pub async fn recover(&self) -> Result<Vec<String>, TransferError> {
        let mut failed = Vec::new();
        for task in self.shared.tasks.list()? {
            if task.state != TaskState::Running || self.shared.registry.contains(&task.id) {
                continue;
            }
            if let Err(e) = self.shared.discard_partial_with_retry(&task).await {
                warn!(task = %task.id, error = %e, "could not remove partial output");
            }
            let err = TransferError::Interrupted("engine restarted while the transfer was running".into());
            self.shared.update(&task.id, |t| t.fail(&err))?;
            warn!(task = %task.id, bytes = task.bytes_transferred, "interrupted task marked failed");
            failed.push(task.id);
        }
        Ok(failed)
    }

    /// Deletes terminal tasks that finished more than `older_than` ago.
    pub fn prune_finished(&self, older_than: chrono::Duration) -> Result<Vec<String>, TransferError> {
        let cutoff = Utc::now() - older_than;
        let mut pruned = Vec::new();
        for task in self.shared.tasks.list()? {
            let expired = task.is_terminal() && task.completed_at.is_some_and(|at| at < cutoff);
            if !expired {
                continue;
            }
            self.shared.tasks.delete(&task.id)?;
            self.shared.emit(TransferEvent::Deleted {
                task_id: task.id.clone(),
            });
            pruned.push(task.id);
        }
        if !pruned.is_empty() {
            info!(count = pruned.len(), "finished tasks pruned");
        }
        Ok(pruned)
    }
}
