//! Live execution contexts, keyed by task ID.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use skyvault_transfer::TransferError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Supervisor-side handle to a running (or queued, or parked) execution.
#[derive(Clone)]
pub struct ExecutionHandle {
    paused: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Worker-side end of an [`ExecutionHandle`].
pub(crate) struct ExecutionControl {
    pub(crate) paused: watch::Receiver<bool>,
    pub(crate) cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl ExecutionHandle {
    /// Creates a connected handle/control pair. `paused` is the initial
    /// pause flag.
    pub(crate) fn pair(paused: bool) -> (ExecutionHandle, ExecutionControl) {
        let (paused_tx, paused_rx) = watch::channel(paused);
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        (
            ExecutionHandle {
                paused: Arc::new(paused_tx),
                cancel: cancel.clone(),
                done: done_rx,
            },
            ExecutionControl {
                paused: paused_rx,
                cancel,
                done: done_tx,
            },
        )
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the execution has written its final state.
    pub async fn finished(&self) {
        let mut done = self.done.clone();
        // A dropped sender also means the worker is gone.
        let _ = done.wait_for(|d| *d).await;
    }
}

impl ExecutionControl {
    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Parks until resumed. Fails with [`TransferError::Cancelled`] if the
    /// task is cancelled while parked.
    pub(crate) async fn wait_until_resumed(&mut self) -> Result<(), TransferError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            res = self.paused.wait_for(|p| !*p) => {
                res.map(|_| ()).map_err(|_| TransferError::Cancelled)
            }
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn mark_done(&self) {
        self.done.send_replace(true);
    }
}

/// Concurrency-safe map of live executions, owned by the supervisor.
#[derive(Default)]
pub struct ExecutionRegistry {
    handles: Mutex<HashMap<String, ExecutionHandle>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an execution. Fails if the task already has one.
    pub fn insert(&self, task_id: &str, handle: ExecutionHandle) -> Result<(), TransferError> {
        let mut handles = self.handles.lock().unwrap();
        if handles.contains_key(task_id) {
            return Err(TransferError::InvalidState(format!(
                "task {task_id} is already scheduled"
            )));
        }
        handles.insert(task_id.to_string(), handle);
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<ExecutionHandle> {
        self.handles.lock().unwrap().get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<ExecutionHandle> {
        self.handles.lock().unwrap().remove(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.handles.lock().unwrap().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn insert_rejects_duplicates() {
        let registry = ExecutionRegistry::new();
        let (h1, _c1) = ExecutionHandle::pair(false);
        let (h2, _c2) = ExecutionHandle::pair(false);
        registry.insert("t1", h1).unwrap();
        assert!(matches!(
            registry.insert("t1", h2),
            Err(TransferError::InvalidState(_))
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("t1").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_inserts_admit_one() {
        let registry = Arc::new(ExecutionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let (h, _c) = ExecutionHandle::pair(false);
                    r.insert("same", h).is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn parked_control_wakes_on_resume() {
        let (handle, mut control) = ExecutionHandle::pair(true);
        assert!(control.is_paused());

        let waiter = tokio::spawn(async move { control.wait_until_resumed().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        handle.resume();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn parked_control_wakes_on_cancel() {
        let (handle, mut control) = ExecutionHandle::pair(true);
        let waiter = tokio::spawn(async move { control.wait_until_resumed().await });
        handle.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(TransferError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn finished_resolves_after_mark_done() {
        let (handle, control) = ExecutionHandle::pair(false);
        let h = handle.clone();
        let waiter = tokio::spawn(async move { h.finished().await });
        control.mark_done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
