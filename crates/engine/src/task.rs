//! The transfer task record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyvault_protocol::{
    ContentRef, Direction, ErrorDetail, TaskSnapshot, TaskState, TransferResult, percent_of,
};
use skyvault_transfer::TransferError;

/// What a task moves, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferTarget {
    /// Ingest spooled bytes at `source` as a new stored file.
    Upload {
        name: String,
        size: u64,
        digest: String,
        source: String,
    },
    /// Copy stored content to `destination`.
    Download {
        content: ContentRef,
        destination: String,
    },
}

/// A single upload or download tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: String,
    pub direction: Direction,
    pub principal: String,
    pub target: TransferTarget,
    pub state: TaskState,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub speed_bps: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<TransferResult>,
}

impl TransferTask {
    fn new(principal: &str, direction: Direction, target: TransferTarget, total_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            principal: principal.to_string(),
            target,
            state: TaskState::Pending,
            bytes_transferred: 0,
            total_bytes,
            speed_bps: 0.0,
            message: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// Creates a pending upload of the bytes spooled at `source`.
    pub fn new_upload(principal: &str, name: &str, size: u64, digest: &str, source: &str) -> Self {
        let target = TransferTarget::Upload {
            name: name.to_string(),
            size,
            digest: digest.to_string(),
            source: source.to_string(),
        };
        Self::new(principal, Direction::Upload, target, size)
    }

    /// Creates a pending download of `content` into `destination`.
    pub fn new_download(principal: &str, content: ContentRef, destination: &str) -> Self {
        let size = content.size;
        let target = TransferTarget::Download {
            content,
            destination: destination.to_string(),
        };
        Self::new(principal, Direction::Download, target, size)
    }

    /// Completion percentage, rounded down; 100 for an empty transfer.
    pub fn percent(&self) -> u8 {
        percent_of(self.bytes_transferred, self.total_bytes)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Location this task writes into, if it writes one itself.
    pub fn destination(&self) -> Option<&str> {
        match &self.target {
            TransferTarget::Download { destination, .. } => Some(destination),
            TransferTarget::Upload { .. } => None,
        }
    }

    fn invalid(&self, action: &str) -> TransferError {
        TransferError::InvalidState(format!(
            "cannot {action} task {} while {}",
            self.id, self.state
        ))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn finish(&mut self, state: TaskState) {
        self.state = state;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Pending -> Running.
    pub fn start(&mut self) -> Result<(), TransferError> {
        if self.state != TaskState::Pending {
            return Err(self.invalid("start"));
        }
        self.state = TaskState::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.message = "transfer running".into();
        self.touch();
        Ok(())
    }

    /// Pending | Running -> Paused.
    pub fn pause(&mut self) -> Result<(), TransferError> {
        if !matches!(self.state, TaskState::Pending | TaskState::Running) {
            return Err(self.invalid("pause"));
        }
        self.state = TaskState::Paused;
        self.speed_bps = 0.0;
        self.message = "transfer paused".into();
        self.touch();
        Ok(())
    }

    /// Paused -> Running.
    pub fn resume(&mut self) -> Result<(), TransferError> {
        if self.state != TaskState::Paused {
            return Err(self.invalid("resume"));
        }
        self.state = TaskState::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.message = "transfer resumed".into();
        self.touch();
        Ok(())
    }

    /// Any non-terminal state -> Cancelled.
    pub fn cancel(&mut self) -> Result<(), TransferError> {
        if self.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.speed_bps = 0.0;
        self.message = "transfer cancelled".into();
        self.finish(TaskState::Cancelled);
        Ok(())
    }

    /// Running -> Completed.
    pub fn complete(&mut self, result: TransferResult) -> Result<(), TransferError> {
        if self.state != TaskState::Running {
            return Err(self.invalid("complete"));
        }
        self.bytes_transferred = self.total_bytes;
        self.message = if result.deduplicated {
            "content already stored; nothing transferred".into()
        } else {
            "transfer completed".into()
        };
        self.result = Some(result);
        self.finish(TaskState::Completed);
        Ok(())
    }

    /// Running -> Failed, recording why.
    ///
    /// A pause that lands while a chunk is in flight does not stop that
    /// chunk's failure from ending the task, so Paused is accepted too.
    pub fn fail(&mut self, err: &TransferError) -> Result<(), TransferError> {
        if !matches!(self.state, TaskState::Running | TaskState::Paused) {
            return Err(self.invalid("fail"));
        }
        let detail = err.detail();
        self.message = detail.message.clone();
        self.error = Some(detail);
        self.speed_bps = 0.0;
        self.finish(TaskState::Failed);
        Ok(())
    }

    /// Commits a new byte count. Counts never go backwards and never pass
    /// the total.
    pub fn record_progress(&mut self, bytes: u64, speed_bps: f64) -> Result<(), TransferError> {
        if self.is_terminal() {
            return Err(self.invalid("record progress on"));
        }
        if bytes < self.bytes_transferred || bytes > self.total_bytes {
            return Err(TransferError::InvalidState(format!(
                "progress {bytes} outside [{}, {}] for task {}",
                self.bytes_transferred, self.total_bytes, self.id
            )));
        }
        self.bytes_transferred = bytes;
        self.speed_bps = speed_bps;
        self.touch();
        Ok(())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            direction: self.direction,
            principal: self.principal.clone(),
            state: self.state,
            progress_percent: self.percent(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            speed_bps: self.speed_bps,
            message: self.message.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use skyvault_protocol::ErrorKind;

    pub(crate) fn sample_content(size: u64) -> ContentRef {
        ContentRef {
            digest: "ab".repeat(32),
            size,
            location: format!("objects/ab/ab/{}", "ab".repeat(32)),
            registered_at: Utc::now(),
        }
    }

    fn download(size: u64) -> TransferTask {
        TransferTask::new_download("alice", sample_content(size), "downloads/out.bin")
    }

    fn result(task: &TransferTask) -> TransferResult {
        TransferResult {
            content: sample_content(task.total_bytes),
            destination: task.destination().map(str::to_string),
            duration_ms: 5,
            deduplicated: false,
        }
    }

    #[test]
    fn new_task_is_pending() {
        let task = download(100);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.percent(), 0);
        assert!(task.started_at.is_none());
        assert_eq!(task.direction, Direction::Download);
    }

    #[test]
    fn empty_task_is_complete_from_creation() {
        assert_eq!(download(0).percent(), 100);
    }

    #[test]
    fn start_requires_pending() {
        let mut task = download(100);
        task.start().unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert!(task.started_at.is_some());

        let err = task.start().unwrap_err();
        assert!(matches!(err, TransferError::InvalidState(_)));
        assert_eq!(task.state, TaskState::Running);
    }

    #[test]
    fn pause_resume_cycle() {
        let mut task = download(100);
        task.pause().unwrap();
        assert_eq!(task.state, TaskState::Paused);
        assert!(task.pause().is_err());
        task.resume().unwrap();
        assert_eq!(task.state, TaskState::Running);
        task.pause().unwrap();
        task.resume().unwrap();
        assert!(task.resume().is_err());
    }

    #[test]
    fn cancel_from_any_live_state() {
        for state in [TaskState::Pending, TaskState::Running, TaskState::Paused] {
            let mut task = download(100);
            match state {
                TaskState::Running => task.start().unwrap(),
                TaskState::Paused => task.pause().unwrap(),
                _ => {}
            }
            task.cancel().unwrap();
            assert_eq!(task.state, TaskState::Cancelled);
            assert!(task.completed_at.is_some());
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        let mut task = download(100);
        task.start().unwrap();
        let res = result(&task);
        task.complete(res).unwrap();

        assert!(task.start().is_err());
        assert!(task.pause().is_err());
        assert!(task.resume().is_err());
        assert!(task.cancel().is_err());
        assert!(task.record_progress(100, 0.0).is_err());
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn complete_requires_running() {
        let mut task = download(100);
        let res = result(&task);
        assert!(task.complete(res).is_err());
    }

    #[test]
    fn complete_fills_progress() {
        let mut task = download(100);
        task.start().unwrap();
        task.record_progress(40, 10.0).unwrap();
        let res = result(&task);
        task.complete(res).unwrap();
        assert_eq!(task.bytes_transferred, 100);
        assert_eq!(task.percent(), 100);
        assert!(task.result.is_some());
    }

    #[test]
    fn fail_records_error_detail() {
        let mut task = download(100);
        task.start().unwrap();
        task.fail(&TransferError::Interrupted("restart".into())).unwrap();
        assert_eq!(task.state, TaskState::Failed);
        let detail = task.error.as_ref().unwrap();
        assert_eq!(detail.kind, ErrorKind::Interrupted);
        assert!(!task.message.is_empty());
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let mut task = download(100);
        task.start().unwrap();
        task.record_progress(30, 0.0).unwrap();
        assert!(task.record_progress(20, 0.0).is_err());
        assert!(task.record_progress(101, 0.0).is_err());
        task.record_progress(30, 0.0).unwrap();
        task.record_progress(99, 0.0).unwrap();
        assert_eq!(task.percent(), 99);
    }

    #[test]
    fn json_roundtrip() {
        let mut task = TransferTask::new_upload("bob", "a.txt", 25, &"cd".repeat(32), "spool/x");
        task.start().unwrap();
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"kind\":\"upload\""));
        let parsed: TransferTask = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn snapshot_reflects_task() {
        let mut task = download(200);
        task.start().unwrap();
        task.record_progress(50, 1.5).unwrap();
        let snap = task.snapshot();
        assert_eq!(snap.task_id, task.id);
        assert_eq!(snap.progress_percent, 25);
        assert_eq!(snap.state, TaskState::Running);
        assert_eq!(snap.speed_bps, 1.5);
    }
}
