use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ContentRef, Direction, ErrorDetail, TaskState};

// ---------------------------------------------------------------------------
// Chunked upload
// ---------------------------------------------------------------------------

/// Request to open (or reopen) a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub name: String,
    pub size: u64,
    pub digest: String,
    pub chunk_count: u32,
}

/// How an upload init request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitUploadStatus {
    /// A fresh session was opened.
    #[serde(rename = "created")]
    Created,
    /// An existing session for the same content was returned unchanged.
    #[serde(rename = "resumed")]
    Resumed,
    /// The content is already stored; no bytes need to be sent.
    #[serde(rename = "already_exists")]
    AlreadyExists,
}

/// Response to [`InitUploadRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub status: InitUploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub chunk_size: u64,
    pub chunk_count: u32,
    /// Chunk indices already held by a resumed session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub received: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentRef>,
}

/// Acknowledgement of a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub session_id: String,
    pub index: u32,
    pub received_count: u32,
    pub chunk_count: u32,
}

/// Result of finishing a chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub content: ContentRef,
    /// `true` when identical content was already stored and reused.
    pub deduplicated: bool,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Outcome data attached to a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub content: ContentRef,
    /// Where a download wrote its bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub deduplicated: bool,
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub direction: Direction,
    pub principal: String,
    pub state: TaskState,
    pub progress_percent: u8,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub speed_bps: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TransferResult>,
}
