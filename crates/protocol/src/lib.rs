pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{
    ChunkAck, CompleteUploadResponse, InitUploadRequest, InitUploadResponse, InitUploadStatus,
    TaskSnapshot, TransferResult,
};
pub use types::{
    ContentRef, ControlAction, Direction, ErrorDetail, ErrorKind, ParseEnumError,
    StateStatistics, TaskState, percent_of,
};
