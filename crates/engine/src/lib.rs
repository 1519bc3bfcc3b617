//! Transfer engine: task lifecycle, bounded scheduling, pause/resume/cancel
//! routing and crash recovery on top of `skyvault-transfer`.

pub mod config;
pub mod events;
mod executor;
pub mod quota;
pub mod registry;
pub mod retry;
pub mod service;
pub mod supervisor;
pub mod task;
pub mod task_store;

pub use config::{EngineConfig, QuotaSettings, RetrySettings};
pub use events::TransferEvent;
pub use quota::{FixedQuota, Quota, Unlimited};
pub use registry::{ExecutionHandle, ExecutionRegistry};
pub use retry::RetryPolicy;
pub use service::{CreateTransfer, TransferService};
pub use skyvault_transfer::TransferError;
pub use supervisor::{Supervisor, SupervisorParts};
pub use task::{TransferTarget, TransferTask};
pub use task_store::{JsonTaskStore, MemoryTaskStore, TaskStore};
