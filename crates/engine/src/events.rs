use skyvault_protocol::TaskState;

/// Events emitted by the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A task entered a new lifecycle state.
    StateChanged { task_id: String, state: TaskState },
    /// A chunk was committed.
    Progress {
        task_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
        percent: u8,
        speed_bps: f64,
    },
    /// A task record was removed.
    Deleted { task_id: String },
}

impl TransferEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TransferEvent::StateChanged { task_id, .. }
            | TransferEvent::Progress { task_id, .. }
            | TransferEvent::Deleted { task_id } => task_id,
        }
    }
}
