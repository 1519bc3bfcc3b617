//! Inbound surface of the engine.
//!
//! `TransferService` wires the store, index, ledger, task store and
//! supervisor together and exposes the operations a request handler needs.
//! Store and ledger work runs on blocking threads.

use std::sync::Arc;

use skyvault_protocol::{
    ChunkAck, CompleteUploadResponse, ContentRef, ControlAction, InitUploadRequest,
    InitUploadResponse, InitUploadStatus, StateStatistics, TaskSnapshot, TaskState,
};
use skyvault_transfer::{
    ChunkLedger, ContentIndex, InitUploadOutcome, LocalStore, ObjectStore, SessionInfo,
    TransferError, normalize_digest,
};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::EngineConfig;
use crate::events::TransferEvent;
use crate::executor::blocking;
use crate::quota::{FixedQuota, Quota, Unlimited};
use crate::supervisor::{Supervisor, SupervisorParts};
use crate::task_store::{JsonTaskStore, TaskStore};

/// A transfer to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateTransfer {
    /// Copy stored content to `destination`, or to a per-task default.
    Download {
        digest: String,
        size: u64,
        destination: Option<String>,
    },
    /// Ingest bytes already spooled at `source`.
    Upload {
        name: String,
        size: u64,
        digest: String,
        source: String,
    },
}

pub struct TransferService {
    supervisor: Supervisor,
    store: Arc<dyn ObjectStore>,
    index: Arc<ContentIndex>,
    ledger: Arc<ChunkLedger>,
}

impl TransferService {
    /// Opens the on-disk layout under `config.data_dir`.
    pub fn open(config: &EngineConfig) -> Result<Self, TransferError> {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(config.store_dir())?);
        let index = Arc::new(ContentIndex::open(Arc::clone(&store), &config.index_path())?);
        let tasks: Arc<dyn TaskStore> = Arc::new(JsonTaskStore::new(config.tasks_dir())?);
        let quota: Arc<dyn Quota> = match config.quota.bytes_per_principal {
            Some(limit) => Arc::new(FixedQuota::new(limit)),
            None => Arc::new(Unlimited),
        };
        info!(data_dir = %config.data_dir.display(), objects = index.len(), "transfer service opened");
        Ok(Self::from_parts(store, index, tasks, quota, config))
    }

    /// Builds a service over caller-supplied collaborators.
    pub fn from_parts(
        store: Arc<dyn ObjectStore>,
        index: Arc<ContentIndex>,
        tasks: Arc<dyn TaskStore>,
        quota: Arc<dyn Quota>,
        config: &EngineConfig,
    ) -> Self {
        let ledger = Arc::new(ChunkLedger::new(
            Arc::clone(&store),
            Arc::clone(&index),
            config.chunk_size,
        ));
        let supervisor = Supervisor::new(
            SupervisorParts {
                store: Arc::clone(&store),
                tasks,
                index: Arc::clone(&index),
                ledger: Arc::clone(&ledger),
                quota,
            },
            config,
        );
        Self {
            supervisor,
            store,
            index,
            ledger,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<ChunkLedger> {
        &self.ledger
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Creates a pending task and returns its ID. The task does not run
    /// until started.
    pub fn create_transfer(
        &self,
        principal: &str,
        request: CreateTransfer,
    ) -> Result<String, TransferError> {
        let snapshot = match request {
            CreateTransfer::Download {
                digest,
                size,
                destination,
            } => self
                .supervisor
                .create_download(principal, &digest, size, destination.as_deref())?,
            CreateTransfer::Upload {
                name,
                size,
                digest,
                source,
            } => self
                .supervisor
                .create_upload(principal, &name, size, &digest, &source)?,
        };
        Ok(snapshot.task_id)
    }

    pub async fn control(
        &self,
        task_id: &str,
        action: ControlAction,
    ) -> Result<TaskSnapshot, TransferError> {
        self.supervisor.signal(task_id, action).await
    }

    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        self.supervisor.status(task_id)
    }

    pub fn list(
        &self,
        principal: Option<&str>,
        state: Option<TaskState>,
    ) -> Result<Vec<TaskSnapshot>, TransferError> {
        self.supervisor.list(principal, state)
    }

    pub fn statistics(&self, principal: Option<&str>) -> Result<Vec<StateStatistics>, TransferError> {
        self.supervisor.statistics(principal)
    }

    pub async fn wait(&self, task_id: &str) -> Result<TaskSnapshot, TransferError> {
        self.supervisor.wait(task_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.supervisor.subscribe()
    }

    // -----------------------------------------------------------------------
    // Chunked uploads
    // -----------------------------------------------------------------------

    pub async fn init_upload(
        &self,
        request: InitUploadRequest,
    ) -> Result<InitUploadResponse, TransferError> {
        let ledger = Arc::clone(&self.ledger);
        let chunk_size = ledger.chunk_size();
        let outcome = blocking(move || {
            ledger.init_upload(
                &request.name,
                request.size,
                &request.digest,
                request.chunk_count,
            )
        })
        .await?;

        Ok(match outcome {
            InitUploadOutcome::AlreadySatisfied(object) => InitUploadResponse {
                status: InitUploadStatus::AlreadyExists,
                session_id: None,
                chunk_size,
                chunk_count: 0,
                received: Vec::new(),
                content: Some(object.to_ref()),
            },
            InitUploadOutcome::Created(info) => session_response(InitUploadStatus::Created, info),
            InitUploadOutcome::Resumed(info) => session_response(InitUploadStatus::Resumed, info),
        })
    }

    pub async fn put_chunk(
        &self,
        session_id: &str,
        index: u32,
        data: Vec<u8>,
    ) -> Result<ChunkAck, TransferError> {
        let ledger = Arc::clone(&self.ledger);
        let session_id = session_id.to_string();
        blocking(move || ledger.put_chunk(&session_id, index, &data)).await
    }

    pub async fn complete_upload(
        &self,
        session_id: &str,
    ) -> Result<CompleteUploadResponse, TransferError> {
        let ledger = Arc::clone(&self.ledger);
        let session_id = session_id.to_string();
        let done = blocking(move || ledger.complete_upload(&session_id)).await?;
        Ok(CompleteUploadResponse {
            content: done.content.to_ref(),
            deduplicated: done.deduplicated,
        })
    }

    pub async fn abort_upload(&self, session_id: &str) -> Result<(), TransferError> {
        let ledger = Arc::clone(&self.ledger);
        let session_id = session_id.to_string();
        blocking(move || ledger.abort_upload(&session_id)).await
    }

    /// Looks up stored content without opening a session.
    pub fn check_content(&self, digest: &str, size: u64) -> Result<Option<ContentRef>, TransferError> {
        let digest = normalize_digest(digest)?;
        Ok(self.index.lookup(&digest, size).map(|o| o.to_ref()))
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    pub async fn recover(&self) -> Result<Vec<String>, TransferError> {
        self.supervisor.recover().await
    }

    pub fn prune_finished(&self, older_than: chrono::Duration) -> Result<Vec<String>, TransferError> {
        self.supervisor.prune_finished(older_than)
    }

    /// Drops upload sessions idle for longer than `config.session_idle_secs`.
    pub async fn reclaim_idle_sessions(
        &self,
        config: &EngineConfig,
    ) -> Result<Vec<String>, TransferError> {
        let ledger = Arc::clone(&self.ledger);
        let window = config.session_idle_window();
        blocking(move || ledger.reclaim_idle(window)).await
    }
}

fn session_response(status: InitUploadStatus, info: SessionInfo) -> InitUploadResponse {
    InitUploadResponse {
        status,
        session_id: Some(info.session_id),
        chunk_size: info.chunk_size,
        chunk_count: info.chunk_count,
        received: info.received,
        content: None,
    }
}
