//! Per-task execution loop.
//!
//! One execution runs per task. It waits for a worker slot, then repeats a
//! chunk step (read, write, digest) followed by a progress commit until the
//! source is drained. Pause and cancel are observed between chunk steps; a
//! parked execution gives its slot back and holds no thread.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use skyvault_protocol::{ContentRef, TaskState, TransferResult};
use skyvault_transfer::{
    ChunkLedger, ChunkReader, DigestEngine, InitUploadOutcome, ObjectStore, SpeedCalculator,
    TransferError, calculate_checksum, checksum_bytes, expected_chunk_count,
};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

use crate::events::TransferEvent;
use crate::registry::ExecutionControl;
use crate::supervisor::Shared;
use crate::task::{TransferTarget, TransferTask};

/// Runs blocking store work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, TransferError>
where
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::Interrupted(format!("blocking task failed: {e}")))?
}

/// Entry point spawned by the supervisor for each started task.
pub(crate) async fn run(shared: Arc<Shared>, task_id: String, mut control: ExecutionControl) {
    let outcome = execute(&shared, &task_id, &mut control).await;
    settle(&shared, &task_id, outcome).await;
    shared.registry.remove(&task_id);
    control.mark_done();
}

/// Writes the final state for a failed or cancelled execution.
async fn settle(shared: &Shared, task_id: &str, outcome: Result<(), TransferError>) {
    let err = match outcome {
        Ok(()) => return,
        Err(e) => e,
    };

    let task = match shared.load(task_id) {
        Ok(t) => t,
        Err(e) => {
            error!(task = %task_id, error = %e, "task record vanished during execution");
            return;
        }
    };
    let cleanup = shared.discard_partial_with_retry(&task).await;

    let result = match (err, cleanup) {
        (TransferError::Cancelled, Ok(())) => {
            info!(task = %task_id, bytes = task.bytes_transferred, "transfer cancelled");
            shared.update(task_id, |t| t.cancel())
        }
        // Partial bytes are still there, so the task cannot claim Cancelled.
        (TransferError::Cancelled, Err(e)) => {
            error!(task = %task_id, error = %e, "cancelled transfer left partial output behind");
            shared.update(task_id, |t| t.fail(&e))
        }
        (e, cleanup) => {
            if let Err(c) = cleanup {
                warn!(task = %task_id, error = %c, "could not remove partial output");
            }
            error!(task = %task_id, error = %e, "transfer failed");
            shared.update(task_id, |t| t.fail(&e))
        }
    };
    if let Err(e) = result {
        warn!(task = %task_id, error = %e, "could not record final task state");
    }
}

async fn execute(
    shared: &Shared,
    task_id: &str,
    control: &mut ExecutionControl,
) -> Result<(), TransferError> {
    let mut slot = Some(acquire_slot(shared, control).await?);

    let task = shared.update(task_id, |t| match t.state {
        TaskState::Pending => t.start(),
        TaskState::Running => Ok(()),
        other => Err(TransferError::InvalidState(format!(
            "execution found task {} {other}",
            t.id
        ))),
    })?;
    info!(task = %task_id, direction = %task.direction, bytes = task.total_bytes, "transfer started");

    let began = Instant::now();
    let mut result = match &task.target {
        TransferTarget::Download {
            content,
            destination,
        } => download(shared, &task, content, destination, control, &mut slot).await?,
        TransferTarget::Upload {
            name,
            size,
            digest,
            source,
        } => {
            let request = IngestRequest {
                name: name.clone(),
                size: *size,
                digest: digest.clone(),
                source: source.clone(),
            };
            upload(shared, &task, request, control, &mut slot).await?
        }
    };
    result.duration_ms = began.elapsed().as_millis() as u64;

    loop {
        checkpoint(shared, control, &mut slot).await?;
        match shared.update(task_id, |t| t.complete(result.clone())) {
            Ok(done) => {
                info!(task = %task_id, bytes = done.total_bytes, ms = result.duration_ms, deduplicated = result.deduplicated, "transfer completed");
                return Ok(());
            }
            // Paused after the last chunk; park and finish on resume.
            Err(TransferError::InvalidState(_)) if control.is_paused() => continue,
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Slots and checkpoints
// ---------------------------------------------------------------------------

async fn acquire_slot(
    shared: &Shared,
    control: &mut ExecutionControl,
) -> Result<OwnedSemaphorePermit, TransferError> {
    loop {
        if control.is_paused() {
            control.wait_until_resumed().await?;
        }
        let permit = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = control.paused.wait_for(|p| *p) => continue,
            permit = Arc::clone(&shared.permits).acquire_owned() => permit
                .map_err(|_| TransferError::Interrupted("worker pool closed".into()))?,
        };
        control.check_cancelled()?;
        if control.is_paused() {
            continue;
        }
        return Ok(permit);
    }
}

/// Observes control state between chunk steps. Returns `true` if the
/// execution was parked.
async fn checkpoint(
    shared: &Shared,
    control: &mut ExecutionControl,
    slot: &mut Option<OwnedSemaphorePermit>,
) -> Result<bool, TransferError> {
    control.check_cancelled()?;
    if !control.is_paused() {
        return Ok(false);
    }

    slot.take();
    debug!("execution parked");
    control.wait_until_resumed().await?;
    *slot = Some(acquire_slot(shared, control).await?);
    debug!("execution unparked");
    Ok(true)
}

// ---------------------------------------------------------------------------
// Chunk pump
// ---------------------------------------------------------------------------

/// One direction's chunk step. Steps must be safe to repeat after a
/// failure: nothing advances unless the whole step succeeded.
trait Pipeline: Send + 'static {
    /// Moves one chunk. Returns the bytes it accounted for, or `None` once
    /// the source is drained.
    fn step(&mut self) -> Result<Option<u64>, TransferError>;

    /// Bytes accounted for so far.
    fn position(&self) -> u64;
}

async fn step_with_retry<P: Pipeline>(
    shared: &Shared,
    task_id: &str,
    mut pipeline: P,
    control: &ExecutionControl,
) -> Result<(P, Option<u64>), TransferError> {
    let mut attempt = 0;
    loop {
        let (p, res) = tokio::task::spawn_blocking(move || {
            let res = pipeline.step();
            (pipeline, res)
        })
        .await
        .map_err(|e| TransferError::Interrupted(format!("chunk step failed: {e}")))?;
        pipeline = p;

        match res {
            Ok(moved) => return Ok((pipeline, moved)),
            Err(e) => {
                attempt += 1;
                if !shared.retry.should_retry(&e, attempt) {
                    return Err(e);
                }
                let delay = shared.retry.delay_for_attempt(attempt);
                warn!(task = %task_id, attempt, error = %e, delay_ms = delay.as_millis() as u64, "chunk step failed; retrying");
                tokio::select! {
                    _ = control.cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Drives `pipeline` to the end, committing progress after every chunk.
async fn pump<P: Pipeline>(
    shared: &Shared,
    task: &TransferTask,
    mut pipeline: P,
    control: &mut ExecutionControl,
    slot: &mut Option<OwnedSemaphorePermit>,
) -> Result<P, TransferError> {
    let speed = SpeedCalculator::default();
    speed.record(0);
    let mut committed = task.bytes_transferred;

    loop {
        if checkpoint(shared, control, slot).await? {
            speed.reset();
            speed.record(0);
        }

        let (p, moved) = step_with_retry(shared, &task.id, pipeline, control).await?;
        pipeline = p;
        let Some(moved) = moved else {
            return Ok(pipeline);
        };
        speed.record(moved);

        let position = pipeline.position();
        if position <= committed {
            continue;
        }
        let bps = speed.bytes_per_second();
        let updated = shared.update(&task.id, |t| t.record_progress(position, bps))?;
        committed = position;
        shared.emit(TransferEvent::Progress {
            task_id: task.id.clone(),
            bytes_transferred: updated.bytes_transferred,
            total_bytes: updated.total_bytes,
            percent: updated.percent(),
            speed_bps: bps,
        });
    }
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

struct DownloadPipeline {
    reader: ChunkReader,
    store: Arc<dyn ObjectStore>,
    destination: String,
    hasher: DigestEngine,
}

impl DownloadPipeline {
    /// Opens the stored object and prepares the destination. A non-zero
    /// `resume_from` continues a partial destination whose prefix is
    /// re-hashed to rebuild the digest state.
    fn open(
        store: Arc<dyn ObjectStore>,
        content: &ContentRef,
        destination: &str,
        chunk_size: usize,
        resume_from: u64,
    ) -> Result<Self, TransferError> {
        let mut reader = ChunkReader::new(Arc::clone(&store), &content.location, chunk_size)?;
        if reader.total_size() != content.size {
            return Err(TransferError::Integrity {
                expected: format!("{} bytes at {}", content.size, content.location),
                actual: format!("{} bytes", reader.total_size()),
            });
        }

        let hasher = if resume_from == 0 {
            store.create(destination)?;
            DigestEngine::new()
        } else {
            let partial = store.size(destination)?.unwrap_or(0);
            if partial < resume_from {
                return Err(TransferError::Interrupted(format!(
                    "partial output {destination} holds {partial} bytes, expected {resume_from}"
                )));
            }
            calculate_checksum(Arc::clone(&store), destination, Some(resume_from), chunk_size)?
        };
        reader.seek_to(resume_from)?;

        Ok(Self {
            reader,
            store,
            destination: destination.to_string(),
            hasher,
        })
    }
}

impl Pipeline for DownloadPipeline {
    fn step(&mut self) -> Result<Option<u64>, TransferError> {
        let Some(chunk) = self.reader.peek_chunk()? else {
            return Ok(None);
        };
        self.store
            .write_at(&self.destination, chunk.offset, &chunk.data)?;
        self.hasher.update(&chunk.data);
        self.reader.advance(chunk.len());
        Ok(Some(chunk.len() as u64))
    }

    fn position(&self) -> u64 {
        self.reader.offset()
    }
}

async fn download(
    shared: &Shared,
    task: &TransferTask,
    content: &ContentRef,
    destination: &str,
    control: &mut ExecutionControl,
    slot: &mut Option<OwnedSemaphorePermit>,
) -> Result<TransferResult, TransferError> {
    let result = TransferResult {
        content: content.clone(),
        destination: Some(destination.to_string()),
        duration_ms: 0,
        deduplicated: false,
    };

    if content.size == 0 {
        let actual = checksum_bytes(&[]);
        if actual != content.digest {
            return Err(TransferError::Integrity {
                expected: content.digest.clone(),
                actual,
            });
        }
        let store = Arc::clone(&shared.store);
        let dest = destination.to_string();
        blocking(move || store.create(&dest)).await?;
        return Ok(result);
    }

    let store = Arc::clone(&shared.store);
    let (c, dest) = (content.clone(), destination.to_string());
    let chunk_size = shared.transfer_chunk_size;
    let resume_from = task.bytes_transferred;
    let pipeline =
        blocking(move || DownloadPipeline::open(store, &c, &dest, chunk_size, resume_from)).await?;
    if resume_from > 0 {
        debug!(task = %task.id, offset = resume_from, "download continuing from partial output");
    }

    let pipeline = pump(shared, task, pipeline, control, slot).await?;
    let actual = pipeline.hasher.finalize_hex();
    if actual != content.digest {
        return Err(TransferError::Integrity {
            expected: content.digest.clone(),
            actual,
        });
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

struct IngestRequest {
    name: String,
    size: u64,
    digest: String,
    source: String,
}

/// Feeds spooled bytes through the chunk ledger. Chunks the session
/// already holds are skipped without being read.
struct UploadPipeline {
    reader: ChunkReader,
    ledger: Arc<ChunkLedger>,
    session_id: String,
    received: BTreeSet<u32>,
    chunk_size: u64,
}

impl Pipeline for UploadPipeline {
    fn step(&mut self) -> Result<Option<u64>, TransferError> {
        let remaining = self.reader.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let index = (self.reader.offset() / self.chunk_size) as u32;
        if self.received.contains(&index) {
            let len = remaining.min(self.chunk_size);
            self.reader.advance(len as usize);
            return Ok(Some(len));
        }

        let Some(chunk) = self.reader.peek_chunk()? else {
            return Ok(None);
        };
        self.ledger.put_chunk(&self.session_id, index, &chunk.data)?;
        self.received.insert(index);
        self.reader.advance(chunk.len());
        Ok(Some(chunk.len() as u64))
    }

    fn position(&self) -> u64 {
        self.reader.offset()
    }
}

async fn upload(
    shared: &Shared,
    task: &TransferTask,
    request: IngestRequest,
    control: &mut ExecutionControl,
    slot: &mut Option<OwnedSemaphorePermit>,
) -> Result<TransferResult, TransferError> {
    // Nothing is staged until the space is reserved.
    shared.quota.reserve(&task.principal, request.size)?;

    let ingested = ingest(shared, task, &request, control, slot).await;
    match &ingested {
        Ok(result) if !result.deduplicated => {}
        _ => shared.quota.release(&task.principal, request.size),
    }
    ingested
}

async fn ingest(
    shared: &Shared,
    task: &TransferTask,
    request: &IngestRequest,
    control: &mut ExecutionControl,
    slot: &mut Option<OwnedSemaphorePermit>,
) -> Result<TransferResult, TransferError> {
    let ledger = Arc::clone(&shared.ledger);
    let chunk_count = expected_chunk_count(request.size, ledger.chunk_size()) as u32;
    let (owner, name, digest, size) = (
        task.id.clone(),
        request.name.clone(),
        request.digest.clone(),
        request.size,
    );
    let outcome = blocking(move || {
        ledger.init_owned_upload(&owner, &name, size, &digest, chunk_count)
    })
    .await?;

    let info = match outcome {
        InitUploadOutcome::AlreadySatisfied(object) => {
            info!(task = %task.id, digest = %object.digest, "content already stored; upload skipped");
            return Ok(TransferResult {
                content: object.to_ref(),
                destination: None,
                duration_ms: 0,
                deduplicated: true,
            });
        }
        InitUploadOutcome::Created(info) | InitUploadOutcome::Resumed(info) => info,
    };

    let store = Arc::clone(&shared.store);
    let ledger = Arc::clone(&shared.ledger);
    let source = request.source.clone();
    let (sid, received) = (info.session_id.clone(), info.received);
    let pipeline = blocking(move || {
        let chunk_size = ledger.chunk_size();
        let reader = ChunkReader::new(store, &source, chunk_size as usize)?;
        if reader.total_size() != size {
            return Err(TransferError::InvalidRequest(format!(
                "source {source} holds {} bytes, declared {size}",
                reader.total_size()
            )));
        }
        Ok(UploadPipeline {
            reader,
            ledger,
            session_id: sid,
            received: received.into_iter().collect(),
            chunk_size,
        })
    })
    .await?;

    pump(shared, task, pipeline, control, slot).await?;

    let ledger = Arc::clone(&shared.ledger);
    let sid = info.session_id;
    let done = blocking(move || ledger.complete_upload(&sid)).await?;
    Ok(TransferResult {
        content: done.content.to_ref(),
        destination: None,
        duration_ms: 0,
        deduplicated: done.deduplicated,
    })
}
