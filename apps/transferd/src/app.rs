//! Command dispatch: opens the engine and runs one command against it.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use skyvault_engine::{CreateTransfer, TransferEvent, TransferService};
use skyvault_protocol::{ControlAction, InitUploadRequest, InitUploadStatus, TaskSnapshot, TaskState};
use skyvault_transfer::{ChunkReader, DigestEngine, expected_chunk_count};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Command;
use crate::config::Config;

pub async fn run(config: Config, command: Command) -> anyhow::Result<()> {
    let service = TransferService::open(&config.engine)?;

    let interrupted = service.recover().await?;
    if !interrupted.is_empty() {
        warn!(count = interrupted.len(), "tasks interrupted by the last shutdown were failed");
    }

    match command {
        Command::Upload { file, name, task } => {
            let name = match name {
                Some(n) => n,
                None => file_name(&file)?,
            };
            if task {
                let snapshot = upload_as_task(&service, &config, &file, &name).await?;
                print_json(&snapshot)
            } else {
                upload_chunked(&service, &file, &name).await
            }
        }
        Command::Download { digest, size, out } => {
            let snapshot = download(&service, &config, &digest, size, out.as_deref()).await?;
            print_json(&snapshot)
        }
        Command::Check { digest, size } => match service.check_content(&digest, size)? {
            Some(content) => print_json(&content),
            None => anyhow::bail!("no stored content {digest} ({size} bytes)"),
        },
        Command::Status { task_id } => print_json(&service.status(&task_id)?),
        Command::List { state, principal } => {
            let state = state.map(|s| s.parse::<TaskState>()).transpose()?;
            print_json(&service.list(principal.as_deref(), state)?)
        }
        Command::Stats { principal } => print_json(&service.statistics(principal.as_deref())?),
        Command::Control { task_id, action } => {
            let action: ControlAction = action.parse()?;
            let snapshot = service.control(&task_id, action).await?;
            if action == ControlAction::Start || action == ControlAction::Resume {
                let follower = follow(service.subscribe(), task_id.clone());
                let snapshot = service.wait(&task_id).await?;
                follower.abort();
                return print_json(&snapshot);
            }
            print_json(&snapshot)
        }
        Command::Prune { days } => {
            let pruned = service.prune_finished(chrono::Duration::days(days))?;
            info!(count = pruned.len(), days, "pruned finished tasks");
            print_json(&pruned)
        }
        Command::Reclaim => {
            let reclaimed = service.reclaim_idle_sessions(&config.engine).await?;
            print_json(&reclaimed)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("cannot derive a file name from {}", path.display()))
}

/// Logs progress for one task until it reaches a terminal state.
fn follow(mut events: broadcast::Receiver<TransferEvent>, task_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransferEvent::Progress {
                    task_id: id,
                    bytes_transferred,
                    total_bytes,
                    percent,
                    speed_bps,
                }) if id == task_id => {
                    info!(task = %id, percent, bytes = bytes_transferred, total = total_bytes, bps = speed_bps as u64, "progress");
                }
                Ok(TransferEvent::StateChanged { task_id: id, state }) if id == task_id => {
                    info!(task = %id, state = %state, "state changed");
                    if state.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress follower lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

async fn hash_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut engine = DigestEngine::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        engine.update(&buf[..n]);
    }
    let size = engine.bytes_hashed();
    Ok((engine.finalize_hex(), size))
}

async fn read_range(file: &mut tokio::fs::File, offset: u64, len: usize) -> anyhow::Result<Vec<u8>> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Client side of the chunked upload protocol.
async fn upload_chunked(service: &TransferService, path: &Path, name: &str) -> anyhow::Result<()> {
    let (digest, size) = hash_file(path).await?;
    let chunk_size = service.ledger().chunk_size();
    let chunk_count = expected_chunk_count(size, chunk_size) as u32;

    let init = service
        .init_upload(InitUploadRequest {
            name: name.to_string(),
            size,
            digest: digest.clone(),
            chunk_count,
        })
        .await?;
    if init.status == InitUploadStatus::AlreadyExists {
        info!(digest = %digest, "content already stored; nothing to send");
        return print_json(&init);
    }
    let session_id = init
        .session_id
        .ok_or_else(|| anyhow::anyhow!("upload init returned no session"))?;

    let mut file = tokio::fs::File::open(path).await?;
    for index in 0..chunk_count {
        if init.received.contains(&index) {
            continue;
        }
        let offset = index as u64 * chunk_size;
        let len = (size - offset).min(chunk_size) as usize;
        let data = read_range(&mut file, offset, len).await?;
        let ack = service.put_chunk(&session_id, index, data).await?;
        debug!(session = %session_id, index, received = ack.received_count, total = ack.chunk_count, "chunk sent");
    }

    let done = service.complete_upload(&session_id).await?;
    info!(digest = %done.content.digest, deduplicated = done.deduplicated, "upload complete");
    print_json(&done)
}

/// Spools the file into the store, then ingests it through an upload task.
async fn upload_as_task(
    service: &TransferService,
    config: &Config,
    path: &Path,
    name: &str,
) -> anyhow::Result<TaskSnapshot> {
    let (digest, size) = hash_file(path).await?;
    let spool = format!("spool/{}", uuid::Uuid::new_v4());
    let store = Arc::clone(service.store());

    store.create(&spool)?;
    let mut file = tokio::fs::File::open(path).await?;
    let step = config.engine.transfer_chunk_size.max(1) as u64;
    let mut offset = 0;
    while offset < size {
        let len = (size - offset).min(step) as usize;
        let data = read_range(&mut file, offset, len).await?;
        store.write_at(&spool, offset, &data)?;
        offset += len as u64;
    }

    let outcome = run_task(
        service,
        &config.principal,
        CreateTransfer::Upload {
            name: name.to_string(),
            size,
            digest,
            source: spool.clone(),
        },
    )
    .await;
    if let Err(e) = store.delete(&spool) {
        warn!(location = %spool, error = %e, "could not remove spooled upload");
    }
    outcome
}

// ---------------------------------------------------------------------------
// Downloads
// ---------------------------------------------------------------------------

async fn download(
    service: &TransferService,
    config: &Config,
    digest: &str,
    size: u64,
    out: Option<&Path>,
) -> anyhow::Result<TaskSnapshot> {
    let snapshot = run_task(
        service,
        &config.principal,
        CreateTransfer::Download {
            digest: digest.to_string(),
            size,
            destination: None,
        },
    )
    .await?;

    let destination = snapshot
        .result
        .as_ref()
        .and_then(|r| r.destination.clone());
    if let (Some(out), Some(destination)) = (out, destination) {
        let store = Arc::clone(service.store());
        let out = out.to_path_buf();
        let chunk_size = config.engine.transfer_chunk_size;
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            use std::io::Write;

            let mut reader = ChunkReader::new(store, &destination, chunk_size)?;
            let mut file = std::fs::File::create(&out)?;
            while let Some(chunk) = reader.next_chunk()? {
                file.write_all(&chunk.data)?;
            }
            file.sync_all()?;
            info!(path = %out.display(), "download copied out");
            Ok(())
        })
        .await??;
    }
    Ok(snapshot)
}

/// Creates a task, starts it and waits for it to finish.
async fn run_task(
    service: &TransferService,
    principal: &str,
    request: CreateTransfer,
) -> anyhow::Result<TaskSnapshot> {
    let task_id = service.create_transfer(principal, request)?;
    let follower = follow(service.subscribe(), task_id.clone());
    service.control(&task_id, ControlAction::Start).await?;
    let snapshot = service.wait(&task_id).await?;
    follower.abort();

    if snapshot.state != TaskState::Completed {
        let reason = snapshot
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| snapshot.state.to_string());
        anyhow::bail!("task {task_id} ended {}: {reason}", snapshot.state);
    }
    Ok(snapshot)
}
