//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use blake2::Digest;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::build::Build;
use crate::coordinator::Coordinator;
use crate::coordinator::Project;
use crate::job::JobStatus;
use crate::proto::Message;
use crate::proto::MultipartCodec;
use crate::proto::messages::ArtifactMessage;
use crate::proto::messages::ChunkMessage;
use crate::proto::messages::JobCompletionMessage;
use crate::proto::messages::LogMessage;
use crate::proto::net::Listener;

pub mod chunks;

/// Serve the intake socket.
///
/// Connections fan into one processing task; handling stays strictly
/// sequential, so per-stream chunk ordering and the single-writer rule on
/// build state both hold without further ceremony.
pub async fn intake_loop(coordinator: Arc<Coordinator>, listener: Listener) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Vec<Bytes>>(64);

    let processor = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while let Some(frames) = rx.recv().await {
                if let Err(e) = process(&coordinator, &frames).await {
                    debug!("intake pipe error, continuing: {:#}", e);
                }
            }
        })
    };

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("intake accept error, aborting: {:#}", e);
                break;
            }
        };
        trace!("intake connection from {}", peer);
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(stream, MultipartCodec);
            while let Some(message) = frames.next().await {
                match message {
                    Ok(parts) => {
                        if tx.send(parts).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("intake read error from {}: {:#}", peer, e);
                        return;
                    }
                }
            }
        });
    }

    drop(tx);
    let _ = processor.await;
    Ok(())
}

async fn process(coordinator: &Arc<Coordinator>, frames: &[Bytes]) -> Result<()> {
    let [tag, body] = frames else {
        return Err(anyhow!("Intake message with {} frames", frames.len()));
    };
    match std::str::from_utf8(tag)? {
        "chunk" => cmd_chunk(coordinator, body),
        "artifact" => cmd_artifact(coordinator, body).await,
        "log" => cmd_log(coordinator, body),
        "job" => cmd_job(coordinator, body).await,
        other => Err(anyhow!("Unknown intake tag '{}'", other)),
    }
}

fn cmd_chunk(coordinator: &Coordinator, body: &[u8]) -> Result<()> {
    let chunk = ChunkMessage::unpack(body)?;
    coordinator.chunks().ingest(body, &chunk)
}

/// Record an artifact that finished uploading (or failed on the worker).
async fn cmd_artifact(coordinator: &Arc<Coordinator>, body: &[u8]) -> Result<()> {
    let message = ArtifactMessage::unpack(body)?;
    debug!(
        "received artifact {} {} (success: {})",
        message.artifact_type, message.artifact, message.success
    );

    let project = match coordinator.project(&message.project) {
        Some(project) => project.clone(),
        None => return Ok(()),
    };
    let build = match project.current_build() {
        Some(build) => build,
        None => return Ok(()),
    };

    // flip the status bits first; everything else is filesystem work
    let artifact = {
        let mut inner = build.inner.lock().await;
        let id = match inner.set_for(message.artifact_type).get(&message.artifact) {
            Some(id) => *id,
            None => return Ok(()),
        };
        let artifact = inner.artifact_mut(id);
        artifact.received = true;
        artifact.failed = !message.success;
        artifact.clone()
    };

    if !message.success {
        finish_artifact(&build, &message.artifact, false).await;
        return Ok(());
    }

    // validated: success implies filename and last_hash are present
    let filename = message.filename.as_deref().unwrap_or_default();
    let last_hash: &[u8] = message.last_hash.as_ref().map(|h| &h[..]).unwrap_or(&[]);

    let stream = match coordinator.chunks().take(last_hash) {
        Some(stream) => stream,
        None => {
            warn!(
                "artifact {} without a matching chunk stream, dropping",
                message.artifact
            );
            mark_failed(&build, &message).await;
            finish_artifact(&build, &message.artifact, false).await;
            return Ok(());
        }
    };
    let staging_path = stream.path.clone();

    // best effort, never blocks the deposit
    if let Some(db) = coordinator.db() {
        let db = db.clone();
        let digest = stream.hasher.clone().finalize().to_vec();
        let artifact = artifact.clone();
        let (name, ts) = (build.name().clone(), *build.ts());
        let recorded = tokio::task::spawn_blocking(move || {
            db.record(
                &name,
                ts,
                artifact.kind,
                &artifact.name,
                artifact.version().unwrap_or(""),
                &digest,
            )
        })
        .await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("failed to record artifact into history: {:#}", e),
            Err(e) => error!("artifact history task failed: {:#}", e),
        }
    }

    let deposited =
        crate::filestore::deposit(&project, &build, &artifact, stream, filename).await;
    if let Err(e) = deposited {
        error!("artifact deposit failed: {:#}", e);
        mark_failed(&build, &message).await;
    }

    // the staging file is gone after a successful move
    match std::fs::remove_file(&staging_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("leftover staging file {}: {}", staging_path.display(), e),
    }

    finish_artifact(&build, &message.artifact, true).await;
    Ok(())
}

async fn mark_failed(build: &Build, message: &ArtifactMessage) {
    let mut inner = build.inner.lock().await;
    if let Some(id) = inner
        .set_for(message.artifact_type)
        .get(&message.artifact)
        .copied()
    {
        inner.artifact_mut(id).failed = true;
    }
}

/// Wake the solver and refresh the status snapshot.
async fn finish_artifact(build: &Build, artifact: &str, deposited: bool) {
    trace!("artifact {} done (deposited: {})", artifact, deposited);
    build.artifact_received.notify_one();
    let inner = build.inner.lock().await;
    if !inner.state.terminating() {
        if let Err(e) = build.store_status(&inner) {
            error!("storing status failed: {:#}", e);
        }
    }
}

/// Append one line to the per-job log of the running build.
fn cmd_log(coordinator: &Coordinator, body: &[u8]) -> Result<()> {
    let message = LogMessage::unpack(body)?;
    let project = match coordinator.project(&message.project) {
        Some(project) => project,
        None => return Ok(()),
    };
    let build = match project.current_build() {
        Some(build) => build,
        None => {
            info!(
                "dropped log because project {} was not running",
                message.project
            );
            return Ok(());
        }
    };

    let path = build.log_path(&message.job);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| anyhow!("Opening log {}", path.display()))?;
    file.write_all(message.line.as_bytes())
        .with_context(|| anyhow!("Appending to {}", path.display()))
}

/// A worker finished (or gave up on) a job: set its terminal status.
async fn cmd_job(coordinator: &Arc<Coordinator>, body: &[u8]) -> Result<()> {
    let message = JobCompletionMessage::unpack(body)?;
    debug!("got job message for {}/{}", message.project, message.job);

    let project: Arc<Project> = match coordinator.project(&message.project) {
        Some(project) => project.clone(),
        None => return Ok(()),
    };
    let build = match project.current_build() {
        Some(build) => build,
        None => return Ok(()),
    };

    {
        let mut inner = build.inner.lock().await;
        let job = match inner.jobs.get_mut(&message.job) {
            Some(job) => job,
            None => return Err(anyhow!("Completion for unknown job '{}'", message.job)),
        };
        job.status = if message.exit_code == 0 {
            JobStatus::Success
        } else if job.unstable {
            JobStatus::IgnoredFailure
        } else {
            JobStatus::Failed
        };
        job.exit_code = Some(message.exit_code);
        job.run_time = Some(message.run_time);

        let info = serde_json::to_vec_pretty(&message)?;
        let path = build.info_path(&message.job);
        std::fs::write(&path, info)
            .with_context(|| anyhow!("Writing {}", path.display()))?;

        if !inner.state.terminating() {
            build.store_status(&inner)?;
        }
    }

    build.artifact_received.notify_one();
    Ok(())
}
