//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use getset::Getters;
use itertools::Itertools;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::build::Build;
use crate::config::CoordinatorConfig;
use crate::db::ArtifactHistory;
use crate::endpoint::JobQueue;
use crate::intake::chunks::ChunkTable;
use crate::job::fail_job;
use crate::job::JobStatus;
use crate::orchestrator::BuildDriver;
use crate::proto::Message;
use crate::proto::MultipartCodec;
use crate::proto::messages::BuildMessage;
use crate::proto::messages::ProjectStatus;
use crate::proto::messages::StatusMessage;
use crate::proto::messages::pack_str;
use crate::proto::messages::unpack_str;
use crate::proto::net::Listener;
use crate::proto::net::Stream;

mod project;

pub use project::Project;

/// The coordinator singleton: projects, shared dispatch queue, chunk
/// reassembly and the optional artifact history.
#[derive(Getters)]
pub struct Coordinator {
    #[getset(get = "pub")]
    project_base: PathBuf,

    #[getset(get = "pub")]
    tmp_dir: PathBuf,

    /// Absolute build root used by workers for this deployment.
    #[getset(get = "pub")]
    build_root: PathBuf,

    /// Intake address as workers can reach it; carried in every job message.
    #[getset(get = "pub")]
    intake_address: String,

    projects: HashMap<String, Arc<Project>>,
    queue: JobQueue,
    chunks: ChunkTable,
    db: Option<Arc<ArtifactHistory>>,
    builds: tokio::sync::Mutex<JoinSet<()>>,
}

impl Coordinator {
    pub fn create(cfg: &CoordinatorConfig) -> Result<Arc<Self>> {
        let project_base = cfg.project_base().clone();
        let collection_dir = project_base.join("_coldir");
        let tmp_dir = project_base.join("_tmp");
        std::fs::create_dir_all(&collection_dir)
            .with_context(|| anyhow!("Creating {}", collection_dir.display()))?;
        std::fs::create_dir_all(&tmp_dir)
            .with_context(|| anyhow!("Creating {}", tmp_dir.display()))?;

        let mut projects = HashMap::new();
        for (name, pcfg) in cfg.projects() {
            let project = Project::from_config(name, pcfg, &project_base);
            std::fs::create_dir_all(project.base())
                .with_context(|| anyhow!("Creating {}", project.base().display()))?;
            debug!("got project {:?}", project);
            projects.insert(name.clone(), Arc::new(project));
        }

        let db = match cfg.artifact_history() {
            Some(url) => match ArtifactHistory::connect(url) {
                Ok(db) => Some(Arc::new(db)),
                Err(e) => {
                    error!("artifact history unavailable, continuing without: {:#}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Arc::new(Coordinator {
            project_base,
            tmp_dir,
            build_root: cfg.build_root().clone(),
            intake_address: cfg.intake().connect().to_string(),
            projects,
            queue: JobQueue::new(1),
            chunks: ChunkTable::new(collection_dir),
            db,
            builds: tokio::sync::Mutex::new(JoinSet::new()),
        }))
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn chunks(&self) -> &ChunkTable {
        &self.chunks
    }

    pub fn db(&self) -> Option<&Arc<ArtifactHistory>> {
        self.db.as_ref()
    }

    pub fn project(&self, name: &str) -> Option<&Arc<Project>> {
        self.projects.get(name)
    }

    pub fn projects(&self) -> &HashMap<String, Arc<Project>> {
        &self.projects
    }

    /// Handle one `[command, arg]` exchange from the command socket.
    pub async fn dispatch_command(self: &Arc<Self>, frames: &[Bytes]) -> (u16, Vec<u8>) {
        if frames.len() != 2 {
            return (400, pack_str("malformed request"));
        }
        let command = match std::str::from_utf8(&frames[0]) {
            Ok(c) => c,
            Err(_) => return (400, pack_str("command is not ascii")),
        };
        match command {
            "build" => self.cmd_build(&frames[1]).await,
            "fail" => self.cmd_fail(&frames[1]).await,
            "status" => self.cmd_status().await,
            _ => (400, pack_str("no such command")),
        }
    }

    async fn cmd_build(self: &Arc<Self>, arg: &[u8]) -> (u16, Vec<u8>) {
        let msg = match BuildMessage::unpack(arg) {
            Ok(msg) => msg,
            Err(e) => return (400, pack_str(&format!("ValidationError: {:#}", e))),
        };
        let project = match self.projects.get(&msg.project) {
            Some(project) => project.clone(),
            None => return (404, pack_str("unknown project")),
        };

        let incremental = msg.incremental.unwrap_or_else(|| project.incremental());
        let build = {
            let mut current = match project.current.lock() {
                Ok(current) => current,
                Err(_) => return (500, pack_str("project lock poisoned")),
            };
            if current.is_some() {
                return (409, pack_str("project already running"));
            }
            let build = match Build::create(
                project.base(),
                project.name(),
                project.git(),
                incremental,
            ) {
                Ok(build) => build,
                Err(e) => {
                    error!("failed to create build: {:#}", e);
                    return (500, pack_str("failed to create build"));
                }
            };
            *current = Some(build.clone());
            build
        };

        let driver = BuildDriver::new(
            self.clone(),
            project,
            build,
            std::time::Duration::from_secs_f64(msg.delay.max(0.0)),
        );
        self.builds.lock().await.spawn(driver.run());
        (204, pack_str(""))
    }

    async fn cmd_fail(self: &Arc<Self>, arg: &[u8]) -> (u16, Vec<u8>) {
        let name = match unpack_str(arg) {
            Ok(name) => name,
            Err(e) => return (400, pack_str(&format!("ValidationError: {:#}", e))),
        };
        let project = match self.projects.get(&name) {
            Some(project) => project,
            None => return (404, pack_str("unknown project")),
        };
        let build = match project.current_build() {
            Some(build) => build,
            None => return (409, pack_str("project not running")),
        };

        let mut guard = build.inner.lock().await;
        let inner = &mut *guard;
        let waiting: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, job)| job.status == JobStatus::Waiting)
            .map(|(name, _)| name.clone())
            .collect();
        for job in waiting {
            fail_job(&mut inner.jobs, &mut inner.artifacts, &job);
        }
        if !inner.state.terminating() {
            if let Err(e) = build.store_status(inner) {
                error!("storing status failed: {:#}", e);
            }
        }
        drop(guard);
        build.artifact_received.notify_one();
        (204, pack_str(""))
    }

    async fn cmd_status(&self) -> (u16, Vec<u8>) {
        let mut projects = BTreeMap::new();
        for project in self.projects.values() {
            projects.insert(
                project.name().clone(),
                ProjectStatus {
                    git: project.git().clone(),
                    description: project.description().clone(),
                    classes: project.classes().clone(),
                    running: project.current_build().is_some(),
                },
            );
        }
        let status = StatusMessage {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| String::from("unknown")),
            load: crate::util::loadavg(),
            pid: std::process::id(),
            projects,
        };
        match status.pack() {
            Ok(packed) => (200, packed),
            Err(e) => {
                error!("failed to pack status: {:#}", e);
                (500, pack_str("internal error"))
            }
        }
    }

    /// SIGUSR1 diagnostics: flush running build statuses and describe the
    /// dispatch queue.
    pub async fn dump_state(&self) {
        info!("force flushing all running build statuses");
        let mut running = 0;
        for (name, project) in &self.projects {
            let build = match project.current_build() {
                Some(build) => build,
                None => continue,
            };
            running += 1;
            let inner = build.inner.lock().await;
            if !inner.state.terminating() {
                if let Err(e) = build.store_status(&inner) {
                    error!("flushing status of {} failed: {:#}", name, e);
                }
            }
            info!(
                "project {} running: {:?} ({:?}, {} jobs)",
                name,
                build,
                inner.state,
                inner.jobs.len()
            );
        }
        info!("running {} project(s)", running);
        info!("outgoing qsize: {}", self.queue.len());
        if let Ok(Some(job)) = self.queue.peek_nowait() {
            info!(
                "last item on queue: caps [{}], {} bytes",
                job.capabilities.iter().join(", "),
                job.payload.len()
            );
        }
    }

    /// Abort all build drivers; outstanding artifacts are not drained.
    pub async fn shutdown(&self) {
        let mut builds = self.builds.lock().await;
        builds.abort_all();
        while builds.join_next().await.is_some() {}
    }
}

/// Serve the request/reply command socket.
pub async fn command_loop(coordinator: Arc<Coordinator>, listener: Listener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("command connection from {}", peer);
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            serve_commands(coordinator, stream).await;
        });
    }
}

async fn serve_commands(coordinator: Arc<Coordinator>, stream: Stream) {
    let mut framed = Framed::new(stream, MultipartCodec);
    while let Some(message) = framed.next().await {
        let frames = match message {
            Ok(frames) => frames,
            Err(e) => {
                debug!("command request error: {:#}", e);
                break;
            }
        };
        let (code, value) = coordinator.dispatch_command(&frames).await;
        let reply = vec![Bytes::from(code.to_string()), Bytes::from(value)];
        if framed.send(reply).await.is_err() {
            break;
        }
    }
}
