//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::path::Path;

use anyhow::Result;
use anyhow::anyhow;
use anyhow::ensure;
use tracing::debug;
use tracing::trace;

use crate::build::Build;
use crate::build::BuildInner;
use crate::coordinator::Project;
use crate::endpoint::JobQueue;
use crate::endpoint::QueuedJob;
use crate::job::ArtifactKind;
use crate::job::JobStatus;
use crate::job::fail_job;
use crate::proto::Message;
use crate::proto::messages::ArtifactSpecMap;
use crate::proto::messages::JobMessage;

/// Everything the solver needs besides the build itself.
pub struct SolverContext<'a> {
    pub queue: &'a JobQueue,
    pub intake_address: &'a str,
    pub build_root: &'a Path,
    pub project: &'a Project,
    pub build: &'a Build,
}

/// Advance a build until every job is terminal.
///
/// Each pass scans the jobs in graph insertion order: RUNNING jobs whose
/// products all arrived are promoted to WAITING_FOR_DONE, WAITING jobs with
/// a failed dependency cascade into failure, and WAITING jobs whose
/// dependencies are all received go out on the dispatch queue as
/// (capabilities, packed job) pairs. Between passes the solver sleeps on
/// the build's artifact_received condition; intake and the dispatchers
/// wake it.
///
/// Returns whether every job ended in a successful state.
pub async fn solve(ctx: &SolverContext<'_>) -> Result<bool> {
    loop {
        let mut dispatches: Vec<QueuedJob> = Vec::new();
        let outcome = {
            let mut guard = ctx.build.inner.lock().await;
            let inner = &mut *guard;
            let mut some_waiting = false;
            let mut changed = false;

            let names: Vec<String> = inner.jobs.keys().cloned().collect();
            for name in &names {
                let promote = match inner.jobs.get(name) {
                    Some(job) => {
                        job.status == JobStatus::Running
                            && job.products.iter().all(|id| inner.artifact(*id).received)
                    }
                    None => continue,
                };
                if promote {
                    trace!("job {} has all products, waiting for done", name);
                    if let Some(job) = inner.jobs.get_mut(name) {
                        job.status = JobStatus::WaitingForDone;
                    }
                    changed = true;
                }

                let status = match inner.jobs.get(name) {
                    Some(job) => job.status,
                    None => continue,
                };
                if !status.terminating() {
                    some_waiting = true;
                }
                if status != JobStatus::Waiting {
                    continue;
                }

                let mut failed = false;
                let mut satisfied = true;
                if let Some(job) = inner.jobs.get(name) {
                    for id in &job.deps {
                        let dep = inner.artifact(*id);
                        if !dep.received {
                            satisfied = false;
                        }
                        if dep.failed {
                            failed = true;
                        }
                    }
                }

                if failed {
                    debug!("job {} has failed dependencies", name);
                    fail_job(&mut inner.jobs, &mut inner.artifacts, name);
                    // artifacts changed under us, make sure we rescan
                    ctx.build.artifact_received.notify_one();
                    changed = true;
                    continue;
                }
                if !satisfied {
                    continue;
                }

                let message = job_message(ctx, inner, name)?;
                debug!("sending job request for {}", name);
                if let Some(job) = inner.jobs.get_mut(name) {
                    job.status = JobStatus::Running;
                    dispatches.push(QueuedJob {
                        capabilities: job.capabilities.clone(),
                        payload: message.pack()?,
                    });
                }
                changed = true;
            }

            if changed {
                ctx.build.store_status(inner)?;
            }

            if !some_waiting {
                assert_complete(inner)?;
                Some(inner.jobs.values().all(|job| job.status.successful()))
            } else {
                None
            }
        };

        if let Some(success) = outcome {
            return Ok(success);
        }

        for job in dispatches {
            ctx.queue.put(job).await?;
        }
        ctx.build.artifact_received.notified().await;
    }
}

fn assert_complete(inner: &BuildInner) -> Result<()> {
    for set in [&inner.tool_set, &inner.pkg_set, &inner.file_set] {
        ensure!(
            set.values().all(|id| inner.artifact(*id).received),
            "Solver finished with unreceived artifacts"
        );
    }
    ensure!(
        inner.jobs.values().all(|job| job.status.terminating()),
        "Solver finished with live jobs"
    );
    Ok(())
}

/// Pack the dispatch message for one ready job.
fn job_message(
    ctx: &SolverContext<'_>,
    inner: &BuildInner,
    name: &str,
) -> Result<JobMessage> {
    let job = inner
        .jobs
        .get(name)
        .ok_or_else(|| anyhow!("No such job '{}'", name))?;

    let mut needed_tools = ArtifactSpecMap::new();
    let mut needed_pkgs = ArtifactSpecMap::new();
    for id in &job.deps {
        let dep = inner.artifact(*id);
        match dep.kind {
            ArtifactKind::Tool => needed_tools.insert(dep.name.clone(), dep.spec()?),
            ArtifactKind::Package => needed_pkgs.insert(dep.name.clone(), dep.spec()?),
            ArtifactKind::File => None,
        };
    }

    let mut prod_tools = ArtifactSpecMap::new();
    let mut prod_pkgs = ArtifactSpecMap::new();
    let mut prod_files = Vec::new();
    for id in &job.products {
        let product = inner.artifact(*id);
        match product.kind {
            ArtifactKind::Tool => {
                prod_tools.insert(product.name.clone(), product.spec()?);
            }
            ArtifactKind::Package => {
                prod_pkgs.insert(product.name.clone(), product.spec()?);
            }
            ArtifactKind::File => prod_files.push(product.name.clone()),
        }
    }

    Ok(JobMessage {
        project: ctx.build.name().clone(),
        job: name.to_string(),
        repository: ctx.build.repository().clone(),
        revision: inner
            .revision
            .clone()
            .ok_or_else(|| anyhow!("Dispatching before the graph was set"))?,
        output: ctx.intake_address.to_string(),
        build_root: ctx.build_root.display().to_string(),
        needed_tools,
        needed_pkgs,
        prod_tools,
        prod_pkgs,
        prod_files,
        tool_repo: ctx.project.tools().clone(),
        pkg_repo: ctx.project.packages().clone(),
        commits_object: inner.commits_object.clone(),
        xbps_keys: crate::filestore::signing_keys(ctx.project)?,
        mirror_root: ctx.project.mirror_root().clone(),
        distfile_path: ctx.project.distfile_path().clone(),
    })
}
