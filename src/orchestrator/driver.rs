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
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::build::Build;
use crate::build::BuildState;
use crate::build::GraphInput;
use crate::coordinator::Coordinator;
use crate::coordinator::Project;
use crate::orchestrator::SolverContext;
use crate::orchestrator::solve;
use crate::util::fs::merge_tree_into;
use crate::util::lock::lock_file;
use crate::util::proc::check_call;
use crate::util::proc::check_output;

#[cfg_attr(doc, aquamarine::aquamarine)]
/// The build driver
///
/// A BuildDriver owns one build of one project from SCHEDULED to DONE: it
/// prepares the source tree, obtains the job graph from the external graph
/// generator, seeds the incremental repositories and then runs the solver
/// until every job is terminal.
///
/// ```mermaid
/// sequenceDiagram
///     participant C  as Coordinator
///     participant D  as BuildDriver
///     participant S  as Solver
///     participant Q  as JobQueue
///     participant W  as Worker
///
///     C->>+D: run()
///         D->>D: fetch sources, compute graph
///         D->>+S: solve()
///             loop until all jobs terminal
///                 S->>Q: put(capabilities, job)
///                 Q->>W: dispatch
///                 W-->>S: artifacts, logs, completion (via intake)
///             end
///         S-->>-D: success
///     D-->>-C: build DONE
/// ```
///
/// Whatever happens inside the pipeline, the build ends in DONE with its
/// final status snapshot on disk and the project's current slot cleared.
pub struct BuildDriver {
    coordinator: Arc<Coordinator>,
    project: Arc<Project>,
    build: Arc<Build>,
    delay: Duration,
}

/// Removes the `<project>/current` symlink once the build is over.
struct CurrentSymlink {
    path: PathBuf,
}

impl CurrentSymlink {
    fn create(project_base: &Path, build_directory: &Path) -> Result<Self> {
        let path = project_base.join("current");
        let datedir = build_directory
            .file_name()
            .ok_or_else(|| anyhow!("Build directory without a name"))?;
        std::os::unix::fs::symlink(datedir, &path)
            .with_context(|| anyhow!("Creating symlink {}", path.display()))?;
        Ok(CurrentSymlink { path })
    }
}

impl Drop for CurrentSymlink {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl BuildDriver {
    pub fn new(
        coordinator: Arc<Coordinator>,
        project: Arc<Project>,
        build: Arc<Build>,
        delay: Duration,
    ) -> Self {
        BuildDriver {
            coordinator,
            project,
            build,
            delay,
        }
    }

    /// Drive the build to DONE; never propagates an error to the caller.
    pub async fn run(self) {
        let start = Instant::now();
        let success = match self.run_pipeline().await {
            Ok(success) => success,
            Err(e) => {
                error!("build failed due to an exception: {:#}", e);
                false
            }
        };
        let length = start.elapsed().as_secs_f64();

        if let Ok(mut current) = self.project.current.lock() {
            *current = None;
        }
        {
            let mut inner = self.build.inner.lock().await;
            inner.state = BuildState::Done;
            inner.success = success;
            if let Err(e) = self.build.store_status_finished(&inner, success, length) {
                error!("storing final status failed: {:#}", e);
            }
        }
        info!(
            "build {} done; success? {} in {:.1}s",
            self.project.name(),
            success,
            length
        );
    }

    async fn run_pipeline(&self) -> Result<bool> {
        let build_dir = self.build.build_directory().clone();
        // the same file also carries the status snapshot; the flock detects
        // a second coordinator sharing this project_base
        let _lock = lock_file(&build_dir, "coordinator")?;
        let _current = CurrentSymlink::create(self.project.base(), &build_dir)?;

        tokio::time::sleep(self.delay).await;

        self.build.update_state(BuildState::Fetch).await?;
        let checkout = tempfile::Builder::new()
            .tempdir_in(self.coordinator.tmp_dir())
            .context("Creating checkout directory")?;
        let projdir = checkout.path();
        git(&["init"], projdir).await?;
        git(&["remote", "add", "origin", self.project.git()], projdir).await?;
        git(&["fetch", "origin"], projdir).await?;
        let refspec = format!("origin/{}", self.project.default_branch());
        git(&["checkout", "--detach", &refspec], projdir).await?;
        let revision = String::from_utf8(
            check_output(
                Command::new("git").args(["rev-parse", "HEAD"]).current_dir(projdir),
                None,
            )
            .await?,
        )?
        .trim()
        .to_string();

        self.build.update_state(BuildState::Setup).await?;
        let scratch = tempfile::Builder::new()
            .tempdir_in(self.coordinator.tmp_dir())
            .context("Creating setup directory")?;
        let setup_dir = scratch.path();
        let distfiles = projdir.join(self.project.distfile_path());
        if distfiles.is_dir() {
            merge_tree_into(&distfiles, setup_dir)?;
        }
        check_call(Command::new("xbstrap").arg("init").arg(projdir).current_dir(setup_dir))
            .await?;

        if self.project.mirror_root().is_some() {
            self.build.update_state(BuildState::UpdatingMirrors).await?;
            let mirror_dir = self.project.base().join("mirror_build");
            std::fs::create_dir_all(&mirror_dir)
                .with_context(|| anyhow!("Creating {}", mirror_dir.display()))?;
            check_call(
                Command::new("xbstrap-mirror")
                    .arg("-S")
                    .arg(projdir)
                    .args(["update", "--keep-going"])
                    .current_dir(&mirror_dir),
            )
            .await?;
        }

        let commits_object = self.collect_version_pins(projdir, setup_dir).await?;

        self.build.update_state(BuildState::Calculating).await?;
        let graph = self.compute_graph(setup_dir).await?;
        self.build
            .set_graph(&revision, graph, commits_object)
            .await?;

        let incremental = { self.build.inner.lock().await.incremental };
        if self.project.rolling_base().exists() && incremental {
            self.build.update_state(BuildState::SetupRepos).await?;
            crate::filestore::seed_build_repos(&self.project, &self.build).await?;
        } else {
            debug!("wiping rolling repos for non incremental build");
            crate::filestore::wipe_rolling(&self.project)?;
        }

        self.build.update_state(BuildState::Running).await?;
        let ctx = SolverContext {
            queue: self.coordinator.queue(),
            intake_address: self.coordinator.intake_address(),
            build_root: self.coordinator.build_root(),
            project: &self.project,
            build: &self.build,
        };
        solve(&ctx).await
    }

    /// Merge rolling versions and variable commits into the commits object
    /// and leave `bootstrap-commits.yml` in the source tree.
    async fn collect_version_pins(
        &self,
        projdir: &Path,
        setup_dir: &Path,
    ) -> Result<Value> {
        check_call(
            Command::new("xbstrap")
                .args(["rolling-versions", "fetch"])
                .current_dir(setup_dir),
        )
        .await?;
        check_call(
            Command::new("xbstrap")
                .args(["variable-commits", "fetch", "-c"])
                .current_dir(setup_dir),
        )
        .await?;

        let rolling_ids: serde_json::Map<String, Value> = serde_json::from_slice(
            &check_output(
                Command::new("xbstrap")
                    .args(["rolling-versions", "determine", "--json"])
                    .current_dir(setup_dir),
                None,
            )
            .await?,
        )
        .context("Parsing rolling version ids")?;
        let variable_commits: serde_json::Map<String, Value> = serde_json::from_slice(
            &check_output(
                Command::new("xbstrap")
                    .args(["variable-commits", "determine", "--json"])
                    .current_dir(setup_dir),
                None,
            )
            .await?,
        )
        .context("Parsing variable commits")?;

        let mut commits = serde_json::Map::new();
        for (name, id) in rolling_ids {
            commits
                .entry(name)
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .map(|entry| entry.insert(String::from("rolling_id"), id));
        }
        for (name, commit) in variable_commits {
            commits
                .entry(name)
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .map(|entry| entry.insert(String::from("fixed_commit"), commit));
        }
        let commits_object = Value::Object(commits);

        let pins_file = projdir.join("bootstrap-commits.yml");
        std::fs::write(
            &pins_file,
            serde_json::to_vec(&serde_json::json!({ "commits": commits_object }))?,
        )
        .with_context(|| anyhow!("Writing {}", pins_file.display()))?;

        Ok(commits_object)
    }

    async fn compute_graph(&self, setup_dir: &Path) -> Result<GraphInput> {
        let mut cmd = Command::new("xbstrap-pipeline");
        cmd.args(["compute-graph", "--artifacts", "--json"])
            .current_dir(setup_dir);

        let incremental = { self.build.inner.lock().await.incremental };
        let version_summary = if incremental {
            let summary = crate::filestore::load_version_summary(&self.project).await?;
            debug!("verinfo collected: {}", summary);
            cmd.args(["--version-file", "fd:0"]);
            Some(serde_json::to_vec(&summary)?)
        } else {
            None
        };

        let stdout = check_output(&mut cmd, version_summary.as_deref()).await?;
        serde_json::from_slice(&stdout).context("Parsing job graph")
    }
}

async fn git(args: &[&str], cwd: &Path) -> Result<()> {
    check_call(Command::new("git").args(args).current_dir(cwd)).await
}
