//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::ensure;
use chrono::DateTime;
use chrono::Utc;
use getset::Getters;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::job::ArchSpec;
use crate::job::Artifact;
use crate::job::ArtifactId;
use crate::job::ArtifactKind;
use crate::job::Job;
use crate::job::JobStatus;

mod graph;

pub use graph::GraphArtifact;
pub use graph::GraphFile;
pub use graph::GraphInput;
pub use graph::GraphJob;
pub use graph::GraphNeeded;
pub use graph::GraphProducts;

lazy_static! {
    static ref JOB_NAME_RE: Regex = Regex::new(r"^[a-z]+:.*$").unwrap();
}

/// Pipeline position of a build. States advance linearly; DONE is reached
/// even when the pipeline errors out.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    Scheduled,
    Fetch,
    Setup,
    UpdatingMirrors,
    Calculating,
    SetupRepos,
    Running,
    Done,
}

impl BuildState {
    pub fn terminating(&self) -> bool {
        matches!(self, BuildState::Done)
    }
}

/// Mutable build state; guarded by the build mutex so the solver, intake
/// and command handlers never observe a half-applied mutation.
#[derive(Debug)]
pub struct BuildInner {
    pub state: BuildState,
    pub incremental: bool,
    pub revision: Option<String>,
    pub commits_object: serde_json::Value,
    pub jobs: IndexMap<String, Job>,
    /// Arena of all artifacts in this build; jobs reference slots by index,
    /// so producer and consumers share one status record.
    pub artifacts: Vec<Artifact>,
    pub tool_set: HashMap<String, ArtifactId>,
    pub pkg_set: HashMap<String, ArtifactId>,
    pub file_set: HashMap<String, ArtifactId>,
    pub success: bool,
}

impl BuildInner {
    pub fn set_for(&self, kind: ArtifactKind) -> &HashMap<String, ArtifactId> {
        match kind {
            ArtifactKind::Tool => &self.tool_set,
            ArtifactKind::Package => &self.pkg_set,
            ArtifactKind::File => &self.file_set,
        }
    }

    fn set_for_mut(&mut self, kind: ArtifactKind) -> &mut HashMap<String, ArtifactId> {
        match kind {
            ArtifactKind::Tool => &mut self.tool_set,
            ArtifactKind::Package => &mut self.pkg_set,
            ArtifactKind::File => &mut self.file_set,
        }
    }

    pub fn artifact(&self, id: ArtifactId) -> &Artifact {
        &self.artifacts[id.0]
    }

    pub fn artifact_mut(&mut self, id: ArtifactId) -> &mut Artifact {
        &mut self.artifacts[id.0]
    }

    /// Intern a tool or package descriptor, reusing the existing arena slot
    /// if the name is already known so producers and consumers alias.
    fn intern(
        &mut self,
        kind: ArtifactKind,
        desc: &GraphArtifact,
        arch_set: &mut BTreeSet<String>,
    ) -> Result<ArtifactId> {
        let id = match self.set_for(kind).get(&desc.name) {
            Some(id) => *id,
            None => {
                let id = ArtifactId(self.artifacts.len());
                self.artifacts.push(Artifact::new(
                    kind,
                    desc.name.clone(),
                    Some(desc.version.clone()),
                    Some(ArchSpec::One(desc.architecture.clone())),
                ));
                self.set_for_mut(kind).insert(desc.name.clone(), id);
                id
            }
        };

        // "noarch" is rewritten after the whole graph is known
        let arch = self.artifacts[id.0]
            .architecture()?
            .clone();
        if arch.is_noarch() {
            return Ok(id);
        }
        let concrete = arch.concrete()?.to_string();
        if !arch_set.is_empty() && !arch_set.contains(&concrete) {
            bail!("multiarch builds unsupported");
        }
        arch_set.insert(concrete);
        Ok(id)
    }
}

/// One execution of a project's job graph.
#[derive(Getters)]
pub struct Build {
    #[getset(get = "pub")]
    name: String,

    #[getset(get = "pub")]
    repository: String,

    #[getset(get = "pub")]
    build_directory: PathBuf,

    #[getset(get = "pub")]
    ts: DateTime<Utc>,

    pub inner: Mutex<BuildInner>,

    /// Edge-triggered wakeup for the solver; set whenever an artifact or a
    /// completion message changed the picture.
    pub artifact_received: Notify,
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Build({}, {})", self.name, self.build_directory.display())
    }
}

#[derive(Serialize)]
struct JobSnapshot<'a> {
    status: JobStatus,
    deps: Vec<&'a Artifact>,
    products: Vec<&'a Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_time: Option<f64>,
}

#[derive(Serialize)]
struct StatusSnapshot<'a> {
    state: BuildState,
    jobs: IndexMap<&'a str, JobSnapshot<'a>>,
    incremental: bool,
    commits_object: &'a serde_json::Value,
    revision: &'a Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_time: Option<f64>,
}

impl Build {
    /// Create a build with a fresh timestamped directory under the project
    /// base and persist the initial SCHEDULED snapshot.
    pub fn create(
        project_dir: &Path,
        name: &str,
        repository: &str,
        incremental: bool,
    ) -> Result<Arc<Build>> {
        let ts = Utc::now();
        let build_directory = project_dir.join(crate::util::timestamp_dirname(&ts));
        std::fs::create_dir_all(&build_directory)
            .with_context(|| anyhow!("Creating {}", build_directory.display()))?;

        let build = Arc::new(Build {
            name: name.to_string(),
            repository: repository.to_string(),
            build_directory,
            ts,
            inner: Mutex::new(BuildInner {
                state: BuildState::Scheduled,
                incremental,
                revision: None,
                commits_object: serde_json::json!({}),
                jobs: IndexMap::new(),
                artifacts: Vec::new(),
                tool_set: HashMap::new(),
                pkg_set: HashMap::new(),
                file_set: HashMap::new(),
                success: false,
            }),
            artifact_received: Notify::new(),
        });

        {
            // freshly constructed, the mutex cannot be contended
            let inner = build
                .inner
                .try_lock()
                .map_err(|_| anyhow!("Fresh build mutex contended"))?;
            build.store_status(&inner)?;
        }
        Ok(build)
    }

    pub fn log_path(&self, job: &str) -> PathBuf {
        self.build_directory.join(format!("{}.log", job))
    }

    pub fn info_path(&self, job: &str) -> PathBuf {
        self.build_directory.join(format!("{}.info", job))
    }

    pub async fn update_state(&self, state: BuildState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state = state;
        self.store_status(&inner)
    }

    /// Persist the JSON snapshot the status UI and post-mortem tooling read.
    pub fn store_status(&self, inner: &BuildInner) -> Result<()> {
        self.write_status(inner, None)
    }

    pub fn store_status_finished(
        &self,
        inner: &BuildInner,
        success: bool,
        run_time: f64,
    ) -> Result<()> {
        self.write_status(inner, Some((success, run_time)))
    }

    fn write_status(&self, inner: &BuildInner, finished: Option<(bool, f64)>) -> Result<()> {
        let jobs = inner
            .jobs
            .iter()
            .map(|(name, job)| {
                let snapshot = JobSnapshot {
                    status: job.status,
                    deps: job.deps.iter().map(|id| inner.artifact(*id)).collect(),
                    products: job.products.iter().map(|id| inner.artifact(*id)).collect(),
                    exit_code: job.exit_code,
                    run_time: job.run_time,
                };
                (name.as_str(), snapshot)
            })
            .collect();

        let snapshot = StatusSnapshot {
            state: inner.state,
            jobs,
            incremental: inner.incremental,
            commits_object: &inner.commits_object,
            revision: &inner.revision,
            success: finished.map(|f| f.0),
            run_time: finished.map(|f| f.1),
        };

        let path = self.build_directory.join("coordinator");
        let rendered = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(&path, rendered)
            .with_context(|| anyhow!("Writing status to {}", path.display()))?;
        trace!("stored status of build {} ({:?})", self.name, inner.state);
        Ok(())
    }

    /// Ingest the generated job graph.
    ///
    /// Artifacts are interned per kind so every job referring to a name
    /// shares one arena slot. At most one concrete architecture may appear
    /// across the graph; "noarch" entries are rewritten to the concrete
    /// architecture list once all jobs are known. Jobs flagged up2date are
    /// terminal immediately and their products count as received.
    pub async fn set_graph(
        &self,
        revision: &str,
        graph: GraphInput,
        commits_object: serde_json::Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.revision = Some(revision.to_string());
        inner.commits_object = commits_object;

        let mut arch_set: BTreeSet<String> = BTreeSet::new();
        for (name, info) in graph {
            ensure!(JOB_NAME_RE.is_match(&name), "Invalid job name '{}'", name);
            let mut job = Job::new(info.unstable, info.capabilities.unwrap_or_default());

            for desc in &info.needed.tools {
                let id = inner.intern(ArtifactKind::Tool, desc, &mut arch_set)?;
                job.deps.push(id);
            }
            for desc in &info.needed.pkgs {
                let id = inner.intern(ArtifactKind::Package, desc, &mut arch_set)?;
                job.deps.push(id);
            }
            for desc in &info.products.tools {
                let id = inner.intern(ArtifactKind::Tool, desc, &mut arch_set)?;
                job.products.push(id);
            }
            for desc in &info.products.pkgs {
                let id = inner.intern(ArtifactKind::Package, desc, &mut arch_set)?;
                job.products.push(id);
            }
            for file in &info.products.files {
                let id = ArtifactId(inner.artifacts.len());
                inner
                    .artifacts
                    .push(Artifact::new(ArtifactKind::File, file.name.clone(), None, None));
                inner.file_set.insert(file.name.clone(), id);
                job.products.push(id);
            }

            if info.up2date {
                job.status = JobStatus::UpToDate;
                for id in &job.products {
                    let artifact = inner.artifact_mut(*id);
                    artifact.received = true;
                    artifact.failed = false;
                }
            }

            inner.jobs.insert(name, job);
        }

        let concrete: Vec<String> = arch_set.into_iter().collect();
        for artifact in inner.artifacts.iter_mut() {
            if matches!(artifact.kind, ArtifactKind::Tool | ArtifactKind::Package)
                && artifact
                    .architecture
                    .as_ref()
                    .map(ArchSpec::is_noarch)
                    .unwrap_or(false)
            {
                artifact.architecture = Some(ArchSpec::Many(concrete.clone()));
            }
        }

        self.store_status(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, arch: &str) -> GraphArtifact {
        GraphArtifact {
            name: name.into(),
            version: "1.0".into(),
            architecture: arch.into(),
        }
    }

    fn graph_job(
        products_pkgs: Vec<GraphArtifact>,
        needed_pkgs: Vec<GraphArtifact>,
        up2date: bool,
    ) -> GraphJob {
        GraphJob {
            up2date,
            unstable: false,
            capabilities: None,
            products: GraphProducts {
                tools: vec![],
                pkgs: products_pkgs,
                files: vec![],
            },
            needed: GraphNeeded {
                tools: vec![],
                pkgs: needed_pkgs,
            },
        }
    }

    fn fresh_build(dir: &Path) -> Arc<Build> {
        Build::create(dir, "testproj", "https://example.com/p.git", false).unwrap()
    }

    #[tokio::test]
    async fn test_empty_graph() {
        let dir = tempfile::tempdir().unwrap();
        let build = fresh_build(dir.path());
        build
            .set_graph("abc", GraphInput::new(), serde_json::json!({}))
            .await
            .unwrap();
        let inner = build.inner.lock().await;
        assert!(inner.jobs.is_empty());
        assert_eq!(inner.revision.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_shared_artifact_identity() {
        let dir = tempfile::tempdir().unwrap();
        let build = fresh_build(dir.path());

        let mut graph = GraphInput::new();
        graph.insert(
            "pkg:a".into(),
            graph_job(vec![desc("p", "x86_64")], vec![], false),
        );
        graph.insert(
            "pkg:b".into(),
            graph_job(vec![], vec![desc("p", "x86_64")], false),
        );
        build
            .set_graph("abc", graph, serde_json::json!({}))
            .await
            .unwrap();

        let mut inner = build.inner.lock().await;
        let producer_side = inner.jobs["pkg:a"].products[0];
        let consumer_side = inner.jobs["pkg:b"].deps[0];
        assert_eq!(producer_side, consumer_side);

        // flipping the bit through one side is visible through the other
        inner.artifact_mut(producer_side).received = true;
        assert!(inner.artifact(consumer_side).received);
    }

    #[tokio::test]
    async fn test_multiarch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let build = fresh_build(dir.path());

        let mut graph = GraphInput::new();
        graph.insert(
            "pkg:a".into(),
            graph_job(vec![desc("p", "x86_64")], vec![], false),
        );
        graph.insert(
            "pkg:b".into(),
            graph_job(vec![desc("q", "riscv64")], vec![], false),
        );
        let err = build
            .set_graph("abc", graph, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("multiarch builds unsupported"));
    }

    #[tokio::test]
    async fn test_noarch_rewritten_to_concrete_list() {
        let dir = tempfile::tempdir().unwrap();
        let build = fresh_build(dir.path());

        let mut graph = GraphInput::new();
        graph.insert(
            "pkg:a".into(),
            graph_job(vec![desc("p", "x86_64")], vec![], false),
        );
        graph.insert(
            "pkg:docs".into(),
            graph_job(vec![desc("docs", "noarch")], vec![], false),
        );
        build
            .set_graph("abc", graph, serde_json::json!({}))
            .await
            .unwrap();

        let inner = build.inner.lock().await;
        let id = inner.pkg_set["docs"];
        assert_eq!(
            inner.artifact(id).architecture,
            Some(ArchSpec::Many(vec![String::from("x86_64")]))
        );
    }

    #[tokio::test]
    async fn test_up2date_job_is_terminal_with_received_products() {
        let dir = tempfile::tempdir().unwrap();
        let build = fresh_build(dir.path());

        let mut graph = GraphInput::new();
        graph.insert(
            "pkg:a".into(),
            graph_job(vec![desc("p", "x86_64")], vec![], true),
        );
        build
            .set_graph("abc", graph, serde_json::json!({}))
            .await
            .unwrap();

        let inner = build.inner.lock().await;
        assert_eq!(inner.jobs["pkg:a"].status, JobStatus::UpToDate);
        let id = inner.pkg_set["p"];
        assert!(inner.artifact(id).received);
        assert!(!inner.artifact(id).failed);
    }

    #[tokio::test]
    async fn test_status_snapshot_written() {
        let dir = tempfile::tempdir().unwrap();
        let build = fresh_build(dir.path());
        build
            .set_graph("abc", GraphInput::new(), serde_json::json!({"x": {"rolling_id": "1"}}))
            .await
            .unwrap();

        let status_file = build.build_directory().join("coordinator");
        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(status_file).unwrap()).unwrap();
        assert_eq!(parsed["state"], "SCHEDULED");
        assert_eq!(parsed["revision"], "abc");
        assert_eq!(parsed["commits_object"]["x"]["rolling_id"], "1");
    }
}
