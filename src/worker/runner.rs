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
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::ensure;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use url::Url;

use crate::job::ArchSpec;
use crate::job::ArtifactKind;
use crate::proto::messages::JobCompletionMessage;
use crate::proto::messages::JobMessage;
use crate::util::fs::merge_tree_into;
use crate::worker::IntakeSink;
use crate::worker::download;
use crate::worker::repo_url_to_arg;
use crate::worker::send_log_line;
use crate::worker::send_message;
use crate::worker::upload;

/// Products the job still owes the coordinator. Uploads pop their entry
/// once they have reported either way, so the final cleanup pass only
/// fails what was never attempted.
#[derive(Debug, Default)]
struct PendingProducts {
    tools: BTreeSet<String>,
    pkgs: BTreeSet<String>,
    files: BTreeSet<String>,
}

impl PendingProducts {
    fn of_job(job: &JobMessage) -> Self {
        PendingProducts {
            tools: job.prod_tools.keys().cloned().collect(),
            pkgs: job.prod_pkgs.keys().cloned().collect(),
            files: job.prod_files.iter().cloned().collect(),
        }
    }

    fn set_for(&mut self, kind: ArtifactKind) -> &mut BTreeSet<String> {
        match kind {
            ArtifactKind::Tool => &mut self.tools,
            ArtifactKind::Package => &mut self.pkgs,
            ArtifactKind::File => &mut self.files,
        }
    }

    fn remove(&mut self, kind: ArtifactKind, name: &str) {
        self.set_for(kind).remove(name);
    }

    fn drain(&mut self) -> Vec<(ArtifactKind, String)> {
        let mut left = Vec::new();
        left.extend(std::mem::take(&mut self.pkgs).into_iter().map(|n| (ArtifactKind::Package, n)));
        left.extend(std::mem::take(&mut self.tools).into_iter().map(|n| (ArtifactKind::Tool, n)));
        left.extend(std::mem::take(&mut self.files).into_iter().map(|n| (ArtifactKind::File, n)));
        left
    }
}

/// One record of the build tool's progress stream.
#[derive(Deserialize, Debug)]
struct ProgressRecord {
    action: String,
    subject: String,
    status: String,
    #[serde(default)]
    artifact_files: Vec<ArtifactFileRecord>,
}

#[derive(Deserialize, Debug)]
struct ArtifactFileRecord {
    name: String,
    filepath: String,
}

/// Directory layout of one job on the worker.
struct JobDirs {
    build_dir: PathBuf,
    source_dir: PathBuf,
    tools_dir: PathBuf,
    sysroot: PathBuf,
    repo_dir: PathBuf,
}

impl JobDirs {
    fn of_job(job: &JobMessage) -> Self {
        let build_dir = PathBuf::from(job.build_root.trim_end_matches('/'));
        let source_dir = PathBuf::from(format!("{}.src", build_dir.display()));
        JobDirs {
            tools_dir: build_dir.join("tools"),
            sysroot: build_dir.join("system-root"),
            repo_dir: build_dir.join("xbps-repo"),
            build_dir,
            source_dir,
        }
    }
}

/// Executes one job: materializes the sysroot, runs the build tool, streams
/// artifacts and logs back, and always closes out with a completion
/// message.
pub struct JobRunner {
    job: JobMessage,
    sink: IntakeSink,
    pending: Arc<Mutex<PendingProducts>>,
}

impl JobRunner {
    pub fn new(job: JobMessage, sink: IntakeSink) -> Self {
        let pending = Arc::new(Mutex::new(PendingProducts::of_job(&job)));
        JobRunner { job, sink, pending }
    }

    pub async fn run(self) {
        let start = Instant::now();
        info!("running job {}/{}", self.job.project, self.job.job);
        let dirs = JobDirs::of_job(&self.job);

        let code = match self.execute(&dirs).await {
            Ok(code) => code,
            Err(e) => {
                error!("job {} failed due to an exception: {:#}", self.job.job, e);
                -1
            }
        };

        for dir in [&dirs.build_dir, &dirs.source_dir] {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("removing {} failed: {}", dir.display(), e),
            }
        }

        // if some artifact wasn't done, that's an error
        let leftovers = self
            .pending
            .lock()
            .map(|mut pending| pending.drain())
            .unwrap_or_default();
        for (kind, name) in leftovers {
            if let Err(e) =
                upload::send_failure(&*self.sink, &self.job.project, kind, &name).await
            {
                debug!("failure report for {} lost: {:#}", name, e);
            }
        }

        let completion = JobCompletionMessage {
            project: self.job.project.clone(),
            job: self.job.job.clone(),
            exit_code: code,
            run_time: start.elapsed().as_secs_f64(),
        };
        if let Err(e) = send_message(&*self.sink, "job", &completion).await {
            error!("completion message lost: {:#}", e);
        }
        info!("job done. return code: {}", code);
    }

    async fn execute(&self, dirs: &JobDirs) -> Result<i64> {
        std::fs::create_dir_all(&dirs.build_dir)?;
        std::fs::create_dir_all(&dirs.source_dir)?;
        std::fs::create_dir(&dirs.sysroot)?;
        std::fs::create_dir(&dirs.tools_dir)?;

        self.run_logged(Command::new("git").arg("init").current_dir(&dirs.source_dir))
            .await?;
        self.run_logged(
            Command::new("git")
                .args(["remote", "add", "origin", &self.job.repository])
                .current_dir(&dirs.source_dir),
        )
        .await?;
        self.run_logged(
            Command::new("git").args(["fetch", "origin"]).current_dir(&dirs.source_dir),
        )
        .await?;
        self.run_logged(
            Command::new("git")
                .args(["checkout", "--detach", &self.job.revision])
                .current_dir(&dirs.source_dir),
        )
        .await?;

        let distfiles = dirs.source_dir.join(&self.job.distfile_path);
        if distfiles.is_dir() {
            merge_tree_into(&distfiles, &dirs.build_dir)?;
        }
        self.run_logged(
            Command::new("xbstrap")
                .arg("init")
                .arg(&dirs.source_dir)
                .current_dir(&dirs.build_dir),
        )
        .await?;

        self.write_commit_pins(dirs)?;
        self.write_xbps_keys(dirs)?;

        if let Some(arch) = self.build_arch()? {
            self.install_packages(dirs, &arch).await?;
        }
        self.fetch_tools(dirs).await?;
        self.run_build_tool(dirs).await
    }

    fn write_commit_pins(&self, dirs: &JobDirs) -> Result<()> {
        let mut general = serde_json::Map::new();
        if let Some(mirror) = &self.job.mirror_root {
            general.insert(
                String::from("xbstrap_mirror"),
                serde_json::Value::String(mirror.clone()),
            );
        }
        let pins = serde_json::json!({
            "general": general,
            "commits": self.job.commits_object,
        });
        let path = dirs.source_dir.join("bootstrap-commits.yml");
        std::fs::write(&path, serde_json::to_vec(&pins)?)
            .with_context(|| anyhow!("Writing {}", path.display()))
    }

    /// Pre-seed the sysroot's key store so xbps trusts the project's
    /// signed repositories.
    fn write_xbps_keys(&self, dirs: &JobDirs) -> Result<()> {
        let keys = match &self.job.xbps_keys {
            Some(keys) if !keys.is_empty() => keys,
            _ => return Ok(()),
        };
        let keysdir = dirs.sysroot.join("var/db/xbps/keys");
        std::fs::create_dir_all(&keysdir)?;
        for (fingerprint, blob) in keys {
            let keyfile = keysdir.join(format!("{}.plist", fingerprint));
            std::fs::write(&keyfile, &blob[..])
                .with_context(|| anyhow!("Writing {}", keyfile.display()))?;
        }
        Ok(())
    }

    /// The single architecture this job's sysroot is built for, if any
    /// packages are needed at all.
    fn build_arch(&self) -> Result<Option<String>> {
        determine_build_arch(&self.job.needed_pkgs)
    }

    async fn install_packages(&self, dirs: &JobDirs, arch: &str) -> Result<()> {
        let repo_arg = repo_url_to_arg(&self.job.pkg_repo)?;
        self.run_logged(
            Command::new("xbps-install")
                .env("XBPS_ARCH", arch)
                .args(["-Uy", "-R"])
                .arg(&repo_arg)
                .arg("-r")
                .arg(&dirs.sysroot)
                .args(["-SM", "--"])
                .args(self.job.needed_pkgs.keys()),
        )
        .await?;

        // rebuild a local repo from what the install just cached, so the
        // build tool resolves against exactly these packages
        debug!("creating repository with existing packages...");
        std::fs::create_dir_all(&dirs.repo_dir)?;
        let cache_dir = match Url::parse(&self.job.pkg_repo) {
            Ok(parsed) if parsed.scheme() == "file" => PathBuf::from(parsed.path()),
            Ok(_) => dirs.sysroot.join("var/cache/xbps"),
            Err(_) => PathBuf::from(&self.job.pkg_repo),
        };
        for entry in std::fs::read_dir(&cache_dir)
            .with_context(|| anyhow!("Reading package cache {}", cache_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".xbps") || !entry.path().is_file() {
                continue;
            }
            debug!("... found {}", name);
            std::fs::copy(entry.path(), dirs.repo_dir.join(&name))?;
            self.run_logged(
                Command::new("xbps-rindex")
                    .env("XBPS_ARCH", arch)
                    .args(["-fa", "--", &name])
                    .current_dir(&dirs.repo_dir),
            )
            .await?;
        }
        Ok(())
    }

    async fn fetch_tools(&self, dirs: &JobDirs) -> Result<()> {
        for name in self.job.needed_tools.keys() {
            let tool_dir = dirs.tools_dir.join(name);
            std::fs::create_dir(&tool_dir)?;
            let tool_tar = dirs.tools_dir.join(format!("{}.tar.gz", name));
            download(&format!("{}/{}.tar.gz", self.job.tool_repo, name), &tool_tar)
                .await
                .with_context(|| anyhow!("Downloading tool {}", name))?;

            let (archive, dest) = (tool_tar.clone(), tool_dir.clone());
            tokio::task::spawn_blocking(move || -> Result<()> {
                let file = std::fs::File::open(&archive)?;
                tar::Archive::new(flate2::read::GzDecoder::new(file))
                    .unpack(&dest)
                    .with_context(|| anyhow!("Extracting {}", archive.display()))
            })
            .await
            .context("Tool extraction task failed")??;
        }
        Ok(())
    }

    /// Run the pipeline job, following its progress stream and uploading
    /// every artifact it reports.
    async fn run_build_tool(&self, dirs: &JobDirs) -> Result<i64> {
        let mut fds = [0i32; 2];
        ensure!(
            unsafe { libc::pipe(fds.as_mut_ptr()) } == 0,
            "Creating the progress pipe failed"
        );
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut cmd = Command::new("xbstrap-pipeline");
        cmd.args(["run-job", "--keep-going", "--progress-file"])
            .arg(format!("fd:{}", write_fd))
            .arg(&self.job.job)
            .current_dir(&dirs.build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        info!("running command {:?}", cmd.as_std());
        let spawned = cmd.spawn();
        // the child inherited the write end; closing ours makes EOF on the
        // read end track the child alone
        unsafe { libc::close(write_fd) };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                unsafe { libc::close(read_fd) };
                return Err(e).context("Spawning xbstrap-pipeline");
            }
        };
        let stdout = self.forward_lines(child.stdout.take());
        let stderr = self.forward_lines(child.stderr.take());

        let mut progress = progress_stream(read_fd);
        let mut uploads = JoinSet::new();
        while let Some(doc) = progress.recv().await {
            match serde_yaml::from_str::<ProgressRecord>(&doc) {
                Ok(notification) => {
                    debug!("got notify {:?}", notification);
                    self.handle_notification(&mut uploads, dirs, notification);
                }
                Err(e) => warn!("unparsable progress record: {:#}", e),
            }
        }

        let status = child.wait().await.context("Waiting for xbstrap-pipeline")?;
        let _ = tokio::join!(stdout, stderr);
        while uploads.join_next().await.is_some() {}
        Ok(i64::from(status.code().unwrap_or(-1)))
    }

    fn handle_notification(
        &self,
        uploads: &mut JoinSet<()>,
        dirs: &JobDirs,
        notification: ProgressRecord,
    ) {
        let succeeded = notification.status == "success";
        match notification.action.as_str() {
            "archive-tool" => {
                let path = dirs
                    .tools_dir
                    .join(format!("{}.tar.gz", notification.subject));
                self.spawn_transfer(
                    uploads,
                    ArtifactKind::Tool,
                    notification.subject.clone(),
                    path,
                    succeeded,
                );
            }
            "pack" => match self.job.prod_pkgs.get(&notification.subject) {
                Some(info) => {
                    let filearch = match &info.architecture {
                        ArchSpec::One(arch) => arch.clone(),
                        ArchSpec::Many(_) => String::from("noarch"),
                    };
                    let path = dirs.repo_dir.join(format!(
                        "{}-{}.{}.xbps",
                        notification.subject, info.version, filearch
                    ));
                    self.spawn_transfer(
                        uploads,
                        ArtifactKind::Package,
                        notification.subject.clone(),
                        path,
                        succeeded,
                    );
                }
                None => warn!("pack notification for unknown package {}", notification.subject),
            },
            _ => {}
        }
        for file in notification.artifact_files {
            self.spawn_transfer(
                uploads,
                ArtifactKind::File,
                file.name,
                PathBuf::from(file.filepath),
                succeeded,
            );
        }
    }

    /// Upload one artifact (or report its failure) concurrently, then pop
    /// it from the pending set either way.
    fn spawn_transfer(
        &self,
        uploads: &mut JoinSet<()>,
        kind: ArtifactKind,
        entry: String,
        path: PathBuf,
        succeeded: bool,
    ) {
        let sink = self.sink.clone();
        let project = self.job.project.clone();
        let pending = self.pending.clone();
        uploads.spawn(async move {
            let reported = if succeeded {
                match upload::upload_artifact(&*sink, &project, kind, &entry, &path).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("failed to upload {} {}: {:#}", kind, entry, e);
                        upload::send_failure(&*sink, &project, kind, &entry).await
                    }
                }
            } else {
                upload::send_failure(&*sink, &project, kind, &entry).await
            };
            if let Err(e) = reported {
                debug!("artifact report for {} lost: {:#}", entry, e);
            }
            if let Ok(mut pending) = pending.lock() {
                pending.remove(kind, &entry);
            }
        });
    }

    /// Run an external command with both output streams forwarded line by
    /// line into the job log.
    async fn run_logged(&self, cmd: &mut Command) -> Result<()> {
        info!("running command {:?}", cmd.as_std());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().context("Spawning command")?;
        let stdout = self.forward_lines(child.stdout.take());
        let stderr = self.forward_lines(child.stderr.take());
        let status = child.wait().await?;
        let _ = tokio::join!(stdout, stderr);
        ensure!(status.success(), "Command exited with {}", status);
        Ok(())
    }

    fn forward_lines<R>(&self, reader: Option<R>) -> tokio::task::JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.sink.clone();
        let project = self.job.project.clone();
        let job = self.job.job.clone();
        tokio::spawn(async move {
            let reader = match reader {
                Some(reader) => reader,
                None => return,
            };
            let mut reader = tokio::io::BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        let line = crate::util::decode_backslash_replace(&raw);
                        send_log_line(&*sink, &project, &job, line).await;
                    }
                }
            }
        })
    }
}

fn determine_build_arch(
    needed_pkgs: &crate::proto::messages::ArtifactSpecMap,
) -> Result<Option<String>> {
    let mut build_arch: Option<String> = None;
    for info in needed_pkgs.values() {
        let arch = match &info.architecture {
            ArchSpec::One(arch) => arch.clone(),
            ArchSpec::Many(archs) if archs.len() == 1 => archs[0].clone(),
            ArchSpec::Many(_) => bail!("multiarch sysroots are not possible"),
        };
        match &build_arch {
            None => build_arch = Some(arch),
            Some(current) if *current != arch => {
                bail!("multiarch sysroots are not possible")
            }
            _ => {}
        }
    }
    Ok(build_arch)
}

/// Read the progress pipe as a stream of `...`-terminated YAML documents.
fn progress_stream(read_fd: std::os::fd::RawFd) -> tokio::sync::mpsc::Receiver<String> {
    use std::io::BufRead;
    use std::os::fd::FromRawFd;

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::task::spawn_blocking(move || {
        let file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let reader = std::io::BufReader::new(file);
        let mut doc = String::new();
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if line.trim() == "..." {
                if tx.blocking_send(std::mem::take(&mut doc)).is_err() {
                    return;
                }
            } else {
                doc.push_str(&line);
                doc.push('\n');
            }
        }
        if !doc.trim().is_empty() {
            let _ = tx.blocking_send(doc);
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::proto::messages::ArtifactSpec;

    fn job_with_pkgs(archs: &[(&str, ArchSpec)]) -> JobMessage {
        let mut needed_pkgs = BTreeMap::new();
        for (name, arch) in archs {
            needed_pkgs.insert(
                name.to_string(),
                ArtifactSpec {
                    version: "1.0".into(),
                    architecture: arch.clone(),
                },
            );
        }
        JobMessage {
            project: "proj".into(),
            job: "pkg:x".into(),
            repository: "https://example.com/r.git".into(),
            revision: "abc".into(),
            output: "tcp://127.0.0.1:1".into(),
            build_root: "/var/lib/build".into(),
            needed_tools: BTreeMap::new(),
            needed_pkgs,
            prod_tools: BTreeMap::new(),
            prod_pkgs: BTreeMap::new(),
            prod_files: vec!["image".into()],
            tool_repo: "https://example.com/tools".into(),
            pkg_repo: "https://example.com/pkgs".into(),
            commits_object: serde_json::json!({}),
            xbps_keys: None,
            mirror_root: None,
            distfile_path: "xbps/".into(),
        }
    }

    #[test]
    fn test_build_arch_single() {
        let job = job_with_pkgs(&[
            ("a", ArchSpec::One("x86_64".into())),
            ("b", ArchSpec::Many(vec!["x86_64".into()])),
        ]);
        let pending = PendingProducts::of_job(&job);
        assert!(pending.files.contains("image"));

        let arch = determine_build_arch(&job.needed_pkgs).unwrap();
        assert_eq!(arch.as_deref(), Some("x86_64"));
    }

    #[test]
    fn test_build_arch_rejects_mixed() {
        let job = job_with_pkgs(&[
            ("a", ArchSpec::One("x86_64".into())),
            ("b", ArchSpec::One("riscv64".into())),
        ]);
        assert!(determine_build_arch(&job.needed_pkgs).is_err());

        let job = job_with_pkgs(&[(
            "a",
            ArchSpec::Many(vec!["x86_64".into(), "riscv64".into()]),
        )]);
        assert!(determine_build_arch(&job.needed_pkgs).is_err());
    }

    #[test]
    fn test_build_arch_none_without_packages() {
        let job = job_with_pkgs(&[]);
        assert_eq!(determine_build_arch(&job.needed_pkgs).unwrap(), None);
    }

    #[test]
    fn test_pending_products_drain() {
        let job = job_with_pkgs(&[]);
        let mut pending = PendingProducts::of_job(&job);
        pending.remove(ArtifactKind::File, "image");
        assert!(pending.drain().is_empty());

        let mut pending = PendingProducts::of_job(&job);
        let left = pending.drain();
        assert_eq!(left, vec![(ArtifactKind::File, String::from("image"))]);
        assert!(pending.drain().is_empty());
    }

    #[test]
    fn test_progress_record_yaml() {
        let doc = "action: pack\nsubject: gcc\nstatus: success\nartifact_files: []\n";
        let record: ProgressRecord = serde_yaml::from_str(doc).unwrap();
        assert_eq!(record.action, "pack");
        assert_eq!(record.subject, "gcc");
        assert_eq!(record.status, "success");
        assert!(record.artifact_files.is_empty());

        let doc = "action: run\nsubject: 'image: make'\nstatus: failure\nartifact_files:\n- name: initrd\n  filepath: /tmp/initrd\n";
        let record: ProgressRecord = serde_yaml::from_str(doc).unwrap();
        assert_eq!(record.artifact_files[0].name, "initrd");
        assert_eq!(record.artifact_files[0].filepath, "/tmp/initrd");
    }
}
