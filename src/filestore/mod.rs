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
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::process::Command;
use tracing::error;
use tracing::info;

use crate::build::Build;
use crate::coordinator::Project;
use crate::intake::chunks::ChunkStream;
use crate::job::ArchSpec;
use crate::job::Artifact;
use crate::job::ArtifactKind;
use crate::util::fs::hash_file;
use crate::util::fs::move_file;
use crate::util::proc::check_call;

lazy_static! {
    // the only key xbforge reads out of a repo pubkey plist
    static ref SIGNATURE_BY_RE: Regex = Regex::new(
        r"<key>signature-by</key>\s*<string>([^<]+)</string>"
    ).unwrap();
}

/// Name of the rolling tools registry file.
const TOOLS_REGISTRY: &str = "tools.json";

/// Deposit a fully received artifact stream.
///
/// The staging file moves into the per-build repository; packages and tools
/// are then propagated into the project's rolling repository so the next
/// incremental build starts from the latest good set. When the rolling
/// copy already matches by version, diverging content is logged and the
/// rolling copy is kept.
pub async fn deposit(
    project: &Project,
    build: &Build,
    artifact: &Artifact,
    stream: ChunkStream,
    filename: &str,
) -> Result<()> {
    let repo = build.build_directory().join(artifact.kind.repo_dirname());
    let repo_roll = project.rolling_repo(artifact.kind);
    std::fs::create_dir_all(&repo)
        .with_context(|| anyhow!("Creating {}", repo.display()))?;
    std::fs::create_dir_all(&repo_roll)
        .with_context(|| anyhow!("Creating {}", repo_roll.display()))?;

    let artifact_file = repo.join(filename);
    let artifact_roll = repo_roll.join(filename);

    drop(stream.file);
    move_file(&stream.path, &artifact_file)?;

    match artifact.kind {
        ArtifactKind::Package => {
            let arch = artifact.architecture()?.concrete()?.to_string();
            rindex(&arch, &["-fa"], &artifact_file).await?;
            if !artifact_roll.exists() {
                std::fs::copy(&artifact_file, &artifact_roll).with_context(|| {
                    anyhow!("Copying into rolling repo {}", artifact_roll.display())
                })?;
                // no -f here, the rolling repo keeps the most up-to-date
                rindex(&arch, &["-a"], &artifact_roll).await?;
                rindex(&arch, &["-r"], &repo_roll).await?;
            } else {
                compare_with_rolling(artifact, &artifact_file, &artifact_roll)?;
            }
            maybe_sign_artifact(project, &artifact_file, &arch).await?;
            maybe_sign_artifact(project, &artifact_roll, &arch).await?;
        }
        ArtifactKind::Tool => {
            let _guard = project.tool_repo_lock.lock().await;
            let registry = load_tool_registry(&repo_roll)?;
            let version = artifact.version()?;
            if !artifact_roll.exists() || registry.get(&artifact.name).map(String::as_str) != Some(version)
            {
                std::fs::copy(&artifact_file, &artifact_roll).with_context(|| {
                    anyhow!("Copying into rolling repo {}", artifact_roll.display())
                })?;
                update_tool_registry(&artifact_roll, &artifact.name, version, Some(registry))?;
            } else {
                compare_with_rolling(artifact, &artifact_file, &artifact_roll)?;
            }
        }
        ArtifactKind::File => {
            std::fs::copy(&artifact_file, &artifact_roll).with_context(|| {
                anyhow!("Copying into rolling repo {}", artifact_roll.display())
            })?;
        }
    }
    Ok(())
}

/// A rolling entry exists under the same version; diverging content means
/// somebody rebuilt without bumping. Keep the rolling copy, surface the
/// discrepancy.
fn compare_with_rolling(artifact: &Artifact, new: &Path, rolling: &Path) -> Result<()> {
    let new_hash = hash_file(new)?;
    let rolling_hash = hash_file(rolling)?;
    if new_hash != rolling_hash {
        error!(
            "{} {} hash changed, but version didn't!",
            artifact.kind, artifact.name
        );
    }
    Ok(())
}

async fn rindex(arch: &str, args: &[&str], target: &Path) -> Result<()> {
    let mut cmd = Command::new("xbps-rindex");
    cmd.env("XBPS_ARCH", arch).args(args).arg(target);
    check_call(&mut cmd).await
}

/// Extract the signer identity from a repo pubkey plist.
pub fn read_signature_by(plist: &Path) -> Result<String> {
    let content = std::fs::read_to_string(plist)
        .with_context(|| anyhow!("Reading {}", plist.display()))?;
    SIGNATURE_BY_RE
        .captures(&content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("No signature-by in {}", plist.display()))
}

/// Sign a repository index entry, if the project has signing configured.
pub async fn maybe_sign_artifact(project: &Project, artifact: &Path, arch: &str) -> Result<()> {
    let (pubkey, privkey) = match (project.pubkey_path(), project.privkey_path()) {
        (Some(pubkey), Some(privkey)) => (pubkey, privkey),
        _ => return Ok(()),
    };
    let signed_by = read_signature_by(&pubkey)?;
    let repo_dir = artifact
        .parent()
        .ok_or_else(|| anyhow!("Artifact {} has no parent", artifact.display()))?;

    let mut sign_repo = Command::new("xbps-rindex");
    sign_repo
        .env("XBPS_ARCH", arch)
        .args(["--signedby", &signed_by])
        .arg("--privkey")
        .arg(&privkey)
        .arg("-s")
        .arg(repo_dir);
    check_call(&mut sign_repo).await?;

    let mut sign_pkg = Command::new("xbps-rindex");
    sign_pkg
        .env("XBPS_ARCH", arch)
        .args(["--signedby", &signed_by])
        .arg("--privkey")
        .arg(&privkey)
        .arg("-S")
        .arg(artifact);
    check_call(&mut sign_pkg).await
}

/// Read the `{name: version}` tools registry; a missing file is an empty
/// registry.
pub fn load_tool_registry(tool_repo: &Path) -> Result<BTreeMap<String, String>> {
    let path = tool_repo.join(TOOLS_REGISTRY);
    match std::fs::read(&path) {
        Ok(content) => {
            serde_json::from_slice(&content).with_context(|| anyhow!("Parsing {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e).with_context(|| anyhow!("Reading {}", path.display())),
    }
}

/// Record a tool version in the registry next to `artifact_file`,
/// atomically replacing the registry file.
pub fn update_tool_registry(
    artifact_file: &Path,
    name: &str,
    version: &str,
    known: Option<BTreeMap<String, String>>,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let repo = artifact_file
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent", artifact_file.display()))?;
    let mut versions = match known {
        Some(versions) => versions,
        None => load_tool_registry(repo)?,
    };
    versions.insert(name.to_string(), version.to_string());

    let mut staged = tempfile::Builder::new()
        .prefix(".")
        .tempfile_in(repo)
        .with_context(|| anyhow!("Creating registry tempfile in {}", repo.display()))?;
    staged.write_all(&serde_json::to_vec_pretty(&versions)?)?;
    std::fs::set_permissions(staged.path(), std::fs::Permissions::from_mode(0o644))?;
    staged
        .persist(repo.join(TOOLS_REGISTRY))
        .context("Persisting tools registry")?;
    Ok(())
}

/// Seed the per-build repositories from the rolling set for an incremental
/// build: every already-received package and tool is copied over and
/// re-indexed so workers resolve against it.
pub async fn seed_build_repos(project: &Project, build: &Build) -> Result<()> {
    let package_repo = build.build_directory().join("package_repo");
    let tool_repo = build.build_directory().join("tool_repo");
    std::fs::create_dir_all(&package_repo)?;
    std::fs::create_dir_all(&tool_repo)?;

    let (packages, tools): (Vec<Artifact>, Vec<Artifact>) = {
        let inner = build.inner.lock().await;
        (
            inner
                .pkg_set
                .values()
                .map(|id| inner.artifact(*id).clone())
                .filter(|a| a.received)
                .collect(),
            inner
                .tool_set
                .values()
                .map(|id| inner.artifact(*id).clone())
                .filter(|a| a.received)
                .collect(),
        )
    };

    info!("populating build repository with up-to-date pkgs");
    let rolling_pkgs = project.rolling_repo(ArtifactKind::Package);
    for package in packages {
        let arch = package.architecture()?.concrete()?.to_string();
        let fname = package.package_filename()?;
        let target = package_repo.join(&fname);
        std::fs::copy(rolling_pkgs.join(&fname), &target)
            .with_context(|| anyhow!("Seeding {}", target.display()))?;
        rindex(&arch, &["-fa"], &target).await?;
        maybe_sign_artifact(project, &target, &arch).await?;
    }

    let rolling_tools = project.rolling_repo(ArtifactKind::Tool);
    for tool in tools {
        let fname = format!("{}.tar.gz", tool.name);
        let rolling_file = rolling_tools.join(&fname);
        std::fs::copy(&rolling_file, tool_repo.join(&fname))
            .with_context(|| anyhow!("Seeding tool {}", fname))?;
        update_tool_registry(&rolling_file, &tool.name, tool.version()?, None)?;
    }
    Ok(())
}

/// Drop the rolling repositories of a project, for non-incremental builds.
pub fn wipe_rolling(project: &Project) -> Result<()> {
    match std::fs::remove_dir_all(project.rolling_base()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| anyhow!("Wiping {}", project.rolling_base().display()))
        }
    }
}

/// Version summary fed to the graph generator for incremental builds:
/// package versions from the rolling package repository, tool versions from
/// the rolling registry.
pub async fn load_version_summary(project: &Project) -> Result<serde_json::Value> {
    let pkgs = scan_package_versions(&project.rolling_repo(ArtifactKind::Package))?;
    let tools = {
        let _guard = project.tool_repo_lock.lock().await;
        load_tool_registry(&project.rolling_repo(ArtifactKind::Tool))?
    };
    Ok(serde_json::json!({ "pkgs": pkgs, "tools": tools }))
}

/// Package file names carry `<name>-<version>.<arch>.xbps`.
fn scan_package_versions(pkg_repo: &Path) -> Result<BTreeMap<String, String>> {
    let mut pkgs = BTreeMap::new();
    let entries = match std::fs::read_dir(pkg_repo) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pkgs),
        Err(e) => return Err(e).with_context(|| anyhow!("Reading {}", pkg_repo.display())),
    };

    for entry in entries {
        let entry = entry?;
        let fname = entry.file_name();
        let fname = fname.to_string_lossy();
        let stem = match fname.strip_suffix(".xbps") {
            Some(stem) => stem,
            None => continue,
        };
        let (pkgver, _arch) = match stem.rsplit_once('.') {
            Some(split) => split,
            None => continue,
        };
        match pkgver.rsplit_once('-') {
            Some((name, version)) => {
                pkgs.insert(name.to_string(), version.to_string());
            }
            None => bail!("Malformed package file name '{}'", fname),
        }
    }
    Ok(pkgs)
}

/// Read the project's public signing key for inclusion in job messages.
pub fn signing_keys(
    project: &Project,
) -> Result<Option<BTreeMap<String, serde_bytes::ByteBuf>>> {
    let (fingerprint, pubkey) = match (project.fingerprint(), project.pubkey_path()) {
        (Some(fingerprint), Some(pubkey)) => (fingerprint, pubkey),
        _ => return Ok(None),
    };
    let blob = std::fs::read(&pubkey)
        .with_context(|| anyhow!("Reading signing key {}", pubkey.display()))?;
    let mut keys = BTreeMap::new();
    keys.insert(fingerprint.clone(), serde_bytes::ByteBuf::from(blob));
    Ok(Some(keys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_registry_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_tool_registry(dir.path()).unwrap().is_empty());

        let artifact = dir.path().join("gcc.tar.gz");
        std::fs::write(&artifact, b"tool").unwrap();
        update_tool_registry(&artifact, "gcc", "13.1", None).unwrap();
        update_tool_registry(&artifact, "binutils", "2.40", None).unwrap();

        let registry = load_tool_registry(dir.path()).unwrap();
        assert_eq!(registry.get("gcc").map(String::as_str), Some("13.1"));
        assert_eq!(registry.get("binutils").map(String::as_str), Some("2.40"));
    }

    #[test]
    fn test_read_signature_by() {
        let dir = tempfile::tempdir().unwrap();
        let plist = dir.path().join("ab.plist");
        std::fs::write(
            &plist,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>public-key-size</key>
    <integer>4096</integer>
    <key>signature-by</key>
    <string>builds@example.org</string>
</dict>
</plist>"#,
        )
        .unwrap();
        assert_eq!(read_signature_by(&plist).unwrap(), "builds@example.org");
    }

    #[test]
    fn test_scan_package_versions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gcc-libs-13.1_1.x86_64.xbps"), b"x").unwrap();
        std::fs::write(dir.path().join("docs-1_1.noarch.xbps"), b"x").unwrap();
        std::fs::write(dir.path().join("x86_64-repodata"), b"x").unwrap();

        let pkgs = scan_package_versions(dir.path()).unwrap();
        assert_eq!(pkgs.get("gcc-libs").map(String::as_str), Some("13.1_1"));
        assert_eq!(pkgs.get("docs").map(String::as_str), Some("1_1"));
        assert_eq!(pkgs.len(), 2);
    }

    #[test]
    fn test_scan_missing_repo_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pkgs = scan_package_versions(&dir.path().join("nowhere")).unwrap();
        assert!(pkgs.is_empty());
    }
}
