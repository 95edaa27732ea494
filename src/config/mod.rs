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
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::ensure;
use getset::CopyGetters;
use getset::Getters;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

lazy_static! {
    // C-identifier-ish, and no leading underscore either: directories like
    // _coldir and _tmp stay in their own namespace
    static ref PROJECT_NAME_RE: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:_[A-Za-z0-9]+)*$").unwrap();
}

fn default_distfile_path() -> String {
    String::from("xbps/")
}

fn default_branch() -> String {
    String::from("master")
}

/// A socket endpoint: either one URL for both sides, or distinct bind and
/// connect addresses (e.g. binding on a wildcard while workers connect to
/// a routable name).
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum EndpointSpec {
    Single(String),
    Pair { bind: String, connect: String },
}

impl EndpointSpec {
    pub fn bind(&self) -> &str {
        match self {
            EndpointSpec::Single(url) => url,
            EndpointSpec::Pair { bind, .. } => bind,
        }
    }

    pub fn connect(&self) -> &str {
        match self {
            EndpointSpec::Single(url) => url,
            EndpointSpec::Pair { connect, .. } => connect,
        }
    }

    fn validate(&self, what: &str) -> Result<()> {
        for url in [self.bind(), self.connect()] {
            ensure!(
                url.starts_with("tcp://") || url.starts_with("ipc://"),
                "{}: endpoint '{}' must be a tcp:// or ipc:// URL",
                what,
                url
            );
        }
        Ok(())
    }
}

#[derive(Deserialize, Getters, CopyGetters, Debug, Clone)]
pub struct ProjectConfig {
    #[getset(get = "pub")]
    git: String,

    #[getset(get = "pub")]
    #[serde(default)]
    description: Option<String>,

    #[getset(get = "pub")]
    #[serde(default)]
    classes: Vec<String>,

    #[getset(get = "pub")]
    packages: String,

    #[getset(get = "pub")]
    tools: String,

    #[getset(get = "pub")]
    #[serde(default)]
    fingerprint: Option<String>,

    #[getset(get_copy = "pub")]
    #[serde(default)]
    incremental: bool,

    #[getset(get = "pub")]
    #[serde(default = "default_distfile_path")]
    distfile_path: String,

    #[getset(get = "pub")]
    #[serde(default)]
    mirror_root: Option<String>,

    #[getset(get = "pub")]
    #[serde(default = "default_branch")]
    default_branch: String,
}

#[derive(Deserialize, Getters, Debug, Clone)]
pub struct CoordinatorConfig {
    #[getset(get = "pub")]
    command_endpoint: EndpointSpec,

    #[getset(get = "pub")]
    project_base: PathBuf,

    /// Build root on the workers; must be absolute.
    #[getset(get = "pub")]
    build_root: PathBuf,

    #[getset(get = "pub")]
    intake: EndpointSpec,

    #[getset(get = "pub")]
    worker_endpoint: String,

    /// Postgres URL; artifact history is disabled when absent.
    #[getset(get = "pub")]
    #[serde(default)]
    artifact_history: Option<String>,

    #[getset(get = "pub")]
    projects: BTreeMap<String, ProjectConfig>,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        self.command_endpoint.validate("command_endpoint")?;
        self.intake.validate("intake")?;
        ensure!(
            self.worker_endpoint.starts_with("tcp://")
                || self.worker_endpoint.starts_with("ipc://"),
            "worker_endpoint '{}' must be a tcp:// or ipc:// URL",
            self.worker_endpoint
        );
        ensure!(
            self.build_root.is_absolute(),
            "build_root '{}' must be absolute",
            self.build_root.display()
        );
        for name in self.projects.keys() {
            ensure!(
                PROJECT_NAME_RE.is_match(name),
                "Invalid project identifier '{}'",
                name
            );
        }
        Ok(())
    }
}

#[derive(Deserialize, Getters, Debug, Clone)]
pub struct WorkerConfig {
    #[getset(get = "pub")]
    job_endpoint: String,

    #[getset(get = "pub")]
    #[serde(default)]
    capabilities: BTreeSet<String>,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.job_endpoint.starts_with("tcp://")
                || self.job_endpoint.starts_with("ipc://"),
            "job_endpoint '{}' must be a tcp:// or ipc:// URL",
            self.job_endpoint
        );
        Ok(())
    }
}

/// Configuration directory, overridable for test deployments.
pub fn config_dir() -> PathBuf {
    std::env::var_os("XBFORGE_CFG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/xbforge"))
}

fn load_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let mut settings = config::Config::default();
    settings
        .merge(config::File::from(path.to_path_buf()))
        .with_context(|| anyhow!("Reading configuration from {}", path.display()))?;
    settings
        .try_into()
        .with_context(|| anyhow!("Deserializing configuration from {}", path.display()))
}

pub fn load_coordinator_config(path: Option<&Path>) -> Result<CoordinatorConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_dir().join("coordinator.toml"));
    let cfg: CoordinatorConfig = load_file(&path)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_worker_config(path: Option<&Path>) -> Result<WorkerConfig> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_dir().join("worker.toml"));
    let cfg: WorkerConfig = load_file(&path)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COORDINATOR_TOML: &str = r#"
        command_endpoint = "ipc:///run/xbforge/cmd.sock"
        project_base = "/var/lib/xbforge"
        build_root = "/var/lib/xbforge-build"
        worker_endpoint = "tcp://0.0.0.0:16001"

        [intake]
        bind = "tcp://0.0.0.0:16999"
        connect = "tcp://coordinator.example.org:16999"

        [projects.managarm]
        git = "https://example.org/managarm.git"
        description = "Reference distribution"
        classes = ["nightly"]
        packages = "https://pkgs.example.org/managarm"
        tools = "https://tools.example.org/managarm"
        incremental = true
        mirror_root = "https://mirrors.example.org"
    "#;

    #[test]
    fn test_coordinator_config_parses() {
        let cfg: CoordinatorConfig = toml::from_str(COORDINATOR_TOML).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.command_endpoint().bind(), "ipc:///run/xbforge/cmd.sock");
        assert_eq!(cfg.intake().bind(), "tcp://0.0.0.0:16999");
        assert_eq!(
            cfg.intake().connect(),
            "tcp://coordinator.example.org:16999"
        );

        let project = &cfg.projects()["managarm"];
        assert!(project.incremental());
        assert_eq!(project.default_branch(), "master");
        assert_eq!(project.distfile_path(), "xbps/");
        assert_eq!(project.classes(), &vec![String::from("nightly")]);
    }

    #[test]
    fn test_invalid_project_name_rejected() {
        let toml = COORDINATOR_TOML.replace("projects.managarm", "projects._hidden");
        let cfg: CoordinatorConfig = toml::from_str(&toml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_relative_build_root_rejected() {
        let toml = COORDINATOR_TOML.replace("\"/var/lib/xbforge-build\"", "\"builds\"");
        let cfg: CoordinatorConfig = toml::from_str(&toml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_worker_config_defaults() {
        let cfg: WorkerConfig =
            toml::from_str("job_endpoint = \"tcp://coordinator:16001\"").unwrap();
        cfg.validate().unwrap();
        assert!(cfg.capabilities().is_empty());

        let cfg: WorkerConfig = toml::from_str(
            "job_endpoint = \"tcp://coordinator:16001\"\ncapabilities = [\"kvm\", \"big-mem\"]",
        )
        .unwrap();
        assert!(cfg.capabilities().contains("kvm"));
    }

    #[test]
    fn test_project_name_regex() {
        for good in ["managarm", "Foo", "a1", "foo_bar", "foo_bar_2"] {
            assert!(PROJECT_NAME_RE.is_match(good), "{}", good);
        }
        for bad in ["_foo", "1foo", "foo-bar", "foo__bar", "foo_", ""] {
            assert!(!PROJECT_NAME_RE.is_match(bad), "{}", bad);
        }
    }
}
