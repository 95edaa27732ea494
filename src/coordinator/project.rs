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
use std::sync::Mutex;

use getset::CopyGetters;
use getset::Getters;
use typed_builder::TypedBuilder;

use crate::build::Build;
use crate::config::ProjectConfig;
use crate::job::ArtifactKind;

/// A named, persistent build target from the coordinator configuration.
#[derive(Getters, CopyGetters, TypedBuilder)]
pub struct Project {
    #[getset(get = "pub")]
    name: String,

    #[getset(get = "pub")]
    git: String,

    #[getset(get = "pub")]
    description: String,

    #[getset(get = "pub")]
    classes: Vec<String>,

    /// Package repository URL handed to workers.
    #[getset(get = "pub")]
    packages: String,

    /// Tool repository URL handed to workers.
    #[getset(get = "pub")]
    tools: String,

    #[getset(get = "pub")]
    base: PathBuf,

    #[getset(get = "pub")]
    distfile_path: String,

    #[getset(get_copy = "pub")]
    incremental: bool,

    #[getset(get = "pub")]
    fingerprint: Option<String>,

    #[getset(get = "pub")]
    mirror_root: Option<String>,

    #[getset(get = "pub")]
    default_branch: String,

    /// The running build, if any. At most one build per project is a hard
    /// invariant, enforced here and by the on-disk coordinator lock.
    #[builder(default)]
    pub current: Mutex<Option<Arc<Build>>>,

    /// Serializes read-modify-write cycles on the rolling tools registry.
    #[builder(default)]
    pub tool_repo_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Project({}, git: {})", self.name, self.git)
    }
}

impl Project {
    pub fn from_config(name: &str, cfg: &ProjectConfig, project_base: &Path) -> Self {
        Project::builder()
            .name(name.to_string())
            .git(cfg.git().clone())
            .description(cfg.description().clone().unwrap_or_default())
            .classes(cfg.classes().clone())
            .packages(cfg.packages().clone())
            .tools(cfg.tools().clone())
            .base(project_base.join(name))
            .distfile_path(cfg.distfile_path().clone())
            .incremental(cfg.incremental())
            .fingerprint(cfg.fingerprint().clone())
            .mirror_root(cfg.mirror_root().clone())
            .default_branch(cfg.default_branch().clone())
            .build()
    }

    pub fn current_build(&self) -> Option<Arc<Build>> {
        self.current.lock().ok().and_then(|cur| cur.clone())
    }

    pub fn rolling_base(&self) -> PathBuf {
        self.base.join("rolling")
    }

    pub fn rolling_repo(&self, kind: ArtifactKind) -> PathBuf {
        self.rolling_base().join(kind.repo_dirname())
    }

    /// Signing key material lives next to the project directory, named by
    /// fingerprint.
    pub fn pubkey_path(&self) -> Option<PathBuf> {
        self.fingerprint
            .as_ref()
            .map(|fp| self.base.join(format!("{}.plist", fp)))
    }

    pub fn privkey_path(&self) -> Option<PathBuf> {
        self.fingerprint
            .as_ref()
            .map(|fp| self.base.join(format!("{}.rsa", fp)))
    }
}
