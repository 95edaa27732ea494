//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use anyhow::Result;
use anyhow::anyhow;
use anyhow::ensure;
use serde::Deserialize;
use serde::Serialize;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Tool,
    Package,
    File,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Tool => "tool",
            ArtifactKind::Package => "package",
            ArtifactKind::File => "file",
        }
    }

    /// Repository directory name for this kind, both per-build and rolling.
    pub fn repo_dirname(&self) -> String {
        format!("{}_repo", self.as_str())
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architecture of a tool or package.
///
/// The graph generator emits single strings; "noarch" entries are rewritten
/// after graph load to the build's concrete architecture *list*, so both
/// forms travel the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
pub enum ArchSpec {
    One(String),
    Many(Vec<String>),
}

impl ArchSpec {
    pub fn is_noarch(&self) -> bool {
        matches!(self, ArchSpec::One(s) if s == "noarch")
    }

    /// Collapse to the single concrete architecture. List values must be
    /// singleton; anything else is a multiarch build, which is unsupported.
    pub fn concrete(&self) -> Result<&str> {
        match self {
            ArchSpec::One(s) => Ok(s),
            ArchSpec::Many(v) => {
                ensure!(v.len() == 1, "multiarch support missing, yet demanded?");
                Ok(&v[0])
            }
        }
    }
}

impl std::fmt::Display for ArchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchSpec::One(s) => f.write_str(s),
            ArchSpec::Many(v) => write!(f, "[{}]", v.join(", ")),
        }
    }
}

/// Index of an [Artifact] in its build's arena.
///
/// Producers and consumers of an artifact share the arena slot, so a status
/// flip is visible on both sides without any cross-references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArtifactId(pub usize);

/// An atom the job graph produces or consumes.
#[derive(Serialize, Clone, Debug)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub name: String,
    pub version: Option<String>,
    pub architecture: Option<ArchSpec>,
    pub received: bool,
    pub failed: bool,
}

impl Artifact {
    pub fn new(
        kind: ArtifactKind,
        name: String,
        version: Option<String>,
        architecture: Option<ArchSpec>,
    ) -> Self {
        Artifact {
            kind,
            name,
            version,
            architecture,
            received: false,
            failed: false,
        }
    }

    pub fn version(&self) -> Result<&str> {
        self.version
            .as_deref()
            .ok_or_else(|| anyhow!("Artifact '{}' has no version", self.name))
    }

    pub fn architecture(&self) -> Result<&ArchSpec> {
        self.architecture
            .as_ref()
            .ok_or_else(|| anyhow!("Artifact '{}' has no architecture", self.name))
    }

    /// Descriptor for job messages; only valid for tools and packages.
    pub fn spec(&self) -> Result<crate::proto::messages::ArtifactSpec> {
        Ok(crate::proto::messages::ArtifactSpec {
            version: self.version()?.to_string(),
            architecture: self.architecture()?.clone(),
        })
    }

    /// File name of a package artifact; set-valued architectures collapse to
    /// "noarch" in the name while the content is arch-specific.
    pub fn package_filename(&self) -> Result<String> {
        let filearch = match self.architecture()? {
            ArchSpec::One(s) => s.clone(),
            ArchSpec::Many(_) => String::from("noarch"),
        };
        Ok(format!("{}-{}.{}.xbps", self.name, self.version()?, filearch))
    }
}

// received/failed are status bits, not identity
impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.version == other.version
            && self.architecture == other.architecture
    }
}

impl Eq for Artifact {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_status_bits() {
        let a = Artifact::new(
            ArtifactKind::Package,
            "p".into(),
            Some("1.0".into()),
            Some(ArchSpec::One("x86_64".into())),
        );
        let mut b = a.clone();
        b.received = true;
        b.failed = true;
        assert_eq!(a, b);
    }

    #[test]
    fn test_concrete_rejects_multiarch() {
        let one = ArchSpec::One("x86_64".into());
        assert_eq!(one.concrete().unwrap(), "x86_64");

        let singleton = ArchSpec::Many(vec!["riscv64".into()]);
        assert_eq!(singleton.concrete().unwrap(), "riscv64");

        let multi = ArchSpec::Many(vec!["x86_64".into(), "riscv64".into()]);
        assert!(multi.concrete().is_err());
    }

    #[test]
    fn test_package_filename() {
        let concrete = Artifact::new(
            ArtifactKind::Package,
            "gcc".into(),
            Some("13.1_1".into()),
            Some(ArchSpec::One("x86_64".into())),
        );
        assert_eq!(concrete.package_filename().unwrap(), "gcc-13.1_1.x86_64.xbps");

        let expanded = Artifact::new(
            ArtifactKind::Package,
            "docs".into(),
            Some("1_1".into()),
            Some(ArchSpec::Many(vec!["x86_64".into()])),
        );
        assert_eq!(expanded.package_filename().unwrap(), "docs-1_1.noarch.xbps");
    }
}
