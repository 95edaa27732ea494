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

use indexmap::IndexMap;
use serde::Deserialize;

/// Job graph as emitted by `xbstrap-pipeline compute-graph --artifacts
/// --json`. Insertion order is preserved; it drives solver scan order and
/// therefore dispatch order.
pub type GraphInput = IndexMap<String, GraphJob>;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct GraphJob {
    pub up2date: bool,
    pub unstable: bool,
    /// Nullable until all graph generators emit it.
    #[serde(default)]
    pub capabilities: Option<BTreeSet<String>>,
    pub products: GraphProducts,
    pub needed: GraphNeeded,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct GraphProducts {
    #[serde(default)]
    pub tools: Vec<GraphArtifact>,
    #[serde(default)]
    pub pkgs: Vec<GraphArtifact>,
    #[serde(default)]
    pub files: Vec<GraphFile>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct GraphNeeded {
    #[serde(default)]
    pub tools: Vec<GraphArtifact>,
    #[serde(default)]
    pub pkgs: Vec<GraphArtifact>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GraphArtifact {
    pub name: String,
    pub version: String,
    pub architecture: String,
}

/// File products carry a path on the worker; only the name matters here.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GraphFile {
    pub name: String,
    #[allow(dead_code)]
    pub filepath: String,
}
