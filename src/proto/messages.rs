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

use anyhow::Context;
use anyhow::Result;
use anyhow::ensure;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::job::ArchSpec;
use crate::job::ArtifactKind;

lazy_static! {
    static ref FINGERPRINT_RE: Regex =
        Regex::new(r"^([a-zA-Z0-9]{2}:){15}[a-zA-Z0-9]{2}$").unwrap();
}

/// Tag value of the first chunk of a stream, in place of a digest.
pub const INITIAL_CHUNK: &[u8] = b"initial";

pub const BLAKE2B_DIGEST_LEN: usize = 64;

/// A self-describing wire record.
///
/// Messages are packed as named MessagePack maps; unpacking rejects unknown
/// fields (via serde) and then applies the per-message validator.
pub trait Message: Serialize + DeserializeOwned {
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    fn pack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).context("Packing message")
    }

    fn unpack(data: &[u8]) -> Result<Self> {
        let msg: Self = rmp_serde::from_slice(data).context("Unpacking message")?;
        msg.validate()?;
        Ok(msg)
    }
}

fn is_digest(bytes: &[u8]) -> bool {
    bytes.len() == BLAKE2B_DIGEST_LEN
}

/// Per-artifact descriptor carried in job messages.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    pub version: String,
    pub architecture: ArchSpec,
}

pub type ArtifactSpecMap = BTreeMap<String, ArtifactSpec>;

/// Everything a worker needs to run one job.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobMessage {
    pub project: String,
    pub job: String,
    pub repository: String,
    pub revision: String,
    /// Intake address the worker streams results back to.
    pub output: String,
    pub build_root: String,
    pub needed_tools: ArtifactSpecMap,
    pub needed_pkgs: ArtifactSpecMap,
    pub prod_tools: ArtifactSpecMap,
    pub prod_pkgs: ArtifactSpecMap,
    pub prod_files: Vec<String>,
    pub tool_repo: String,
    pub pkg_repo: String,
    pub commits_object: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xbps_keys: Option<BTreeMap<String, serde_bytes::ByteBuf>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_root: Option<String>,
    pub distfile_path: String,
}

impl Message for JobMessage {
    fn validate(&self) -> Result<()> {
        if let Some(keys) = &self.xbps_keys {
            for fingerprint in keys.keys() {
                ensure!(
                    FINGERPRINT_RE.is_match(fingerprint),
                    "Invalid signing key fingerprint '{}'",
                    fingerprint
                );
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    pub capabilities: BTreeSet<String>,
}

impl Message for JobRequest {}

/// One segment of a chained artifact stream. `last_hash` is either
/// `b"initial"` or the BLAKE2b digest of the previously packed chunk.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ChunkMessage {
    #[serde(with = "serde_bytes")]
    pub last_hash: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Message for ChunkMessage {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.last_hash == INITIAL_CHUNK || is_digest(&self.last_hash),
            "Chunk last_hash is neither 'initial' nor a BLAKE2b digest"
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ArtifactMessage {
    pub project: String,
    pub artifact_type: ArtifactKind,
    pub artifact: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hash: Option<serde_bytes::ByteBuf>,
}

impl Message for ArtifactMessage {
    fn validate(&self) -> Result<()> {
        if let Some(hash) = &self.last_hash {
            ensure!(is_digest(hash), "Artifact last_hash is not a BLAKE2b digest");
        }
        if self.success {
            ensure!(
                self.filename.is_some() && self.last_hash.is_some(),
                "Successful artifact without filename or stream hash"
            );
        }
        Ok(())
    }
}

impl ArtifactMessage {
    pub fn failure(project: &str, kind: ArtifactKind, name: &str) -> Self {
        ArtifactMessage {
            project: project.to_string(),
            artifact_type: kind,
            artifact: name.to_string(),
            success: false,
            filename: None,
            last_hash: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LogMessage {
    pub project: String,
    pub job: String,
    pub line: String,
}

impl Message for LogMessage {}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobCompletionMessage {
    pub project: String,
    pub job: String,
    pub exit_code: i64,
    pub run_time: f64,
}

impl Message for JobCompletionMessage {}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProjectStatus {
    pub git: String,
    pub description: String,
    pub classes: Vec<String>,
    pub running: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StatusMessage {
    pub hostname: String,
    pub load: (f64, f64, f64),
    pub pid: u32,
    pub projects: BTreeMap<String, ProjectStatus>,
}

impl Message for StatusMessage {}

/// Request to start a build of a project after `delay` seconds.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BuildMessage {
    pub project: String,
    pub delay: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<bool>,
}

impl Message for BuildMessage {
    fn validate(&self) -> Result<()> {
        ensure!(self.delay >= 0.0, "Negative build delay");
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub load: (f64, f64, f64),
    pub fqdn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

impl Message for Heartbeat {}

/// Decode a bare msgpack string, as used for command arguments and replies.
pub fn unpack_str(data: &[u8]) -> Result<String> {
    rmp_serde::from_slice(data).context("Unpacking string")
}

pub fn pack_str(s: &str) -> Vec<u8> {
    // strings always encode
    rmp_serde::to_vec(s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_roundtrip() {
        let msg = ChunkMessage {
            last_hash: INITIAL_CHUNK.to_vec(),
            data: b"abcd".to_vec(),
        };
        let packed = msg.pack().unwrap();
        let unpacked = ChunkMessage::unpack(&packed).unwrap();
        assert_eq!(unpacked.last_hash, INITIAL_CHUNK);
        assert_eq!(unpacked.data, b"abcd");
    }

    #[test]
    fn test_chunk_bad_hash_rejected() {
        let msg = ChunkMessage {
            last_hash: b"not-a-digest".to_vec(),
            data: vec![],
        };
        let packed = msg.pack().unwrap();
        assert!(ChunkMessage::unpack(&packed).is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        // a LogMessage with an extra field must not unpack
        #[derive(Serialize)]
        struct Wider {
            project: String,
            job: String,
            line: String,
            extra: u32,
        }
        let packed = rmp_serde::to_vec_named(&Wider {
            project: "p".into(),
            job: "j".into(),
            line: "l".into(),
            extra: 1,
        })
        .unwrap();
        assert!(LogMessage::unpack(&packed).is_err());
    }

    #[test]
    fn test_artifact_success_requires_stream() {
        let msg = ArtifactMessage {
            project: "p".into(),
            artifact_type: ArtifactKind::Package,
            artifact: "a".into(),
            success: true,
            filename: None,
            last_hash: None,
        };
        assert!(msg.validate().is_err());
        assert!(ArtifactMessage::failure("p", ArtifactKind::Tool, "t").validate().is_ok());
    }

    #[test]
    fn test_job_message_fingerprint_validation() {
        let mut keys = BTreeMap::new();
        keys.insert(String::from("zz:zz"), serde_bytes::ByteBuf::from(vec![1u8]));
        let msg = JobMessage {
            project: "p".into(),
            job: "x:y".into(),
            repository: "https://example.com/r.git".into(),
            revision: "abc".into(),
            output: "tcp://127.0.0.1:1".into(),
            build_root: "/var/lib/build".into(),
            needed_tools: BTreeMap::new(),
            needed_pkgs: BTreeMap::new(),
            prod_tools: BTreeMap::new(),
            prod_pkgs: BTreeMap::new(),
            prod_files: vec![],
            tool_repo: "https://example.com/tools".into(),
            pkg_repo: "https://example.com/pkgs".into(),
            commits_object: serde_json::json!({}),
            xbps_keys: Some(keys),
            mirror_root: None,
            distfile_path: "xbps/".into(),
        };
        assert!(msg.validate().is_err());

        let good = "aa:bb:cc:dd:ee:ff:00:11:22:33:44:55:66:77:88:99";
        let mut msg = msg;
        let mut keys = BTreeMap::new();
        keys.insert(String::from(good), serde_bytes::ByteBuf::from(vec![1u8]));
        msg.xbps_keys = Some(keys);
        assert!(msg.validate().is_ok());

        let packed = msg.pack().unwrap();
        let unpacked = JobMessage::unpack(&packed).unwrap();
        assert_eq!(unpacked.job, "x:y");
        assert!(unpacked.xbps_keys.unwrap().contains_key(good));
    }

    #[test]
    fn test_arch_spec_wire_forms() {
        let one: ArtifactSpec =
            serde_json::from_str(r#"{"version": "1.0", "architecture": "x86_64"}"#).unwrap();
        assert_eq!(one.architecture, ArchSpec::One("x86_64".into()));

        let many: ArtifactSpec =
            serde_json::from_str(r#"{"version": "1.0", "architecture": ["x86_64"]}"#).unwrap();
        assert_eq!(many.architecture, ArchSpec::Many(vec!["x86_64".into()]));
    }
}
