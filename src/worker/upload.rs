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

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use blake2::Blake2b512;
use blake2::Digest;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::job::ArtifactKind;
use crate::proto::Message;
use crate::proto::messages::ArtifactMessage;
use crate::proto::messages::ChunkMessage;
use crate::proto::messages::INITIAL_CHUNK;
use crate::worker::FrameSink;
use crate::worker::send_message;
use crate::worker::send_tagged;

pub const CHUNK_SIZE: usize = 32 * 1024;

/// Stream a file to the coordinator as a chained chunk sequence followed by
/// the artifact record.
///
/// Each chunk message carries the BLAKE2b digest of the previously *packed*
/// chunk message; the chain both identifies the stream on the receiving
/// side and proves continuity. Empty files still send one (empty) chunk so
/// the artifact record has a chain to reference.
pub async fn upload_artifact<S: FrameSink>(
    sink: &Mutex<S>,
    project: &str,
    kind: ArtifactKind,
    name: &str,
    path: &Path,
) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| anyhow!("Opening {} for upload", path.display()))?;

    let mut last_hash = INITIAL_CHUNK.to_vec();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent_any = false;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| anyhow!("Reading {}", path.display()))?;
        if n == 0 && sent_any {
            break;
        }
        let chunk = ChunkMessage {
            last_hash: last_hash.clone(),
            data: buf[..n].to_vec(),
        };
        let raw = chunk.pack()?;
        last_hash = Blake2b512::digest(&raw).to_vec();
        send_tagged(sink, "chunk", raw).await?;
        sent_any = true;
        if n == 0 {
            break;
        }
    }

    let filename = path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
        .to_string_lossy()
        .into_owned();
    let record = ArtifactMessage {
        project: project.to_string(),
        artifact_type: kind,
        artifact: name.to_string(),
        success: true,
        filename: Some(filename),
        last_hash: Some(serde_bytes::ByteBuf::from(last_hash)),
    };
    send_message(sink, "artifact", &record).await?;
    debug!("successfully uploaded {} {} for {}", kind, name, project);
    Ok(())
}

/// Report an artifact the job could not produce.
pub async fn send_failure<S: FrameSink>(
    sink: &Mutex<S>,
    project: &str,
    kind: ArtifactKind,
    name: &str,
) -> Result<()> {
    send_message(sink, "artifact", &ArtifactMessage::failure(project, kind, name)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;
    use tokio_util::codec::FramedRead;
    use tokio_util::codec::FramedWrite;

    use crate::proto::MultipartCodec;

    // An in-memory stand-in for the intake connection.
    fn test_sink() -> (
        Mutex<FramedWrite<tokio::io::DuplexStream, MultipartCodec>>,
        FramedRead<tokio::io::DuplexStream, MultipartCodec>,
    ) {
        let (near, far) = tokio::io::duplex(1024 * 1024);
        (
            Mutex::new(FramedWrite::new(near, MultipartCodec)),
            FramedRead::new(far, MultipartCodec),
        )
    }

    #[tokio::test]
    async fn test_upload_chain_reassembles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.xbps");
        // two full chunks plus a tail
        let content: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let (sink, mut received) = test_sink();
        let uploader = async {
            upload_artifact(&sink, "proj", ArtifactKind::Package, "p", &path)
                .await
                .unwrap();
        };

        let collector = async {
            let table = crate::intake::chunks::ChunkTable::new(dir.path().to_path_buf());
            loop {
                let frames = received.next().await.unwrap().unwrap();
                match std::str::from_utf8(&frames[0]).unwrap() {
                    "chunk" => {
                        let chunk = ChunkMessage::unpack(&frames[1]).unwrap();
                        table.ingest(&frames[1], &chunk).unwrap();
                    }
                    "artifact" => {
                        return (table, ArtifactMessage::unpack(&frames[1]).unwrap());
                    }
                    other => panic!("unexpected tag {}", other),
                }
            }
        };

        let ((), (table, record)) = tokio::join!(uploader, collector);
        assert!(record.success);
        assert_eq!(record.filename.as_deref(), Some("artifact.xbps"));

        let stream = table.take(record.last_hash.as_ref().unwrap()).unwrap();
        assert_eq!(std::fs::read(&stream.path).unwrap(), content);
        assert_eq!(
            stream.hasher.finalize().as_slice(),
            Blake2b512::digest(&content).as_slice()
        );
    }

    #[tokio::test]
    async fn test_empty_file_still_forms_a_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let (sink, mut received) = test_sink();
        let uploader = async {
            upload_artifact(&sink, "proj", ArtifactKind::File, "f", &path)
                .await
                .unwrap();
        };
        let collector = async {
            let mut messages = Vec::new();
            loop {
                let frames = received.next().await.unwrap().unwrap();
                let done = frames[0].as_ref() == &b"artifact"[..];
                messages.push(frames);
                if done {
                    return messages;
                }
            }
        };

        let ((), messages) = tokio::join!(uploader, collector);
        assert_eq!(messages.len(), 2, "one empty chunk plus the record");
        let record = ArtifactMessage::unpack(&messages[1][1]).unwrap();
        assert!(record.validate().is_ok());
        assert!(record.last_hash.is_some());
    }
}
