//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use blake2::Blake2b512;
use blake2::Digest;
use tracing::trace;

use crate::proto::messages::BLAKE2B_DIGEST_LEN;
use crate::proto::messages::ChunkMessage;
use crate::proto::messages::INITIAL_CHUNK;

/// An in-flight artifact stream: the staging file being appended to and the
/// running digest of everything appended so far.
#[derive(Debug)]
pub struct ChunkStream {
    pub file: std::fs::File,
    pub path: PathBuf,
    pub hasher: Blake2b512,
}

/// Reassembly table for chunked artifact uploads.
///
/// Streams are keyed by the BLAKE2b digest of the last chunk *message*
/// received for them; each incoming chunk names its predecessor's digest,
/// which both identifies the stream and proves nothing was lost or
/// reordered. A chunk whose predecessor is unknown belongs to a broken
/// stream and is dropped without comment.
#[derive(Debug)]
pub struct ChunkTable {
    streams: Mutex<HashMap<[u8; BLAKE2B_DIGEST_LEN], ChunkStream>>,
    collection_dir: PathBuf,
}

impl ChunkTable {
    pub fn new(collection_dir: PathBuf) -> Self {
        ChunkTable {
            streams: Mutex::new(HashMap::new()),
            collection_dir,
        }
    }

    /// Apply one chunk message. `raw` must be the exact packed bytes the
    /// digest chain is computed over.
    pub fn ingest(&self, raw: &[u8], chunk: &ChunkMessage) -> Result<()> {
        let mut streams = self.streams.lock().map_err(|_| anyhow!("Lock poisoned"))?;

        let mut stream = if chunk.last_hash == INITIAL_CHUNK {
            self.open_staging()?
        } else {
            let mut key = [0u8; BLAKE2B_DIGEST_LEN];
            key.copy_from_slice(&chunk.last_hash);
            match streams.remove(&key) {
                Some(stream) => stream,
                None => {
                    trace!("chunk for unknown stream dropped");
                    return Ok(());
                }
            }
        };

        let mut digest = [0u8; BLAKE2B_DIGEST_LEN];
        digest.copy_from_slice(&Blake2b512::digest(raw));

        stream.hasher.update(&chunk.data);
        stream
            .file
            .write_all(&chunk.data)
            .with_context(|| anyhow!("Appending to {}", stream.path.display()))?;
        streams.insert(digest, stream);
        Ok(())
    }

    /// Hand a completed stream over to artifact recording.
    pub fn take(&self, last_hash: &[u8]) -> Option<ChunkStream> {
        if last_hash.len() != BLAKE2B_DIGEST_LEN {
            return None;
        }
        let mut key = [0u8; BLAKE2B_DIGEST_LEN];
        key.copy_from_slice(last_hash);
        self.streams.lock().ok()?.remove(&key)
    }

    fn open_staging(&self) -> Result<ChunkStream> {
        use std::os::unix::fs::PermissionsExt;

        let (file, path) = tempfile::Builder::new()
            .prefix(".collect")
            .tempfile_in(&self.collection_dir)
            .with_context(|| {
                anyhow!("Creating staging file in {}", self.collection_dir.display())
            })?
            .keep()
            .context("Keeping staging file")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .with_context(|| anyhow!("Setting mode on {}", path.display()))?;
        Ok(ChunkStream {
            file,
            path,
            hasher: Blake2b512::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Message;

    /// Chain chunks the way a worker does and return the packed messages
    /// plus the final chain hash.
    fn chain(chunks: &[&[u8]]) -> (Vec<(Vec<u8>, ChunkMessage)>, Vec<u8>) {
        let mut last_hash = INITIAL_CHUNK.to_vec();
        let mut out = Vec::new();
        for data in chunks {
            let msg = ChunkMessage {
                last_hash: last_hash.clone(),
                data: data.to_vec(),
            };
            let raw = msg.pack().unwrap();
            last_hash = Blake2b512::digest(&raw).to_vec();
            out.push((raw, msg));
        }
        (out, last_hash)
    }

    #[test]
    fn test_stream_reassembly_law() {
        let dir = tempfile::tempdir().unwrap();
        let table = ChunkTable::new(dir.path().to_path_buf());

        let (messages, last_hash) = chain(&[b"ab", b"cd", b"ef"]);
        for (raw, msg) in &messages {
            table.ingest(raw, msg).unwrap();
        }

        let stream = table.take(&last_hash).unwrap();
        assert_eq!(std::fs::read(&stream.path).unwrap(), b"abcdef");
        assert_eq!(
            stream.hasher.finalize().as_slice(),
            Blake2b512::digest(b"abcdef").as_slice()
        );
    }

    #[test]
    fn test_broken_chain_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let table = ChunkTable::new(dir.path().to_path_buf());

        // second chunk arrives with a predecessor digest never seen
        let msg = ChunkMessage {
            last_hash: vec![0u8; BLAKE2B_DIGEST_LEN],
            data: b"orphan".to_vec(),
        };
        let raw = msg.pack().unwrap();
        table.ingest(&raw, &msg).unwrap();
        assert!(table.take(&Blake2b512::digest(&raw)).is_none());
    }

    #[test]
    fn test_concurrent_streams_stay_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let table = ChunkTable::new(dir.path().to_path_buf());

        let (first, first_hash) = chain(&[b"one-a", b"one-b"]);
        let (second, second_hash) = chain(&[b"two-a", b"two-b"]);

        // interleave the two chains
        table.ingest(&first[0].0, &first[0].1).unwrap();
        table.ingest(&second[0].0, &second[0].1).unwrap();
        table.ingest(&first[1].0, &first[1].1).unwrap();
        table.ingest(&second[1].0, &second[1].1).unwrap();

        let one = table.take(&first_hash).unwrap();
        let two = table.take(&second_hash).unwrap();
        assert_eq!(std::fs::read(&one.path).unwrap(), b"one-aone-b");
        assert_eq!(std::fs::read(&two.path).unwrap(), b"two-atwo-b");
    }

    #[test]
    fn test_take_consumes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let table = ChunkTable::new(dir.path().to_path_buf());

        let (messages, last_hash) = chain(&[b"x"]);
        table.ingest(&messages[0].0, &messages[0].1).unwrap();
        assert!(table.take(&last_hash).is_some());
        assert!(table.take(&last_hash).is_none());
    }
}
