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
use walkdir::WalkDir;

/// Copy the contents of `src` over `dst`, creating directories as needed.
///
/// Existing files in `dst` are overwritten; files only present in `dst` are
/// left alone.
pub fn merge_tree_into(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| anyhow!("Walking {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| anyhow!("Stripping prefix {}", src.display()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| anyhow!("Creating {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| anyhow!("Creating {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target).with_context(|| {
                anyhow!("Copying {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

/// BLAKE2b digest of a file's contents.
pub fn hash_file(path: &Path) -> Result<[u8; 64]> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)
        .with_context(|| anyhow!("Opening {} for hashing", path.display()))?;
    let mut hasher = Blake2b512::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| anyhow!("Reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// Move a file, falling back to copy-and-unlink across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to).with_context(|| {
                anyhow!("Copying {} to {}", from.display(), to.display())
            })?;
            std::fs::remove_file(from)
                .with_context(|| anyhow!("Removing {}", from.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_tree_into_copies_nested_files() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/f.txt"), b"content").unwrap();
        std::fs::write(src.path().join("top.txt"), b"top").unwrap();
        std::fs::write(dst.path().join("keep.txt"), b"keep").unwrap();

        merge_tree_into(src.path(), dst.path()).unwrap();

        assert_eq!(std::fs::read(dst.path().join("a/b/f.txt")).unwrap(), b"content");
        assert_eq!(std::fs::read(dst.path().join("top.txt")).unwrap(), b"top");
        assert_eq!(std::fs::read(dst.path().join("keep.txt")).unwrap(), b"keep");
    }

    #[test]
    fn test_hash_file_matches_direct_digest() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"abcdef").unwrap();

        let mut expected = [0u8; 64];
        expected.copy_from_slice(&Blake2b512::digest(b"abcdef"));
        assert_eq!(hash_file(&p).unwrap(), expected);
    }
}
