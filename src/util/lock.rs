//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use fs2::FileExt;

/// An exclusive advisory lock on a file, released on drop.
///
/// Two coordinators sharing one project_base would otherwise silently
/// interleave writes to the same build directory.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

pub fn lock_file(dir: &Path, name: &str) -> Result<FileLock> {
    let path = dir.join(name);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| anyhow!("Opening lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| anyhow!("Locking {} (another coordinator running?)", path.display()))?;
    Ok(FileLock { file })
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let held = lock_file(dir.path(), "coordinator").unwrap();
        assert!(lock_file(dir.path(), "coordinator").is_err());
        drop(held);
        assert!(lock_file(dir.path(), "coordinator").is_ok());
    }
}
