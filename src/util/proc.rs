//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::process::Stdio;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use tracing::info;

fn describe(cmd: &Command) -> String {
    let std = cmd.as_std();
    let mut s = std.get_program().to_string_lossy().into_owned();
    for arg in std.get_args() {
        s.push(' ');
        s.push_str(&arg.to_string_lossy());
    }
    s
}

/// Run a command to completion, failing on a non-zero exit status.
pub async fn check_call(cmd: &mut Command) -> Result<()> {
    let what = describe(cmd);
    info!("running command {}", what);
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| anyhow!("Spawning '{}'", what))?;
    debug!("'{}' exited with {}", what, output.status);
    if !output.status.success() {
        return Err(anyhow!(
            "Command '{}' failed with {}: {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}

/// Run a command to completion and return its stdout; `input`, if given, is
/// written to the child's stdin.
pub async fn check_output(cmd: &mut Command, input: Option<&[u8]>) -> Result<Vec<u8>> {
    let what = describe(cmd);
    info!("running command {}", what);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    if input.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    let mut child = cmd.spawn().with_context(|| anyhow!("Spawning '{}'", what))?;
    if let Some(data) = input {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("No stdin handle for '{}'", what))?;
        stdin.write_all(data).await?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| anyhow!("Waiting for '{}'", what))?;
    debug!("'{}' exited with {}", what, output.status);
    if !output.status.success() {
        return Err(anyhow!(
            "Command '{}' failed with {}: {}",
            what,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(output.stdout)
}
