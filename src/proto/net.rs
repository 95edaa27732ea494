//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UnixListener;
use tokio::net::UnixStream;

/// Socket addresses are URLs: `tcp://host:port` or `ipc:///path/to.sock`.
fn split_url(url: &str) -> Result<(&str, &str)> {
    url.split_once("://")
        .ok_or_else(|| anyhow!("Endpoint '{}' is not a tcp:// or ipc:// URL", url))
}

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

pub async fn bind(url: &str) -> Result<Listener> {
    let (scheme, rest) = split_url(url)?;
    match scheme {
        "tcp" => {
            let listener = TcpListener::bind(rest)
                .await
                .with_context(|| anyhow!("Binding {}", url))?;
            Ok(Listener::Tcp(listener))
        }
        "ipc" => {
            // a leftover socket from a previous run would fail the bind
            match std::fs::remove_file(rest) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| anyhow!("Unlinking {}", rest)),
            }
            let listener =
                UnixListener::bind(rest).with_context(|| anyhow!("Binding {}", url))?;
            ipc_chmod(url, 0o664)?;
            Ok(Listener::Unix(listener))
        }
        other => Err(anyhow!("Unsupported endpoint scheme '{}'", other)),
    }
}

pub async fn connect(url: &str) -> Result<Stream> {
    let (scheme, rest) = split_url(url)?;
    match scheme {
        "tcp" => {
            let stream = TcpStream::connect(rest)
                .await
                .with_context(|| anyhow!("Connecting to {}", url))?;
            Ok(Stream::Tcp(stream))
        }
        "ipc" => {
            let stream = UnixStream::connect(rest)
                .await
                .with_context(|| anyhow!("Connecting to {}", url))?;
            Ok(Stream::Unix(stream))
        }
        other => Err(anyhow!("Unsupported endpoint scheme '{}'", other)),
    }
}

pub fn ipc_chmod(url: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(path) = url.strip_prefix("ipc://") {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| anyhow!("Setting permissions on {}", path))?;
    }
    Ok(())
}

impl Listener {
    /// Accept one peer; the returned string labels the peer for logging.
    pub async fn accept(&self) -> Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), String::from("ipc peer")))
            }
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
