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
use std::sync::Arc;

use anyhow::Error;
use anyhow::Result;
use anyhow::bail;
use bytes::Bytes;
use futures::Sink;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use url::Url;

use crate::proto::Message;
use crate::proto::MultipartCodec;
use crate::proto::messages::LogMessage;
use crate::proto::net::Stream;

pub mod runner;
pub mod upload;

pub use runner::JobRunner;

/// Anything multipart frames can be sent into.
pub trait FrameSink: Sink<Vec<Bytes>, Error = Error> + Unpin {}
impl<T> FrameSink for T where T: Sink<Vec<Bytes>, Error = Error> + Unpin {}

/// The worker's connection to the coordinator intake, shared between the
/// job runner, the log forwarders and concurrent artifact uploads.
pub type IntakeSink = Arc<Mutex<FramedWrite<Stream, MultipartCodec>>>;

pub async fn send_tagged<S: FrameSink>(
    sink: &Mutex<S>,
    tag: &str,
    body: Vec<u8>,
) -> Result<()> {
    let frames = vec![Bytes::from(tag.to_string()), Bytes::from(body)];
    sink.lock().await.send(frames).await
}

pub async fn send_message<S: FrameSink, M: Message>(
    sink: &Mutex<S>,
    tag: &str,
    message: &M,
) -> Result<()> {
    send_tagged(sink, tag, message.pack()?).await
}

pub async fn send_log_line<S: FrameSink>(
    sink: &Mutex<S>,
    project: &str,
    job: &str,
    line: String,
) {
    let message = LogMessage {
        project: project.to_string(),
        job: job.to_string(),
        line,
    };
    if let Err(e) = send_message(sink, "log", &message).await {
        tracing::debug!("dropping log line: {:#}", e);
    }
}

/// Turn a repository URL into what `xbps-install -R` expects: a plain path
/// for local repositories, the URL itself for remote ones.
pub fn repo_url_to_arg(url: &str) -> Result<String> {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => Ok(parsed.path().to_string()),
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url.to_string()),
        Ok(_) => bail!("url must be file or http(s)"),
        // no scheme at all: treat as a local path
        Err(_) => Ok(url.to_string()),
    }
}

/// Fetch `url` into `to`; http(s) is streamed, file URLs and bare paths are
/// copied.
pub async fn download(url: &str, to: &Path) -> Result<()> {
    match Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "file" => {
            std::fs::copy(parsed.path(), to)?;
            Ok(())
        }
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
            let response = reqwest::get(parsed).await?.error_for_status()?;
            let mut stream = response.bytes_stream();
            let mut file = tokio::fs::File::create(to).await?;
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            Ok(())
        }
        Ok(_) => bail!("url must be file or http(s)"),
        Err(_) => {
            std::fs::copy(url, to)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_url_to_arg() {
        assert_eq!(repo_url_to_arg("file:///srv/repo").unwrap(), "/srv/repo");
        assert_eq!(
            repo_url_to_arg("https://example.com/repo").unwrap(),
            "https://example.com/repo"
        );
        assert_eq!(repo_url_to_arg("/srv/plain").unwrap(), "/srv/plain");
        assert!(repo_url_to_arg("ftp://example.com/repo").is_err());
    }

    #[tokio::test]
    async fn test_download_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, b"payload").unwrap();

        download(&format!("file://{}", src.display()), &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }
}
