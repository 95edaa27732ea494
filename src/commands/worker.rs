//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use clap::ArgMatches;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_util::codec::FramedWrite;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::proto::Message;
use crate::proto::MultipartCodec;
use crate::proto::codec;
use crate::proto::messages::JobMessage;
use crate::proto::messages::JobRequest;
use crate::proto::net;
use crate::worker::IntakeSink;
use crate::worker::JobRunner;

/// The coordinator heartbeats each minute, so 1.5 minutes of silence is a
/// sane duration to assume coordinator death on.
const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(90);

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub async fn run(matches: &ArgMatches) -> Result<()> {
    let cfg = crate::config::load_worker_config(
        crate::commands::config_override(matches).as_deref(),
    )?;
    info!("worker configured: {:?}", cfg);

    let request = JobRequest {
        capabilities: cfg.capabilities().clone(),
    }
    .pack()?;

    loop {
        let stream = match net::connect(cfg.job_endpoint()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot reach coordinator: {:#}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let mut framed = Framed::new(stream, MultipartCodec);

        loop {
            if framed.send(vec![Bytes::from(request.clone())]).await.is_err() {
                break;
            }
            debug!("waiting for job...");

            let reply = tokio::time::timeout(HEARTBEAT_DEADLINE, framed.next()).await;
            let frames = match reply {
                Err(_) => {
                    // breaking the inner loop causes a reconnect; requests
                    // unsent to the presumed-dead coordinator are dropped
                    debug!("dropping socket after a heartbeat timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("job socket error: {:#}", e);
                    break;
                }
                Ok(Some(Ok(frames))) => frames,
            };
            if codec::is_heartbeat(&frames) {
                continue;
            }

            let payload = match frames.last() {
                Some(payload) => payload,
                None => continue,
            };
            let job = match JobMessage::unpack(payload) {
                Ok(job) => job,
                Err(e) => {
                    error!("undecodable job message: {:#}", e);
                    continue;
                }
            };
            if let Err(e) = process_job(job).await {
                error!("job error: {:#}", e);
            }
        }
    }
}

async fn process_job(job: JobMessage) -> Result<()> {
    let intake = net::connect(&job.output).await?;
    let sink: IntakeSink = Arc::new(Mutex::new(FramedWrite::new(intake, MultipartCodec)));
    JobRunner::new(job, sink).run().await;
    Ok(())
}
