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

use anyhow::Error;
use anyhow::Result;
use anyhow::anyhow;
use bytes::Bytes;
use futures::Sink;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::trace;

use crate::coordinator::Coordinator;
use crate::endpoint::queue::JobQueue;
use crate::proto::Message;
use crate::proto::MultipartCodec;
use crate::proto::codec;
use crate::proto::messages::JobRequest;
use crate::proto::net::Listener;
use crate::proto::net::Stream;

/// How long a worker request waits for a job before it gets a heartbeat.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff after requeueing a job whose capabilities the requester lacks.
pub const CAPS_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Accept workers and serve their job requests.
pub async fn worker_loop(coordinator: Arc<Coordinator>, listener: Listener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("worker connected from {}", peer);
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_worker(coordinator, stream, &peer).await {
                debug!("worker connection {} closed: {:#}", peer, e);
            }
        });
    }
}

async fn serve_worker(
    coordinator: Arc<Coordinator>,
    stream: Stream,
    peer: &str,
) -> Result<()> {
    let framed = Framed::new(stream, MultipartCodec);
    let (sink, mut requests) = framed.split();
    let sink = Arc::new(Mutex::new(sink));

    while let Some(message) = requests.next().await {
        let frames = message?;
        let body = frames
            .last()
            .ok_or_else(|| anyhow!("Job request without a body frame"))?;
        let request = match JobRequest::unpack(body) {
            Ok(request) => request,
            Err(e) => {
                debug!("job request error, continuing: {:#}", e);
                continue;
            }
        };
        trace!("received job request from {}: {:?}", peer, request);

        let coordinator = coordinator.clone();
        let sink = sink.clone();
        let peer = peer.to_string();
        tokio::spawn(async move {
            if let Err(e) =
                dispatch_request(coordinator.queue(), &*sink, &request, &peer).await
            {
                debug!("dispatching to {} failed: {:#}", peer, e);
            }
        });
    }
    Ok(())
}

/// Pair one worker request with a queued job.
///
/// Waits up to [DISPATCH_TIMEOUT] for a job; on timeout the worker gets an
/// empty heartbeat reply so it knows the coordinator is alive. A job whose
/// capability set the requester does not cover is requeued, and only after
/// the requeue do we sleep: sleeping first would let a single mismatched
/// worker drain and restore the queue without ever yielding.
pub async fn dispatch_request<S>(
    queue: &JobQueue,
    reply: &Mutex<S>,
    request: &JobRequest,
    peer: &str,
) -> Result<()>
where
    S: Sink<Vec<Bytes>, Error = Error> + Unpin,
{
    loop {
        let queued = match tokio::time::timeout(DISPATCH_TIMEOUT, queue.get()).await {
            Err(_) => {
                trace!("no job for {} in {:?}, heartbeat", peer, DISPATCH_TIMEOUT);
                let mut sink = reply.lock().await;
                // the peer may be long gone; that is fine for a heartbeat
                let _ = sink.send(codec::heartbeat()).await;
                return Ok(());
            }
            Ok(job) => job?,
        };

        if !queued.capabilities.is_subset(&request.capabilities) {
            trace!(
                "{} lacks capabilities {:?}, requeueing",
                peer,
                queued.capabilities
            );
            queue.put(queued).await?;
            tokio::time::sleep(CAPS_RETRY_DELAY).await;
            continue;
        }

        let payload = Bytes::from(queued.payload.clone());
        let mut sink = reply.lock().await;
        if let Err(e) = sink.send(vec![payload]).await {
            debug!("{} unreachable, reusing its job: {:#}", peer, e);
            drop(sink);
            queue.put(queued).await?;
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::queue::QueuedJob;

    fn request(caps: &[&str]) -> JobRequest {
        JobRequest {
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn queued(caps: &[&str], payload: &[u8]) -> QueuedJob {
        QueuedJob {
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            payload: payload.to_vec(),
        }
    }

    fn pipe() -> (
        Mutex<Framed<tokio::io::DuplexStream, MultipartCodec>>,
        Framed<tokio::io::DuplexStream, MultipartCodec>,
    ) {
        let (near, far) = tokio::io::duplex(1024 * 1024);
        (
            Mutex::new(Framed::new(near, MultipartCodec)),
            Framed::new(far, MultipartCodec),
        )
    }

    #[tokio::test]
    async fn test_matching_worker_receives_job() {
        let queue = JobQueue::new(1);
        queue.put(queued(&["x86_64"], b"payload")).await.unwrap();
        let (sink, mut far) = pipe();

        dispatch_request(&queue, &sink, &request(&["x86_64", "kvm"]), "w1")
            .await
            .unwrap();

        let frames = far.next().await.unwrap().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"payload");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_timeout() {
        let queue = JobQueue::new(1);
        let (sink, mut far) = pipe();

        dispatch_request(&queue, &sink, &request(&[]), "w1").await.unwrap();

        let frames = far.next().await.unwrap().unwrap();
        assert!(codec::is_heartbeat(&frames));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_mismatch_requeues_until_matching_consumer() {
        let queue = Arc::new(JobQueue::new(1));
        queue.put(queued(&["big-mem"], b"payload")).await.unwrap();
        let (sink, mut far) = pipe();

        let q = queue.clone();
        let dispatcher = tokio::spawn(async move {
            dispatch_request(&q, &sink, &request(&["small"]), "w1").await
        });

        // while the only requester lacks the capability, the job keeps
        // cycling back to the queue and the dispatcher never completes
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!dispatcher.is_finished());

        // a matching consumer takes the job away; the mismatched request
        // then idles out with a heartbeat
        let job = queue.get().await.unwrap();
        assert_eq!(job.payload, b"payload");

        dispatcher.await.unwrap().unwrap();
        let frames = far.next().await.unwrap().unwrap();
        assert!(codec::is_heartbeat(&frames));
    }

    #[tokio::test]
    async fn test_unreachable_worker_requeues_job() {
        let queue = JobQueue::new(1);
        queue.put(queued(&[], b"payload")).await.unwrap();

        let (near, far) = tokio::io::duplex(64);
        drop(far); // peer hangs up before the reply
        let sink = Mutex::new(Framed::new(near, MultipartCodec));

        dispatch_request(&queue, &sink, &request(&[]), "w1").await.unwrap();
        assert_eq!(queue.len(), 1, "the job must be requeued transparently");
    }
}
