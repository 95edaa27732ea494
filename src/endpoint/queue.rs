//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use anyhow::anyhow;
use tokio::sync::Notify;

/// A job packed for dispatch, together with the capabilities a worker must
/// offer to run it.
#[derive(Clone, Debug)]
pub struct QueuedJob {
    pub capabilities: BTreeSet<String>,
    pub payload: Vec<u8>,
}

/// Bounded FIFO between the solvers and the worker dispatchers.
///
/// The capacity is 1 by construction: a blocked `put` is the backpressure
/// that stops a solver from racing ahead of the worker pool.
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<VecDeque<QueuedJob>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        JobQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Append a job, waiting for a free slot.
    pub async fn put(&self, job: QueuedJob) -> Result<()> {
        let mut job = Some(job);
        loop {
            let slot_freed = self.not_full.notified();
            {
                let mut queue = self.inner.lock().map_err(|_| anyhow!("Lock poisoned"))?;
                if queue.len() < self.capacity {
                    // job is always Some here; it is only taken on this path
                    if let Some(job) = job.take() {
                        queue.push_back(job);
                    }
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            slot_freed.await;
        }
    }

    /// Pop the head, waiting until there is one.
    pub async fn get(&self) -> Result<QueuedJob> {
        loop {
            let item_added = self.not_empty.notified();
            {
                let mut queue = self.inner.lock().map_err(|_| anyhow!("Lock poisoned"))?;
                if let Some(job) = queue.pop_front() {
                    self.not_full.notify_one();
                    return Ok(job);
                }
            }
            item_added.await;
        }
    }

    /// Non-blocking look at the head, for diagnostics.
    pub fn peek_nowait(&self) -> Result<Option<QueuedJob>> {
        let queue = self.inner.lock().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(queue.front().cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn job(caps: &[&str]) -> QueuedJob {
        QueuedJob {
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            payload: b"job".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_put_get_fifo() {
        let queue = JobQueue::new(2);
        queue.put(job(&["a"])).await.unwrap();
        queue.put(job(&["b"])).await.unwrap();
        assert_eq!(queue.get().await.unwrap().capabilities, job(&["a"]).capabilities);
        assert_eq!(queue.get().await.unwrap().capabilities, job(&["b"]).capabilities);
    }

    #[tokio::test]
    async fn test_put_blocks_at_capacity() {
        let queue = Arc::new(JobQueue::new(1));
        queue.put(job(&[])).await.unwrap();

        let q = queue.clone();
        let second_put = tokio::spawn(async move { q.put(job(&["second"])).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second_put.is_finished(), "put must block while the slot is taken");

        queue.get().await.unwrap();
        second_put.await.unwrap().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_job_delivered_to_exactly_one_consumer() {
        let queue = Arc::new(JobQueue::new(1));

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = queue.clone();
                tokio::spawn(async move {
                    tokio::time::timeout(Duration::from_millis(200), q.get()).await
                })
            })
            .collect();

        queue.put(job(&["c"])).await.unwrap();

        let mut received = 0;
        for consumer in consumers {
            if let Ok(Ok(_)) = consumer.await.unwrap() {
                received += 1;
            }
        }
        assert_eq!(received, 1, "the queue must never duplicate a job");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let queue = JobQueue::new(1);
        queue.put(job(&["x"])).await.unwrap();
        assert!(queue.peek_nowait().unwrap().is_some());
        assert_eq!(queue.len(), 1);
    }
}
