//! Bounded worker pool for offloaded method execution.
//!
//! `n` worker tasks drain one job channel; each job is a prepared handler
//! invocation plus a oneshot for its outcome. The dispatching task blocks
//! only on that oneshot, never on the handler's internals.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

use crate::registry::HandlerResult;

struct Job {
    work: BoxFuture<'static, HandlerResult>,
    reply: oneshot::Sender<HandlerResult>,
}

pub struct WorkerPool {
    jobs_tx: mpsc::Sender<Job>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(size);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        for worker in 0..size {
            let jobs_rx = Arc::clone(&jobs_rx);
            tokio::spawn(async move {
                loop {
                    let job = jobs_rx.lock().await.recv().await;
                    let Some(job) = job else {
                        break;
                    };
                    let outcome = job.work.await;
                    // A dropped reply means the dispatcher gave up; fine.
                    let _ = job.reply.send(outcome);
                }
                debug!(worker, "worker pool task exiting");
            });
        }
        WorkerPool { jobs_tx, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `work` on the pool and wait for its outcome.
    pub async fn execute(&self, work: BoxFuture<'static, HandlerResult>) -> HandlerResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .jobs_tx
            .send(Job {
                work,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Err("worker pool is closed".to_owned());
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err("worker pool dropped the job".to_owned()))
    }
}
