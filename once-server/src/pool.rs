//! # Worker Pool
//!
//! Fixed set of workers, started once, each looping on the shared task
//! queue until shutdown drains it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::connection::{self, PipelineContext};
use crate::listener::Connection;
use crate::queue::{Dequeued, TaskQueue};

/// How long `shutdown` waits for each worker to finish its current request.
const JOIN_GRACE: Duration = Duration::from_secs(5);

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    queue: Arc<TaskQueue<Connection>>,
}

impl WorkerPool {
    /// Spawns `count` workers draining `queue`.
    pub fn start(count: usize, queue: Arc<TaskQueue<Connection>>, ctx: Arc<PipelineContext>) -> Self {
        let workers = (0..count)
            .map(|id| {
                let queue = Arc::clone(&queue);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(worker_loop(id, queue, ctx))
            })
            .collect();
        tracing::info!(count, "worker pool started");
        WorkerPool { workers, queue }
    }

    /// Signals the queue and waits for every worker to drain out and exit.
    /// Workers still running after the grace period are left detached and
    /// logged; their tasks are not aborted mid-request.
    pub async fn shutdown(self) {
        self.queue.shutdown();
        for (id, worker) in self.workers.into_iter().enumerate() {
            match tokio::time::timeout(JOIN_GRACE, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    tracing::error!(worker = id, %join_err, "worker exited abnormally");
                }
                Err(_) => {
                    tracing::warn!(worker = id, "worker still busy after grace period");
                }
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(id: usize, queue: Arc<TaskQueue<Connection>>, ctx: Arc<PipelineContext>) {
    tracing::debug!(worker = id, "worker started");
    loop {
        match queue.dequeue().await {
            Dequeued::Task(conn) => {
                let peer = conn.peer;
                if let Err(err) = connection::handle(conn, &ctx).await {
                    tracing::warn!(worker = id, %peer, %err, "request failed");
                }
            }
            Dequeued::Shutdown => break,
        }
    }
    tracing::debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use once_common::Limits;
    use once_guard::{IdempotencyStore, ShardedStore};

    use crate::handler::PaymentHandler;

    use super::*;

    fn context() -> Arc<PipelineContext> {
        Arc::new(PipelineContext {
            guard: ShardedStore::new(Duration::from_secs(300)) as Arc<dyn IdempotencyStore>,
            handler: Arc::new(PaymentHandler),
            limits: Limits::default(),
        })
    }

    async fn accepted_pair(listener: &TcpListener) -> (TcpStream, Connection) {
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (client, Connection { stream, peer })
    }

    #[tokio::test]
    async fn workers_drain_queued_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let queue = Arc::new(TaskQueue::new(8));
        let pool = WorkerPool::start(2, Arc::clone(&queue), context());

        let mut clients = Vec::new();
        for _ in 0..4 {
            let (mut client, conn) = accepted_pair(&listener).await;
            tokio::io::AsyncWriteExt::write_all(&mut client, b"GET / HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
            queue.enqueue(conn).await.unwrap();
            clients.push(client);
        }

        for mut client in clients {
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK"));
        }

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_with_idle_workers_completes() {
        let queue: Arc<TaskQueue<Connection>> = Arc::new(TaskQueue::new(8));
        let pool = WorkerPool::start(4, Arc::clone(&queue), context());
        pool.shutdown().await;
        assert!(queue.is_empty());
    }
}
