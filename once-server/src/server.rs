//! # Server Assembly
//!
//! Wires the listener, bounded queue, worker pool, idempotency store, and
//! background sweeper into one runnable server.
//!
//! ## Design Principles
//!
//! 1. **Bind Early, Serve Later**: `bind` claims the port and fails fast;
//!    `serve` runs until shutdown. Tests bind port 0 and read the real
//!    address before driving traffic.
//! 2. **Ordered Teardown**: Stop accepting first, then drain the queue and
//!    join workers, then stop the sweeper. In-flight requests finish.
//! 3. **Accept Errors Do Not Kill the Server**: A failed accept is logged
//!    and the loop continues; only bind-time errors are fatal.

use std::net::SocketAddr;
use std::sync::Arc;

use once_common::{ServerConfig, ServerResult};
use once_guard::{IdempotencyStore, ShardedStore, sweeper};

use crate::connection::PipelineContext;
use crate::handler::Handler;
use crate::listener::{Accepted, Listener, ShutdownSignal};
use crate::pool::WorkerPool;
use crate::queue::{Rejected, TaskQueue};

pub struct Server {
    config: ServerConfig,
    listener: Listener,
    guard: Arc<ShardedStore>,
    ctx: Arc<PipelineContext>,
    shutdown: ShutdownSignal,
}

impl Server {
    /// Binds the listening socket and assembles the pipeline. Must be called
    /// from within a tokio runtime.
    pub fn bind(config: ServerConfig, handler: Arc<dyn Handler>) -> ServerResult<Self> {
        let shutdown = ShutdownSignal::new();
        let listener = Listener::bind(config.port, config.backlog, shutdown.subscribe())?;

        let guard = ShardedStore::new(config.idempotency_ttl);
        let ctx = Arc::new(PipelineContext {
            guard: Arc::clone(&guard) as Arc<dyn IdempotencyStore>,
            handler,
            limits: config.limits.clone(),
        });

        Ok(Server {
            config,
            listener,
            guard,
            ctx,
            shutdown,
        })
    }

    /// Actual bound address; differs from the configured port when binding
    /// port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Handle for requesting a stop from outside `serve` (signal handlers,
    /// tests).
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Runs the accept loop until shutdown is requested, then tears the
    /// pipeline down in order.
    pub async fn serve(mut self) -> ServerResult<()> {
        let sweeper = sweeper::start(Arc::clone(&self.guard), self.config.sweep_interval);
        let queue = Arc::new(TaskQueue::new(self.config.queue_capacity));
        let pool = WorkerPool::start(self.config.workers, Arc::clone(&queue), Arc::clone(&self.ctx));

        loop {
            match self.listener.accept().await {
                Ok(Accepted::Connection(conn)) => {
                    if let Err(Rejected(conn)) = queue.enqueue(conn).await {
                        // Queue already shut down in a shutdown race.
                        tracing::warn!(peer = %conn.peer, "dropping connection accepted during shutdown");
                    }
                }
                Ok(Accepted::Shutdown) => break,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                }
            }
        }

        tracing::info!("draining worker pool");
        pool.shutdown().await;
        sweeper.stop();
        tracing::info!("server stopped");
        Ok(())
    }
}
