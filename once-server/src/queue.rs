//! # Bounded Task Queue
//!
//! FIFO handoff between the accept loop and the worker pool.
//!
//! ## Design Principles
//!
//! 1. **Strict FIFO**: Tasks are delivered in acceptance order, each to
//!    exactly one consumer.
//! 2. **Backpressure, Not Drops**: A full bounded queue blocks the producer;
//!    a task is never silently discarded while the queue is live.
//! 3. **Drain on Shutdown**: After shutdown, producers fail immediately and
//!    get their task back (so the caller can close the connection), while
//!    consumers drain everything already queued before seeing `Shutdown`.
//! 4. **Broadcast Wakeup**: Shutdown wakes every blocked producer and
//!    consumer, not just one.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

/// Enqueue refused because the queue has shut down. Carries the task back so
/// the caller can dispose of it (close the connection) itself.
#[derive(Debug, Error)]
#[error("task queue is shut down")]
pub struct Rejected<T>(pub T);

/// Result of a dequeue.
#[derive(Debug, PartialEq)]
pub enum Dequeued<T> {
    Task(T),
    /// The queue has shut down and is fully drained.
    Shutdown,
}

struct Inner<T> {
    tasks: VecDeque<T>,
    shutdown: bool,
}

/// Thread-safe bounded FIFO queue. Capacity 0 means unbounded.
pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        TaskQueue {
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity,
        }
    }

    /// Appends a task, waiting while a bounded queue is at capacity. Fails
    /// without blocking once shutdown has been signaled; a task accepted
    /// before the shutdown flag is observed stays queued and will be drained.
    pub async fn enqueue(&self, task: T) -> Result<(), Rejected<T>> {
        let mut task = Some(task);
        loop {
            // Register for wakeups before checking state, so a notify that
            // lands between the check and the await is not lost.
            let waiter = self.not_full.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutdown {
                    return Err(Rejected(task.take().unwrap()));
                }
                if self.capacity == 0 || inner.tasks.len() < self.capacity {
                    inner.tasks.push_back(task.take().unwrap());
                    let free = self.capacity > 0 && inner.tasks.len() < self.capacity;
                    drop(inner);
                    self.not_empty.notify_one();
                    if free {
                        // Pass the wakeup along to the next blocked producer.
                        self.not_full.notify_one();
                    }
                    return Ok(());
                }
            }
            waiter.await;
        }
    }

    /// Removes the oldest task, waiting while the queue is empty. After
    /// shutdown, drains remaining tasks in order, then reports `Shutdown`.
    pub async fn dequeue(&self) -> Dequeued<T> {
        loop {
            let waiter = self.not_empty.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(task) = inner.tasks.pop_front() {
                    let more = !inner.tasks.is_empty();
                    drop(inner);
                    if self.capacity > 0 {
                        self.not_full.notify_one();
                    }
                    if more {
                        self.not_empty.notify_one();
                    }
                    return Dequeued::Task(task);
                }
                if inner.shutdown {
                    return Dequeued::Shutdown;
                }
            }
            waiter.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flags the queue terminal and wakes every blocked producer and
    /// consumer. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        tracing::info!("task queue shutdown signaled");
    }
}
