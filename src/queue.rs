use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, warn};

/// A unit of work the queue runs once a slot is free.
#[async_trait]
pub trait Task: Send + 'static {
    async fn execute(self: Box<Self>) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`Task`].
pub struct FnTask<F>(F);

pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnTask(f)
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(self: Box<Self>) -> anyhow::Result<()> {
        (self.0)().await
    }
}

struct QueueState {
    pending: VecDeque<Box<dyn Task>>,
    running: usize,
}

struct Inner {
    capacity: usize,
    state: Mutex<QueueState>,
}

/// FIFO queue that runs at most `capacity` tasks at the same time.
///
/// A task's slot is released when it finishes, whether it returned `Ok`,
/// returned `Err` or panicked.
#[derive(Clone)]
pub struct WorkerQueue {
    inner: Arc<Inner>,
}

impl WorkerQueue {
    /// Create a queue. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    running: 0,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of tasks currently holding a slot.
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Number of tasks waiting for a slot.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Append a task and start it right away if a slot is free.
    /// Must be called from within a tokio runtime.
    pub fn enqueue<T: Task>(&self, task: T) {
        self.inner.state.lock().pending.push_back(Box::new(task));
        self.inner.advance();
    }
}

impl Inner {
    fn advance(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let mut state = self.state.lock();
            while state.running < self.capacity {
                match state.pending.pop_front() {
                    Some(task) => {
                        state.running += 1;
                        admitted.push(task);
                    }
                    None => break,
                }
            }
        }

        for task in admitted {
            let inner = self.clone();
            tokio::spawn(async move { inner.run(task).await });
        }
    }

    async fn run(self: Arc<Self>, task: Box<dyn Task>) {
        // The task gets its own spawn so a panic surfaces as a JoinError here.
        match tokio::spawn(task.execute()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("queued task failed: {e:#}"),
            Err(e) => error!("queued task aborted: {e}"),
        }
        self.finish();
    }

    fn finish(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.advance();
    }
}
