//! Supervised task group for connection lifecycles.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::BoxError;

/// Runs connection tasks bound to the pool's cancellation scope.
///
/// Each task receives a handle to the group token and is expected to return
/// promptly once it is cancelled. There is no restart: a task exiting is
/// terminal for its connection. [`wait`](Supervisor::wait) joins everything
/// spawned so far and surfaces the first task error.
pub struct Supervisor {
    ctx: CancellationToken,
    tracker: TaskTracker,
    first_err: Arc<Mutex<Option<BoxError>>>,
}

impl Supervisor {
    pub fn new(ctx: CancellationToken) -> Self {
        Self {
            ctx,
            tracker: TaskTracker::new(),
            first_err: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns a supervised task.
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let ctx = self.ctx.clone();
        let first_err = Arc::clone(&self.first_err);
        self.tracker.spawn(async move {
            if let Err(err) = task(ctx).await {
                let mut slot = first_err.lock().expect("supervisor error slot poisoned");
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        });
    }

    /// Blocks until every spawned task has returned, then yields the first
    /// task error, if any.
    pub async fn wait(&self) -> Result<(), BoxError> {
        self.tracker.close();
        self.tracker.wait().await;
        let err = self
            .first_err
            .lock()
            .expect("supervisor error slot poisoned")
            .take();
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
