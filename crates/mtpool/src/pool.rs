//! Per-datacenter connection pool.
//!
//! Flow:
//! 1. Caller enters through [`Dc::invoke_raw`]
//! 2. `acquire` pops a free connection, creates one under the cap, or parks
//!    the caller in the request map
//! 3. The RPC runs on the picked connection
//! 4. `release` hands the connection to the oldest parked caller, or returns
//!    it to the free stack
//!
//! Connection lifecycles are owned by the supervisor; a death feeds back
//! through `dead`, which retires the connection and kicks parked callers so
//! they re-evaluate pool state.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::BoxError;
use crate::conn::{Conn, PoolConn};
use crate::ready::ResetReady;
use crate::request_map::{RequestKey, RequestMap};
use crate::supervisor::Supervisor;
use crate::wire::{Decode, Encode};

/// Why an `acquire` attempt ended without a connection.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The caller's context was canceled while acquiring.
    #[error("request canceled")]
    Canceled,
    /// The pool's own context was canceled.
    #[error("DC closed: context canceled")]
    DcClosed,
    /// The picked connection died between checkout and use. Retried
    /// internally by the invoke loop; never observed by callers.
    #[error("connection dead")]
    ConnDead,
}

/// Errors surfaced by the pool's public operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("DC is closed")]
    Closed,
    #[error("DC already closed")]
    AlreadyClosed,
    #[error("acquire connection: {0}")]
    Acquire(#[from] AcquireError),
    #[error("invoke pool: {0}")]
    Invoke(#[source] BoxError),
    #[error("connection run: {0}")]
    Run(#[source] BoxError),
}

/// Pool configuration for a single datacenter.
#[derive(Debug, Clone, Default)]
pub struct DcOptions {
    /// Open connection limit. Any value below 1 disables the cap.
    pub max_open_connections: i64,
}

impl DcOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_open_connections(mut self, max: i64) -> Self {
        self.max_open_connections = max;
        self
    }
}

/// Point-in-time view of pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DcHealth {
    /// Live connections, including those checked out by callers.
    pub total: i64,
    /// Idle connections parked in the free stack.
    pub free: usize,
    /// Configured cap; below 1 means unbounded.
    pub max: i64,
}

impl DcHealth {
    pub fn is_saturated(&self) -> bool {
        self.max >= 1 && self.total >= self.max
    }
}

/// State guarded by the DC mutex. Held only across small operations, never
/// across a suspension point.
struct DcState {
    free: Vec<Arc<PoolConn>>,
    total: i64,
    free_req: RequestMap,
}

/// Outcome of one pass over the pool state under the mutex.
enum Checkout {
    Free(Arc<PoolConn>),
    Create,
    Wait(RequestKey, oneshot::Receiver<Arc<PoolConn>>),
}

/// Connection pool to one datacenter.
pub struct Dc {
    id: i32,
    new_conn: Box<dyn Fn() -> Arc<dyn Conn> + Send + Sync>,

    /// DC scope; canceled by `close` (or on drop) to unwind connections.
    ctx: CancellationToken,
    supervisor: Supervisor,

    state: Mutex<DcState>,
    next_conn: AtomicI64,
    max: i64,

    /// Fired whenever a connection dies, so parked acquirers re-check pool
    /// state; re-armed for the next death.
    stuck: ResetReady,

    /// In-flight `invoke_raw` calls, drained during the graceful close
    /// window.
    ongoing: TaskTracker,
    closed: AtomicBool,
}

impl Dc {
    /// Creates a new idle pool. No connection is opened until the first
    /// [`invoke_raw`](Dc::invoke_raw).
    pub fn new<F>(parent: CancellationToken, id: i32, new_conn: F, options: DcOptions) -> Arc<Self>
    where
        F: Fn() -> Arc<dyn Conn> + Send + Sync + 'static,
    {
        let ctx = parent.child_token();
        Arc::new(Self {
            id,
            new_conn: Box::new(new_conn),
            supervisor: Supervisor::new(ctx.clone()),
            ctx,
            state: Mutex::new(DcState {
                free: Vec::new(),
                total: 0,
                free_req: RequestMap::new(),
            }),
            next_conn: AtomicI64::new(0),
            max: options.max_open_connections,
            stuck: ResetReady::new(),
            ongoing: TaskTracker::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn health(&self) -> DcHealth {
        let state = self.state();
        DcHealth {
            total: state.total,
            free: state.free.len(),
            max: self.max,
        }
    }

    fn state(&self) -> MutexGuard<'_, DcState> {
        self.state.lock().expect("DC state mutex poisoned")
    }

    fn create_connection(self: &Arc<Self>, id: i64) -> Arc<PoolConn> {
        let conn = Arc::new(PoolConn::new((self.new_conn)(), id));

        let dc = Arc::downgrade(self);
        let run = Arc::clone(&conn);
        self.supervisor.spawn(move |group_ctx| async move {
            let result = run.run(group_ctx).await;
            if let Some(dc) = Weak::upgrade(&dc) {
                dc.dead(&run, result.as_ref().err());
            }
            result
        });

        conn
    }

    /// Retires a connection. Idempotent: only the caller that wins the
    /// `deleted` test-and-set does the bookkeeping.
    fn dead(&self, conn: &PoolConn, cause: Option<&BoxError>) {
        if !conn.mark_deleted() {
            return;
        }

        // Kick parked acquirers; capacity may have opened up.
        self.stuck.reset();

        let remaining = {
            let mut state = self.state();
            conn.retired().signal();

            state.total -= 1;
            assert!(state.total >= 0, "connection accounting went negative");

            if let Some(idx) = state.free.iter().position(|c| c.id() == conn.id()) {
                state.free.remove(idx);
            }
            state.total
        };

        tracing::debug!(
            remaining,
            conn_id = conn.id(),
            error = ?cause,
            "Connection died"
        );
    }

    /// Returns a connection to circulation: hand-off to the oldest parked
    /// caller if any, otherwise back onto the free stack. Never blocks.
    fn release(&self, conn: Arc<PoolConn>) {
        let conn_id = conn.id();
        let mut state = self.state();
        match state.free_req.transfer(conn) {
            Ok(request_id) => {
                tracing::debug!(conn_id, request_id, "Transfer connection to requester");
            }
            Err(conn) => {
                state.free.push(conn);
                tracing::debug!(conn_id, "Connection released");
            }
        }
    }

    async fn acquire(self: &Arc<Self>, ctx: &CancellationToken) -> Result<Arc<PoolConn>, AcquireError> {
        loop {
            let checkout = {
                let mut state = self.state();
                if let Some(conn) = state.free.pop() {
                    Checkout::Free(conn)
                } else if self.max < 1 || state.total < self.max {
                    state.total += 1;
                    Checkout::Create
                } else {
                    let (key, rx) = state.free_req.request();
                    Checkout::Wait(key, rx)
                }
            };

            match checkout {
                Checkout::Free(conn) => {
                    if conn.dead().is_set() {
                        self.dead(&conn, None);
                        continue;
                    }
                    tracing::debug!(conn_id = conn.id(), "Re-using free connection");
                    return Ok(conn);
                }

                Checkout::Create => {
                    let id = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(conn_id = id, "Creating new connection");
                    let conn = self.create_connection(id);

                    tokio::select! {
                        _ = ctx.cancelled() => return Err(AcquireError::Canceled),
                        _ = self.ctx.cancelled() => return Err(AcquireError::DcClosed),
                        _ = conn.ready().wait() => return Ok(conn),
                        _ = conn.dead().wait() => {
                            self.dead(&conn, None);
                            continue;
                        }
                    }
                }

                Checkout::Wait(key, mut rx) => {
                    tracing::debug!(request_id = key, "Waiting for free connection");

                    let stuck = self.stuck.gate();
                    let err = tokio::select! {
                        delivered = &mut rx => match delivered {
                            Ok(conn) => {
                                tracing::debug!(
                                    conn_id = conn.id(),
                                    request_id = key,
                                    "Got connection for request"
                                );
                                return Ok(conn);
                            }
                            // The pool tore the map down underneath us.
                            Err(_) => AcquireError::DcClosed,
                        },
                        _ = stuck.wait() => {
                            tracing::debug!(request_id = key, "Some connection died, canceling wait");
                            self.state().free_req.delete(key);
                            // A hand-off may have raced the wake-up.
                            if let Ok(conn) = rx.try_recv() {
                                return Ok(conn);
                            }
                            continue;
                        }
                        _ = ctx.cancelled() => AcquireError::Canceled,
                        _ = self.ctx.cancelled() => AcquireError::DcClosed,
                    };

                    self.state().free_req.delete(key);
                    // A hand-off may have raced the cancellation; rehome the
                    // stranded connection instead of losing it.
                    if let Ok(conn) = rx.try_recv() {
                        self.release(conn);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Sends one RPC over a pooled connection.
    ///
    /// Connection death mid-acquire or mid-invoke is retried transparently on
    /// another connection; every other failure is surfaced.
    pub async fn invoke_raw(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        input: &dyn Encode,
        output: &mut dyn Decode,
    ) -> Result<(), PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let _ongoing = self.ongoing.token();

        loop {
            let conn = match self.acquire(ctx).await {
                Ok(conn) => conn,
                Err(AcquireError::ConnDead) => continue,
                Err(err) => return Err(PoolError::Acquire(err)),
            };

            tracing::debug!(conn_id = conn.id(), "DC invoke");
            let result = conn.invoke_raw(ctx, input, output).await;
            if result.is_err() && conn.dead().is_set() {
                // The connection died under us; the supervisor reaps it.
                // Retry on another one without releasing.
                continue;
            }

            let conn_id = conn.id();
            self.release(conn);
            return match result {
                Ok(()) => {
                    tracing::debug!(conn_id, "DC invoke complete");
                    Ok(())
                }
                Err(err) => {
                    tracing::debug!(conn_id, error = %err, "DC invoke failed");
                    Err(PoolError::Invoke(err))
                }
            };
        }
    }

    /// Closes the pool.
    ///
    /// In-flight requests get a graceful window bounded by `close_ctx`; after
    /// that the pool context is canceled and remaining connections unwind.
    /// Returns the first connection task error, if any. Fails on the second
    /// call.
    pub async fn close(&self, close_ctx: CancellationToken) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyClosed);
        }
        tracing::debug!(dc_id = self.id, "Closing DC");

        self.ongoing.close();
        tokio::select! {
            _ = self.ongoing.wait() => {}
            _ = close_ctx.cancelled() => {}
        }

        self.ctx.cancel();
        let result = self.supervisor.wait().await;
        tracing::debug!(dc_id = self.id, "DC closed");
        result.map_err(PoolError::Run)
    }
}

impl Drop for Dc {
    fn drop(&mut self) {
        // Unwind supervised connections if the pool is dropped without close.
        self.ctx.cancel();
    }
}
