//! Connection capability consumed by the pool, and the pool-owned wrapper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::BoxError;
use crate::ready::Ready;
use crate::wire::{Decode, Encode};

/// A raw MTProto connection as the pool sees it.
///
/// The pool assumes [`ready`](Conn::ready) fires exactly once, that
/// [`dead`](Conn::dead) fires exactly once and stays signaled, and that
/// [`invoke_raw`](Conn::invoke_raw) is safe to call between the two.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Drives the connection until it exits. Called at most once per
    /// connection lifetime, under the pool's supervisor.
    async fn run(&self, ctx: CancellationToken) -> Result<(), BoxError>;

    /// Gate fired once the handshake is complete and the connection is
    /// usable.
    fn ready(&self) -> &Ready;

    /// Gate fired once the connection is permanently unusable.
    fn dead(&self) -> &Ready;

    /// Executes a single RPC. May fail for transport or protocol reasons.
    async fn invoke_raw(
        &self,
        ctx: &CancellationToken,
        input: &dyn Encode,
        output: &mut dyn Decode,
    ) -> Result<(), BoxError>;
}

/// Pool-owned wrapper around a raw connection.
///
/// Carries the monotonic connection id, the write-once `deleted` flag that
/// makes retirement idempotent, and a pool-side gate fired once the pool has
/// dropped the connection from its accounting. Lifecycle gates of the
/// underlying connection are exposed by delegation.
pub struct PoolConn {
    conn: Arc<dyn Conn>,
    id: i64,
    deleted: AtomicBool,
    retired: Ready,
}

impl std::fmt::Debug for PoolConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConn").field("id", &self.id).finish()
    }
}

impl PoolConn {
    pub(crate) fn new(conn: Arc<dyn Conn>, id: i64) -> Self {
        Self {
            conn,
            id,
            deleted: AtomicBool::new(false),
            retired: Ready::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn ready(&self) -> &Ready {
        self.conn.ready()
    }

    pub fn dead(&self) -> &Ready {
        self.conn.dead()
    }

    /// Pool-side gate, fired once the pool has retired this connection.
    pub fn retired(&self) -> &Ready {
        &self.retired
    }

    /// Test-and-set of the `deleted` flag. Returns true for the single caller
    /// that flips it; every later caller gets false.
    pub(crate) fn mark_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::SeqCst)
    }

    pub(crate) async fn run(&self, ctx: CancellationToken) -> Result<(), BoxError> {
        self.conn.run(ctx).await
    }

    pub(crate) async fn invoke_raw(
        &self,
        ctx: &CancellationToken,
        input: &dyn Encode,
        output: &mut dyn Decode,
    ) -> Result<(), BoxError> {
        self.conn.invoke_raw(ctx, input, output).await
    }
}
