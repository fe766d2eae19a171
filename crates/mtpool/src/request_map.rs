//! FIFO queue of parked acquirers keyed by monotonic token.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::conn::PoolConn;

pub(crate) type RequestKey = u64;

/// Parked acquirers waiting for a free connection.
///
/// Keys grow monotonically, so iteration order is arrival order and
/// [`transfer`](RequestMap::transfer) hands connections to the oldest waiter
/// first. Each entry is a one-slot delivery channel: at most one connection is
/// ever sent on it, and a send never blocks.
pub(crate) struct RequestMap {
    next_key: RequestKey,
    waiting: BTreeMap<RequestKey, oneshot::Sender<Arc<PoolConn>>>,
}

impl RequestMap {
    pub(crate) fn new() -> Self {
        Self {
            next_key: 0,
            waiting: BTreeMap::new(),
        }
    }

    /// Registers a new waiter, returning its token and the delivery end.
    pub(crate) fn request(&mut self) -> (RequestKey, oneshot::Receiver<Arc<PoolConn>>) {
        self.next_key += 1;
        let key = self.next_key;
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(key, tx);
        (key, rx)
    }

    /// Hands `conn` to the oldest waiter still listening.
    ///
    /// Waiters whose receiver is already gone (the acquiring future was
    /// dropped before it could unregister) are discarded along the way.
    /// Returns the delivered waiter's token, or gives the connection back
    /// when nobody takes it.
    pub(crate) fn transfer(&mut self, conn: Arc<PoolConn>) -> Result<RequestKey, Arc<PoolConn>> {
        let mut conn = conn;
        while let Some((key, tx)) = self.waiting.pop_first() {
            match tx.send(conn) {
                Ok(()) => return Ok(key),
                Err(returned) => conn = returned,
            }
        }
        Err(conn)
    }

    /// Unregisters a waiter. Idempotent: the entry may already have been
    /// consumed by a concurrent [`transfer`](RequestMap::transfer).
    pub(crate) fn delete(&mut self, key: RequestKey) {
        self.waiting.remove(&key);
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::BoxError;
    use crate::conn::Conn;
    use crate::ready::Ready;
    use crate::wire::{Decode, Encode};

    struct IdleConn {
        ready: Ready,
        dead: Ready,
    }

    #[async_trait]
    impl Conn for IdleConn {
        async fn run(&self, ctx: CancellationToken) -> Result<(), BoxError> {
            ctx.cancelled().await;
            Ok(())
        }

        fn ready(&self) -> &Ready {
            &self.ready
        }

        fn dead(&self) -> &Ready {
            &self.dead
        }

        async fn invoke_raw(
            &self,
            _ctx: &CancellationToken,
            _input: &dyn Encode,
            _output: &mut dyn Decode,
        ) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn pool_conn(id: i64) -> Arc<PoolConn> {
        let raw = Arc::new(IdleConn {
            ready: Ready::new(),
            dead: Ready::new(),
        });
        Arc::new(PoolConn::new(raw, id))
    }

    #[tokio::test]
    async fn tokens_are_monotonic() {
        let mut map = RequestMap::new();
        let (first, _rx1) = map.request();
        let (second, _rx2) = map.request();
        let (third, _rx3) = map.request();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn transfer_serves_oldest_waiter_first() {
        let mut map = RequestMap::new();
        let (_k1, mut rx1) = map.request();
        let (_k2, mut rx2) = map.request();

        let delivered = map.transfer(pool_conn(1)).expect("no waiter took the conn");
        assert_eq!(delivered, 1);
        assert_eq!(rx1.try_recv().unwrap().id(), 1);
        assert!(rx2.try_recv().is_err());

        map.transfer(pool_conn(2)).expect("second waiter skipped");
        assert_eq!(rx2.try_recv().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn transfer_returns_conn_when_empty() {
        let mut map = RequestMap::new();
        let conn = pool_conn(9);
        let back = map.transfer(conn).expect_err("delivered to nobody");
        assert_eq!(back.id(), 9);
    }

    #[tokio::test]
    async fn transfer_skips_dropped_receivers() {
        let mut map = RequestMap::new();
        let (_k1, rx1) = map.request();
        let (_k2, mut rx2) = map.request();
        drop(rx1);

        let delivered = map.transfer(pool_conn(3)).expect("live waiter skipped");
        assert_eq!(delivered, 2);
        assert_eq!(rx2.try_recv().unwrap().id(), 3);
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let mut map = RequestMap::new();
        let (key, _rx) = map.request();

        map.delete(key);
        map.delete(key);
        assert_eq!(map.len(), 0);

        // Deleting a token that a transfer already consumed is a no-op too.
        let (key, mut rx) = map.request();
        map.transfer(pool_conn(4)).unwrap();
        map.delete(key);
        assert_eq!(rx.try_recv().unwrap().id(), 4);
    }
}
