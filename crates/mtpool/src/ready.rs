//! One-shot and re-armable broadcast gates.
//!
//! `Ready` is the Rust rendering of a closed-channel broadcast: it latches on
//! the first [`Ready::signal`] and every past or future waiter observes the
//! latch. `ResetReady` layers an epoch swap on top so the gate can be fired
//! and re-armed; the pool uses it to kick parked acquirers whenever a
//! connection dies.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// One-shot broadcast gate.
///
/// Cloning yields another handle to the same gate. Signaling is idempotent.
#[derive(Clone)]
pub struct Ready {
    set: Arc<watch::Sender<bool>>,
}

impl Ready {
    pub fn new() -> Self {
        let (set, _) = watch::channel(false);
        Self { set: Arc::new(set) }
    }

    /// Fires the gate, waking all current and future waiters.
    pub fn signal(&self) {
        self.set.send_replace(true);
    }

    /// Whether the gate has fired.
    pub fn is_set(&self) -> bool {
        *self.set.borrow()
    }

    /// Completes once the gate has fired. Returns immediately if it already
    /// has.
    pub async fn wait(&self) {
        let mut rx = self.set.subscribe();
        // The sender lives at least as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Ready {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ready").field("set", &self.is_set()).finish()
    }
}

/// Re-armable broadcast gate.
///
/// [`ResetReady::reset`] fires the current epoch and arms a fresh one, so a
/// waiter always observes the epoch that was in effect when it grabbed its
/// [`ResetReady::gate`] handle.
pub struct ResetReady {
    current: Mutex<Ready>,
}

impl ResetReady {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Ready::new()),
        }
    }

    /// Handle to the epoch in effect right now. Await it with [`Ready::wait`].
    pub fn gate(&self) -> Ready {
        self.lock().clone()
    }

    /// Fires the current epoch without re-arming.
    pub fn signal(&self) {
        self.lock().signal();
    }

    /// Fires the current epoch and arms a fresh, unfired one.
    pub fn reset(&self) {
        let mut current = self.lock();
        current.signal();
        *current = Ready::new();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ready> {
        self.current.lock().expect("gate mutex poisoned")
    }
}

impl Default for ResetReady {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResetReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResetReady")
            .field("set", &self.lock().is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn signal_wakes_current_and_future_waiters() {
        let ready = Ready::new();
        assert!(!ready.is_set());

        let early = tokio::spawn({
            let ready = ready.clone();
            async move { ready.wait().await }
        });

        ready.signal();
        tokio::time::timeout(Duration::from_secs(1), early)
            .await
            .expect("waiter timed out")
            .unwrap();

        // A waiter arriving after the fact observes the latch.
        tokio::time::timeout(Duration::from_secs(1), ready.wait())
            .await
            .expect("late waiter timed out");
        assert!(ready.is_set());
    }

    #[tokio::test]
    async fn signal_is_idempotent() {
        let ready = Ready::new();
        ready.signal();
        ready.signal();
        assert!(ready.is_set());
        ready.wait().await;
    }

    #[tokio::test]
    async fn clones_share_the_gate() {
        let ready = Ready::new();
        let other = ready.clone();
        other.signal();
        assert!(ready.is_set());
    }

    #[tokio::test]
    async fn reset_fires_the_grabbed_epoch() {
        let gate = ResetReady::new();

        let epoch = gate.gate();
        let waiter = tokio::spawn(async move { epoch.wait().await });

        gate.reset();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken by reset")
            .unwrap();

        // The fresh epoch is unfired.
        assert!(!gate.gate().is_set());
    }

    #[tokio::test]
    async fn signal_fires_without_rearming() {
        let gate = ResetReady::new();
        gate.signal();
        assert!(gate.gate().is_set());
    }

    #[tokio::test]
    async fn waiter_keeps_its_epoch_across_reset() {
        let gate = ResetReady::new();

        let first = gate.gate();
        gate.reset();
        // `first` was fired by the reset even though a new epoch is armed.
        assert!(first.is_set());

        let second = gate.gate();
        assert!(!second.is_set());
        gate.reset();
        assert!(second.is_set());
    }
}
