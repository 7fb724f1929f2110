//! Process-wide shutdown context.
//!
//! One `Shutdown` is created at startup and cloned into the session loops,
//! every reader and the HTTP server. Blocking code waits on a condition
//! variable, async code on a `tokio::sync::Notify`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

/// Cloneable handle to the shared shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
    notify: Notify,
}

impl Shutdown {
    /// Creates an untriggered shutdown context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the process as closing and wakes every waiter.
    ///
    /// Idempotent; only the first call logs.
    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested");
        }

        let _guard = self.inner.lock.lock();
        self.inner.condvar.notify_all();
        self.inner.notify.notify_waiters();
    }

    /// Returns true once `trigger` has been called.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps for up to `timeout`, returning early on shutdown.
    ///
    /// Returns true if shutdown has been triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_triggered() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, timeout);
        self.is_triggered()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_wait_timeout_without_trigger() {
        let shutdown = Shutdown::new();
        let started = Instant::now();

        assert!(!shutdown.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_trigger_wakes_blocked_waiter() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let triggered = waiter.wait_timeout(Duration::from_secs(10));
            (triggered, started.elapsed())
        });

        std::thread::sleep(Duration::from_millis(50));
        shutdown.trigger();

        let (triggered, elapsed) = handle.join().unwrap();
        assert!(triggered);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancelled future should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_after_trigger_is_immediate() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(100), shutdown.cancelled())
            .await
            .expect("already triggered");
        assert!(shutdown.wait_timeout(Duration::from_secs(10)));
    }
}
