//! Keeps the host alive while event handlers still have work in flight.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Inner {
    pending: AtomicUsize,
    idle: Notify,
}

/// Registry of background work started by event handlers.
///
/// `wait_until` counts a task until it settles (or panics); `drain` resolves
/// once the count reaches zero.
#[derive(Clone, Default)]
pub struct KeepAlive {
    inner: Arc<Inner>,
}

struct Guard(Arc<Inner>);

impl Drop for Guard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_until<F>(&self, label: &'static str, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let guard = Guard(Arc::clone(&self.inner));
        tracing::trace!(task = label, "keep-alive acquired");
        tokio::spawn(async move {
            let _guard = guard;
            work.await;
            tracing::trace!(task = label, "keep-alive released");
        })
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}
