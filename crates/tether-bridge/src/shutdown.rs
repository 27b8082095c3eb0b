//! Cooperative stop signal for a handle's background workers.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Default)]
struct WorkerCount {
    live: Mutex<usize>,
    idle: Condvar,
}

/// Held by each running worker; dropping it marks the worker as finished.
struct WorkerToken {
    count: Arc<WorkerCount>,
}

impl WorkerToken {
    fn new(count: Arc<WorkerCount>) -> Self {
        *count.live.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Self { count }
    }
}

impl Drop for WorkerToken {
    fn drop(&mut self) {
        let mut live = self.count.live.lock().unwrap_or_else(|e| e.into_inner());
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.count.idle.notify_all();
        }
    }
}

/// The `done` side, owned by the handle.
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
    workers: Arc<WorkerCount>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx,
            workers: Arc::new(WorkerCount::default()),
        }
    }

    /// Register a new worker. It counts as live until the listener drops.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
            token: WorkerToken::new(self.workers.clone()),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Fire `done` without waiting.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn live_workers(&self) -> usize {
        *self.workers.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire `done` and wait until every worker has dropped its listener.
    ///
    /// Returns false if workers were still running when `timeout` elapsed.
    pub fn trigger_and_wait(&self, timeout: Duration) -> bool {
        self.trigger();

        let deadline = Instant::now() + timeout;
        let mut live = self.workers.live.lock().unwrap_or_else(|e| e.into_inner());
        while *live > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            live = self
                .workers
                .idle
                .wait_timeout(live, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker side. Cloning registers another worker.
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
    token: WorkerToken,
}

impl ShutdownListener {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `done` fires (or the signal itself is gone).
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

impl Clone for ShutdownListener {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            token: WorkerToken::new(self.token.count.clone()),
        }
    }
}
