//! Work queue for asynchronous side effects of signal handlers.
//!
//! Handlers run synchronously inside [`SignalRouter::route`](crate::router::SignalRouter::route)
//! and must not block the receive loop. Anything slow (HTTP calls, database
//! writes) is handed to a [`WorkQueue`]: `submit` returns immediately and the
//! future runs on the tokio runtime. Tests call [`WorkQueue::drain`] to wait
//! for every submitted job before asserting on side effects.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Cloneable handle to a set of in-flight background jobs.
#[derive(Clone, Default)]
pub struct WorkQueue {
    jobs: Arc<Mutex<JoinSet<anyhow::Result<()>>>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `job` on the current tokio runtime and return immediately.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn submit<F>(&self, job: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut jobs = self.jobs.lock();
        // Reap finished jobs so the set does not grow without bound.
        while let Some(result) = jobs.try_join_next() {
            log_outcome(result);
        }
        jobs.spawn(job);
    }

    /// Number of jobs not yet reaped.
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Wait for every submitted job (including ones submitted while
    /// draining) to finish. Returns how many jobs completed.
    pub async fn drain(&self) -> usize {
        let mut completed = 0;
        loop {
            let mut batch = std::mem::take(&mut *self.jobs.lock());
            if batch.is_empty() {
                return completed;
            }
            while let Some(result) = batch.join_next().await {
                log_outcome(result);
                completed += 1;
            }
        }
    }

    /// Abort every outstanding job.
    pub fn abort_all(&self) {
        let mut jobs = self.jobs.lock();
        if !jobs.is_empty() {
            debug!("Aborting {} queued handler jobs", jobs.len());
        }
        jobs.abort_all();
    }
}

fn log_outcome(result: Result<anyhow::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Handler job failed: {e:#}"),
        Err(e) if e.is_cancelled() => debug!("Handler job cancelled"),
        Err(e) => warn!("Handler job panicked: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
