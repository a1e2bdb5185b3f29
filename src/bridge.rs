use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::time::Duration;

use tracing::warn;

use crate::deferred::DeferredResult;
use crate::engine::EngineError;
use crate::limits::DEFAULT_QUERY_TIMEOUT;
use crate::observability::QUERY_TIMEOUTS_TOTAL;

/// Blocking view of a [`DeferredResult`] for call sites that cannot await.
///
/// The timeout only stops the wait. The computation behind the result keeps running and its
/// eventual outcome is dropped with nobody observing it; under sustained slow queries this
/// holds runtime work alive past the caller's interest.
///
/// `wait` blocks the current thread, so it must not be called from a runtime worker thread.
#[derive(Debug, Clone, Copy)]
pub struct SyncBridge {
    timeout: Duration,
}

impl Default for SyncBridge {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT)
    }
}

impl SyncBridge {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The value, the error the result failed with, or `DeadlineExceeded` once the timeout
    /// elapses without a settlement.
    pub fn wait<T>(&self, result: &DeferredResult<T>) -> Result<T, EngineError>
    where
        T: Clone + Send + 'static,
    {
        let (tx, rx) = sync_channel(1);
        result.on_complete(move |outcome| {
            // The receiver is gone if the wait already timed out.
            let _ = tx.try_send(outcome.clone());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                metrics::counter!(QUERY_TIMEOUTS_TOTAL).increment(1);
                warn!("gave up waiting for a query after {:?}", self.timeout);
                Err(EngineError::DeadlineExceeded(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::QueryFailure(
                "result abandoned without settling".into(),
            )),
        }
    }
}
