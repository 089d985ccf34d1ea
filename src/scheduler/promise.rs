use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A result slot that is filled once and wakes every task waiting on it.
///
/// Used wherever a layer issues a request and waits for an event to come back
/// (join response, digest, discovery results). `reset` re-arms it for the
/// next request.
pub struct Promise<T> {
    result: Mutex<Option<T>>,
    ready: Notify,
}

impl<T: Clone> Promise<T> {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Notify::new(),
        }
    }

    pub fn set_result(&self, value: T) {
        *self.result.lock().unwrap() = Some(value);
        self.ready.notify_waiters();
    }

    pub fn reset(&self) {
        *self.result.lock().unwrap() = None;
    }

    pub fn has_result(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }

    /// Returns the current result without waiting.
    pub fn result(&self) -> Option<T> {
        self.result.lock().unwrap().clone()
    }

    /// Waits up to `timeout` for a result. Returns `None` on timeout.
    pub async fn get_result(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.result() {
                return Some(value);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.result();
            }
        }
    }
}

impl<T: Clone> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
