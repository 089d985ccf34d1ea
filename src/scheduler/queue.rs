use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Returned by every operation on a queue that has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is closed")]
pub struct QueueClosed;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded FIFO with blocking (async) removal and an explicit close.
///
/// `add` never blocks, so a layer may enqueue into its neighbour while it is in
/// the middle of handling an event. Once closed, producers and consumers get
/// [`QueueClosed`] instead of waiting forever.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    available: Notify,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    pub fn add(&self, item: T) -> Result<(), QueueClosed> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(QueueClosed);
            }
            inner.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Waits until an element is available. Elements still queued when the
    /// queue was closed with `flush == true` are handed out before the error.
    pub async fn remove(&self) -> Result<T, QueueClosed> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.pop_front() {
                    return Ok(item);
                }
                if inner.closed {
                    return Err(QueueClosed);
                }
            }

            notified.await;
        }
    }

    /// Like [`remove`](Self::remove) but gives up after `timeout`, returning `Ok(None)`.
    pub async fn remove_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueClosed> {
        match tokio::time::timeout(timeout, self.remove()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn try_remove(&self) -> Result<Option<T>, QueueClosed> {
        let mut inner = self.inner.lock().unwrap();
        match inner.items.pop_front() {
            Some(item) => Ok(Some(item)),
            None if inner.closed => Err(QueueClosed),
            None => Ok(None),
        }
    }

    /// Closes the queue. With `flush == false` pending elements are discarded.
    pub fn close(&self, flush: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
            if !flush {
                inner.items.clear();
            }
        }
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T: Clone> Queue<T> {
    /// Returns a copy of the head without removing it, waiting up to `timeout`.
    pub async fn peek(&self, timeout: Duration) -> Result<Option<T>, QueueClosed> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock().unwrap();
                if let Some(item) = inner.items.front() {
                    // Hand the wakeup on to a consumer that may be waiting too.
                    self.available.notify_one();
                    return Ok(Some(item.clone()));
                }
                if inner.closed {
                    return Err(QueueClosed);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
