use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use lumberjack_types::{LogBatch, LogLine};

/// Stable identity of one subscriber session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a fresh, process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returned by a delivery callback to keep or drop its registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

type Callback = Box<dyn FnMut(&LogBatch) -> Flow + Send>;

/// Lines and subscribers live under one lock so that append+notify and
/// snapshot+subscribe can never interleave
struct Inner {
    lines: VecDeque<LogLine>,
    subscribers: HashMap<SubscriberId, Callback>,
}

/// Thread-safe ring buffer of log lines with live subscriber fan-out
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,

    /// Maximum number of retained lines
    capacity: usize,

    /// Lines ever appended, including evicted ones
    total_appended: Arc<AtomicU64>,
}

impl LogBuffer {
    /// Create a new log buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity),
                subscribers: HashMap::new(),
            })),
            capacity,
            total_appended: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append one line, evicting the oldest if at capacity
    pub fn append(&self, line: impl Into<LogLine>) {
        self.append_batch([line.into()]);
    }

    /// Append several lines as one unit
    ///
    /// Every subscriber receives the whole batch in a single delivery.
    pub fn append_batch<I>(&self, lines: I)
    where
        I: IntoIterator<Item = LogLine>,
    {
        let batch: LogBatch = lines.into_iter().collect();
        if batch.is_empty() {
            return;
        }
        self.total_appended
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        if self.capacity > 0 {
            for line in batch.iter() {
                if inner.lines.len() >= self.capacity {
                    inner.lines.pop_front();
                }
                inner.lines.push_back(line.clone());
            }
        }

        inner.subscribers.retain(|id, callback| match callback(&batch) {
            Flow::Continue => true,
            Flow::Stop => {
                debug!(subscriber = %id, "Subscriber stopped, removing");
                false
            }
        });
    }

    /// Current contents in insertion order
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.inner.lock().lines.iter().cloned().collect()
    }

    /// Register a delivery callback, replacing any callback under the same id
    pub fn subscribe<F>(&self, id: SubscriberId, callback: F)
    where
        F: FnMut(&LogBatch) -> Flow + Send + 'static,
    {
        self.inner.lock().subscribers.insert(id, Box::new(callback));
        debug!(subscriber = %id, "Subscribed");
    }

    /// Read the contents and register the callback in one step
    ///
    /// The callback receives exactly the lines appended after the returned
    /// snapshot: no gap and no duplicate.
    pub fn subscribe_with_snapshot<F>(&self, id: SubscriberId, callback: F) -> Vec<LogLine>
    where
        F: FnMut(&LogBatch) -> Flow + Send + 'static,
    {
        let mut inner = self.inner.lock();
        let snapshot = inner.lines.iter().cloned().collect();
        inner.subscribers.insert(id, Box::new(callback));
        debug!(subscriber = %id, "Subscribed with snapshot");
        snapshot
    }

    /// Subscribe through a bounded queue
    ///
    /// A subscriber that lets its queue fill up is dropped rather than
    /// stalling the producer; its receiver then observes the end of the
    /// stream.
    pub fn subscribe_channel(&self, queue_len: usize) -> Subscription {
        let id = SubscriberId::next();
        let (tx, receiver) = mpsc::channel(queue_len.max(1));

        let snapshot = self.subscribe_with_snapshot(id, move |batch: &LogBatch| {
            match tx.try_send(batch.clone()) {
                Ok(()) => Flow::Continue,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = %id, "Subscriber queue full, dropping subscriber");
                    Flow::Stop
                }
                Err(TrySendError::Closed(_)) => Flow::Stop,
            }
        });

        Subscription {
            id,
            buffer: self.clone(),
            snapshot,
            receiver,
        }
    }

    /// Remove a subscriber; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.inner.lock().subscribers.remove(&id).is_some() {
            debug!(subscriber = %id, "Unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Number of retained lines
    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended.load(Ordering::Relaxed)
    }

    /// Export all retained lines as raw text
    pub fn export_raw(&self) -> String {
        self.inner
            .lock()
            .lines
            .iter()
            .map(|line| line.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A queued live subscription
///
/// Unsubscribes from its buffer when dropped.
pub struct Subscription {
    id: SubscriberId,
    buffer: LogBuffer,
    snapshot: Vec<LogLine>,
    receiver: mpsc::Receiver<LogBatch>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Buffer contents at the moment of subscribing
    pub fn snapshot(&self) -> &[LogLine] {
        &self.snapshot
    }

    /// Take the snapshot, leaving it empty
    pub fn take_snapshot(&mut self) -> Vec<LogLine> {
        std::mem::take(&mut self.snapshot)
    }

    /// Next batch; `None` once the subscriber has been dropped by its buffer
    pub async fn recv(&mut self) -> Option<LogBatch> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.buffer.unsubscribe(self.id);
    }
}
