//! Bounded event channels between the sensor and its consumer.
//!
//! Two independent queues carry records across the boundary: the auth
//! channel for operations blocked on a verdict, and the larger notify
//! channel for best-effort telemetry. Enqueue never blocks; a full channel
//! or an absent consumer rejects the record, and the producer's only
//! feedback is the boolean result (the auth path turns a rejection into a
//! fail-open verdict, the notify path just drops).
//!
//! The consumer attaches by taking the drain side of each channel and
//! optionally registering a wake signal fired after each successful
//! enqueue, so it need not poll.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::event::EventRecord;

/// Which queue of the pair an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Latency-sensitive queue for operations awaiting a decision.
    Auth,
    /// Best-effort telemetry queue.
    Notify,
}

/// Consumer-side wake signal, fired after each successful enqueue.
pub trait ConsumerSignal: Send + Sync {
    fn notify(&self);
}

/// Counters for one channel, for logs and the health surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub published: u64,
    pub dropped: u64,
}

struct EventChannel {
    tx: Sender<EventRecord>,
    rx: Mutex<Option<Receiver<EventRecord>>>,
    signal: RwLock<Option<Arc<dyn ConsumerSignal>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventChannel {
    fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            signal: RwLock::new(None),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

/// The auth/notify queue pair shared by the pipeline and the consumer glue.
pub struct EventChannelPair {
    auth: EventChannel,
    notify: EventChannel,
    connected: AtomicBool,
}

impl EventChannelPair {
    /// Creates the pair with the given per-queue capacities.
    pub fn new(auth_capacity: usize, notify_capacity: usize) -> Self {
        Self {
            auth: EventChannel::with_capacity(auth_capacity),
            notify: EventChannel::with_capacity(notify_capacity),
            connected: AtomicBool::new(false),
        }
    }

    /// Offers a record to one queue without blocking.
    ///
    /// Returns `false` and drops the record when the queue is full or no
    /// consumer is attached. On success the queue's registered wake signal
    /// (if any) is fired.
    pub fn publish(&self, kind: ChannelKind, record: EventRecord) -> bool {
        if !self.is_connected() {
            self.chan(kind).dropped.fetch_add(1, Ordering::Relaxed);
            trace!(kind = ?kind, identity = record.identity, "no consumer attached, dropping event");
            return false;
        }

        let chan = self.chan(kind);
        match chan.tx.try_send(record) {
            Ok(()) => {
                chan.published.fetch_add(1, Ordering::Relaxed);
                if let Some(signal) = lock_read(&chan.signal).as_ref() {
                    signal.notify();
                }
                true
            }
            Err(TrySendError::Full(record)) => {
                chan.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = ?kind, identity = record.identity, "event channel full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(record)) => {
                chan.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = ?kind, identity = record.identity, "event channel closed, dropping event");
                false
            }
        }
    }

    /// Hands out the drain side of one queue.
    ///
    /// Each queue's consumer can be taken exactly once for the lifetime of
    /// the pair; `None` on a second take.
    pub fn consumer(&self, kind: ChannelKind) -> Option<ChannelConsumer> {
        let rx = self
            .chan(kind)
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        debug!(kind = ?kind, "channel consumer attached");
        Some(ChannelConsumer { rx })
    }

    /// Registers the wake signal fired after each successful enqueue on the
    /// given queue, replacing any previous registration.
    pub fn register_signal(&self, kind: ChannelKind, signal: Arc<dyn ConsumerSignal>) {
        *self
            .chan(kind)
            .signal
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(signal);
    }

    /// Marks the consumer attached or detached. While detached, every
    /// publish is rejected, which the auth path resolves as fail-open.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        debug!(connected, "consumer connection state changed");
    }

    /// Whether a consumer is currently attached.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of records currently queued on one channel.
    pub fn depth(&self, kind: ChannelKind) -> usize {
        self.chan(kind).tx.len()
    }

    /// Publish/drop counters for one channel.
    pub fn stats(&self, kind: ChannelKind) -> ChannelStats {
        let chan = self.chan(kind);
        ChannelStats {
            published: chan.published.load(Ordering::Relaxed),
            dropped: chan.dropped.load(Ordering::Relaxed),
        }
    }

    fn chan(&self, kind: ChannelKind) -> &EventChannel {
        match kind {
            ChannelKind::Auth => &self.auth,
            ChannelKind::Notify => &self.notify,
        }
    }
}

/// Drain side of one event channel.
pub struct ChannelConsumer {
    rx: Receiver<EventRecord>,
}

impl ChannelConsumer {
    /// Removes and returns every record currently queued.
    pub fn try_drain(&self) -> Vec<EventRecord> {
        self.rx.try_iter().collect()
    }

    /// Blocks up to `timeout` for the next record.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<EventRecord> {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => Some(record),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

fn lock_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}
