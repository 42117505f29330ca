//! In-process publish/subscribe fan-out.
//!
//! Every subscriber owns an independent bounded queue. Publishing never
//! blocks on a slow subscriber with the default [`OverflowPolicy::Drop`]:
//! the event is dropped for that subscriber only and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::domain::{Article, DeliveryReport};

/// What `publish` does when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the event for that subscriber.
    #[default]
    Drop,
    /// Wait up to `timeout_ms` for room, then drop.
    Block { timeout_ms: u64 },
}

/// Events flowing through the dispatcher.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// An article finished processing and should be delivered.
    ArticleCreated(Arc<Article>),
    /// A delivery attempt reached a terminal status.
    DeliveryFinished(DeliveryReport),
}

impl DispatchEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ArticleCreated(_) => "article_created",
            Self::DeliveryFinished(_) => "delivery_finished",
        }
    }
}

struct Subscriber<T> {
    name: String,
    tx: mpsc::Sender<T>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Receiving half handed out by [`EventBus::subscribe`].
pub struct EventReceiver<T> {
    name: String,
    rx: mpsc::Receiver<T>,
}

impl<T> EventReceiver<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next event in FIFO order; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Per-subscriber counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub name: String,
    pub capacity: usize,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// Result of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Fan-out bus for events of type `T`.
pub struct EventBus<T> {
    subscribers: RwLock<Vec<Arc<Subscriber<T>>>>,
    overflow: OverflowPolicy,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(overflow: OverflowPolicy) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            overflow,
        }
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Add a subscriber with its own queue of `capacity` events.
    pub fn subscribe(&self, name: impl Into<String>, capacity: usize) -> EventReceiver<T> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.write().push(Arc::new(Subscriber {
            name: name.clone(),
            tx,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }));
        debug!(subscriber = %name, capacity, "event bus subscriber added");
        EventReceiver { name, rx }
    }

    /// Fan `event` out to every subscriber, honoring the overflow policy.
    pub async fn publish(&self, event: T) -> PublishReport {
        let subscribers = self.subscribers.read().clone();
        let mut report = PublishReport::default();
        let mut saw_closed = false;

        for sub in subscribers {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    sub.delivered.fetch_add(1, Ordering::Relaxed);
                    report.delivered += 1;
                }
                Err(TrySendError::Full(event)) => match self.overflow {
                    OverflowPolicy::Drop => {
                        record_drop(&sub);
                        report.dropped += 1;
                    }
                    OverflowPolicy::Block { timeout_ms } => {
                        let timeout = Duration::from_millis(timeout_ms);
                        match tokio::time::timeout(timeout, sub.tx.send(event)).await {
                            Ok(Ok(())) => {
                                sub.delivered.fetch_add(1, Ordering::Relaxed);
                                report.delivered += 1;
                            }
                            Ok(Err(_)) => saw_closed = true,
                            Err(_) => {
                                record_drop(&sub);
                                report.dropped += 1;
                            }
                        }
                    }
                },
                Err(TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            self.prune();
        }
        report
    }

    /// Like [`publish`](Self::publish) but never waits, whatever the
    /// overflow policy.
    pub fn try_publish(&self, event: T) -> PublishReport {
        let subscribers = self.subscribers.read().clone();
        let mut report = PublishReport::default();
        let mut saw_closed = false;

        for sub in subscribers {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    sub.delivered.fetch_add(1, Ordering::Relaxed);
                    report.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    record_drop(&sub);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => saw_closed = true,
            }
        }

        if saw_closed {
            self.prune();
        }
        report
    }

    /// Remove subscribers whose receiver was dropped.
    pub fn prune(&self) {
        self.subscribers.write().retain(|sub| {
            let open = !sub.tx.is_closed();
            if !open {
                debug!(subscriber = %sub.name, "event bus subscriber closed, pruning");
            }
            open
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.subscribers
            .read()
            .iter()
            .map(|sub| {
                let capacity = sub.tx.max_capacity();
                SubscriberStats {
                    name: sub.name.clone(),
                    capacity,
                    queued: capacity - sub.tx.capacity(),
                    delivered: sub.delivered.load(Ordering::Relaxed),
                    dropped: sub.dropped.load(Ordering::Relaxed),
                }
            })
            .collect()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(OverflowPolicy::default())
    }
}

fn record_drop<T>(sub: &Subscriber<T>) {
    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
    // Warn on the first drop and then every thousandth to keep logs quiet.
    if dropped == 1 || dropped % 1000 == 0 {
        warn!(subscriber = %sub.name, dropped, "event bus subscriber queue full, dropping events");
    } else {
        trace!(subscriber = %sub.name, dropped, "event dropped");
    }
}
