//! Bounded broadcast event bus with backpressure
//!
//! Every subscriber owns a bounded queue and receives its own copy of the
//! stream. Publishing for one key is serialized, so events sharing a key
//! reach each subscriber in production order. A full subscriber makes the
//! publisher wait until the publish deadline; after that the copy for that
//! subscriber is dropped and counted.

use crate::error::BusError;
use crate::models::{DeviceId, FlowRecord, Sample};
use crate::observability::CollectorMetrics;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// An event that can travel on the bus, ordered per key
pub trait BusEvent: Send + Sync + 'static {
    type Key: Hash + Eq + Clone + fmt::Display + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

impl BusEvent for Sample {
    type Key = DeviceId;

    fn key(&self) -> DeviceId {
        self.device.clone()
    }
}

impl BusEvent for FlowRecord {
    type Key = IpAddr;

    fn key(&self) -> IpAddr {
        self.exporter
    }
}

/// Configuration for an event bus
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Queue capacity per subscriber
    pub capacity: usize,
    /// How long a publish may wait on full subscribers before dropping
    pub publish_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            publish_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Throughput counters of one bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

struct Subscriber<T> {
    name: String,
    tx: mpsc::Sender<Arc<T>>,
}

struct BusInner<T: BusEvent> {
    name: &'static str,
    config: BusConfig,
    subscribers: DashMap<u64, Subscriber<T>>,
    key_locks: DashMap<T::Key, Arc<Mutex<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    counters: BusCounters,
    metrics: CollectorMetrics,
}

impl<T: BusEvent> BusInner<T> {
    fn key_lock(&self, key: &T::Key) -> Arc<Mutex<()>> {
        Arc::clone(
            self.key_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn release_key(&self, key: &T::Key, lock: Arc<Mutex<()>>) {
        drop(lock);
        // Only the map holds it now: nobody is publishing for this key.
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn targets(&self) -> Vec<(u64, mpsc::Sender<Arc<T>>)> {
        self.subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect()
    }

    fn remove_subscriber(&self, id: u64) {
        if let Some((_, subscriber)) = self.subscribers.remove(&id) {
            debug!(bus = self.name, subscriber = %subscriber.name, "Subscriber detached");
            self.metrics
                .set_bus_subscribers(self.name, self.subscribers.len() as i64);
        }
    }
}

/// Bounded, per-key ordered broadcast bus
pub struct EventBus<T: BusEvent> {
    inner: Arc<BusInner<T>>,
}

impl<T: BusEvent> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: BusEvent> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.inner.name)
            .field("subscribers", &self.inner.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl<T: BusEvent> EventBus<T> {
    pub fn new(name: &'static str, config: BusConfig, metrics: CollectorMetrics) -> Self {
        let config = BusConfig {
            capacity: config.capacity.max(1),
            ..config
        };
        Self {
            inner: Arc::new(BusInner {
                name,
                config,
                subscribers: DashMap::new(),
                key_locks: DashMap::new(),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                counters: BusCounters::default(),
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Attach a new subscriber. It sees events published from now on.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<T> {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.capacity);

        if !self.inner.closed.load(Ordering::Acquire) {
            self.inner.subscribers.insert(
                id,
                Subscriber {
                    name: name.clone(),
                    tx,
                },
            );
            self.inner
                .metrics
                .set_bus_subscribers(self.inner.name, self.inner.subscribers.len() as i64);
            debug!(bus = self.inner.name, subscriber = %name, "Subscriber attached");
        }

        Subscription { id, name, rx }
    }

    /// Detach a subscriber by id
    pub fn unsubscribe(&self, id: u64) {
        self.inner.remove_subscriber(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Publish one event to every subscriber.
    ///
    /// Returns the number of subscribers that received it. Never waits longer
    /// than the configured publish timeout; subscribers still full at the
    /// deadline lose this event and [`BusError::BackpressureDrop`] is returned.
    pub async fn publish(&self, event: T) -> Result<usize, BusError> {
        self.publish_with(event, |_| {}).await
    }

    /// Like [`publish`](Self::publish), but runs `prepare` on the event while
    /// its key is locked. Publishes sharing a key are serialized from
    /// `prepare` through delivery. `prepare` is skipped if the key lock is not
    /// acquired before the publish deadline.
    pub async fn publish_with<F>(&self, mut event: T, prepare: F) -> Result<usize, BusError>
    where
        F: FnOnce(&mut T) + Send,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + inner.config.publish_timeout;
        let key = event.key();
        let lock = inner.key_lock(&key);
        let mut delivered = 0usize;
        let mut dropped = 0usize;

        match timeout_at(deadline, lock.lock()).await {
            Ok(_guard) => {
                prepare(&mut event);
                let event = Arc::new(event);
                for (id, tx) in inner.targets() {
                    match tx.try_send(Arc::clone(&event)) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Closed(_)) => inner.remove_subscriber(id),
                        Err(TrySendError::Full(event)) => {
                            match timeout_at(deadline, tx.send(event)).await {
                                Ok(Ok(())) => delivered += 1,
                                Ok(Err(_)) => inner.remove_subscriber(id),
                                Err(_) => dropped += 1,
                            }
                        }
                    }
                }
            }
            // Another publish for this key held the lock past our deadline.
            Err(_) => dropped = inner.subscribers.len(),
        }
        inner.release_key(&key, lock);

        inner
            .counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        inner.metrics.inc_bus_delivered(inner.name, delivered as u64);

        if dropped > 0 {
            inner
                .counters
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            inner.metrics.inc_bus_dropped(inner.name, dropped as u64);
            debug!(bus = inner.name, key = %key, dropped, "Backpressure drop");
            return Err(BusError::BackpressureDrop { dropped });
        }

        Ok(delivered)
    }

    /// Stop accepting events and detach all subscribers. Subscribers drain
    /// what is already queued and then see the end of the stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subscribers.clear();
        self.inner.metrics.set_bus_subscribers(self.inner.name, 0);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            subscribers: self.inner.subscribers.len(),
        }
    }
}

/// Receiving side of one subscriber
pub struct Subscription<T> {
    id: u64,
    name: String,
    rx: mpsc::Receiver<Arc<T>>,
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event; `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<Arc<T>> {
        self.rx.recv().await
    }

    /// Take the next event if one is queued
    pub fn try_recv(&mut self) -> Option<Arc<T>> {
        self.rx.try_recv().ok()
    }

    /// Number of events waiting in this subscriber's queue
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn into_stream(self) -> ReceiverStream<Arc<T>> {
        ReceiverStream::new(self.rx)
    }
}
