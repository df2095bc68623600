//! In-process broker.
//!
//! Behaves like a single RabbitMQ node for everything the reliability layer
//! relies on: durable vs. transient queues, declaration conflicts, per-channel
//! prefetch, ack/nack with requeue, requeue of unacknowledged deliveries when
//! a channel or link goes away, and `message_count` reporting ready messages
//! only. It also exposes fault injection (refused connections, dropped links,
//! broker restarts) for exercising retry paths.

use crate::config::ConnectionConfig;
use crate::transport::{
    Acknowledger, Channel, Delivery, DeliveryStream, Link, MessageProperties, OutboundMessage,
    QueueStats, Transport,
};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Debug)]
struct InFlight {
    channel: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<u64, InFlight>,
    consumers: Vec<u64>,
    dead_letters: Vec<StoredMessage>,
}

impl MemoryQueue {
    fn stats(&self) -> QueueStats {
        QueueStats {
            message_count: u32::try_from(self.ready.len()).unwrap_or(u32::MAX),
            consumer_count: u32::try_from(self.consumers.len()).unwrap_or(u32::MAX),
        }
    }

    fn in_flight_for(&self, channel: u64) -> usize {
        self.unacked.values().filter(|f| f.channel == channel).count()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    open_links: HashSet<u64>,
    /// channel id -> owning link id
    open_channels: HashMap<u64, u64>,
    next_id: u64,
    next_tag: u64,
    refuse_remaining: u32,
    connect_attempts: u64,
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_error(&self, channel: u64, link: u64) -> CourierError {
        if self.open_links.contains(&link) {
            CourierError::Channel(format!("channel {channel} is closed"))
        } else {
            CourierError::ConnectionLost(format!("link {link} is closed"))
        }
    }

    fn check_channel(&self, channel: u64, link: u64) -> CourierResult<()> {
        if self.open_channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(self.channel_error(channel, link))
        }
    }

    /// Requeue everything the channel holds unacknowledged, in delivery order,
    /// ahead of messages that were never delivered.
    fn release_channel(&mut self, channel: u64) {
        self.open_channels.remove(&channel);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| *c != channel);
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, f)| f.channel == channel)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags.into_iter().rev() {
                if let Some(mut in_flight) = queue.unacked.remove(&tag) {
                    in_flight.message.redelivered = true;
                    queue.ready.push_front(in_flight.message);
                }
            }
        }
    }

    fn release_link(&mut self, link: u64) {
        self.open_links.remove(&link);
        let channels: Vec<u64> = self
            .open_channels
            .iter()
            .filter(|(_, owner)| **owner == link)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.release_channel(channel);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// A broker living inside the process. Cloning shares the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// An empty broker with no queues.
    pub fn new() -> Self {
        Self::default()
    }

    fn wake(&self) {
        self.inner.notify.notify_waiters();
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.inner.state.lock().refuse_remaining = n;
    }

    /// Total connection attempts seen, refused ones included.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.state.lock().connect_attempts
    }

    /// Number of currently open links.
    pub fn open_link_count(&self) -> usize {
        self.inner.state.lock().open_links.len()
    }

    /// Sever every link, as a network partition would.
    /// Unacknowledged deliveries go back to their queues.
    pub fn drop_connections(&self) {
        {
            let mut state = self.inner.state.lock();
            let links: Vec<u64> = state.open_links.iter().copied().collect();
            for link in links {
                state.release_link(link);
            }
        }
        debug!("Memory broker dropped all connections");
        self.wake();
    }

    /// Simulate a broker restart: links drop and transient queues vanish,
    /// durable queues keep their messages.
    pub fn restart(&self) {
        self.drop_connections();
        self.inner.state.lock().queues.retain(|_, q| q.durable);
        self.wake();
    }

    /// Ready messages in `queue`, or `None` if it does not exist.
    pub fn message_count(&self, queue: &str) -> Option<u32> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.stats().message_count)
    }

    /// Delivered but not yet settled messages in `queue`.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
    }

    /// Messages rejected without requeue.
    pub fn dead_letter_count(&self, queue: &str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.len())
    }

    /// Active consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> Option<u32> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.stats().consumer_count)
    }

    /// Declared durability of `queue`.
    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.inner.state.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Bodies of the ready messages in `queue`, front first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// All queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, config: &ConnectionConfig) -> CourierResult<Arc<dyn Link>> {
        let id = {
            let mut state = self.inner.state.lock();
            state.connect_attempts += 1;
            if state.refuse_remaining > 0 {
                state.refuse_remaining -= 1;
                return Err(CourierError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("connection to {} refused", config.endpoint()),
                )));
            }
            let id = state.allocate_id();
            state.open_links.insert(id);
            id
        };
        debug!(link = id, "Memory broker accepted connection");
        Ok(Arc::new(MemoryLink {
            id,
            broker: self.clone(),
        }))
    }
}

struct MemoryLink {
    id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl Link for MemoryLink {
    fn is_open(&self) -> bool {
        self.broker.inner.state.lock().open_links.contains(&self.id)
    }

    async fn open_channel(&self) -> CourierResult<Box<dyn Channel>> {
        let mut state = self.broker.inner.state.lock();
        if !state.open_links.contains(&self.id) {
            return Err(CourierError::ConnectionLost(format!(
                "link {} is closed",
                self.id
            )));
        }
        let id = state.allocate_id();
        state.open_channels.insert(id, self.id);
        Ok(Box::new(MemoryChannel {
            id,
            link: self.id,
            broker: self.broker.clone(),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> CourierResult<()> {
        self.broker.inner.state.lock().release_link(self.id);
        self.broker.wake();
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    link: u64,
    broker: MemoryBroker,
    prefetch: AtomicU16,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn queue_declare(&self, queue: &str, durable: bool) -> CourierResult<QueueStats> {
        let mut state = self.broker.inner.state.lock();
        state.check_channel(self.id, self.link)?;
        match state.queues.get(queue) {
            Some(existing) if existing.durable != durable => Err(CourierError::QueueConflict {
                queue: queue.to_string(),
                existing: existing.durable,
                requested: durable,
            }),
            Some(existing) => Ok(existing.stats()),
            None => {
                let created = MemoryQueue {
                    durable,
                    ..MemoryQueue::default()
                };
                let stats = created.stats();
                state.queues.insert(queue.to_string(), created);
                Ok(stats)
            }
        }
    }

    async fn queue_inspect(&self, queue: &str) -> CourierResult<QueueStats> {
        let state = self.broker.inner.state.lock();
        state.check_channel(self.id, self.link)?;
        state
            .queues
            .get(queue)
            .map(MemoryQueue::stats)
            .ok_or_else(|| CourierError::Channel(format!("NOT_FOUND - no queue '{queue}'")))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> CourierResult<()> {
        self.broker
            .inner
            .state
            .lock()
            .check_channel(self.id, self.link)?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_publish(&self, queue: &str, message: OutboundMessage) -> CourierResult<()> {
        {
            let mut state = self.broker.inner.state.lock();
            state.check_channel(self.id, self.link)?;
            let target = state.queues.get_mut(queue).ok_or_else(|| {
                CourierError::Channel(format!("NOT_FOUND - no queue '{queue}'"))
            })?;
            target.ready.push_back(StoredMessage {
                body: message.body,
                properties: message.properties,
                redelivered: false,
            });
        }
        self.broker.wake();
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> CourierResult<Box<dyn DeliveryStream>> {
        let mut state = self.broker.inner.state.lock();
        state.check_channel(self.id, self.link)?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| CourierError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?;
        target.consumers.push(self.id);
        debug!(queue = %queue, consumer_tag = %consumer_tag, channel = self.id, "Memory consumer registered");
        Ok(Box::new(MemoryDeliveryStream {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            channel: self.id,
            prefetch: usize::from(self.prefetch.load(Ordering::SeqCst)),
        }))
    }

    async fn close(&self) -> CourierResult<()> {
        self.broker.inner.state.lock().release_channel(self.id);
        self.broker.wake();
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let released = {
            let mut state = self.broker.inner.state.lock();
            if state.open_channels.contains_key(&self.id) {
                state.release_channel(self.id);
                true
            } else {
                false
            }
        };
        if released {
            self.broker.wake();
        }
    }
}

enum Take {
    Delivered(Delivery),
    Closed,
    Empty,
}

struct MemoryDeliveryStream {
    broker: MemoryBroker,
    queue: String,
    channel: u64,
    /// 0 means unlimited.
    prefetch: usize,
}

impl MemoryDeliveryStream {
    fn try_take(&self) -> Take {
        let mut state = self.broker.inner.state.lock();
        if !state.open_channels.contains_key(&self.channel) {
            return Take::Closed;
        }
        state.next_tag += 1;
        let tag = state.next_tag;
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Take::Closed;
        };
        if self.prefetch > 0 && queue.in_flight_for(self.channel) >= self.prefetch {
            return Take::Empty;
        }
        let Some(message) = queue.ready.pop_front() else {
            return Take::Empty;
        };
        queue.unacked.insert(
            tag,
            InFlight {
                channel: self.channel,
                message: message.clone(),
            },
        );
        Take::Delivered(Delivery::new(
            tag,
            message.body,
            message.properties,
            message.redelivered,
            Box::new(MemoryAcker {
                broker: self.broker.clone(),
                queue: self.queue.clone(),
                channel: self.channel,
            }),
        ))
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<CourierResult<Delivery>> {
        let inner = Arc::clone(&self.broker.inner);
        loop {
            // Register interest before looking, so a publish racing with the
            // check still wakes us.
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Take::Delivered(delivery) => return Some(Ok(delivery)),
                Take::Closed => return None,
                Take::Empty => notified.await,
            }
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    channel: u64,
}

impl MemoryAcker {
    fn settle(&self, delivery_tag: u64, requeue: Option<bool>) -> CourierResult<()> {
        {
            let mut state = self.broker.inner.state.lock();
            if !state.open_channels.contains_key(&self.channel) {
                return Err(CourierError::ConnectionLost(format!(
                    "channel {} closed before delivery {delivery_tag} was settled",
                    self.channel
                )));
            }
            let queue = state.queues.get_mut(&self.queue).ok_or_else(|| {
                CourierError::Channel(format!("NOT_FOUND - no queue '{}'", self.queue))
            })?;
            let in_flight = queue.unacked.remove(&delivery_tag).ok_or_else(|| {
                CourierError::Channel(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                ))
            })?;
            match requeue {
                None => {}
                Some(true) => {
                    let mut message = in_flight.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
                Some(false) => queue.dead_letters.push(in_flight.message),
            }
        }
        self.broker.wake();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> CourierResult<()> {
        self.settle(delivery_tag, None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> CourierResult<()> {
        self.settle(delivery_tag, Some(requeue))
    }
}
