//! # Event Buffer
//!
//! The ordered, append-only log of every decoded ingress event, shared by the
//! ingress reader and the provider workers (each reading by its own index).
//!
//! The buffer also carries the *live feed*: every raw ingress frame, valid or
//! not, is delivered to each pass-through worker through its own bounded
//! `mpsc` queue. Delivery is lossless: when a worker's queue is full, `ingest`
//! waits for it, which in turn stops the ingress reader from pulling more
//! frames off the producer socket.
//!
//! Appending an event and taking the subscriber list happen under one lock,
//! which is what lets
//! [`subscribe_if_caught_up`](EventBuffer::subscribe_if_caught_up) cut the
//! stream exactly between "already in the log" and "will arrive live". A
//! separate async lock serializes publishers so every subscriber sees frames in
//! ingest order, even while a replaced producer connection is still being read.
//!
//! The `std::sync::Mutex` is never held across an `.await`.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::core::event::{Event, Frame};

/// One item of the live feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveFrame {
    /// A raw ingress frame, exactly as received.
    Frame(Frame),
    /// The current producer connection ended.
    Disconnected,
}

/// Receiving end of one live feed subscription.
pub type LiveFeed = mpsc::Receiver<LiveFrame>;

struct Log {
    events: Vec<Event>,
    subscribers: Vec<mpsc::Sender<LiveFrame>>,
}

pub struct EventBuffer {
    log: Mutex<Log>,
    publishing: tokio::sync::Mutex<()>,
    live_capacity: usize,
}

impl EventBuffer {
    /// `live_capacity` is the per-subscriber queue depth; it must be positive.
    pub fn new(live_capacity: usize) -> Self {
        Self {
            log: Mutex::new(Log {
                events: Vec::new(),
                subscribers: Vec::new(),
            }),
            publishing: tokio::sync::Mutex::new(()),
            live_capacity: live_capacity.max(1),
        }
    }

    /// Appends one event and returns the new length.
    pub fn append(&self, event: Event) -> usize {
        let mut log = self.lock();
        log.events.push(event);
        log.events.len()
    }

    /// Records one raw ingress frame: appends its decoded event (if any), then
    /// delivers the raw frame to every live subscriber, waiting for room in
    /// full queues.
    pub async fn ingest(&self, raw: Frame, decoded: Option<Event>) -> usize {
        let _publishing = self.publishing.lock().await;
        let (len, subscribers) = {
            let mut log = self.lock();
            if let Some(event) = decoded {
                log.events.push(event);
            }
            (log.events.len(), log.live_subscribers())
        };

        // No subscribers is the normal case before any worker reaches pass-through.
        publish(&subscribers, LiveFrame::Frame(raw)).await;
        len
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// The event at `index`, if it has been written yet.
    pub fn get(&self, index: usize) -> Option<Event> {
        self.lock().events.get(index).cloned()
    }

    /// Copy of the whole log.
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Subscribes to frames ingested from now on.
    pub fn subscribe(&self) -> LiveFeed {
        self.lock().subscribe(self.live_capacity)
    }

    /// Live feed subscribers whose receiver is still alive.
    pub fn live_subscribers(&self) -> usize {
        self.lock().live_subscribers().len()
    }

    /// Subscribes to the live feed only if `index` has reached the end of the
    /// log, checked under the same lock that guards appends. When this returns
    /// `Some`, every frame ingested after the event at `index - 1` will arrive on
    /// the receiver.
    pub fn subscribe_if_caught_up(&self, index: usize) -> Option<LiveFeed> {
        let mut log = self.lock();
        (index >= log.events.len()).then(|| log.subscribe(self.live_capacity))
    }

    /// Tells every live subscriber that the producer connection ended.
    pub async fn publish_disconnect(&self) {
        let _publishing = self.publishing.lock().await;
        let subscribers = self.lock().live_subscribers();
        publish(&subscribers, LiveFrame::Disconnected).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().expect("Event buffer lock poisoned")
    }
}

impl Log {
    fn subscribe(&mut self, capacity: usize) -> LiveFeed {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.push(tx);
        rx
    }

    /// Drops subscribers whose worker has gone and returns the rest.
    fn live_subscribers(&mut self) -> Vec<mpsc::Sender<LiveFrame>> {
        self.subscribers.retain(|tx| !tx.is_closed());
        self.subscribers.clone()
    }
}

async fn publish(subscribers: &[mpsc::Sender<LiveFrame>], item: LiveFrame) {
    for tx in subscribers {
        // A closed queue only means that worker has terminated.
        let _ = tx.send(item.clone()).await;
    }
}
