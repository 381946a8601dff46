use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Events retained for subscribers that connect late.
pub const BACKLOG_SIZE: usize = 10;
const DEFAULT_QUEUE_SIZE: usize = 64;

pub type StatusEvent = Value;

struct Inner {
    subscribers: Vec<(u64, mpsc::Sender<StatusEvent>)>,
    backlog: VecDeque<StatusEvent>,
    running: bool,
    next_id: u64,
}

/// Multi-subscriber fan-out of dynamic-mode status events.
///
/// Events are only accepted while the dynamic controller is running. With no
/// subscribers connected the last `BACKLOG_SIZE` events are buffered and
/// replayed to the next subscriber. A subscriber that cannot keep up (its
/// bounded queue fills) is disconnected rather than allowed to block the
/// publisher.
pub struct StatusStream {
    queue_capacity: usize,
    inner: Arc<Mutex<Inner>>,
}

impl StatusStream {
    pub fn new() -> StatusStream {
        StatusStream::with_queue_capacity(DEFAULT_QUEUE_SIZE)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> StatusStream {
        StatusStream {
            queue_capacity,
            inner: Arc::new(Mutex::new(Inner {
                subscribers: vec![],
                backlog: VecDeque::with_capacity(BACKLOG_SIZE),
                running: false,
                next_id: 0,
            })),
        }
    }

    pub fn set_running(&self, running: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = running;

        if !running {
            inner.backlog.clear();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    pub fn backlog(&self) -> Vec<StatusEvent> {
        self.inner.lock().unwrap().backlog.iter().cloned().collect()
    }

    /// Publish an event. Dropped while stopped; buffered while nobody is
    /// listening; otherwise enqueued to every subscriber without blocking.
    pub fn publish(&self, event: StatusEvent) {
        let mut inner = self.inner.lock().unwrap();

        if !inner.running {
            return;
        }

        if inner.subscribers.is_empty() {
            if inner.backlog.len() == BACKLOG_SIZE {
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(event);
            log::debug!("Event buffered, backlog size: {}", inner.backlog.len());
            return;
        }

        let mut disconnected = vec![];

        for (id, sender) in &inner.subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("Subscriber queue full, removing subscriber");
                    disconnected.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    disconnected.push(*id);
                }
            }
        }

        inner
            .subscribers
            .retain(|(id, _)| !disconnected.contains(id));
    }

    /// Register a new subscriber. Backlogged events are copied into its
    /// queue before any live event, so a reconnecting client never misses
    /// the recent window.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut inner = self.inner.lock().unwrap();

        let id = inner.next_id;
        inner.next_id += 1;

        for event in &inner.backlog {
            if tx.try_send(event.clone()).is_err() {
                log::warn!("Backlog overflowed new subscriber queue");
                break;
            }
        }

        inner.subscribers.push((id, tx));
        log::debug!("New subscriber added, total: {}", inner.subscribers.len());

        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Terminate every subscriber and clear all stream state.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();

        for (_, sender) in &inner.subscribers {
            let _ = sender.try_send(Value::Null);
        }

        inner.subscribers.clear();
        inner.backlog.clear();
        inner.running = false;
        log::info!("StatusStream closed");
    }
}

impl Default for StatusStream {
    fn default() -> StatusStream {
        StatusStream::new()
    }
}

/// A live subscription; unsubscribes itself when dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<StatusEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl Subscription {
    /// Next event, in publish order. `None` once the stream closes.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        match self.rx.recv().await {
            None | Some(Value::Null) => None,
            Some(event) => Some(event),
        }
    }

    /// Non-blocking receive, for drains and tests.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        match self.rx.try_recv() {
            Ok(Value::Null) | Err(_) => None,
            Ok(event) => Some(event),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|(id, _)| *id != self.id);
        log::debug!("Subscriber removed, total: {}", inner.subscribers.len());
    }
}
