//! Process-wide event hub.
//!
//! One publish path, many subscribers. A single mutex guards sequence
//! allocation and the replay ring so `seq` is strictly monotonic and the
//! ring always reflects publish order. Subscribers get their own bounded
//! queue; a subscriber that cannot keep up loses messages rather than
//! slowing the publisher, and is evicted after too many consecutive
//! losses. Clients recover with resume-by-seq (`job.log` events are
//! exempt: they are not buffered and their loss is not counted, since
//! logs are independently fetchable over HTTP).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use stevedore_protocol::events::{Event, EventKind};
use stevedore_protocol::ids::JobId;

/// Replay ring capacity (non-log events).
const RING_CAPACITY: usize = 512;
/// Outbound queue depth per subscriber.
const SUBSCRIBER_QUEUE: usize = 256;
/// Consecutive failed sends before a subscriber is evicted.
const MAX_CONSECUTIVE_DROPS: u32 = 32;

struct Subscriber {
    id: u64,
    include_logs: bool,
    tx: mpsc::Sender<Arc<Event>>,
    consecutive_drops: u32,
}

struct HubState {
    next_seq: u64,
    ring: VecDeque<Arc<Event>>,
    subscribers: Vec<Subscriber>,
}

/// Multi-consumer fan-out with a bounded replay buffer.
pub struct EventHub {
    state: Mutex<HubState>,
    next_subscriber_id: AtomicU64,
    published_total: AtomicU64,
    dropped_total: AtomicU64,
}

/// Handle returned by [`EventHub::subscribe`]. Dropping the receiver
/// unsubscribes implicitly; the hub notices on the next publish.
pub struct Subscription {
    pub backlog: Vec<Arc<Event>>,
    pub receiver: mpsc::Receiver<Arc<Event>>,
    pub subscriber_id: u64,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                next_seq: 1,
                ring: VecDeque::with_capacity(RING_CAPACITY),
                subscribers: Vec::new(),
            }),
            next_subscriber_id: AtomicU64::new(1),
            published_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Assign the next seq, stamp, buffer and fan out. Returns the seq.
    pub fn publish(
        &self,
        kind: EventKind,
        job_id: Option<JobId>,
        payload: serde_json::Value,
    ) -> u64 {
        let mut state = self.state.lock().expect("event hub mutex poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;

        let event = Arc::new(Event {
            seq,
            ts: chrono::Utc::now(),
            kind,
            job_id,
            payload,
        });

        if kind.is_buffered() {
            if state.ring.len() == RING_CAPACITY {
                state.ring.pop_front();
            }
            state.ring.push_back(event.clone());
        }

        let counts_drops = kind.is_buffered();
        let mut dropped = 0u64;
        state.subscribers.retain_mut(|sub| {
            if kind == EventKind::JobLog && !sub.include_logs {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    sub.consecutive_drops = 0;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    if counts_drops {
                        sub.consecutive_drops += 1;
                        if sub.consecutive_drops >= MAX_CONSECUTIVE_DROPS {
                            debug!(subscriber = sub.id, "evicting subscriber that cannot keep up");
                            return false;
                        }
                    }
                    true
                }
            }
        });

        self.published_total.fetch_add(1, Ordering::Relaxed);
        self.dropped_total.fetch_add(dropped, Ordering::Relaxed);
        seq
    }

    /// Register a subscriber. The backlog holds every buffered event
    /// with `seq > after_seq` still inside the ring, in order; live
    /// events follow on the receiver.
    pub fn subscribe(&self, after_seq: Option<u64>, include_logs: bool) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().expect("event hub mutex poisoned");
        let backlog = match after_seq {
            Some(after) => state
                .ring
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        state.subscribers.push(Subscriber {
            id,
            include_logs,
            tx,
            consecutive_drops: 0,
        });

        Subscription {
            backlog,
            receiver: rx,
            subscriber_id: id,
        }
    }

    pub fn unsubscribe(&self, subscriber_id: u64) {
        let mut state = self.state.lock().expect("event hub mutex poisoned");
        state.subscribers.retain(|s| s.id != subscriber_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .expect("event hub mutex poisoned")
            .subscribers
            .len()
    }

    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}
