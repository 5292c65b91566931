//! Bulkhead — per-endpoint concurrency limit with a FIFO wait queue.
//!
//! Admission:
//! - a free slot is granted immediately;
//! - otherwise the request joins the queue (if `max_queued` allows) and
//!   suspends until a slot is handed to it or `queue_timeout` elapses;
//! - otherwise it is rejected synchronously.
//!
//! Slots are handed out only by the grant path, which runs under the
//! bulkhead lock whenever a slot frees up or the config changes. A grant is
//! delivered through the waiter's oneshot channel; if the waiter is gone the
//! grant is discarded and the next waiter is tried. The `bulkhead_accepted`
//! event is emitted by the admitted caller, never by the grant path.
//!
//! A [`BulkheadPermit`] releases its slot on drop, so normal return, error,
//! panic unwinding and task abort all give the slot back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::{BulkheadConfig, ConfigSubscriber, EndpointConfig};
use crate::error::GuardError;
use crate::events::{EventBus, EventKind};
use crate::lock::{lock, read, write};

/// Point-in-time view of a bulkhead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkheadSnapshot {
    pub name: String,
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queued: usize,
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
    /// `active / max_concurrent`.
    pub utilization: f64,
    /// Mean wait of requests that were granted from the queue.
    pub avg_queue_wait_ms: f64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
    enqueued_at: Instant,
}

struct BulkheadState {
    config: BulkheadConfig,
    active: usize,
    queue: VecDeque<Waiter>,
    next_id: u64,
    total_accepted: u64,
    total_rejected: u64,
    total_timeouts: u64,
    total_cancelled: u64,
    queued_grants: u64,
    total_queue_wait: Duration,
}

impl BulkheadState {
    /// Hand free slots to the oldest live waiters. Returns how many were granted.
    fn drain(&mut self) -> usize {
        let mut granted = 0;
        while self.active < self.config.max_concurrent {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            // A closed receiver means the waiter already left; drop the grant.
            if waiter.tx.send(()).is_ok() {
                self.active += 1;
                self.total_accepted += 1;
                self.queued_grants += 1;
                self.total_queue_wait += waiter.enqueued_at.elapsed();
                granted += 1;
            }
        }
        granted
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    fn release_slot(&mut self) -> usize {
        self.active = self.active.saturating_sub(1);
        self.drain()
    }
}

/// Concurrency limiter for one endpoint.
pub struct Bulkhead {
    name: String,
    state: Mutex<BulkheadState>,
    events: EventBus,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig, events: EventBus) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(BulkheadState {
                config,
                active: 0,
                queue: VecDeque::new(),
                next_id: 0,
                total_accepted: 0,
                total_rejected: 0,
                total_timeouts: 0,
                total_cancelled: 0,
                queued_grants: 0,
                total_queue_wait: Duration::ZERO,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BulkheadConfig {
        lock(&self.state).config
    }

    /// Acquire a slot, waiting in the queue for at most `timeout`
    /// (`None` uses the configured `queue_timeout`).
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<BulkheadPermit, GuardError> {
        let (id, rx, wait, depth) = {
            let mut st = lock(&self.state);
            if st.active < st.config.max_concurrent && st.queue.is_empty() {
                st.active += 1;
                st.total_accepted += 1;
                drop(st);
                self.events.emit(&self.name, EventKind::BulkheadAccepted);
                return Ok(self.permit());
            }

            if st.queue.len() >= st.config.max_queued {
                st.total_rejected += 1;
                let no_queue = st.config.max_queued == 0;
                drop(st);
                return Err(self.reject(no_queue));
            }

            let id = st.next_id;
            st.next_id += 1;
            let (tx, rx) = oneshot::channel();
            st.queue.push_back(Waiter {
                id,
                tx,
                enqueued_at: Instant::now(),
            });
            let wait = timeout.unwrap_or(st.config.queue_timeout);
            (id, rx, wait, st.queue.len())
        };

        self.events
            .emit(&self.name, EventKind::BulkheadQueued { queue_depth: depth });
        tracing::debug!(endpoint = %self.name, queue_depth = depth, "request queued");

        let mut ticket = QueueTicket {
            bulkhead: self.clone(),
            id,
            rx,
            settled: false,
        };
        let started = Instant::now();

        match tokio::time::timeout(wait, &mut ticket.rx).await {
            Ok(Ok(())) => {
                ticket.settled = true;
                self.events.emit(&self.name, EventKind::BulkheadAccepted);
                Ok(self.permit())
            }
            // The sender only disappears without a grant if the waiter was
            // removed, which only this ticket does; treat it like a timeout.
            Ok(Err(_)) | Err(_) => {
                if ticket.expire() {
                    self.events.emit(&self.name, EventKind::BulkheadAccepted);
                    return Ok(self.permit());
                }
                let waited_ms = started.elapsed().as_millis() as u64;
                self.events
                    .emit(&self.name, EventKind::BulkheadTimeout { waited_ms });
                tracing::debug!(endpoint = %self.name, waited_ms, "queued request timed out");
                Err(GuardError::BulkheadTimeout {
                    endpoint: self.name.clone(),
                    ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Apply a new config and immediately hand out any newly available
    /// slots. Running work is never evicted and queued requests stay queued
    /// even if `max_queued` shrinks.
    pub fn reconfigure(&self, config: BulkheadConfig) {
        let mut st = lock(&self.state);
        st.config = config;
        let granted = st.drain();
        drop(st);
        if granted > 0 {
            tracing::debug!(endpoint = %self.name, granted, "queued requests admitted after reconfigure");
        }
    }

    pub fn snapshot(&self) -> BulkheadSnapshot {
        let st = lock(&self.state);
        let utilization = if st.config.max_concurrent == 0 {
            0.0
        } else {
            st.active as f64 / st.config.max_concurrent as f64
        };
        let avg_queue_wait_ms = if st.queued_grants == 0 {
            0.0
        } else {
            st.total_queue_wait.as_secs_f64() * 1000.0 / st.queued_grants as f64
        };
        BulkheadSnapshot {
            name: self.name.clone(),
            active: st.active,
            queued: st.queue.len(),
            max_concurrent: st.config.max_concurrent,
            max_queued: st.config.max_queued,
            total_accepted: st.total_accepted,
            total_rejected: st.total_rejected,
            total_timeouts: st.total_timeouts,
            total_cancelled: st.total_cancelled,
            utilization,
            avg_queue_wait_ms,
        }
    }

    fn permit(self: &Arc<Self>) -> BulkheadPermit {
        BulkheadPermit {
            bulkhead: self.clone(),
        }
    }

    fn reject(&self, no_queue: bool) -> GuardError {
        let endpoint = self.name.clone();
        let err = if no_queue {
            GuardError::BulkheadFull { endpoint }
        } else {
            GuardError::BulkheadQueueFull { endpoint }
        };
        self.events.emit(
            &self.name,
            EventKind::BulkheadRejected {
                reason: err.kind().to_string(),
            },
        );
        tracing::debug!(endpoint = %self.name, reason = err.kind(), "request rejected");
        err
    }

    fn release(&self) {
        lock(&self.state).release_slot();
    }
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.state);
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("active", &st.active)
            .field("queued", &st.queue.len())
            .finish()
    }
}

/// An execution slot. The slot is returned when this is dropped.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
}

impl BulkheadPermit {
    pub fn endpoint(&self) -> &str {
        self.bulkhead.name()
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.release();
    }
}

impl std::fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPermit")
            .field("endpoint", &self.bulkhead.name())
            .finish()
    }
}

/// A queued request. Dropping it unsettled (caller cancelled) removes it
/// from the queue, or returns the slot if a grant already arrived.
struct QueueTicket {
    bulkhead: Arc<Bulkhead>,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl QueueTicket {
    /// Give up waiting. Returns `true` if a grant raced in first, in which
    /// case the caller owns the slot.
    fn expire(&mut self) -> bool {
        self.settled = true;
        let mut st = lock(&self.bulkhead.state);
        if st.remove_waiter(self.id) {
            st.total_timeouts += 1;
            return false;
        }
        self.rx.try_recv().is_ok()
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut st = lock(&self.bulkhead.state);
        if st.remove_waiter(self.id) {
            st.total_cancelled += 1;
        } else if self.rx.try_recv().is_ok() {
            st.release_slot();
        }
    }
}

/// Keyed store of [`Bulkhead`]s, one per endpoint.
pub struct BulkheadRegistry {
    bulkheads: RwLock<HashMap<String, Arc<Bulkhead>>>,
    events: EventBus,
}

impl BulkheadRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            bulkheads: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Bulkhead>> {
        read(&self.bulkheads).get(name).cloned()
    }

    pub fn get_or_create(&self, name: &str, config: &BulkheadConfig) -> Arc<Bulkhead> {
        if let Some(b) = self.get(name) {
            return b;
        }
        write(&self.bulkheads)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(name, *config, self.events.clone())))
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.bulkheads).keys().cloned().collect();
        names.sort();
        names
    }
}

impl ConfigSubscriber for BulkheadRegistry {
    fn config_changed(&self, endpoint: &str, config: &EndpointConfig) {
        self.get_or_create(endpoint, &config.bulkhead)
            .reconfigure(config.bulkhead);
    }
}

impl std::fmt::Debug for BulkheadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadRegistry")
            .field("bulkheads", &self.names())
            .finish()
    }
}
