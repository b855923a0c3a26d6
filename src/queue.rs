//! Key-partitioned work queue.
//!
//! Three containers hold every message that has not been confirmed:
//! `pending` (not yet tried this pass), `deferred` (key was busy when tried)
//! and `in_flight` (granted to a worker). A key is BUSY in the lock table
//! iff a message with that key is in flight.
//!
//! All state lives behind one mutex; each public operation is a single
//! critical section and never waits on a key.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::lock::KeyLockTable;
use crate::model::{Message, MessageId, WorkerId};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Ordering contract for messages sharing a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// Messages for one key are granted in arrival order, even across
    /// deferral. Safe for any operation mix.
    #[default]
    #[serde(alias = "strict")]
    StrictPerKey,
    /// A deferred message may be overtaken by a later message for the same
    /// key. Only correct when every operation after the first per key
    /// commutes (ADD/SUB).
    Relaxed,
}

impl std::fmt::Display for OrderingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderingMode::StrictPerKey => write!(f, "strict"),
            OrderingMode::Relaxed => write!(f, "relaxed"),
        }
    }
}

impl std::str::FromStr for OrderingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" | "strict_per_key" => Ok(OrderingMode::StrictPerKey),
            "relaxed" => Ok(OrderingMode::Relaxed),
            other => Err(format!("unknown ordering mode: {other}")),
        }
    }
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub ordering: OrderingMode,
    /// How long a grant stays valid without a confirm. `None` disables
    /// reclaiming, so a crashed worker holds its key forever.
    pub lease: Option<Duration>,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ordering: OrderingMode::default(),
            lease: None,
            event_capacity: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of [`Queue::request_work`].
#[derive(Debug, Clone, PartialEq)]
pub enum Poll {
    /// The caller now holds this message's key until it confirms or releases.
    Grant(Message),
    /// Nothing grantable right now. Back off and ask again.
    NoneAvailable,
    /// No pending, deferred or in-flight work remains. Stop polling.
    Drained,
}

impl Poll {
    pub fn is_drained(&self) -> bool {
        matches!(self, Poll::Drained)
    }
}

/// Point-in-time container sizes, taken under the queue lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub deferred: usize,
    pub in_flight: usize,
    pub busy_keys: usize,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct InFlight {
    message: Message,
    worker: WorkerId,
    granted_at: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Message>,
    deferred: VecDeque<Message>,
    /// Number of messages per key currently in `deferred`.
    deferred_keys: HashMap<String, usize>,
    in_flight: HashMap<MessageId, InFlight>,
    locks: KeyLockTable,
    seq: u64,
}

/// Work queue with per-key mutual exclusion. Share it behind an `Arc`.
pub struct Queue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    events: broadcast::Sender<Event>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    /// Queue with strict per-key ordering and no lease.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            state: Mutex::new(QueueState::default()),
            config,
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Append a message to `pending`.
    pub fn enqueue(&self, message: Message) {
        let mut state = self.lock();
        debug!(id = %message.id, key = %message.key, "enqueued");
        let kind = EventKind::Enqueued {
            id: message.id.clone(),
            key: message.key.clone(),
        };
        state.pending.push_back(message);
        self.emit(&mut state, kind);
        drop(state);
        record_operation("enqueue");
    }

    /// Ask for the next grantable message on behalf of `worker_id`.
    pub fn request_work(&self, worker_id: &WorkerId) -> Poll {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(lease) = self.config.lease {
            self.reclaim_expired(state, lease);
        }

        let strict = self.config.ordering == OrderingMode::StrictPerKey;
        while let Some(message) = state.pending.pop_front() {
            // A reused id is held back until the earlier grant completes.
            let blocked = !state.locks.is_free(&message.key)
                || (strict && state.deferred_keys.contains_key(&message.key))
                || state.in_flight.contains_key(&message.id);

            if blocked {
                debug!(id = %message.id, key = %message.key, "deferred");
                *state.deferred_keys.entry(message.key.clone()).or_insert(0) += 1;
                let kind = EventKind::Deferred {
                    id: message.id.clone(),
                    key: message.key.clone(),
                };
                state.deferred.push_back(message);
                self.emit(state, kind);
                record_operation("defer");
                continue;
            }

            let acquired = state.locks.acquire(&message.key, worker_id, &message.id);
            debug_assert!(acquired, "granted key {} was already busy", message.key);
            debug!(id = %message.id, key = %message.key, worker = %worker_id, "granted");
            let kind = EventKind::Granted {
                id: message.id.clone(),
                key: message.key.clone(),
                worker_id: worker_id.clone(),
            };
            state.in_flight.insert(
                message.id.clone(),
                InFlight {
                    message: message.clone(),
                    worker: worker_id.clone(),
                    granted_at: Instant::now(),
                },
            );
            self.emit(state, kind);
            record_operation("grant");
            return Poll::Grant(message);
        }

        // Busy keys may have been freed since their messages were deferred.
        if !state.deferred.is_empty() {
            let count = state.deferred.len();
            let deferred = std::mem::take(&mut state.deferred);
            state.pending.extend(deferred);
            state.deferred_keys.clear();
            self.emit(state, EventKind::Flushed { count });
        }

        if state.pending.is_empty() && state.deferred.is_empty() && state.in_flight.is_empty() {
            self.emit(state, EventKind::Drained);
            Poll::Drained
        } else {
            Poll::NoneAvailable
        }
    }

    /// Mark a granted message as done and free its key.
    pub fn confirm(&self, worker_id: &WorkerId, message_id: &MessageId) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entry = self.take_in_flight(state, worker_id, message_id, "confirm")?;

        state.locks.release(&entry.message.key)?;
        debug!(id = %message_id, key = %entry.message.key, worker = %worker_id, "confirmed");
        self.emit(
            state,
            EventKind::Confirmed {
                id: entry.message.id,
                key: entry.message.key,
                worker_id: worker_id.clone(),
            },
        );
        drop(guard);
        record_operation("confirm");
        Ok(())
    }

    /// Give a granted message back unprocessed. It becomes the next
    /// candidate for its key.
    pub fn release(&self, worker_id: &WorkerId, message_id: &MessageId) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let entry = self.take_in_flight(state, worker_id, message_id, "release")?;

        state.locks.release(&entry.message.key)?;
        info!(id = %message_id, key = %entry.message.key, worker = %worker_id, "released");
        let kind = EventKind::Released {
            id: entry.message.id.clone(),
            key: entry.message.key.clone(),
            worker_id: worker_id.clone(),
        };
        requeue_front(state, entry.message);
        self.emit(state, kind);
        drop(guard);
        record_operation("release");
        Ok(())
    }

    /// Length of `pending`. A coarse backlog metric, stale as soon as the
    /// lock is dropped.
    pub fn size(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.pending.len(),
            deferred: state.deferred.len(),
            in_flight: state.in_flight.len(),
            busy_keys: state.locks.busy_count(),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Every critical section leaves the state consistent before anything
    /// that can panic, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_in_flight(
        &self,
        state: &mut QueueState,
        worker_id: &WorkerId,
        message_id: &MessageId,
        action: &str,
    ) -> Result<InFlight> {
        let reason = match state.in_flight.get(message_id) {
            None => Some("message is not in flight".to_string()),
            Some(entry) if &entry.worker != worker_id => {
                Some(format!("message is held by {}", entry.worker))
            }
            Some(_) => None,
        };

        if let Some(reason) = reason {
            warn!(id = %message_id, worker = %worker_id, action, %reason, "protocol violation");
            metrics::protocol_violations().add(1, &[KeyValue::new("action", action.to_string())]);
            return Err(Error::ProtocolViolation {
                worker_id: worker_id.clone(),
                message_id: message_id.clone(),
                reason,
            });
        }

        state
            .in_flight
            .remove(message_id)
            .ok_or_else(|| Error::Other(format!("in-flight entry {message_id} vanished")))
    }

    fn reclaim_expired(&self, state: &mut QueueState, lease: Duration) {
        let now = Instant::now();
        let mut expired: Vec<MessageId> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.granted_at) >= lease)
            .map(|(id, _)| id.clone())
            .collect();
        // Oldest grant ends up at the very front.
        expired.sort_by_key(|id| std::cmp::Reverse(state.in_flight[id].granted_at));

        for id in expired {
            let Some(entry) = state.in_flight.remove(&id) else {
                continue;
            };
            if let Err(e) = state.locks.release(&entry.message.key) {
                warn!(id = %id, "lease reclaim: {e}");
            }
            warn!(
                id = %id,
                key = %entry.message.key,
                worker = %entry.worker,
                "lease expired, reclaiming"
            );
            let kind = EventKind::LeaseExpired {
                id: entry.message.id.clone(),
                key: entry.message.key.clone(),
                worker_id: entry.worker.clone(),
            };
            requeue_front(state, entry.message);
            self.emit(state, kind);
            metrics::lease_reclaims().add(1, &[]);
        }
    }

    fn emit(&self, state: &mut QueueState, kind: EventKind) {
        state.seq += 1;
        // No subscribers is fine.
        let _ = self.events.send(Event {
            seq: state.seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}

/// Put a message back ahead of every later message for its key. If the key
/// already has messages in `deferred`, those arrived later, so go in front of
/// them; otherwise the front of `pending` is enough.
fn requeue_front(state: &mut QueueState, message: Message) {
    if let Some(count) = state.deferred_keys.get_mut(&message.key) {
        *count += 1;
        state.deferred.push_front(message);
    } else {
        state.pending.push_front(message);
    }
}

fn record_operation(operation: &'static str) {
    metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}
