//! Structured events emitted by the queue on every state change.
//!
//! Consumers subscribe via [`Queue::subscribe`](crate::queue::Queue::subscribe)
//! to build dashboards or audit logs. Delivery is best effort: a subscriber
//! that falls behind sees `RecvError::Lagged`, the queue never waits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{MessageId, WorkerId};

/// A structured event emitted by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Enqueued {
        id: MessageId,
        key: String,
    },
    Granted {
        id: MessageId,
        key: String,
        worker_id: WorkerId,
    },
    Deferred {
        id: MessageId,
        key: String,
    },
    /// Deferred messages moved back onto pending.
    Flushed {
        count: usize,
    },
    Confirmed {
        id: MessageId,
        key: String,
        worker_id: WorkerId,
    },
    Released {
        id: MessageId,
        key: String,
        worker_id: WorkerId,
    },
    LeaseExpired {
        id: MessageId,
        key: String,
        worker_id: WorkerId,
    },
    Drained,
}
