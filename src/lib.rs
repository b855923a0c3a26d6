//! # keyq
//!
//! Key-partitioned work queue. Many workers drain one queue concurrently,
//! but at most one of them holds a message for any given key at a time, so
//! operations on a shared value never interleave.
//!
//! Provides the queue and its key-lock table, a tokio worker pool, an
//! in-memory value store, configuration, and OpenTelemetry observability.

pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
pub use model::{Message, MessageId, Operation, WorkerId};
pub use queue::{OrderingMode, Poll, Queue, QueueConfig, QueueStats};
