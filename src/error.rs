//! Error types for keyq.
//!
//! Contention on a key is never an error; it surfaces as
//! [`Poll::NoneAvailable`](crate::queue::Poll::NoneAvailable). Only caller
//! mistakes and collaborator failures end up here.

use thiserror::Error;

use crate::model::{MessageId, WorkerId};

#[derive(Debug, Error)]
pub enum Error {
    /// A worker confirmed or released a message it does not hold.
    #[error("protocol violation by worker {worker_id} on message {message_id}: {reason}")]
    ProtocolViolation {
        worker_id: WorkerId,
        message_id: MessageId,
        reason: String,
    },

    #[error("lock table invariant broken: {0}")]
    LockState(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors caused by a worker breaking the grant/confirm protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
