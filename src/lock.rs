//! Key-lock table: the per-key availability flag behind every grant.
//!
//! A key missing from the table is FREE. Lookups never insert; only
//! [`KeyLockTable::acquire`] creates an entry and [`KeyLockTable::release`]
//! removes it, so the table holds exactly the BUSY keys.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::{MessageId, WorkerId};

/// Availability of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    /// Held by `worker` while it processes `message`.
    Busy { worker: WorkerId, message: MessageId },
}

impl LockState {
    pub fn is_free(&self) -> bool {
        matches!(self, LockState::Free)
    }
}

/// Mapping from key to holder. Not synchronized; the queue guards it.
#[derive(Debug, Default)]
pub struct KeyLockTable {
    busy: HashMap<String, (WorkerId, MessageId)>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `key`.
    pub fn state(&self, key: &str) -> LockState {
        match self.busy.get(key) {
            Some((worker, message)) => LockState::Busy {
                worker: worker.clone(),
                message: message.clone(),
            },
            None => LockState::Free,
        }
    }

    pub fn is_free(&self, key: &str) -> bool {
        !self.busy.contains_key(key)
    }

    /// Mark `key` BUSY for `worker`. Returns false if it already was.
    pub fn acquire(&mut self, key: &str, worker: &WorkerId, message: &MessageId) -> bool {
        if self.busy.contains_key(key) {
            return false;
        }
        self.busy
            .insert(key.to_string(), (worker.clone(), message.clone()));
        true
    }

    /// Mark `key` FREE again. Releasing a key that is not held is a bug in
    /// the caller's bookkeeping.
    pub fn release(&mut self, key: &str) -> Result<()> {
        self.busy
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::LockState(format!("release of free key {key}")))
    }

    /// Number of BUSY keys.
    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }
}

