//! Core data model.
//!
//! A message is one mutation of one named value: a key, an operation and an
//! operand. Messages are immutable once created and carry no back-references
//! to the queue that holds them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A unit of work for a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier. Opaque to the queue.
    pub id: MessageId,

    /// Partition key. At most one message per key is in flight at a time.
    pub key: String,

    /// What to do to the value stored under `key`.
    pub operation: Operation,

    pub operand: f64,
}

impl Message {
    /// Create a message with a generated `"{key}:{uuid}"` id.
    pub fn new(key: impl Into<String>, operation: Operation, operand: f64) -> Self {
        let key = key.into();
        Self {
            id: MessageId(format!("{key}:{}", Uuid::new_v4())),
            key,
            operation,
            operand,
        }
    }

    /// Create a message with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        key: impl Into<String>,
        operation: Operation,
        operand: f64,
    ) -> Self {
        Self {
            id: MessageId(id.into()),
            key: key.into(),
            operation,
            operand,
        }
    }
}

/// Newtype for message IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Mutation applied to a numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Overwrite the value.
    Set,
    /// Add the operand.
    Add,
    /// Subtract the operand.
    Sub,
}

impl Operation {
    /// Whether this operation commutes with every other commutative
    /// operation on the same key. Reordering is only harmless among these.
    pub fn is_commutative(self) -> bool {
        matches!(self, Operation::Add | Operation::Sub)
    }

    /// Apply to a current value (absent values count as zero).
    pub fn apply(self, current: Option<f64>, operand: f64) -> f64 {
        let current = current.unwrap_or(0.0);
        match self {
            Operation::Set => operand,
            Operation::Add => current + operand,
            Operation::Sub => current - operand,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Set => "set",
            Operation::Add => "add",
            Operation::Sub => "sub",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "set" => Ok(Operation::Set),
            "add" => Ok(Operation::Add),
            "sub" => Ok(Operation::Sub),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Identifies the worker holding a grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Conventional name for the n-th worker of a pool.
    pub fn numbered(n: usize) -> Self {
        Self(format!("worker-{n}"))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
