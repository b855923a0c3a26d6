//! The value store workers apply operations to.
//!
//! The queue knows nothing about values. A [`Store`] owns the key → value
//! mapping; [`MemoryStore`] is the in-process implementation used by the CLI
//! and tests.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::model::Operation;

/// Applies a single operation to the value under `key`.
pub trait Store: Send + Sync + 'static {
    fn apply(
        &self,
        key: &str,
        operation: Operation,
        operand: f64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Key → `f64` map held in memory.
///
/// `apply` is a read, an optional random delay, then a write, with no lock
/// held across the delay. Two concurrent applies on one key therefore lose
/// an update, which is exactly what the queue has to prevent.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, f64>>,
    max_latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep up to `max_latency` between read and write of every apply.
    pub fn with_latency(max_latency: Duration) -> Self {
        Self {
            values: Mutex::default(),
            max_latency: Some(max_latency),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.values()?.get(key).copied())
    }

    /// Sorted copy of every key and value.
    pub fn snapshot(&self) -> Result<BTreeMap<String, f64>> {
        Ok(self
            .values()?
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, f64>>> {
        self.values
            .lock()
            .map_err(|_| Error::Store("value map poisoned".to_string()))
    }

    fn jitter(&self) -> Option<Duration> {
        let max = self.max_latency?;
        let micros = max.as_micros().min(u64::MAX as u128) as u64;
        Some(Duration::from_micros(rand::thread_rng().gen_range(0..=micros)))
    }
}

impl Store for MemoryStore {
    async fn apply(&self, key: &str, operation: Operation, operand: f64) -> Result<()> {
        let current = self.get(key)?;
        if let Some(delay) = self.jitter() {
            tokio::time::sleep(delay).await;
        }
        let next = operation.apply(current, operand);
        self.values()?.insert(key.to_string(), next);
        Ok(())
    }
}
