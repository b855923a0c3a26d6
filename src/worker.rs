//! Workers: poll the queue, apply granted messages to the store, confirm.
//!
//! A worker stops on `Drained` or on shutdown. A failed apply hands the
//! message back to the queue and the worker keeps polling.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{Message, WorkerId};
use crate::queue::{Poll, Queue};
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, record_transition, start_message_span};

/// Configuration for a worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep after a `NoneAvailable` answer.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// What one worker did before it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    /// Messages applied and confirmed.
    pub processed: usize,
    /// Confirms rejected by the queue, e.g. after a lease expired.
    pub rejected: usize,
    /// Store applies that failed; the message went back to the queue.
    pub failed: usize,
    /// `NoneAvailable` answers received.
    pub idle_polls: usize,
}

/// One polling loop over a shared queue and store.
pub struct Worker<S> {
    id: WorkerId,
    queue: Arc<Queue>,
    store: Arc<S>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S: Store> Worker<S> {
    pub fn new(
        id: WorkerId,
        queue: Arc<Queue>,
        store: Arc<S>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            config,
            shutdown,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Poll until the queue is drained or shutdown is signalled.
    pub async fn run(mut self) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            worker_id: self.id.clone(),
            processed: 0,
            rejected: 0,
            failed: 0,
            idle_polls: 0,
        };
        info!(worker = %self.id, "worker started");

        loop {
            if *self.shutdown.borrow() {
                info!(worker = %self.id, "worker shutting down");
                break;
            }

            match self.queue.request_work(&self.id) {
                Poll::Grant(message) => match self.process(message).await? {
                    Processed::Confirmed => report.processed += 1,
                    Processed::Rejected => report.rejected += 1,
                    Processed::Failed => {
                        report.failed += 1;
                        self.back_off().await;
                    }
                },
                Poll::NoneAvailable => {
                    report.idle_polls += 1;
                    self.back_off().await;
                }
                Poll::Drained => {
                    debug!(worker = %self.id, "queue drained");
                    break;
                }
            }
        }

        info!(
            worker = %self.id,
            processed = report.processed,
            rejected = report.rejected,
            failed = report.failed,
            "worker stopped"
        );
        Ok(report)
    }

    /// Sleep for the poll interval, or less if shutdown is signalled.
    async fn back_off(&mut self) {
        tokio::select! {
            changed = self.shutdown.changed() => {
                // Sender gone: nobody can signal shutdown anymore.
                if changed.is_err() {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    /// Apply one granted message and confirm it. On store failure the
    /// message is released back to the queue. A confirm or release the
    /// queue rejects (the lease ran out mid-apply) is not an error for the
    /// worker; only a broken queue invariant is.
    async fn process(&self, message: Message) -> Result<Processed> {
        let span = start_message_span(&self.id, &message);

        async {
            record_transition(&span, "granted", "applying");
            let started = std::time::Instant::now();
            let applied = self
                .store
                .apply(&message.key, message.operation, message.operand)
                .await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            let op = KeyValue::new("operation", message.operation.to_string());
            metrics::apply_duration_ms().record(elapsed_ms, std::slice::from_ref(&op));

            match applied {
                Ok(()) => {
                    metrics::store_applies().add(1, &[op, KeyValue::new("result", "ok")]);
                    match self.queue.confirm(&self.id, &message.id) {
                        Ok(()) => {
                            record_transition(&span, "applying", "confirmed");
                            record_outcome(&span, "confirmed");
                            Ok(Processed::Confirmed)
                        }
                        Err(e) if e.is_protocol_violation() => {
                            warn!(worker = %self.id, "confirm rejected: {e}");
                            record_outcome(&span, "rejected");
                            Ok(Processed::Rejected)
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => {
                    metrics::store_applies().add(1, &[op, KeyValue::new("result", "error")]);
                    error!(id = %message.id, key = %message.key, "apply failed: {e}");
                    match self.queue.release(&self.id, &message.id) {
                        Ok(()) => record_outcome(&span, "released"),
                        // Lease already reclaimed it; the message is back in the queue.
                        Err(release) if release.is_protocol_violation() => {
                            warn!(worker = %self.id, "release rejected: {release}");
                            record_outcome(&span, "reclaimed");
                        }
                        Err(release) => return Err(release),
                    }
                    Ok(Processed::Failed)
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}

/// How a granted message left the worker.
enum Processed {
    Confirmed,
    /// The queue no longer considered this worker the holder.
    Rejected,
    /// The store failed; the message is back in the queue.
    Failed,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Aggregated result of a pool run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
}

impl PoolReport {
    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }
}

/// Signals every worker of a pool to stop after its current message.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// A fixed number of workers draining one queue into one store.
pub struct WorkerPool<S> {
    queue: Arc<Queue>,
    store: Arc<S>,
    size: usize,
    config: WorkerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<S: Store> WorkerPool<S> {
    pub fn new(queue: Arc<Queue>, store: Arc<S>, size: usize, config: WorkerConfig) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            queue,
            store,
            size,
            config,
            shutdown: Arc::new(tx),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Run all workers to completion. Reports are ordered by worker number.
    ///
    /// # Errors
    ///
    /// Returns the first worker error (broken queue invariant or panicked task);
    /// the remaining workers are still awaited.
    pub async fn run(self) -> Result<PoolReport> {
        info!(workers = self.size, "starting worker pool");
        let mut tasks = JoinSet::new();
        for n in 0..self.size {
            let worker = Worker::new(
                WorkerId::numbered(n),
                Arc::clone(&self.queue),
                Arc::clone(&self.store),
                self.config.clone(),
                self.shutdown.subscribe(),
            );
            tasks.spawn(async move { (n, worker.run().await) });
        }

        let mut reports = Vec::with_capacity(self.size);
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((n, Ok(report))) => reports.push((n, report)),
                Ok((n, Err(e))) => {
                    error!(worker = n, "worker failed: {e}");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::Other(format!("worker task failed: {e}")));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        reports.sort_by_key(|(n, _)| *n);
        Ok(PoolReport {
            workers: reports.into_iter().map(|(_, r)| r).collect(),
        })
    }
}
