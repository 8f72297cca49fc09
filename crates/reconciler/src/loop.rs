//! Worker pool draining the reconcile queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use confcascade_core::{ControllerConfig, ReconcileKey, RetryConfig};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::filter::ChangeFilter;
use crate::queue::WorkQueue;
use crate::reconciler::{ReconcileContext, Reconciler};
use crate::types::ReconcileOutcome;

/// Runs a fixed pool of workers, each looping `get -> reconcile -> done`.
pub struct Controller {
    queue: WorkQueue<ReconcileKey>,
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    stop_tx: Arc<watch::Sender<bool>>,
    dropped: Arc<AtomicUsize>,
}

impl Controller {
    /// Create a controller.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(reconciler: Arc<Reconciler>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let queue = WorkQueue::new(config.retry.base_delay(), config.retry.max_delay());
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            queue,
            reconciler,
            config,
            stop_tx: Arc::new(stop_tx),
            dropped: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Notification callback feeding this controller's queue.
    pub fn filter(&self) -> ChangeFilter {
        ChangeFilter::new(self.queue.clone())
    }

    /// The controller's queue.
    pub const fn queue(&self) -> &WorkQueue<ReconcileKey> {
        &self.queue
    }

    /// Keys given up on after a failure: retries exhausted or the error was permanent.
    pub fn dropped_keys(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Handle for stopping or draining a running controller.
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            queue: self.queue.clone(),
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Run the workers until the queue shuts down.
    pub async fn run(&self) {
        info!(workers = self.config.workers, "Starting controller");

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                reconciler: Arc::clone(&self.reconciler),
                retry: self.config.retry.clone(),
                timeout: self.config.reconcile_timeout(),
                stop_rx: self.stop_tx.subscribe(),
                dropped: Arc::clone(&self.dropped),
            };
            workers.spawn(worker.run());
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("Controller stopped");
    }
}

/// Handle to stop a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    queue: WorkQueue<ReconcileKey>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl ControllerHandle {
    /// Cancel in-flight reconciliations and stop the workers.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.queue.shut_down();
    }

    /// Stop accepting keys; workers exit once the queue is empty and no
    /// retry is pending.
    pub fn drain(&self) {
        self.queue.shut_down_with_drain();
    }

    /// Whether [`ControllerHandle::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }
}

struct Worker {
    id: usize,
    queue: WorkQueue<ReconcileKey>,
    reconciler: Arc<Reconciler>,
    retry: RetryConfig,
    timeout: std::time::Duration,
    stop_rx: watch::Receiver<bool>,
    dropped: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            if *self.stop_rx.borrow() {
                self.queue.done(&key);
                break;
            }
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = self.id, "Worker exited");
    }

    async fn process(&self, key: &ReconcileKey) {
        let ctx = ReconcileContext::with_timeout(self.timeout).with_cancellation(self.stop_rx.clone());

        match self.reconciler.reconcile_with(key, &ctx).await {
            Ok(outcome) => {
                self.queue.forget(key);
                match &outcome {
                    ReconcileOutcome::Gone { .. } => debug!(%outcome, "Reconciled"),
                    ReconcileOutcome::Reconciled { .. } => info!(%outcome, "Reconciled"),
                }
            }
            Err(e) if !e.is_retryable() => {
                self.drop_key(key);
                error!(key = %key, error = %e, "Reconciliation failed permanently, dropping key");
            }
            Err(e) => {
                let requeues = self.queue.num_requeues(key);
                if !self.retry.allows_retry(requeues) {
                    self.drop_key(key);
                    error!(
                        key = %key,
                        error = %e,
                        requeues,
                        "Reconciliation failed too many times, dropping key"
                    );
                } else if self.queue.add_rate_limited(key.clone()) {
                    warn!(key = %key, error = %e, requeues, "Reconciliation failed, requeueing");
                } else {
                    self.queue.forget(key);
                    warn!(key = %key, error = %e, "Reconciliation failed after stop, not requeueing");
                }
            }
        }
    }

    fn drop_key(&self, key: &ReconcileKey) {
        self.queue.forget(key);
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}
