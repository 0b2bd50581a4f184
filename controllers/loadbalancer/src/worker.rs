//! The single sequential worker.
//!
//! Takes one key at a time from the [`WorkQueue`], dispatches it to the
//! [`Reconciler`] and decides between backoff and forgetting. Once the queue
//! drains it asks the [`PublishCoordinator`] to publish, so a burst of watch
//! events becomes one downstream update.

use crate::publish::PublishCoordinator;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::resource::ResourceKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before an item deferred by the cold start is offered again
const COLD_START_DEFER: Duration = Duration::from_millis(5);

/// Sequential consumer of the work queue
pub struct Worker {
    queue: Arc<WorkQueue>,
    reconciler: Reconciler,
    publisher: PublishCoordinator,
    /// Services still to be seen before the cold start ends
    pending_services: usize,
    initializing: bool,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("initializing", &self.initializing)
            .field("pending_services", &self.pending_services)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// `initial_services` is the number of Services in scope at startup;
    /// other intent is deferred until that many Service keys were processed.
    pub fn new(
        queue: Arc<WorkQueue>,
        mut reconciler: Reconciler,
        publisher: PublishCoordinator,
        initial_services: usize,
        ready: Arc<AtomicBool>,
    ) -> Self {
        let initializing = initial_services > 0;
        reconciler.set_initializing(initializing);
        if !initializing {
            ready.store(true, Ordering::SeqCst);
        }
        Self {
            queue,
            reconciler,
            publisher,
            pending_services: initial_services,
            initializing,
            ready,
        }
    }

    /// True until Service membership is primed
    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    /// The reconciler and its generated state
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    fn finish_cold_start(&mut self) {
        if !self.initializing {
            return;
        }
        info!("Service membership primed, processing all resources");
        self.initializing = false;
        self.reconciler.set_initializing(false);
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Consume the queue until it is shut down and drained
    pub async fn run(mut self) {
        info!("Worker started");
        while self.process_next().await {}
        info!("Worker stopped");
    }

    /// Process one item. Returns false once the queue is shut down.
    pub async fn process_next(&mut self) -> bool {
        let Some(item) = self.queue.get().await else {
            return false;
        };
        let key = item.key();

        if self.initializing {
            match key.kind {
                ResourceKind::Service | ResourceKind::Namespace => {}
                _ => {
                    debug!(key = %key, "Deferring until Service membership is primed");
                    self.queue.add_after(item, COLD_START_DEFER);
                    self.queue.done(&key);
                    return true;
                }
            }
        }

        if self.reconciler.accepts(&item) {
            debug!(key = %key, "Processing");
            match self.reconciler.reconcile(&item).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) if e.is_retryable() => {
                    warn!(
                        key = %key,
                        requeues = self.queue.num_requeues(&key),
                        error = %e,
                        "Reconcile failed, retrying with backoff"
                    );
                    self.queue.add_rate_limited(item);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Reconcile failed, waiting for the resource to change");
                    self.queue.forget(&key);
                }
            }
        } else {
            debug!(key = %key, "Namespace not in scope, skipping");
            self.queue.forget(&key);
        }
        self.queue.done(&key);

        if self.initializing && key.kind == ResourceKind::Service {
            self.pending_services = self.pending_services.saturating_sub(1);
            if self.pending_services == 0 {
                self.finish_cold_start();
            }
        }

        if self.queue.is_empty() {
            self.publisher
                .publish_if_changed(self.reconciler.resources(), self.reconciler.dns_config());
            self.finish_cold_start();
        }
        true
    }
}
