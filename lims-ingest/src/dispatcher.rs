//! Bounded-parallel message dispatcher
//!
//! Each submitted message runs on its own task. Two semaphores bound the work:
//! - `admission` caps messages in flight (`ingest_queue_capacity`); `submit`
//!   waits when it is full
//! - `workers` caps messages reconciling at once (`ingest_max_concurrent_messages`)
//!
//! A message whose identity lock timed out gives its worker permit back,
//! waits `ingest_requeue_backoff_ms`, and queues for a permit again behind
//! everything already waiting. It is never dropped.

use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, warn};

use crate::engine::ReconcileEngine;
use crate::error::{IngestError, IngestResult};
use crate::outcome::Verdict;
use crate::payload::IngestMessage;

pub struct Dispatcher {
    engine: Arc<ReconcileEngine>,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new(engine: Arc<ReconcileEngine>) -> Self {
        let settings = engine.settings();
        let queue_capacity = settings.queue_capacity;
        let workers = settings.max_concurrent_messages;

        Self {
            engine,
            admission: Arc::new(Semaphore::new(queue_capacity)),
            workers: Arc::new(Semaphore::new(workers)),
            queue_capacity,
        }
    }

    /// Queue a message; the receiver yields its verdict
    ///
    /// Waits while `ingest_queue_capacity` messages are already in flight.
    pub async fn submit(&self, message: IngestMessage) -> IngestResult<oneshot::Receiver<Verdict>> {
        let admitted = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| closed())?;

        let engine = self.engine.clone();
        let workers = self.workers.clone();
        let backoff = engine.settings().requeue_backoff;
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let _admitted = admitted;
            let mut requeues = 0u32;

            loop {
                let Ok(permit) = workers.clone().acquire_owned().await else {
                    debug!("Dispatcher closed before message ran");
                    return;
                };
                let result = engine.ingest(&message).await;
                drop(permit);

                match result {
                    Ok(verdict) => {
                        let _ = tx.send(verdict);
                        return;
                    }
                    Err(err) => {
                        requeues += 1;
                        warn!(
                            kind = %message.kind(),
                            source = message.source(),
                            external_id = ?message.external_id(),
                            requeues,
                            "Requeueing message: {}",
                            err
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Submit a message and wait for its verdict
    pub async fn ingest(&self, message: IngestMessage) -> IngestResult<Verdict> {
        let rx = self.submit(message).await?;
        rx.await.map_err(|_| closed())
    }

    /// Wait for every admitted message to finish, then refuse new ones
    pub async fn shutdown(&self) {
        let permits = u32::try_from(self.queue_capacity).unwrap_or(u32::MAX);
        match self.admission.acquire_many(permits).await {
            Ok(all) => {
                all.forget();
                self.admission.close();
                self.workers.close();
                debug!(held_locks = self.engine.locks().active(), "Dispatcher drained");
            }
            Err(_) => debug!("Dispatcher already shut down"),
        }
    }
}

fn closed() -> IngestError {
    IngestError::Common(lims_common::Error::Internal(
        "dispatcher is shut down".to_string(),
    ))
}
