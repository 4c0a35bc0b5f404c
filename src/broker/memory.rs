//! In-process broker backed by an unbounded channel.
//!
//! Deliveries fan out to at most `concurrency` concurrent processor
//! calls, gated by a semaphore. A failed `process` call redelivers the
//! signature after a short delay; a successful one acknowledges it by
//! dropping it. Signatures with a future `eta` are parked in a timer
//! task until they ripen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::models::Signature;

use super::{Broker, BrokerError, TaskProcessor};

/// How long a redelivered signature waits before re-entering the queue.
const REDELIVERY_DELAY: Duration = Duration::from_millis(100);

/// An in-memory [`Broker`] for tests and local prototyping.
///
/// Messages live in an unbounded channel; nothing is durable. Stopping
/// the broker is terminal: a stopped broker's consume loop exits
/// gracefully and will not restart.
#[derive(Debug)]
pub struct InMemoryBroker {
    deliveries: mpsc::UnboundedSender<Signature>,
    queue: Mutex<mpsc::UnboundedReceiver<Signature>>,
    stop: CancellationToken,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (deliveries, queue) = mpsc::unbounded_channel();
        Self {
            deliveries,
            queue: Mutex::new(queue),
            stop: CancellationToken::new(),
        }
    }

    fn enqueue(&self, signature: Signature) -> Result<(), BrokerError> {
        if self.stop.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        self.deliveries
            .send(signature)
            .map_err(|_| BrokerError::Closed)
    }

    fn enqueue_at(&self, signature: Signature, delay: Duration) {
        let deliveries = self.deliveries.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = stop.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = deliveries.send(signature);
                }
            }
        });
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), BrokerError> {
        let concurrency = concurrency.max(1);
        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut queue = self.queue.lock().await;

        tracing::debug!(consumer_tag, concurrency, "consuming");

        loop {
            let delivery = tokio::select! {
                () = self.stop.cancelled() => break,
                delivery = queue.recv() => delivery,
            };
            let Some(signature) = delivery else { break };

            // unripe messages go back on the timer instead of blocking the loop
            if let Some(eta) = signature.eta {
                let now = Utc::now();
                if eta > now {
                    let delay = (eta - now).to_std().unwrap_or_default();
                    self.enqueue_at(signature, delay);
                    continue;
                }
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let processor = Arc::clone(&processor);
            let deliveries = self.deliveries.clone();
            tokio::spawn(async move {
                if let Err(error) = processor.process(signature.clone()).await {
                    tracing::warn!(task_id = %signature.id, %error, "processing failed, redelivering");
                    tokio::time::sleep(REDELIVERY_DELAY).await;
                    let _ = deliveries.send(signature);
                }
                drop(permit);
            });
        }

        // drain: every in-flight delivery holds a permit until it finishes
        let _ = semaphore.acquire_many(permits).await;
        tracing::debug!(consumer_tag, "stopped consuming");
        Ok(())
    }

    async fn stop_consuming(&self) {
        self.stop.cancel();
    }

    async fn publish(&self, signature: &Signature) -> Result<(), BrokerError> {
        if let Some(eta) = signature.eta {
            let now = Utc::now();
            if eta > now {
                let delay = (eta - now).to_std().unwrap_or_default();
                self.enqueue_at(signature.clone(), delay);
                return Ok(());
            }
        }
        self.enqueue(signature.clone())
    }
}
