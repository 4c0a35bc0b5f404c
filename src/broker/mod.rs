//! Broker contract: the message transport delivering signatures to
//! workers.
//!
//! Concrete transports (AMQP, SQS, and friends) live outside this crate;
//! they implement [`Broker`] and drive a [`TaskProcessor`] — normally a
//! [`Worker`](crate::worker::Worker) — with up to `concurrency` parallel
//! deliveries. [`InMemoryBroker`] is the in-process reference transport
//! used by the integration tests and for local prototyping.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::Signature;
use crate::worker::ProcessError;

pub use memory::InMemoryBroker;

/// Errors surfaced by a broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Transient transport failure. The consume loop should reconnect
    /// and resume.
    #[error("broker transport error: {0}")]
    Transport(String),

    /// Unrecoverable failure. The worker should signal fatal exit.
    #[error("broker terminal error: {0}")]
    Terminal(String),

    /// The broker has been closed and no longer accepts publishes.
    #[error("broker is closed")]
    Closed,
}

impl BrokerError {
    /// Returns true if the consume loop should reconnect rather than
    /// give up.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Consumer side of a broker: something that can process one delivered
/// signature.
///
/// Implemented by [`Worker`](crate::worker::Worker). An `Ok` return
/// acknowledges the delivery; an `Err` asks the broker to redeliver.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Processes one delivered signature.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when an infrastructure call (backend
    /// state transition, republish) failed and the delivery should be
    /// redelivered.
    async fn process(&self, signature: Signature) -> Result<(), ProcessError>;
}

/// The message transport contract consumed by workers.
///
/// Implementations must be safe for concurrent use; the worker shares
/// one broker handle between its consume loop and every in-flight task
/// publishing callbacks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Runs the consume loop until stopped or failed, dispatching up to
    /// `concurrency` parallel deliveries into `processor`.
    ///
    /// Returns `Ok(())` when the loop was stopped gracefully via
    /// [`stop_consuming`](Self::stop_consuming), after in-flight
    /// deliveries have drained.
    ///
    /// # Errors
    ///
    /// Returns a [`BrokerError`]; when
    /// [`is_retryable`](BrokerError::is_retryable) the caller should
    /// reconnect by calling `start_consuming` again.
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), BrokerError>;

    /// Stops the consume loop and drains in-flight deliveries.
    /// Idempotent.
    async fn stop_consuming(&self);

    /// Publishes a signature, honoring its `eta` for delayed delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the message could not be enqueued.
    async fn publish(&self, signature: &Signature) -> Result<(), BrokerError>;
}
