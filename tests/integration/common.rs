//! Common test utilities: a worker harness over the in-memory broker and
//! backend, a recording broker for publish assertions, and shared
//! handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use machina::{
    Backend, Broker, BrokerError, Config, FnHandler, HandlerDescriptor, HandlerRegistry,
    InMemoryBackend, InMemoryBroker, ParamKind, Signature, Slot, StateKind, TaskProcessor,
    TaskState, Worker,
};

/// A worker wired to the in-memory broker and backend, already consuming.
pub struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub backend: Arc<InMemoryBackend>,
    consume: tokio::task::JoinHandle<Result<(), BrokerError>>,
}

/// Starts a harness with the given registry and a concurrency of 4.
pub async fn start(registry: HandlerRegistry) -> Harness {
    start_with(registry, InMemoryBackend::new(), 4).await
}

/// Starts a harness with a specific backend and concurrency.
pub async fn start_with(
    registry: HandlerRegistry,
    backend: InMemoryBackend,
    concurrency: usize,
) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    let backend = Arc::new(backend);
    let worker = Arc::new(
        Worker::new(
            Config::default(),
            Arc::new(registry),
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&backend) as Arc<dyn Backend>,
        )
        .with_concurrency(concurrency)
        .with_consumer_tag("integration"),
    );

    let consume = {
        let broker = Arc::clone(&broker);
        let processor: Arc<dyn TaskProcessor> = worker as _;
        tokio::spawn(
            async move { broker.start_consuming("integration", concurrency, processor).await },
        )
    };

    Harness {
        broker,
        backend,
        consume,
    }
}

impl Harness {
    /// Publishes a signature onto the harness broker.
    pub async fn submit(&self, signature: &Signature) {
        self.broker
            .publish(signature)
            .await
            .expect("publish to in-memory broker");
    }

    /// Polls the backend until the task reaches the given state.
    ///
    /// # Panics
    ///
    /// Panics if the state is not reached within the polling budget.
    pub async fn wait_for_state(&self, signature_id: &str, state: StateKind) -> TaskState {
        for _ in 0..600 {
            if let Ok(task_state) = self.backend.task_state(signature_id).await {
                if task_state.state == state {
                    return task_state;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {signature_id} did not reach {state} in time");
    }

    /// Polls the backend until the task reaches a terminal state.
    ///
    /// # Panics
    ///
    /// Panics if no terminal state is reached within the polling budget.
    pub async fn wait_for_terminal(&self, signature_id: &str) -> TaskState {
        for _ in 0..600 {
            if let Ok(task_state) = self.backend.task_state(signature_id).await {
                if task_state.is_completed() {
                    return task_state;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {signature_id} did not complete in time");
    }

    /// Stops consuming and waits for the drain.
    pub async fn shutdown(self) {
        self.broker.stop_consuming().await;
        let _ = self.consume.await;
    }
}

/// A broker that records publishes instead of delivering them. Useful
/// for asserting on republished signatures (retries, callbacks).
#[derive(Debug, Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<Signature>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<Signature> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn start_consuming(
        &self,
        _consumer_tag: &str,
        _concurrency: usize,
        _processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn stop_consuming(&self) {}

    async fn publish(&self, signature: &Signature) -> Result<(), BrokerError> {
        self.published.lock().await.push(signature.clone());
        Ok(())
    }
}

/// Builds a worker over a [`RecordingBroker`] for direct `process` calls.
pub fn recording_worker(registry: HandlerRegistry) -> (Worker, Arc<RecordingBroker>, Arc<InMemoryBackend>) {
    let broker = Arc::new(RecordingBroker::new());
    let backend = Arc::new(InMemoryBackend::new());
    let worker = Worker::new(
        Config::default(),
        Arc::new(registry),
        Arc::clone(&broker) as Arc<dyn Broker>,
        Arc::clone(&backend) as Arc<dyn Backend>,
    );
    (worker, broker, backend)
}

/// Registers a handler summing `arity` integer arguments.
pub fn register_sum(registry: &mut HandlerRegistry, name: &str, arity: usize) {
    registry.register(
        name,
        HandlerDescriptor::new(FnHandler::arc(|_ctx, args: Vec<Value>| async move {
            let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
            vec![Slot::value(json!(sum)), Slot::nil()]
        }))
        .with_params(vec![ParamKind::Int; arity]),
    );
}
