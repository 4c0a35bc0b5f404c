//! Worker lifecycle: launch, broker reconnection, and signal-driven
//! shutdown.
//!
//! `launch_async` spawns the consume loop and, unless disabled in the
//! configuration, a signal listener. The first SIGINT/SIGTERM drains the
//! worker gracefully (stop consuming, wait for in-flight tasks); the
//! second aborts, cancelling in-flight invocation contexts.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::{BrokerError, TaskProcessor};
use crate::models::TaskError;

use super::Worker;

/// Terminal outcome of a worker launch.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The broker failed in a way reconnection cannot fix.
    #[error("broker terminated with a fatal error")]
    Broker(#[source] BrokerError),

    /// A second interrupt arrived before the graceful drain finished.
    #[error("worker quit abruptly")]
    Aborted,
}

impl Worker {
    /// Launches the worker and blocks until it stops.
    ///
    /// Returns `Ok(())` after a graceful drain (signal or
    /// [`quit`](Self::quit)).
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] when the broker fails terminally or a
    /// second interrupt aborts the drain.
    pub async fn launch(self: &Arc<Self>) -> Result<(), RunnerError> {
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        self.launch_async(results_tx);
        match results_rx.recv().await {
            Some(result) => result,
            None => Ok(()),
        }
    }

    /// Non-blocking launch. The first terminal outcome (graceful drain,
    /// fatal broker error, abort) is sent on `results`.
    pub fn launch_async(self: &Arc<Self>, results: mpsc::UnboundedSender<Result<(), RunnerError>>) {
        let config = self.config();
        tracing::info!(
            broker = %config.broker_url,
            result_backend = %config.result_backend_url,
            queue = %self.custom_queue().unwrap_or(&config.default_queue),
            consumer_tag = %self.consumer_tag(),
            concurrency = self.concurrency(),
            "launching worker"
        );

        // consume loop: reconnect on retryable broker failures, surface
        // everything else
        let worker = Arc::clone(self);
        let consume_results = results.clone();
        tokio::spawn(async move {
            loop {
                let processor: Arc<dyn TaskProcessor> = Arc::clone(&worker) as _;
                let outcome = worker
                    .broker()
                    .start_consuming(worker.consumer_tag(), worker.concurrency(), processor)
                    .await;
                match outcome {
                    Ok(()) => {
                        let _ = consume_results.send(Ok(()));
                        return;
                    }
                    Err(error) if error.is_retryable() => {
                        if let Some(handler) = worker.error_handler() {
                            handler(&TaskError::failed(error.to_string()), None, None);
                        } else {
                            tracing::warn!(%error, "broker failed, reconnecting");
                        }
                    }
                    Err(error) => {
                        let _ = consume_results.send(Err(RunnerError::Broker(error)));
                        return;
                    }
                }
            }
        });

        if !self.config().no_unix_signals {
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                let mut signals_received = 0_u32;
                loop {
                    wait_for_interrupt().await;
                    signals_received += 1;

                    if signals_received < 2 {
                        tracing::warn!(
                            "signal received, waiting for running tasks to finish before shutting down"
                        );
                        let worker = Arc::clone(&worker);
                        let results = results.clone();
                        tokio::spawn(async move {
                            worker.quit().await;
                            let _ = results.send(Ok(()));
                        });
                    } else {
                        tracing::warn!("second signal received, aborting");
                        worker.cancel_root().cancel();
                        let _ = results.send(Err(RunnerError::Aborted));
                        return;
                    }
                }
            });
        }
    }

    /// Gracefully tears down the worker: stops consuming and waits for
    /// in-flight tasks to return.
    pub async fn quit(&self) {
        self.broker().stop_consuming().await;
    }
}

/// Completes when SIGINT or SIGTERM is received.
async fn wait_for_interrupt() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
