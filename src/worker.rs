use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::signal::TradeSignal;
use crate::signal::router::SignalRouter;
use crate::swap::error::{ErrorClass, OrchestrationError};
use crate::swap::service::SwapOrchestrator;

/// Pulls signals one at a time and executes the resulting swap before
/// taking the next one. Returns when every sender is gone.
pub async fn run_signal_loop(
    mut signals: mpsc::Receiver<TradeSignal>,
    router: SignalRouter,
    orchestrator: Arc<SwapOrchestrator>,
) {
    while let Some(signal) = signals.recv().await {
        let request = match router.route(&signal).await {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(kind = %signal.kind, error = %err, "signal rejected");
                continue;
            }
        };

        let request_id = request.request_id.clone();
        match orchestrator.execute(request).await {
            Ok(record) => {
                tracing::info!(
                    %request_id,
                    result_amount = ?record.result_amount,
                    "signal handled"
                );
            }
            Err(err) => log_outcome(&request_id, &err),
        }
    }
    tracing::info!("signal channel closed; consumer stopping");
}

/// Periodically re-drives the in-flight swap, if the ledger has one.
pub fn spawn_resume_worker(
    orchestrator: Arc<SwapOrchestrator>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll_interval).await;

            match orchestrator.resume_in_flight().await {
                Ok(Some(record)) => {
                    tracing::info!(request_id = %record.request_id, phase = %record.phase, "resumed swap settled");
                }
                Ok(None) => {}
                Err(OrchestrationError::Busy { active }) => {
                    tracing::debug!(%active, "resume skipped; swap already running");
                }
                Err(err) => log_outcome("in-flight", &err),
            }
        }
    })
}

fn log_outcome(request_id: &str, err: &OrchestrationError) {
    match err.class() {
        ErrorClass::Retryable => {
            tracing::warn!(%request_id, error = %err, "swap pending; will resume");
        }
        ErrorClass::PreflightFailed => {
            tracing::warn!(%request_id, error = %err, "swap not started");
        }
        ErrorClass::NonRetryable => {
            tracing::error!(%request_id, error = %err, "swap failed");
        }
    }
}
