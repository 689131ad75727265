use anyhow::{Context as _, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::TradeSignal;

/// One signal at a time; anything arriving while the slot is taken is
/// refused rather than queued.
pub fn signal_channel() -> (mpsc::Sender<TradeSignal>, mpsc::Receiver<TradeSignal>) {
    mpsc::channel(1)
}

pub fn router(signals: mpsc::Sender<TradeSignal>) -> Router {
    Router::new()
        .route("/webhook", post(receive_alert))
        .with_state(signals)
}

pub async fn serve(listener: TcpListener, signals: mpsc::Sender<TradeSignal>) -> Result<()> {
    let addr = listener.local_addr().context("webhook local addr")?;
    tracing::info!(%addr, "alert webhook listening");
    axum::serve(listener, router(signals))
        .await
        .context("serve alert webhook")
}

async fn receive_alert(
    State(signals): State<mpsc::Sender<TradeSignal>>,
    Json(payload): Json<Value>,
) -> StatusCode {
    let signal = TradeSignal::from_payload(payload, Utc::now());
    let kind = signal.kind.clone();
    match signals.try_send(signal) {
        Ok(()) => {
            tracing::info!(%kind, "alert received");
            StatusCode::ACCEPTED
        }
        Err(TrySendError::Full(_)) => {
            tracing::warn!(%kind, "alert dropped: previous signal still being handled");
            StatusCode::TOO_MANY_REQUESTS
        }
        Err(TrySendError::Closed(_)) => {
            tracing::error!(%kind, "alert dropped: signal consumer stopped");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
